//! Tiny `${VAR}` substitution helper for YAML route tables.
//!
//! This lets a generic container image ship a static routes file that references values injected
//! by the runtime (for example, a deploy pipeline exporting upstream names as environment
//! variables).

/// Render a template by replacing `${NAME}` placeholders with values provided by `lookup`.
///
/// Supported placeholder syntax:
/// - `${NAME}` where `NAME` matches `[A-Za-z_][A-Za-z0-9_]*`;
/// - `${NAME:-fallback}` which uses `fallback` when the variable is unset.
///
/// An unset variable without a fallback results in an error.
pub fn render_env_template_with(
    input: &str,
    mut lookup: impl FnMut(&str) -> Option<String>,
) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            anyhow::bail!("unterminated placeholder");
        };

        let inner = &after[..end];
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (inner, None),
        };
        validate_env_name(name)?;

        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => match fallback {
                Some(fallback) => out.push_str(fallback),
                None => anyhow::bail!("missing environment variable: {name}"),
            },
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Render a template against the process environment.
pub fn render_env_template(input: &str) -> anyhow::Result<String> {
    render_env_template_with(input, |name| std::env::var(name).ok())
}

fn validate_env_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        anyhow::bail!("empty placeholder name");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        anyhow::bail!("invalid placeholder name: {name}");
    }
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || ch == '_') {
            anyhow::bail!("invalid placeholder name: {name}");
        }
    }
    Ok(())
}
