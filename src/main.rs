use clap::Parser;
use fanout_gateway::{config::GatewayConfig, routes::RouteTable, server, template};

#[derive(Debug, Parser)]
struct Args {
    /// Path to the gateway config YAML.
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config, "starting");

    let cfg_bytes = tokio::fs::read(&args.config).await?;
    let cfg = GatewayConfig::from_yaml_bytes(&cfg_bytes)?;

    let routes_text = tokio::fs::read_to_string(&cfg.routes_path).await?;
    let routes_text = template::render_env_template(&routes_text)?;
    let routes = RouteTable::from_yaml_bytes(routes_text.as_bytes())?;

    server::run(cfg, routes).await
}
