use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_fleet::cli::{run, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let filter_layer = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let value = run(cli).await;
    println!("{}", serde_json::to_string_pretty(&value).unwrap());
    if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        std::process::exit(1);
    }
}
