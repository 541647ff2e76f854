use clap::Parser;
use eyre::Result;

use tempo::{
    config::{CliConfig, Config},
    node::Node,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliConfig::parse();
    telemetry::init(cli.verbose)?;

    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "configuration rejected");
            std::process::exit(2);
        }
    };

    tracing::info!(
        l1 = %config.l1_rpc_url,
        engine = %config.l2_engine_url,
        tick_ms = config.tick_interval_ms,
        "starting sequencer"
    );

    if let Err(err) = Node::from_config(config)?.run().await {
        tracing::error!(%err, "sequencer exited with a fatal error");
        std::process::exit(1);
    }

    Ok(())
}
