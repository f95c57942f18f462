use anyhow::Result;
use clap::Parser;
use conveyor_host::{build, subscribe_log, Cli};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = subscribe_log(&cli.log_path, &cli.log_level, cli.max_log);
    info!("starting with args: {cli:?}");

    let process = build(&cli).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    process.scheduler.run(cancel).await?;
    Ok(())
}
