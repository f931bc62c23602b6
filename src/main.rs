use anyhow::Result;
use clap::Parser;

use fetchstore::{cli::Cli, logging, run, settings::Settings};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(cli.log.unwrap_or(settings.log))?;

    tokio::select! {
        result = run(settings, cli) => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::warn!("interrupted; abandoning in-flight transfers");
            Ok(())
        }
    }
}
