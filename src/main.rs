use std::process;
use std::sync::Arc;

use anyhow::Result;
use tracing::error;

use rspuppet::cli;
use rspuppet::executor::RealCommandExecutor;

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    let log_level = match &args.command {
        cli::Commands::Provision(opts) => opts.log_level,
        cli::Commands::Validate(opts) => opts.log_level,
        cli::Commands::Completions(opts) => {
            rspuppet::run_completions(opts, &mut std::io::stdout());
            return Ok(());
        }
    };
    rspuppet::init_logging(log_level)?;

    let result = match &args.command {
        cli::Commands::Provision(opts) => {
            let executor = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            rspuppet::run_provision(opts, executor).map(|_| ())
        }
        cli::Commands::Validate(opts) => rspuppet::run_validate(opts),
        cli::Commands::Completions(_) => Ok(()),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
