mod commands;

use rust_vtl::cli::{Cli, Commands};
use rust_vtl::error::Result;
use rust_vtl::logger;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse_args();

    // Initialize logging system
    logger::init(args.verbose)?;

    debug!("RustVTL CLI starting");

    match run(args).await {
        Ok(_) => {
            info!("Operation completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = args.config;
    match args.command {
        Commands::Format {
            path,
            bid,
            size,
            register,
        } => commands::format::execute(path, bid, size, register, config).await,

        Commands::Space { detailed } => commands::space::execute(config, detailed).await,

        Commands::Check {
            disk,
            dry_run,
            parallel,
            report,
            json,
        } => commands::check::execute(config, disk, dry_run, parallel, report, json).await,
    }
}
