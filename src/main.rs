mod cli;

use clap::Parser;
use cli::{Cli, Commands, FetchArgs};
use evfetch::config::Config;
use evfetch::fetch::{self, FetchOptions};
use evfetch::observability;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path.clone())?,
        None => Config::load()?,
    };
    observability::init_tracing(&config.telemetry);

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_fetch(args: FetchArgs, config: &Config) -> Result<(), BoxError> {
    let options = FetchOptions {
        output_dir: args.output_dir,
        max_body: args.max_body.unwrap_or(config.transfer.max_body_bytes),
    };

    let reports = fetch::run(&args.urls, config, &options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}", report.summary());
        }
    }

    let failed = reports.iter().filter(|report| !report.is_success()).count();
    if failed > 0 {
        return Err(format!("{} of {} transfers failed", failed, reports.len()).into());
    }
    Ok(())
}
