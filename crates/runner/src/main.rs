//! apidrive - run YAML API scripts against an endpoint
//!
//! Exit codes: 0 when every script passed, 1 when an expectation failed,
//! 2 when a script or the runner itself hit an error.

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use apidrive::DriverConfig;
use apidrive_runner::{RunnerConfig, SuiteResult, SuiteRunner};

#[derive(Parser, Debug)]
#[command(name = "apidrive")]
#[command(author, version, about = "Declarative end-to-end API test runner", long_about = None)]
struct Cli {
    /// Directory containing script files
    #[arg(short, long, default_value = "scripts")]
    scripts: PathBuf,

    /// Run only scripts carrying this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Run only the script with this name
    #[arg(short, long)]
    name: Option<String>,

    /// Endpoint routes are resolved against, overriding the config file
    #[arg(short, long, env = "APIDRIVE_ENDPOINT")]
    endpoint: Option<String>,

    /// Driver configuration file
    #[arg(short, long, default_value = "apidrive.toml")]
    config: PathBuf,

    /// Output directory for results
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(results) if results.errored > 0 => 2,
        Ok(results) if results.success() => 0,
        Ok(_) => 1,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<SuiteResult> {
    info!("apidrive v{}", apidrive::VERSION);

    let mut driver = DriverConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(endpoint) = cli.endpoint {
        driver.endpoint = endpoint;
        driver.validate()?;
    }

    let runner = SuiteRunner::new(RunnerConfig {
        scripts_dir: cli.scripts,
        output_dir: cli.output,
        driver,
    })?;

    let results = if let Some(name) = cli.name {
        runner.run_named(&name).await?
    } else if let Some(tag) = cli.tag {
        runner.run_tagged(&tag).await?
    } else {
        runner.run_all().await?
    };

    runner.write_results(&results)?;
    Ok(results)
}
