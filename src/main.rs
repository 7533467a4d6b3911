//! fleet CLI - distributes test suites across pools of devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet::config::{self, MetricsConfig, ProviderConfig};
use fleet::execution::Scheduler;
use fleet::metrics::{self, HistoryRecorder};
use fleet::provider::local::LocalProvider;
use fleet::report::{ConsoleReporter, MultiReporter};

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Distributes test suites across dynamic pools of devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "fleet.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Test list: one `package.Class#method` per line, or a JSON array
        #[arg(short, long)]
        tests: PathBuf,

        /// Override the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Where to write the configuration
        #[arg(short, long, default_value = "fleet.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { tests, output } => run_tests(&cli.config, &tests, output, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { path } => init_config(&path),
    }
}

async fn run_tests(
    config_path: &Path,
    tests_path: &Path,
    output: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(output) = output {
        config.fleet.output_dir = output;
    }
    info!("Loaded configuration from {}", config_path.display());

    let tests = fleet::test::load_tests(tests_path)?;
    info!("Loaded {} tests from {}", tests.len(), tests_path.display());

    let metrics = metrics::from_config(&config.metrics)?;
    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(
        verbose || config.report.verbose,
        config.report.progress,
    ));
    if let MetricsConfig::History(history) = &config.metrics {
        reporter = reporter.with_reporter(HistoryRecorder::new(&history.path));
    }

    let provider = LocalProvider::from_config(&config.provider);
    let scheduler = Scheduler::new(config, provider, metrics, Arc::new(reporter));

    let result = scheduler.execute(tests).await?;
    std::process::exit(result.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Output dir: {}", config.fleet.output_dir.display());
    println!("  Batch timeout: {}s", config.fleet.batch_timeout_secs);
    println!("  Output timeout: {}s", config.fleet.output_timeout_secs);
    println!("  No-devices timeout: {}s", config.fleet.no_devices_timeout_secs);

    let (provider_name, devices) = match &config.provider {
        ProviderConfig::Local(local) => ("local", local.devices.len()),
        ProviderConfig::Stub(stub) => ("stub", stub.devices.len()),
    };
    println!("  Provider: {} ({} devices)", provider_name, devices);

    let metrics_name = match &config.metrics {
        MetricsConfig::None => "none".to_string(),
        MetricsConfig::History(history) => format!("history ({})", history.path.display()),
    };
    println!("  Metrics: {}", metrics_name);

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# fleet configuration file

[fleet]
output_dir = "fleet-output"
batch_timeout_secs = 1800
output_timeout_secs = 300
no_devices_timeout_secs = 600
history_window_days = 30

[strategies.pooling]
type = "operating-system"

[strategies.sorting]
type = "success-rate"

[strategies.batching]
type = "fixed-size"
size = 5

[strategies.flakiness]
type = "probability-based"
min_success_rate = 0.8

[strategies.retry]
type = "fixed-quota"
total_allowed_retry_quota = 200
retry_per_test_quota = 3

[metrics]
type = "history"
path = "fleet-history.json"

[provider]
type = "local"

# Each device runs `run_command` with the batch's test names appended and
# prints PASSED/FAILED/IGNORED lines for them.
[[provider.devices]]
serial = "emulator-5554"
os_version = "29"
prepare_command = "adb -s emulator-5554 install -r app.apk"
run_command = "./scripts/run-tests.sh emulator-5554"

[report]
verbose = false
progress = true
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, SAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fleet run --tests tests.txt");

    Ok(())
}
