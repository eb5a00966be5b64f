//! lambdabats CLI - run a bats suite by fanning each test out to
//! short-lived cloud sandboxes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lambdabats::config::{self, OutputFormat, Strategy, TargetArch};
use lambdabats::discovery::TestInventory;
use lambdabats::report;
use lambdabats::runner::{LocalRunner, Runner, SkipRunner};
use lambdabats::schedule::Dispatcher;

#[derive(Parser)]
#[command(name = "lambdabats")]
#[command(about = "Run a bats test suite against remote sandboxes", long_about = None)]
#[command(version)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    /// Format for the test results output
    #[arg(short = 'F', long = "format", value_enum, default_value_t = OutputFormat::Pretty)]
    format: OutputFormat,

    /// Execution strategy: lambda runs most tests remote and some locally,
    /// lambda_skip skips the local ones, lambda_emulator targets a local
    /// function emulator
    #[arg(short = 's', long = "strategy", value_enum, default_value_t = Strategy::Lambda)]
    strategy: Strategy,

    /// Target architecture for the sandbox binaries
    #[arg(long = "arch", value_enum, default_value_t = TargetArch::Arm64)]
    arch: TargetArch,

    /// Build and upload the test artifacts, print their locations, and exit
    #[arg(long = "build-only")]
    build_only: bool,

    /// Environment variable to set in the remote invocation, for example
    /// --env SQL_ENGINE=remote-engine
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = config::parse_env_var)]
    env: Vec<String>,

    /// Use credentials from the environment instead of the built-in
    /// developer configuration
    #[arg(long = "use-aws-environment-credentials")]
    use_aws_environment_credentials: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Bats directories or files to run; all must share one directory
    #[arg(value_name = "BATS_DIR_OR_FILES", required = true)]
    paths: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// SSO login to AWS as a developer. Requires the AWS CLI.
    Login {
        /// Use the device-code flow instead of opening a browser
        #[arg(long)]
        headless: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(Commands::Login { headless }) = cli.command {
        std::process::exit(config::do_login(headless).await?);
    }

    run_tests(cli).await
}

async fn run_tests(cli: Cli) -> Result<()> {
    let mut build_only = cli.build_only;
    if cli.arch == TargetArch::Amd64 {
        println!("Forcing --build-only because x86 is not supported");
        build_only = true;
    }

    let dolt_src_dir =
        config::find_dolt_src_dir(&cli.paths).context("could not find dolt source directory")?;

    let (run_config, fallback): (config::RunConfig, Arc<dyn Runner>) = match cli.strategy {
        Strategy::Lambda => {
            let cfg = config::aws_run_config(cli.use_aws_environment_credentials)?;
            let local = LocalRunner::new(dolt_src_dir.join("integration-tests/bats"));
            (cfg, Arc::new(local))
        }
        Strategy::LambdaSkip => {
            let cfg = config::aws_run_config(cli.use_aws_environment_credentials)?;
            let skip = SkipRunner::new("lambda runner does not support virtual ttys");
            (cfg, Arc::new(skip))
        }
        Strategy::LambdaEmulator => {
            let cfg = config::emulator_run_config()?;
            // No sandbox restrictions apply locally; tagged tests run
            // through the emulator like everything else.
            let runner = Arc::clone(&cfg.runner);
            (cfg, runner)
        }
    };

    let bundle = lambdabats::artifact::build_bundle(&dolt_src_dir, cli.arch.as_str())
        .await
        .context("building test artifacts")?;

    if build_only {
        println!("Dolt Binary: {}", bundle.dolt_tar.display());
        println!("RemoteSrv Binary: {}", bundle.bin_tar.display());
        println!("Test Artifacts: {}", bundle.bats_tar.display());
    }

    run_config
        .uploader
        .upload(&bundle)
        .await
        .context("uploading test artifacts")?;

    if build_only {
        println!("Test artifacts saved. Exiting.");
        return Ok(());
    }

    let keys = bundle.keys();
    for path in [&bundle.dolt_tar, &bundle.bin_tar, &bundle.bats_tar] {
        let _ = std::fs::remove_file(path);
    }

    let mut inventory = TestInventory::load(&cli.paths)?;
    let total = inventory.total_tests();
    info!(total, "loaded test inventory");

    let bar = ProgressBar::new(total as u64).with_message("running tests");
    let dispatcher = Dispatcher::new(
        Arc::clone(&run_config.runner),
        fallback,
        run_config.concurrency,
    );
    dispatcher
        .dispatch(&mut inventory, &keys, &cli.env, &bar)
        .await
        .context("test run failed")?;
    bar.finish();

    let stdout = std::io::stdout();
    let code = match cli.format {
        OutputFormat::Pretty => report::render_pretty(
            &inventory.files,
            &mut stdout.lock(),
            console::colors_enabled(),
        )?,
        OutputFormat::Tap => report::render_tap(&inventory.files, &mut stdout.lock())?,
    };
    std::process::exit(code);
}
