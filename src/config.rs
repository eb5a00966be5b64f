//! Run configuration: execution strategies, endpoints, credential
//! selection, and source-tree discovery.
//!
//! A strategy bundles the three things that vary between environments: how
//! artifacts get uploaded, which runner executes the bulk of the tests, and
//! how wide the fan-out may be. The fallback runner for sandbox-incompatible
//! tests is chosen separately by the caller.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;

use crate::runner::{EmulatorRunner, FunctionUrlInvoker, RemoteRunner, Runner};
use crate::store::HttpStore;
use crate::upload::{CopyingUploader, StoreUploader, Uploader};

/// Bucket holding the content-addressed artifact archives.
pub const S3_BUCKET_NAME: &str = "dolt-cloud-test-run-artifacts";

/// Name of the deployed test-runner function.
pub const LAMBDA_FUNCTION_NAME: &str = "dolt_bats_test_runner";

const ARTIFACT_STORE_URL_VAR: &str = "LAMBDABATS_ARTIFACT_STORE_URL";
const FUNCTION_URL_VAR: &str = "LAMBDABATS_FUNCTION_URL";

/// How test executions are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Run most tests remotely, incompatible ones locally.
    Lambda,
    /// Run most tests remotely, skip incompatible ones.
    #[value(name = "lambda_skip")]
    LambdaSkip,
    /// Run every test against a local function emulator.
    #[value(name = "lambda_emulator")]
    LambdaEmulator,
}

/// Report output form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Tap,
}

/// Target architecture for the sandbox binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArch {
    Amd64,
    Arm64,
}

impl TargetArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::Amd64 => "amd64",
            TargetArch::Arm64 => "arm64",
        }
    }
}

/// Everything the driver needs to run one strategy.
pub struct RunConfig {
    pub concurrency: usize,
    pub uploader: Box<dyn Uploader>,
    pub runner: Arc<dyn Runner>,
    /// Keeps the materialized AWS config file alive for the whole run.
    _aws_config: Option<tempfile::NamedTempFile>,
}

/// Configuration for the emulator strategy: artifacts are copied into the
/// directory the emulator container mounts, and everything runs through the
/// local endpoint one test at a time.
pub fn emulator_run_config() -> Result<RunConfig> {
    let wd = std::env::current_dir().context("reading working directory")?;
    Ok(RunConfig {
        concurrency: 1,
        uploader: Box::new(CopyingUploader::new(wd.join("../docker/uploads"))),
        runner: Arc::new(EmulatorRunner::new()),
        _aws_config: None,
    })
}

/// Configuration for the remote strategies.
///
/// With `env_creds` unset, the embedded developer AWS config is written to
/// a temp file and exported for the duration of the run so ambient tooling
/// resolves the developer role; otherwise the environment is taken as-is.
pub fn aws_run_config(env_creds: bool) -> Result<RunConfig> {
    let function_url = std::env::var(FUNCTION_URL_VAR).with_context(|| {
        format!(
            "{FUNCTION_URL_VAR} must point at the function URL of the deployed \
             {LAMBDA_FUNCTION_NAME} function"
        )
    })?;
    aws_run_config_with(artifact_store_url(), function_url, env_creds)
}

fn aws_run_config_with(
    store_url: String,
    function_url: String,
    env_creds: bool,
) -> Result<RunConfig> {
    let aws_config = if env_creds {
        None
    } else {
        let file = write_aws_config()?;
        std::env::set_var("AWS_CONFIG_FILE", file.path());
        std::env::set_var("AWS_PROFILE", "corp_runner");
        Some(file)
    };

    Ok(RunConfig {
        concurrency: 512,
        uploader: Box::new(StoreUploader::new(HttpStore::new(store_url))),
        runner: Arc::new(RemoteRunner::new(FunctionUrlInvoker::new(function_url))),
        _aws_config: aws_config,
    })
}

/// Base URL of the artifact object store.
pub fn artifact_store_url() -> String {
    std::env::var(ARTIFACT_STORE_URL_VAR)
        .unwrap_or_else(|_| format!("https://{S3_BUCKET_NAME}.s3.us-west-2.amazonaws.com"))
}

/// Locate the dolt source tree from the first test path: test files live
/// two levels below the repository root (`integration-tests/bats`).
pub fn find_dolt_src_dir(args: &[PathBuf]) -> Result<PathBuf> {
    let first = args.first().context("must supply tests to run")?;
    let meta = std::fs::metadata(first)
        .with_context(|| format!("could not open test path {}", first.display()))?;

    let dolt_dir = if meta.is_dir() {
        first.join("../..")
    } else {
        match first.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.join("../.."),
            _ => PathBuf::from("../.."),
        }
    };

    let meta = std::fs::metadata(&dolt_dir).with_context(|| {
        format!(
            "could not find dolt src directory from first file argument: {}",
            first.display()
        )
    })?;
    ensure!(
        meta.is_dir(),
        "could not find dolt src directory from first file argument: {}",
        first.display()
    );
    Ok(dolt_dir)
}

/// clap value parser for `--env KEY=VALUE` settings.
pub fn parse_env_var(val: &str) -> Result<String, String> {
    if !val.contains('=') {
        return Err(format!(
            "expected an environment variable setting such as ENVVAR=VALUE, got: {val}"
        ));
    }
    Ok(val.to_string())
}

/// Developer AWS configuration: an SSO session plus the role that may
/// invoke the test-runner function.
const AWS_CONFIG: &str = "
[default]
region = us-west-2

[profile corp_runner]
role_arn = arn:aws:iam::407903926827:role/RunBatsInLambda
region = us-west-2
source_profile = corp_sso_developer

[profile corp_sso_developer]
sso_session = dolthub_sso_session
sso_account_id = 407903926827
sso_role_name = DoltHubDeveloper
region = us-west-2

[sso-session dolthub_sso_session]
sso_start_url = https://d-90678b8781.awsapps.com/start#
sso_region = us-east-1
sso_registration_scopes = sso:account:access
";

fn write_aws_config() -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("lambda-bats-aws-config-")
        .tempfile()
        .context("creating AWS config file")?;
    use std::io::Write;
    file.write_all(AWS_CONFIG.as_bytes())
        .context("writing AWS config file")?;
    file.flush()?;
    Ok(file)
}

/// Delegate to `aws sso login` with the embedded config. The CLI handles
/// the whole SSO flow; we only point it at the right session.
pub async fn do_login(headless: bool) -> Result<i32> {
    let config = write_aws_config()?;

    let mut cmd = tokio::process::Command::new("aws");
    cmd.args(["sso", "login", "--sso-session", "dolthub_sso_session"]);
    if headless {
        cmd.arg("--use-device-code");
    }
    cmd.env("AWS_CONFIG_FILE", config.path());

    let status = cmd
        .status()
        .await
        .context("error running `aws sso login`; is the AWS CLI installed?")?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dolt_src_dir_from_directory_argument() {
        let root = TempDir::new().unwrap();
        let bats = root.path().join("integration-tests/bats");
        std::fs::create_dir_all(&bats).unwrap();

        let found = find_dolt_src_dir(&[bats]).unwrap();
        assert_eq!(
            found.canonicalize().unwrap(),
            root.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn dolt_src_dir_from_file_argument() {
        let root = TempDir::new().unwrap();
        let bats = root.path().join("integration-tests/bats");
        std::fs::create_dir_all(&bats).unwrap();
        let file = bats.join("types.bats");
        std::fs::write(&file, "@test \"t\" {\n}\n").unwrap();

        let found = find_dolt_src_dir(&[file]).unwrap();
        assert_eq!(
            found.canonicalize().unwrap(),
            root.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn missing_source_tree_is_an_error() {
        let dir = TempDir::new().unwrap();
        let stray = dir.path().join("stray.bats");
        std::fs::write(&stray, "").unwrap();
        // `<dir>/../..` exists but the argument itself must, too.
        assert!(find_dolt_src_dir(&[dir.path().join("missing.bats")]).is_err());
        assert!(find_dolt_src_dir(&[stray]).is_ok());
    }

    #[test]
    fn env_var_settings_must_contain_equals() {
        assert!(parse_env_var("SQL_ENGINE=remote-engine").is_ok());
        assert!(parse_env_var("SQL_ENGINE").is_err());
    }

    #[test]
    fn emulator_config_is_serial() {
        let config = emulator_run_config().unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn aws_config_fan_out_width() {
        let config = aws_run_config_with(
            "https://artifacts.example".to_string(),
            "https://fn.example".to_string(),
            true,
        )
        .unwrap();
        assert_eq!(config.concurrency, 512);
        assert!(config._aws_config.is_none());
    }
}
