//! # lambdabats
//!
//! A distributed runner for a large bats integration suite. Instead of
//! executing the suite sequentially on one host, the driver fans every
//! individual `@test` case out to a stateless sandbox running in a
//! short-lived, cloud-function-style environment, collects all replies, and
//! prints one unified report. The same crate also ships the sandbox-side
//! executor, a local emulator mode, and an in-process fallback for tests
//! the sandbox cannot host.
//!
//! ## Architecture
//!
//! The driver pipeline, in order:
//!
//! - [`artifact`] builds three content-addressed tar archives: the system
//!   under test (`bin/dolt`), auxiliary binaries (`bin/remotesrv`), and the
//!   `bats/` test tree. Keys are the base32-hex SHA-256 of the archive
//!   bytes, so identical builds dedupe across driver runs.
//! - [`upload`] pushes the archives through an [`store::ObjectStore`],
//!   probing each key first and skipping what is already present.
//! - [`discovery`] scans the test files into a [`discovery::TestInventory`]
//!   with a line-oriented parse of `@test` declarations and tag comments.
//! - [`schedule`] fans the inventory out across a bounded pool, choosing a
//!   [`runner::Runner`] per test: the configured main runner, or the
//!   fallback for tests tagged `no_lambda`.
//! - [`report`] classifies every reply (JUnit parse in [`report::junit`])
//!   and renders the pretty or TAP form, yielding the exit code.
//!
//! On the other side, [`server`] implements the executor: it materializes
//! the three archives on first use behind a sentinel-guarded cache, wipes
//! the per-invocation scratch directories, runs the harness against the one
//! filtered test, and returns its combined output in the wire reply.
//!
//! [`wire`] defines the request/reply records and the Lambda-Function-URL
//! envelope both sides speak; [`config`] selects strategies, endpoints, and
//! credentials for the driver CLI.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use indicatif::ProgressBar;
//! use lambdabats::discovery::TestInventory;
//! use lambdabats::runner::SkipRunner;
//! use lambdabats::schedule::Dispatcher;
//! use lambdabats::{artifact, config, report};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let paths = vec![PathBuf::from("../dolt/integration-tests/bats")];
//!     let dolt_src = config::find_dolt_src_dir(&paths)?;
//!
//!     // Build and upload the content-addressed artifact bundle.
//!     let run = config::aws_run_config(false)?;
//!     let bundle = artifact::build_bundle(&dolt_src, "arm64").await?;
//!     run.uploader.upload(&bundle).await?;
//!
//!     // Fan the suite out, skipping tests the sandbox cannot host.
//!     let mut inventory = TestInventory::load(&paths)?;
//!     let bar = ProgressBar::new(inventory.total_tests() as u64);
//!     let fallback = Arc::new(SkipRunner::new("no virtual tty in the sandbox"));
//!     Dispatcher::new(run.runner.clone(), fallback, run.concurrency)
//!         .dispatch(&mut inventory, &bundle.keys(), &[], &bar)
//!         .await?;
//!
//!     let code = report::render_pretty(&inventory.files, &mut std::io::stdout(), true)?;
//!     std::process::exit(code);
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod discovery;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod server;
pub mod store;
pub mod upload;
pub mod wire;

pub use discovery::{Test, TestFile, TestInventory, TestRun};
pub use report::{ResultError, TestRunResult, TestStatus};
pub use runner::Runner;
pub use schedule::Dispatcher;
pub use wire::{RunTestRequest, RunTestResult};
