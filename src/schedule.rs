//! Bounded-concurrency fan-out over the test inventory.
//!
//! Every test becomes one work unit: build the wire request, pick the
//! runner (the fallback for tests tagged incompatible with the sandbox),
//! await the reply, and record it on the test. Units run inside a pool of
//! configured capacity; completion order is unspecified, and the reporter
//! later walks the inventory in enumeration order regardless.
//!
//! The first transport error cancels the whole group: units that have not
//! started yet observe the cancellation before doing any work, in-flight
//! invocations are abandoned at their next await point, and replies already
//! recorded stay recorded.

use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::artifact::ArtifactKeys;
use crate::discovery::{escape_name_for_filter, TestInventory, TestRun};
use crate::runner::{Runner, RunnerError, RunnerResult};
use crate::wire::{RunTestRequest, RunTestResult};

/// Tests carrying this tag are routed to the fallback runner.
pub const FALLBACK_TAG: &str = "no_lambda";

/// Fans the inventory out across a bounded pool of work units.
pub struct Dispatcher {
    runner: Arc<dyn Runner>,
    fallback: Arc<dyn Runner>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn Runner>, fallback: Arc<dyn Runner>, concurrency: usize) -> Self {
        Self {
            runner,
            fallback,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every test in the inventory once, recording each reply on its
    /// test. Returns the first transport error, if any; in that case some
    /// tests will have no recorded run.
    pub async fn dispatch(
        &self,
        inventory: &mut TestInventory,
        keys: &ArtifactKeys,
        env_vars: &[String],
        bar: &ProgressBar,
    ) -> RunnerResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let cancel = CancellationToken::new();
        let mut units: JoinSet<RunnerResult<(usize, usize, RunTestResult)>> = JoinSet::new();

        for (fi, file) in inventory.files.iter().enumerate() {
            for (ti, test) in file.tests.iter().enumerate() {
                let req = RunTestRequest {
                    bats_location: keys.bats.clone(),
                    bin_location: keys.bin.clone(),
                    dolt_location: keys.dolt.clone(),
                    file_name: file.name.clone(),
                    test_name: test.name.clone(),
                    test_filter: escape_name_for_filter(&test.name),
                    env_vars: env_vars.to_vec(),
                };
                let runner = if test.has_tag(FALLBACK_TAG) {
                    Arc::clone(&self.fallback)
                } else {
                    Arc::clone(&self.runner)
                };
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                let bar = bar.clone();

                units.spawn(async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                        permit = semaphore.acquire_owned() => {
                            permit.map_err(|_| RunnerError::Cancelled)?
                        }
                    };
                    let reply = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                        reply = runner.run(&req) => reply?,
                    };
                    bar.inc(1);
                    debug!(test = %req.test_name, "test completed");
                    Ok((fi, ti, reply))
                });
            }
        }

        let mut first_err: Option<RunnerError> = None;
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok((fi, ti, response))) => {
                    inventory.files[fi].tests[ti].runs.push(TestRun { response });
                }
                Ok(Err(RunnerError::Cancelled)) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        error!(%err, "test run failed, cancelling remaining work");
                        first_err = Some(err);
                        cancel.cancel();
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(RunnerError::Io(std::io::Error::other(join_err)));
                        cancel.cancel();
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
