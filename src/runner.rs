//! Runner strategies.
//!
//! A [`Runner`] executes one test request and produces one reply. The
//! dispatcher picks a runner per test at submission time:
//!
//! - [`RemoteRunner`] - POST the function-URL envelope to the deployed
//!   function endpoint.
//! - [`EmulatorRunner`] - same envelope, POSTed to the local function
//!   emulator.
//! - [`LocalRunner`] - run the harness directly in the current filesystem,
//!   one test at a time, for tests the sandbox cannot host (virtual ttys).
//! - [`SkipRunner`] - synthesize a skipped result without running anything.
//!
//! Runner errors are transport-level problems and abort the whole run; a
//! failing or even crashing test is still a successful `run` call whose
//! reply carries the harness exit status.

use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::wire::{reply_from_envelope_bytes, to_envelope_bytes, RunTestRequest, RunTestResult};

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Transport-level failures. Any of these aborts the run; per-test failures
/// are carried inside [`RunTestResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invoke transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("envelope codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("failed to run test harness: {0}")]
    Io(#[from] std::io::Error),

    #[error("test run cancelled")]
    Cancelled,
}

/// Executes a single test request.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, req: &RunTestRequest) -> RunnerResult<RunTestResult>;
}

/// Runner that never executes anything and reports the test as skipped
/// with a fixed reason.
pub struct SkipRunner {
    reason: String,
}

impl SkipRunner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Runner for SkipRunner {
    async fn run(&self, req: &RunTestRequest) -> RunnerResult<RunTestResult> {
        Ok(RunTestResult {
            output: crate::report::skipped_case_output(&req.file_name, &req.test_name, &self.reason),
            err: String::new(),
        })
    }
}

/// Runner that executes the harness in-process against a local checkout.
///
/// Local tests share the working tree and the process environment, so only
/// one may run at a time; the mutex is the whole concurrency story here.
pub struct LocalRunner {
    bats_dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalRunner {
    pub fn new(bats_dir: impl Into<PathBuf>) -> Self {
        Self {
            bats_dir: bats_dir.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run(&self, req: &RunTestRequest) -> RunnerResult<RunTestResult> {
        let _guard = self.lock.lock().await;
        debug!(test = %req.test_name, "running test locally");

        let out = tokio::process::Command::new("bats")
            .args(["-F", "junit", "-f", &req.test_filter, &req.file_name])
            .current_dir(&self.bats_dir)
            .output()
            .await?;

        Ok(RunTestResult {
            output: combined_output(&out.stdout, &out.stderr),
            err: if out.status.success() {
                String::new()
            } else {
                exit_error_string(&out.status)
            },
        })
    }
}

/// Runner that POSTs the function-URL envelope to the local emulator.
pub struct EmulatorRunner {
    endpoint_url: String,
    client: reqwest::Client,
}

/// Invocation path exposed by the function runtime emulator.
pub const EMULATOR_ENDPOINT: &str =
    "http://localhost:8080/2015-03-31/functions/function/invocations";

impl EmulatorRunner {
    pub fn new() -> Self {
        Self::with_endpoint(EMULATOR_ENDPOINT)
    }

    pub fn with_endpoint(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for EmulatorRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for EmulatorRunner {
    async fn run(&self, req: &RunTestRequest) -> RunnerResult<RunTestResult> {
        post_envelope(&self.client, &self.endpoint_url, req).await
    }
}

/// Transport that delivers an envelope payload to the deployed function
/// and returns the response payload.
///
/// The wire contract admits two transports: an HTTP POST against the
/// function URL, and an SDK-level Invoke carrying the same envelope. The
/// former is [`FunctionUrlInvoker`]; the latter lives outside this crate
/// and plugs in through this trait.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, payload: Vec<u8>) -> RunnerResult<Vec<u8>>;
}

/// Invoker that POSTs the envelope to the function's HTTPS endpoint.
pub struct FunctionUrlInvoker {
    function_url: String,
    client: reqwest::Client,
}

impl FunctionUrlInvoker {
    pub fn new(function_url: impl Into<String>) -> Self {
        Self {
            function_url: function_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FunctionInvoker for FunctionUrlInvoker {
    async fn invoke(&self, payload: Vec<u8>) -> RunnerResult<Vec<u8>> {
        let resp = self
            .client
            .post(&self.function_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Runner that invokes the deployed function with a function-URL envelope.
pub struct RemoteRunner {
    invoker: Box<dyn FunctionInvoker>,
}

impl RemoteRunner {
    pub fn new(invoker: impl FunctionInvoker + 'static) -> Self {
        Self {
            invoker: Box::new(invoker),
        }
    }

    /// Convenience for the common transport: POST to a function URL.
    pub fn with_function_url(function_url: impl Into<String>) -> Self {
        Self::new(FunctionUrlInvoker::new(function_url))
    }
}

#[async_trait]
impl Runner for RemoteRunner {
    async fn run(&self, req: &RunTestRequest) -> RunnerResult<RunTestResult> {
        let payload = to_envelope_bytes(req)?;
        let response = self.invoker.invoke(payload).await?;
        Ok(reply_from_envelope_bytes(&response)?)
    }
}

async fn post_envelope(
    client: &reqwest::Client,
    url: &str,
    req: &RunTestRequest,
) -> RunnerResult<RunTestResult> {
    let body = to_envelope_bytes(req)?;
    let resp = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    let bytes = resp.bytes().await?;
    Ok(reply_from_envelope_bytes(&bytes)?)
}

/// Harness stdout and stderr, concatenated. The JUnit document arrives on
/// stdout, so stderr chatter lands after it and does not disturb parsing.
pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).into_owned();
    out.push_str(&String::from_utf8_lossy(stderr));
    out
}

/// Render an exit status the way the reply contract expects: a failing test
/// produces exactly `"exit status 1"`.
pub(crate) fn exit_error_string(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match status.signal() {
                    Some(sig) => format!("signal: {sig}"),
                    None => "terminated without exit status".to_string(),
                }
            }
            #[cfg(not(unix))]
            {
                "terminated without exit status".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TestRun;
    use crate::report::TestStatus;
    use crate::wire::{FunctionUrlRequest, FunctionUrlResponse};

    fn request(name: &str) -> RunTestRequest {
        RunTestRequest {
            bats_location: "bats".into(),
            bin_location: "bin".into(),
            dolt_location: "dolt".into(),
            file_name: "a.bats".into(),
            test_name: name.into(),
            test_filter: crate::discovery::escape_name_for_filter(name),
            env_vars: Vec::new(),
        }
    }

    #[tokio::test]
    async fn skip_runner_synthesizes_skipped_junit() {
        let runner = SkipRunner::new("lambda runner does not support virtual ttys");
        let reply = runner.run(&request("t1")).await.unwrap();
        assert!(reply.err.is_empty());

        let run = TestRun { response: reply };
        let res = run.result("t1").unwrap();
        assert_eq!(res.status, TestStatus::Skipped);
        assert_eq!(res.output, "lambda runner does not support virtual ttys");
    }

    /// Minimal emulator: one axum route that answers every invocation with
    /// a canned envelope.
    async fn serve_canned(response: FunctionUrlResponse) -> String {
        use axum::{routing::post, Json, Router};

        let app = Router::new().route(
            "/2015-03-31/functions/function/invocations",
            post(move |Json(envelope): Json<FunctionUrlRequest>| {
                let response = response.clone();
                async move {
                    assert_eq!(envelope.version, "2.0");
                    Json(response)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/2015-03-31/functions/function/invocations")
    }

    #[tokio::test]
    async fn emulator_runner_round_trips_reply() {
        let reply = RunTestResult {
            output: "<testsuites/>".into(),
            err: String::new(),
        };
        let endpoint = serve_canned(FunctionUrlResponse::new(
            200,
            serde_json::to_string(&reply).unwrap(),
        ))
        .await;

        let runner = EmulatorRunner::with_endpoint(endpoint);
        let got = runner.run(&request("t1")).await.unwrap();
        assert_eq!(got.output, "<testsuites/>");
        assert!(got.err.is_empty());
    }

    #[tokio::test]
    async fn non_200_envelope_becomes_reply_err() {
        let endpoint = serve_canned(FunctionUrlResponse::new(500, "sandbox exploded")).await;

        let runner = RemoteRunner::with_function_url(endpoint);
        let got = runner.run(&request("t1")).await.unwrap();
        assert!(got.err.contains("non-200 status code"));
        assert!(got.err.contains("sandbox exploded"));
    }

    #[tokio::test]
    async fn remote_runner_speaks_through_any_invoker() {
        /// Invoker that decodes the request itself and answers in kind.
        struct EchoInvoker;

        #[async_trait]
        impl FunctionInvoker for EchoInvoker {
            async fn invoke(&self, payload: Vec<u8>) -> RunnerResult<Vec<u8>> {
                let envelope: FunctionUrlRequest = serde_json::from_slice(&payload)?;
                let req: RunTestRequest = serde_json::from_str(&envelope.body)?;
                let reply = RunTestResult {
                    output: format!("ran {}", req.test_name),
                    err: String::new(),
                };
                let resp = FunctionUrlResponse::new(200, serde_json::to_string(&reply)?);
                Ok(serde_json::to_vec(&resp)?)
            }
        }

        let runner = RemoteRunner::new(EchoInvoker);
        let got = runner.run(&request("t1")).await.unwrap();
        assert_eq!(got.output, "ran t1");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        // Nothing listens on this port.
        let runner = EmulatorRunner::with_endpoint("http://127.0.0.1:1/invoke");
        match runner.run(&request("t1")).await {
            Err(RunnerError::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
