//! Wire types exchanged between the driver and the sandbox executor.
//!
//! A test execution is a single request/reply pair. The request names the
//! three content-addressed artifacts the sandbox needs, the test to run,
//! and any extra environment; the reply carries the harness output verbatim.
//!
//! Both sides speak the Lambda-Function-URL v2 envelope: the request record
//! is serialized into the envelope `body` as a JSON string, and the reply is
//! recovered from the response envelope the same way. A non-200 envelope is
//! flattened into [`RunTestResult::err`] rather than surfaced as a transport
//! error, so the caller can record it as a fatal result for that one test.
//!
//! An older dialect of the request collapsed the three location fields into
//! a single `test_location`. Such payloads still parse as JSON but leave all
//! three locations empty, and the executor rejects them with a 400.

use serde::{Deserialize, Serialize};

/// Request to run a single test case inside the sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTestRequest {
    /// Key of the uploaded archive holding the `bats/` test tree.
    #[serde(default)]
    pub bats_location: String,

    /// Key of the uploaded archive holding auxiliary `bin/*` files.
    /// Currently `bin/remotesrv`.
    #[serde(default)]
    pub bin_location: String,

    /// Key of the uploaded archive holding `bin/dolt`.
    #[serde(default)]
    pub dolt_location: String,

    /// The test file to run, for example `sql-server.bats`.
    #[serde(default)]
    pub file_name: String,

    /// The test name within the file to run.
    #[serde(default)]
    pub test_name: String,

    /// The filter passed to the `bats` invocation to select the targeted
    /// test: an escaped, anchored form of `test_name`.
    #[serde(default)]
    pub test_filter: String,

    /// Extra `KEY=VALUE` settings for the harness environment. The sandbox
    /// forcibly sets `PATH`, `TMPDIR`, and `HOME` after these.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

/// Reply for a single test execution.
///
/// `output` is the harness' combined stdout and stderr, usually JUnit XML.
/// `err` is empty on clean exit, `"exit status 1"` when the harness exited
/// non-zero because a test case failed, or any other text for a deeper
/// failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTestResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub err: String,
}

/// Lambda-Function-URL v2 request envelope. Only the fields this system
/// reads and writes; everything else in the event is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionUrlRequest {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "rawPath", default)]
    pub raw_path: String,
    #[serde(default)]
    pub body: String,
}

/// Lambda-Function-URL v2 response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionUrlResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: i64,
    #[serde(default)]
    pub body: String,
}

impl FunctionUrlResponse {
    pub fn new(status_code: i64, body: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
        }
    }
}

/// Serialize a request into the function-URL envelope payload.
pub fn to_envelope_bytes(req: &RunTestRequest) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_string(req)?;
    let envelope = FunctionUrlRequest {
        version: "2.0".to_string(),
        raw_path: "/".to_string(),
        body,
    };
    serde_json::to_vec(&envelope)
}

/// Recover a reply from a function-URL response payload.
///
/// A non-200 envelope is not an error here: it becomes a reply whose `err`
/// preserves the status code and the raw response body.
pub fn reply_from_envelope_bytes(bytes: &[u8]) -> Result<RunTestResult, serde_json::Error> {
    let envelope: FunctionUrlResponse = serde_json::from_slice(bytes)?;
    if envelope.status_code != 200 {
        return Ok(RunTestResult {
            output: String::new(),
            err: format!(
                "non-200 status code in lambda response: code: {}, body: {}",
                envelope.status_code,
                String::from_utf8_lossy(bytes)
            ),
        });
    }
    serde_json::from_str(&envelope.body)
}
