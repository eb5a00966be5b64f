//! The sandbox-side executor.
//!
//! One externally reachable operation: take a run-test request, make sure
//! the three artifact archives are materialized locally, wipe the
//! per-invocation scratch directories, run the harness against the single
//! filtered test, and hand back its combined output.
//!
//! The handler answers 200 even when the test fails; the driver decides
//! pass/fail from the reply. Only infrastructural problems (fetch, unpack,
//! filesystem) propagate as errors and become a 500 at the transport layer.

pub mod cache;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::runner::{combined_output, exit_error_string};
use crate::store::ObjectStore;
use crate::wire::{FunctionUrlRequest, FunctionUrlResponse, RunTestRequest, RunTestResult};

pub use cache::{ArtifactCache, CacheError};

/// Errors that make the invocation itself fail, as opposed to the test.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("payload codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache class directories, one per artifact kind.
const TESTS_CLASS: &str = "downloaded_tests";
const BINS_CLASS: &str = "downloaded_bins";
const DOLTS_CLASS: &str = "downloaded_dolts";

/// Per-invocation scratch, wiped and recreated on every request.
const SCRATCH_TMPDIR: &str = "bats_test_tmpdir";
const SCRATCH_HOME: &str = "bats_test_home";

/// The executor service: an artifact cache plus the harness invocation.
pub struct Executor {
    cache: ArtifactCache,
    tmp_root: PathBuf,
}

impl Executor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_tmp_root(store, std::env::temp_dir())
    }

    pub fn with_tmp_root(store: Arc<dyn ObjectStore>, tmp_root: PathBuf) -> Self {
        Self {
            cache: ArtifactCache::new(store),
            tmp_root,
        }
    }

    /// Handle one invocation envelope.
    pub async fn handle(
        &self,
        envelope: FunctionUrlRequest,
    ) -> Result<FunctionUrlResponse, ExecutorError> {
        let req: RunTestRequest = serde_json::from_str(&envelope.body)?;

        if let Some(missing) = validate(&req) {
            return Ok(FunctionUrlResponse::new(400, format!("must supply {missing}")));
        }

        info!(test = %req.test_name, file = %req.file_name, "handling test request");

        let tests_dest = self.tmp_root.join(TESTS_CLASS).join(&req.bats_location);
        let bins_dest = self.tmp_root.join(BINS_CLASS).join(&req.bin_location);
        let dolts_dest = self.tmp_root.join(DOLTS_CLASS).join(&req.dolt_location);

        self.cache
            .ensure_unpacked(&tests_dest, &req.bats_location)
            .await?;
        self.cache
            .ensure_unpacked(&bins_dest, &req.bin_location)
            .await?;
        self.cache
            .ensure_unpacked(&dolts_dest, &req.dolt_location)
            .await?;

        let scratch_tmp = self.tmp_root.join(SCRATCH_TMPDIR);
        let scratch_home = self.tmp_root.join(SCRATCH_HOME);
        provision_scratch(&scratch_tmp).await?;
        provision_scratch(&scratch_home).await?;

        let path_prefix = format!(
            "{}:{}",
            dolts_dest.join("bin").display(),
            bins_dest.join("bin").display()
        );
        let env = harness_env(&req.env_vars, &path_prefix, &scratch_tmp, &scratch_home);

        debug!(filter = %req.test_filter, "invoking bats");
        let out = tokio::process::Command::new("bats")
            .args(["-F", "junit", "-f", &req.test_filter, &req.file_name])
            .current_dir(tests_dest.join("bats"))
            .envs(env)
            .output()
            .await?;

        let reply = RunTestResult {
            output: combined_output(&out.stdout, &out.stderr),
            err: if out.status.success() {
                String::new()
            } else {
                exit_error_string(&out.status)
            },
        };

        Ok(FunctionUrlResponse::new(200, serde_json::to_string(&reply)?))
    }
}

/// Returns the name of the first missing required field, if any.
fn validate(req: &RunTestRequest) -> Option<&'static str> {
    if req.dolt_location.is_empty() {
        return Some("dolt_location");
    }
    if req.bin_location.is_empty() {
        return Some("bin_location");
    }
    if req.bats_location.is_empty() {
        return Some("bats_location");
    }
    if req.file_name.is_empty() {
        return Some("file_name");
    }
    if req.test_name.is_empty() {
        return Some("test_name");
    }
    if req.test_filter.is_empty() {
        return Some("test_filter");
    }
    None
}

/// The harness environment on top of the inherited process environment:
/// request settings first, then the reserved variables, so a request can
/// never override `PATH`, `TMPDIR`, or `HOME`.
fn harness_env(
    env_vars: &[String],
    path_prefix: &str,
    tmpdir: &Path,
    home: &Path,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = env_vars
        .iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let inherited_path = std::env::var("PATH").unwrap_or_default();
    env.push((
        "PATH".to_string(),
        format!("{path_prefix}:{inherited_path}"),
    ));
    env.push(("TMPDIR".to_string(), tmpdir.display().to_string()));
    env.push(("HOME".to_string(), home.display().to_string()));
    env
}

/// Wipe and recreate one scratch directory. Tests occasionally leave
/// entries without write permission behind; loosen modes and retry once
/// before giving up.
async fn provision_scratch(dir: &Path) -> Result<(), ExecutorError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => {
            let _ = tokio::process::Command::new("chmod")
                .arg("-R")
                .arg("777")
                .arg(dir)
                .output()
                .await;
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::store::DirStore;
    use crate::wire;

    fn envelope_for(req: &RunTestRequest) -> FunctionUrlRequest {
        FunctionUrlRequest {
            version: "2.0".to_string(),
            raw_path: "/".to_string(),
            body: serde_json::to_string(req).unwrap(),
        }
    }

    fn full_request() -> RunTestRequest {
        RunTestRequest {
            bats_location: "BATSKEY0".into(),
            bin_location: "BINKEY00".into(),
            dolt_location: "DOLTKEY0".into(),
            file_name: "t.bats".into(),
            test_name: "t1".into(),
            test_filter: "^t1$".into(),
            env_vars: Vec::new(),
        }
    }

    fn executor_over(shared: &Path, tmp_root: PathBuf) -> Executor {
        Executor::with_tmp_root(Arc::new(DirStore::new(shared)), tmp_root)
    }

    #[tokio::test]
    async fn missing_fields_get_400_in_order() {
        let shared = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();
        let executor = executor_over(shared.path(), sandbox.path().to_path_buf());

        let cases: &[(fn(&mut RunTestRequest), &str)] = &[
            (|r| r.dolt_location.clear(), "must supply dolt_location"),
            (|r| r.bin_location.clear(), "must supply bin_location"),
            (|r| r.bats_location.clear(), "must supply bats_location"),
            (|r| r.file_name.clear(), "must supply file_name"),
            (|r| r.test_name.clear(), "must supply test_name"),
            (|r| r.test_filter.clear(), "must supply test_filter"),
        ];
        for (mutate, want) in cases {
            let mut req = full_request();
            mutate(&mut req);
            let resp = executor.handle(envelope_for(&req)).await.unwrap();
            assert_eq!(resp.status_code, 400);
            assert_eq!(resp.body, *want);
        }
    }

    #[tokio::test]
    async fn old_dialect_body_is_rejected() {
        let shared = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();
        let executor = executor_over(shared.path(), sandbox.path().to_path_buf());

        let envelope = FunctionUrlRequest {
            version: "2.0".to_string(),
            raw_path: "/".to_string(),
            body: r#"{"test_location":"K","file_name":"t.bats","test_name":"t1","test_filter":"^t1$"}"#
                .to_string(),
        };
        let resp = executor.handle(envelope).await.unwrap();
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.body, "must supply dolt_location");
    }

    #[tokio::test]
    async fn unparseable_body_is_an_error() {
        let shared = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();
        let executor = executor_over(shared.path(), sandbox.path().to_path_buf());

        let envelope = FunctionUrlRequest {
            version: "2.0".to_string(),
            raw_path: "/".to_string(),
            body: "not json".to_string(),
        };
        assert!(matches!(
            executor.handle(envelope).await,
            Err(ExecutorError::Codec(_))
        ));
    }

    #[test]
    fn reserved_env_vars_cannot_be_overridden() {
        let env = harness_env(
            &[
                "PATH=/evil".to_string(),
                "TMPDIR=/evil".to_string(),
                "SQL_ENGINE=remote-engine".to_string(),
                "garbage-without-equals".to_string(),
            ],
            "/cache/dolt/bin:/cache/bin/bin",
            Path::new("/tmp/bats_test_tmpdir"),
            Path::new("/tmp/bats_test_home"),
        );

        // Later entries win when the same key appears twice.
        let resolved: std::collections::HashMap<_, _> = env.into_iter().collect();
        assert!(resolved["PATH"].starts_with("/cache/dolt/bin:/cache/bin/bin:"));
        assert_eq!(resolved["TMPDIR"], "/tmp/bats_test_tmpdir");
        assert_eq!(resolved["HOME"], "/tmp/bats_test_home");
        assert_eq!(resolved["SQL_ENGINE"], "remote-engine");
        assert!(!resolved.contains_key("garbage-without-equals"));
    }

    /// End-to-end pass through the handler with a stub harness: the dolt
    /// archive ships a fake `bin/bats` that prints canned JUnit, and the
    /// prepended PATH makes the handler pick it up.
    #[cfg(unix)]
    #[tokio::test]
    async fn handle_runs_harness_and_wraps_reply() {
        use std::io::Write;

        let shared = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();

        let seed = |key: &str, entries: &[(&str, &[u8], u32)]| {
            let file = std::fs::File::create(shared.path().join(format!("{key}.tar"))).unwrap();
            let mut builder = tar::Builder::new(file);
            for (name, contents, mode) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(*mode);
                builder.append_data(&mut header, *name, *contents).unwrap();
            }
            builder.finish().unwrap();
        };

        let mut stub = Vec::new();
        writeln!(stub, "#!/bin/sh").unwrap();
        writeln!(
            stub,
            "echo '<testsuites><testsuite><testcase name=\"t1\"/></testsuite></testsuites>'"
        )
        .unwrap();
        seed(
            "DOLTKEY0",
            &[("bin/dolt", b"", 0o755), ("bin/bats", &stub, 0o755)],
        );
        seed("BINKEY00", &[("bin/remotesrv", b"", 0o755)]);
        seed("BATSKEY0", &[("bats/t.bats", b"@test \"t1\" {\n}\n", 0o644)]);

        let executor = executor_over(shared.path(), sandbox.path().to_path_buf());
        let resp = executor.handle(envelope_for(&full_request())).await.unwrap();
        assert_eq!(resp.status_code, 200);

        let reply = wire::reply_from_envelope_bytes(&serde_json::to_vec(&resp).unwrap()).unwrap();
        assert!(reply.err.is_empty());
        assert!(reply.output.contains("<testcase name=\"t1\"/>"));

        // Scratch directories are provisioned fresh.
        assert!(sandbox.path().join(SCRATCH_TMPDIR).is_dir());
        assert!(sandbox.path().join(SCRATCH_HOME).is_dir());
    }
}
