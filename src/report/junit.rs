//! Interpretation of executor replies as per-test results.
//!
//! The harness emits one JUnit XML document per invocation. A reply is
//! classified in two steps: first the transport-level `err` field decides
//! whether the run even produced a verdict (anything other than empty or
//! `"exit status 1"` is an infrastructure failure), then the XML is searched
//! for the one `<testcase>` matching the test name.

use serde::Deserialize;

use crate::discovery::TestRun;

/// Verdict for a single test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Success,
    Failure,
    Skipped,
}

/// A parsed verdict plus its detail text (failure output or skip reason).
#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub status: TestStatus,
    pub output: String,
}

/// Fatal outcomes: the system could not determine pass/fail for the test.
/// Distinct from a test failure, which is a [`TestStatus::Failure`].
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    /// The runner reported a transport or sandbox problem.
    #[error("{0}")]
    Infrastructure(String),

    /// The reply output was not parseable JUnit XML.
    #[error("could not parse junit output")]
    MalformedXml,

    /// The document did not contain exactly one `<testsuite>`.
    #[error("expected one testsuite element")]
    WrongShape,

    /// No `<testcase>` carried the expected name.
    #[error("expected to find a testcase element with name \"{0}\"")]
    CaseNotFound(String),
}

#[derive(Debug, Deserialize)]
struct JUnitReport {
    #[serde(rename = "testsuite", default)]
    testsuites: Vec<TestSuite>,
}

#[derive(Debug, Deserialize)]
struct TestSuite {
    #[serde(rename = "testcase", default)]
    testcases: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
struct TestCase {
    #[serde(rename = "@name")]
    name: String,
    skipped: Option<Detail>,
    failure: Option<Detail>,
}

/// Element body of `<skipped>` / `<failure>`; attributes are ignored and an
/// empty element yields an empty string.
#[derive(Debug, Default, Deserialize)]
struct Detail {
    #[serde(rename = "$text", default)]
    text: String,
}

impl TestRun {
    /// Classify this run's reply for the test named `name`.
    pub fn result(&self, name: &str) -> Result<TestRunResult, ResultError> {
        if !self.response.err.is_empty() && self.response.err != "exit status 1" {
            return Err(ResultError::Infrastructure(self.response.err.clone()));
        }

        let report: JUnitReport = quick_xml::de::from_str(self.response.output.trim())
            .map_err(|_| ResultError::MalformedXml)?;

        if report.testsuites.len() != 1 {
            return Err(ResultError::WrongShape);
        }

        let case = report.testsuites[0]
            .testcases
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ResultError::CaseNotFound(name.to_string()))?;

        if let Some(skipped) = &case.skipped {
            return Ok(TestRunResult {
                status: TestStatus::Skipped,
                output: skipped.text.clone(),
            });
        }
        if let Some(failure) = &case.failure {
            return Ok(TestRunResult {
                status: TestStatus::Failure,
                output: failure.text.clone(),
            });
        }
        Ok(TestRunResult {
            status: TestStatus::Success,
            output: String::new(),
        })
    }
}

/// Synthesize the JUnit document a skipped run would have produced. Used by
/// the skip runner so its replies flow through the same parsing path as
/// real harness output.
pub fn skipped_case_output(file_name: &str, test_name: &str, reason: &str) -> String {
    let file_name = quick_xml::escape::escape(file_name);
    let test_name = quick_xml::escape::escape(test_name);
    let reason = quick_xml::escape::escape(reason);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites time="0">
<testsuite name="{file_name}" tests="1" failures="0" errors="0" skipped="1" time="0">
    <testcase classname="{file_name}" name="{test_name}" time="0">
       <skipped>{reason}</skipped>
    </testcase>
</testsuite>
</testsuites>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RunTestResult;

    fn run(output: &str, err: &str) -> TestRun {
        TestRun {
            response: RunTestResult {
                output: output.to_string(),
                err: err.to_string(),
            },
        }
    }

    #[test]
    fn passing_case() {
        let tr = run(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites time="12.037">
<testsuite name="sql-server-remotesrv.bats" tests="1" failures="0" errors="0" skipped="0" time="12.037" timestamp="2023-12-21T23:48:08" hostname="feb1f90d66dc">
    <testcase classname="sql-server-remotesrv.bats" name="sql-server-remotesrv: push to non-existent database fails" time="12.037" />

</testsuite>
</testsuites>
"#,
            "",
        );
        let res = tr
            .result("sql-server-remotesrv: push to non-existent database fails")
            .unwrap();
        assert_eq!(res.status, TestStatus::Success);
    }

    #[test]
    fn skipped_case_with_reason() {
        let tr = run(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites time="0">
<testsuite name="sql-server-remotesrv.bats" tests="1" failures="0" errors="0" skipped="1" time="0">
    <testcase classname="sql-server-remotesrv.bats" name="create remote branch as super user" time="0">
        <skipped>this is a skipped test</skipped>
    </testcase>
</testsuite>
</testsuites>
"#,
            "",
        );
        let res = tr.result("create remote branch as super user").unwrap();
        assert_eq!(res.status, TestStatus::Skipped);
        assert_eq!(res.output, "this is a skipped test");
    }

    #[test]
    fn failing_case_keeps_failure_text() {
        let tr = run(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites time="0.586">
<testsuite name="sql-server-remotesrv.bats" tests="1" failures="1" errors="0" skipped="0" time="0.586">
    <testcase classname="sql-server-remotesrv.bats" name="delete remote dirty branch requires force" time="0.586">
        <failure type="failure">(in test file sql-server-remotesrv.bats, line 596)
Successfully initialized dolt data repository.
http server exited</failure>
    </testcase>
</testsuite>
</testsuites>
"#,
            "exit status 1",
        );
        let res = tr.result("delete remote dirty branch requires force").unwrap();
        assert_eq!(res.status, TestStatus::Failure);
        assert!(res.output.contains("http server exited"));
    }

    #[test]
    fn transport_error_is_infrastructure() {
        let tr = run("", "connection reset by peer");
        let err = tr.result("t1").unwrap_err();
        assert!(matches!(err, ResultError::Infrastructure(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn exit_status_one_is_not_infrastructure() {
        // The harness exits 1 when a case fails; the XML decides the verdict.
        let tr = run(
            r#"<testsuites><testsuite><testcase name="t1"><failure>why</failure></testcase></testsuite></testsuites>"#,
            "exit status 1",
        );
        let res = tr.result("t1").unwrap();
        assert_eq!(res.status, TestStatus::Failure);
        assert_eq!(res.output, "why");
    }

    #[test]
    fn garbage_output_is_malformed() {
        let tr = run("not xml", "");
        assert!(matches!(tr.result("t1"), Err(ResultError::MalformedXml)));
    }

    #[test]
    fn two_testsuites_is_wrong_shape() {
        let tr = run(
            r#"<testsuites><testsuite></testsuite><testsuite></testsuite></testsuites>"#,
            "",
        );
        assert!(matches!(tr.result("t1"), Err(ResultError::WrongShape)));
    }

    #[test]
    fn missing_case_is_fatal() {
        let tr = run(
            r#"<testsuites><testsuite><testcase name="other"/></testsuite></testsuites>"#,
            "",
        );
        match tr.result("t1") {
            Err(ResultError::CaseNotFound(name)) => assert_eq!(name, "t1"),
            other => panic!("expected CaseNotFound, got {other:?}"),
        }
    }

    #[test]
    fn synthesized_skip_parses_back() {
        let tr = run(&skipped_case_output("t.bats", "t1", "no tty"), "");
        let res = tr.result("t1").unwrap();
        assert_eq!(res.status, TestStatus::Skipped);
        assert_eq!(res.output, "no tty");
    }

    #[test]
    fn synthesized_skip_escapes_markup() {
        let tr = run(&skipped_case_output("t.bats", "a < b & c", "x<y"), "");
        let res = tr.result("a < b & c").unwrap();
        assert_eq!(res.status, TestStatus::Skipped);
        assert_eq!(res.output, "x<y");
    }
}
