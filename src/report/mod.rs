//! Result rendering.
//!
//! Two output forms: a bats-like pretty form for humans and TAP for
//! machines. Both walk the inventory in enumeration order, classify each
//! test's single recorded run via [`junit`], and return the process exit
//! code: zero iff there were no failures and no fatals.

pub mod junit;

use std::io::{self, Write};

use console::Style;

use crate::discovery::TestFile;

pub use junit::{skipped_case_output, ResultError, TestRunResult, TestStatus};

/// Verdict for one test, precomputed so the pretty form can decide file
/// grouping without re-parsing replies.
struct Row<'a> {
    name: &'a str,
    outcome: Result<TestRunResult, ResultError>,
    /// Raw reply output, echoed for infrastructure fatals.
    raw_output: &'a str,
}

struct FileReport<'a> {
    name: &'a str,
    rows: Vec<Row<'a>>,
    all_pass: bool,
}

fn classify(files: &[TestFile]) -> Vec<FileReport<'_>> {
    files
        .iter()
        .map(|file| {
            let rows: Vec<Row<'_>> = file
                .tests
                .iter()
                .map(|test| {
                    let (outcome, raw_output) = match test.runs.first() {
                        Some(run) => (run.result(&test.name), run.response.output.as_str()),
                        None => (
                            Err(ResultError::Infrastructure(
                                "no result recorded for test".to_string(),
                            )),
                            "",
                        ),
                    };
                    Row {
                        name: &test.name,
                        outcome,
                        raw_output,
                    }
                })
                .collect();
            let all_pass = rows.iter().all(|r| {
                matches!(
                    r.outcome,
                    Ok(TestRunResult {
                        status: TestStatus::Success | TestStatus::Skipped,
                        ..
                    })
                )
            });
            FileReport {
                name: &file.name,
                rows,
                all_pass,
            }
        })
        .collect()
}

/// Detail lines shown under a fatal result. Infrastructure fatals preserve
/// the transport error and echo the raw reply; shape problems get their
/// one-line message; unparseable output gets nothing further.
fn fatal_detail(err: &ResultError, raw_output: &str) -> Vec<String> {
    match err {
        ResultError::Infrastructure(text) => {
            let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
            lines.extend(raw_output.lines().map(str::to_string));
            lines
        }
        ResultError::MalformedXml => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Render the bats-like pretty form. Fully passing files collapse to one
/// green summary line and sort ahead of the interesting ones.
pub fn render_pretty(files: &[TestFile], out: &mut impl Write, color: bool) -> io::Result<i32> {
    let plain = Style::new();
    let (blue, red, green) = if color {
        (
            Style::new().blue(),
            Style::new().red(),
            Style::new().green(),
        )
    } else {
        (plain.clone(), plain.clone(), plain.clone())
    };

    let mut reports = classify(files);
    reports.sort_by(|a, b| {
        b.all_pass
            .cmp(&a.all_pass)
            .then_with(|| a.name.cmp(b.name))
    });

    let mut num_tests = 0usize;
    let mut num_skipped = 0usize;
    let mut num_failed = 0usize;
    let mut num_fatal = 0usize;

    for report in &reports {
        if report.all_pass {
            writeln!(
                out,
                "{}",
                green.apply_to(format!("{} 100% PASSED", report.name))
            )?;
            num_tests += report.rows.len();
            continue;
        }

        writeln!(out, "{}", blue.apply_to(report.name))?;
        for row in &report.rows {
            num_tests += 1;
            match &row.outcome {
                Err(err) => {
                    num_fatal += 1;
                    writeln!(out, "{}", red.apply_to(format!("  ✗ {}", row.name)))?;
                    for line in fatal_detail(err, row.raw_output) {
                        writeln!(out, "{}", red.apply_to(format!("  {line}")))?;
                    }
                }
                Ok(res) => match res.status {
                    TestStatus::Success => {
                        writeln!(out, "  ✓ {}", row.name)?;
                    }
                    TestStatus::Skipped => {
                        num_skipped += 1;
                        if res.output.is_empty() {
                            writeln!(out, "  - {} (skipped)", row.name)?;
                        } else {
                            writeln!(out, "  - {} (skipped: {})", row.name, res.output)?;
                        }
                    }
                    TestStatus::Failure => {
                        num_failed += 1;
                        writeln!(out, "{}", red.apply_to(format!("  ✗ {}", row.name)))?;
                        for line in res.output.lines() {
                            writeln!(out, "{}", red.apply_to(format!("  {line}")))?;
                        }
                    }
                },
            }
        }
        writeln!(out)?;
    }

    if num_fatal > 0 {
        writeln!(
            out,
            "{}",
            red.apply_to(format!(
                "{num_tests} tests, {num_fatal} fatal, {num_failed} failures, {num_skipped} skipped"
            ))
        )?;
    } else if num_failed > 0 {
        writeln!(
            out,
            "{}",
            red.apply_to(format!(
                "{num_tests} tests, {num_failed} failures, {num_skipped} skipped"
            ))
        )?;
    } else {
        writeln!(
            out,
            "{num_tests} tests, {num_failed} failures, {num_skipped} skipped"
        )?;
    }

    Ok(if num_failed == 0 && num_fatal == 0 { 0 } else { 1 })
}

/// Render TAP: `1..N` then one line per test in enumeration order, with
/// detail expanded as `#`-prefixed comment lines.
pub fn render_tap(files: &[TestFile], out: &mut impl Write) -> io::Result<i32> {
    let reports = classify(files);

    let total: usize = reports.iter().map(|r| r.rows.len()).sum();
    writeln!(out, "1..{total}")?;

    let mut num_failed = 0usize;
    let mut num_fatal = 0usize;
    let mut i = 1usize;

    for report in &reports {
        for row in &report.rows {
            match &row.outcome {
                Err(err) => {
                    num_fatal += 1;
                    writeln!(out, "not ok {i} {}", row.name)?;
                    for line in fatal_detail(err, row.raw_output) {
                        writeln!(out, "#{line}")?;
                    }
                }
                Ok(res) => match res.status {
                    TestStatus::Success => {
                        writeln!(out, "ok {i} {}", row.name)?;
                    }
                    TestStatus::Skipped => {
                        if res.output.is_empty() {
                            writeln!(out, "ok {i} {} # skip", row.name)?;
                        } else {
                            writeln!(out, "ok {i} {} # skip {}", row.name, res.output)?;
                        }
                    }
                    TestStatus::Failure => {
                        num_failed += 1;
                        writeln!(out, "not ok {i} {}", row.name)?;
                        for line in res.output.lines() {
                            writeln!(out, "#{line}")?;
                        }
                    }
                },
            }
            i += 1;
        }
    }

    Ok(if num_failed == 0 && num_fatal == 0 { 0 } else { 1 })
}
