//! Test discovery for bats suites.
//!
//! Discovery is a deliberately syntactic, line-oriented scan: it recognizes
//! `@test "name" {` declarations and the `# bats test_tags=...` comment
//! immediately preceding them, and nothing else. Declarations spanning
//! multiple lines or using single quotes are not picked up.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::wire::RunTestResult;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while loading test files.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("error loading test files: all bats files must be in a single directory")]
    MixedDirectories,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One recorded execution of a test. Normally a test has exactly one run;
/// the vector shape leaves room for more but nothing schedules a second.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub response: RunTestResult,
}

/// A single `@test "..." {` case within a test file.
#[derive(Debug, Clone)]
pub struct Test {
    /// The literal quoted name from the declaration.
    pub name: String,
    /// Tags from the most recent `# bats test_tags=` line before this test.
    pub tags: Vec<String>,
    /// Executions recorded by the dispatcher.
    pub runs: Vec<TestRun>,
}

impl Test {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A single `.bats` source file and the tests found in it.
#[derive(Debug, Clone)]
pub struct TestFile {
    /// Basename of the file, e.g. `sql-server.bats`.
    pub name: String,
    pub tests: Vec<Test>,
}

/// The full ordered inventory of test files for one driver run.
///
/// Enumeration order is directory-listing order for directory arguments,
/// then insertion order for file arguments; the reporter and the TAP
/// numbering both follow it. The inventory is the sole owner of the test
/// tree; work units refer back to their test by file and test index.
#[derive(Debug)]
pub struct TestInventory {
    pub files: Vec<TestFile>,
    bats_dir: PathBuf,
}

impl TestInventory {
    /// Load tests from the given paths, each either a directory of `.bats`
    /// files or a single file. All paths must share one parent directory.
    pub fn load(paths: &[PathBuf]) -> DiscoveryResult<Self> {
        let mut bats_dir: Option<PathBuf> = None;
        let mut names: Vec<String> = Vec::new();

        for arg in paths {
            let meta = std::fs::metadata(arg)?;
            if meta.is_dir() {
                match &bats_dir {
                    None => bats_dir = Some(arg.clone()),
                    Some(d) if d == arg => {}
                    Some(_) => return Err(DiscoveryError::MixedDirectories),
                }
                let mut entries: Vec<String> = std::fs::read_dir(arg)?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.ends_with(".bats"))
                    .collect();
                entries.sort();
                for name in entries {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            } else {
                let parent = match arg.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                match &bats_dir {
                    None => bats_dir = Some(parent),
                    Some(d) if *d == parent => {}
                    Some(_) => return Err(DiscoveryError::MixedDirectories),
                }
                let name = arg
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let bats_dir = bats_dir.unwrap_or_else(|| PathBuf::from("."));
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let tests = scan_test_file(&bats_dir.join(&name))?;
            files.push(TestFile { name, tests });
        }

        Ok(Self { files, bats_dir })
    }

    /// The single directory all test files live in.
    pub fn bats_dir(&self) -> &Path {
        &self.bats_dir
    }

    /// Total number of tests across all files.
    pub fn total_tests(&self) -> usize {
        self.files.iter().map(|f| f.tests.len()).sum()
    }
}

/// Scan one file for `@test` declarations and pending tag lines.
///
/// A tag line applies to the next recognized test only; emitting a test
/// clears the pending tags.
fn scan_test_file(path: &Path) -> DiscoveryResult<Vec<Test>> {
    let file = File::open(path)?;
    let mut tags: Vec<String> = Vec::new();
    let mut tests = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(rest) = line.strip_prefix("# bats test_tags=") {
            tags = rest.split(' ').map(str::to_string).collect();
        } else if let Some(rest) = line.strip_prefix("@test \"") {
            // Strict suffix handling: the declaration must close with `" {`.
            // Lines that do not are left unrecognized rather than trimmed
            // into a corrupted name.
            if let Some(name) = rest.trim_end().strip_suffix("\" {") {
                tests.push(Test {
                    name: name.to_string(),
                    tags: std::mem::take(&mut tags),
                    runs: Vec::new(),
                });
            }
        }
    }

    Ok(tests)
}

/// Escape a test name into the anchored regex filter passed to the harness.
///
/// Only `(` and `+` are escaped; other metacharacters do not occur in the
/// existing suite and pass through untouched.
pub fn escape_name_for_filter(name: &str) -> String {
    let escaped = name.replace('(', "\\(").replace('+', "\\+");
    format!("^{escaped}$")
}
