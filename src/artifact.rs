//! Artifact construction: cross-compiled binaries and the test tree, each
//! wrapped in its own content-addressed tar archive.
//!
//! Three archives make up a bundle: `bin/dolt` (the system under test),
//! `bin/remotesrv` (an auxiliary server some tests need), and the full
//! `bats/` test directory. Every archive is written once to a temporary
//! path with its SHA-256 computed as the bytes stream out, then renamed to
//! `<base32hex(sha256)>.tar`. Identical inputs therefore always yield
//! identical keys, and any number of concurrent driver runs may share an
//! upload.
//!
//! The binaries are linked statically against musl so they run inside the
//! sandbox image; a pinned C toolchain for the host platform is downloaded
//! on demand, checksum-verified, and cached on disk by checksum.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use data_encoding::BASE32HEX;
use futures::StreamExt;
use indicatif::ProgressBar;
use sha2::{Digest, Sha256};
use tracing::debug;

/// The three archives produced by one build, by path on local disk.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub dolt_tar: PathBuf,
    pub bin_tar: PathBuf,
    pub bats_tar: PathBuf,
}

/// Upload keys for a bundle: the archive basenames without `.tar`.
#[derive(Debug, Clone)]
pub struct ArtifactKeys {
    pub dolt: String,
    pub bin: String,
    pub bats: String,
}

impl ArtifactBundle {
    pub fn keys(&self) -> ArtifactKeys {
        ArtifactKeys {
            dolt: key_from_path(&self.dolt_tar),
            bin: key_from_path(&self.bin_tar),
            bats: key_from_path(&self.bats_tar),
        }
    }
}

/// Archive basename without the `.tar` suffix.
pub fn key_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Content key for archive bytes: base32-hex of their SHA-256.
pub fn artifact_key(digest: &[u8]) -> String {
    BASE32HEX.encode(digest)
}

/// Writer that feeds every byte through a SHA-256 alongside the target.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(mut self) -> std::io::Result<(W, Vec<u8>)> {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize().to_vec()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn entry_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0o644
    }
}

/// Append a directory header. Headers carry only name and mode so archive
/// bytes are a pure function of tree contents.
fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str, mode: u32) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode);
    builder
        .append_data(&mut header, name, std::io::empty())
        .with_context(|| format!("appending directory {name}"))?;
    Ok(())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    path: &Path,
    mode: Option<u32>,
) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for archiving", path.display()))?;
    let meta = file.metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_size(meta.len());
    header.set_mode(mode.unwrap_or_else(|| entry_mode(&meta)));
    builder
        .append_data(&mut header, name, &mut file)
        .with_context(|| format!("appending {name}"))?;
    Ok(())
}

/// Recursively append `dir` under the archive name `prefix`, visiting
/// entries in sorted order so the archive bytes are deterministic.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, prefix: &str, dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = format!("{prefix}/{}", entry.file_name().to_string_lossy());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            append_dir(builder, &format!("{name}/"), entry_mode(&meta))?;
            append_tree(builder, &name, &entry.path())?;
        } else {
            append_file(builder, &name, &entry.path(), None)?;
        }
    }
    Ok(())
}

/// Write one archive into `out_dir`, hashing while streaming, and rename it
/// to its content key.
fn build_archive(
    out_dir: &Path,
    populate: impl FnOnce(&mut tar::Builder<HashingWriter<File>>) -> Result<()>,
) -> Result<PathBuf> {
    let staging = tempfile::Builder::new()
        .prefix("lambdabats-archive-")
        .suffix(".tar")
        .tempfile_in(out_dir)
        .context("creating archive staging file")?;
    let (staging_file, staging_path) = staging.keep().context("keeping archive staging file")?;

    let mut builder = tar::Builder::new(HashingWriter::new(staging_file));
    populate(&mut builder)?;
    let writer = builder.into_inner().context("finishing archive")?;
    let (_, digest) = writer.finish()?;

    let final_path = out_dir.join(format!("{}.tar", artifact_key(&digest)));
    std::fs::rename(&staging_path, &final_path)
        .with_context(|| format!("renaming archive to {}", final_path.display()))?;
    debug!(path = %final_path.display(), "wrote archive");
    Ok(final_path)
}

/// Pinned toolchain downloads, keyed by host platform.
fn toolchain_location() -> Result<(&'static str, &'static str)> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => Ok((
            "https://dolthub-tools.s3.us-west-2.amazonaws.com/gcc/host=aarch64-darwin/target=linux-musl/20240515_0.0.2.tar.xz",
            "c3fe69b5f412c17f18efc8ddcdec4128f0103242c76b99adb3cdcf8a2c45ec89",
        )),
        ("macos", "x86_64") => Ok((
            "https://dolthub-tools.s3.us-west-2.amazonaws.com/gcc/host=x86_64-darwin/target=linux-musl/20240515_0.0.2.tar.xz",
            "f1eda39fa81a3eaab4f79f0f010a2d6bf0aea395e65b3a6e87541f55cf2ac853",
        )),
        ("linux", "aarch64") => Ok((
            "https://dolthub-tools.s3.us-west-2.amazonaws.com/gcc/host=aarch64-linux/target=linux-musl/20240515_0.0.2.tar.xz",
            "b603a5c636547e1cd0dc6cf1bba5a1f67aacb8dd21f1b12582786497311f1fa9",
        )),
        ("linux", "x86_64") => Ok((
            "https://dolthub-tools.s3.us-west-2.amazonaws.com/gcc/host=x86_64-linux/target=linux-musl/20240515_0.0.2.tar.xz",
            "befaa4d83d843b8a57ea0e6a16980ffa5b5ba575f4428adec1f7f5b1aa7671f1",
        )),
        (os, arch) => bail!(
            "unsupported host platform {os}-{arch}; a C toolchain targeting \
             linux-musl is required to build the test binaries"
        ),
    }
}

/// Download (or reuse) the statically-linked C toolchain for the host and
/// return the environment needed to compile against it.
pub async fn stage_toolchain() -> Result<Vec<(String, String)>> {
    let (url, sha) = toolchain_location()?;

    let gnu_arch = if std::env::consts::ARCH == "aarch64" {
        "aarch64"
    } else {
        "x86_64"
    };

    let dest = std::env::temp_dir().join(sha);
    let host_path = std::env::var("PATH").unwrap_or_default();
    let vars = vec![
        ("CGO_ENABLED".to_string(), "1".to_string()),
        (
            "PATH".to_string(),
            format!("{}/bin:{host_path}", dest.display()),
        ),
        ("CC".to_string(), format!("{gnu_arch}-linux-musl-gcc")),
        ("AS".to_string(), format!("{gnu_arch}-linux-musl-as")),
        ("CGO_LDFLAGS".to_string(), "-static -s".to_string()),
    ];

    if dest.exists() {
        // Already downloaded and extracted.
        return Ok(vars);
    }

    let download = tempfile::NamedTempFile::new().context("creating toolchain download file")?;
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("fetching toolchain from {url}"))?;
    if !resp.status().is_success() {
        bail!("unexpected HTTP status {} fetching toolchain {url}", resp.status());
    }

    let mut hasher = Sha256::new();
    {
        let mut file = File::create(download.path())?;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("reading toolchain download")?;
            hasher.update(&chunk);
            file.write_all(&chunk)?;
        }
        file.flush()?;
    }
    let got = format!("{:x}", hasher.finalize());
    if got != sha {
        bail!("toolchain download checksum ({got}) did not match expected checksum ({sha})");
    }

    let extract_dir = tempfile::tempdir_in(std::env::temp_dir())?;
    let out = tokio::process::Command::new("tar")
        .args(["Jx", "-C"])
        .arg(extract_dir.path())
        .args(["--strip-components", "1", "-f"])
        .arg(download.path())
        .output()
        .await
        .context("running tar to extract toolchain")?;
    if !out.status.success() {
        bail!(
            "could not extract downloaded toolchain: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    match std::fs::rename(extract_dir.path(), &dest) {
        Ok(()) => {}
        // A concurrent build may have staged the same checksum first.
        Err(_) if dest.exists() => {}
        Err(e) => return Err(e).context("moving extracted toolchain into place"),
    }

    Ok(vars)
}

async fn go_build(
    dolt_src_dir: &Path,
    package: &str,
    output: &Path,
    env: &[(String, String)],
) -> Result<()> {
    let out = tokio::process::Command::new("go")
        .args(["build", "-ldflags=-linkmode external -s -w", "-o"])
        .arg(output)
        .arg(package)
        .current_dir(dolt_src_dir.join("go"))
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .output()
        .await
        .with_context(|| format!("running go build {package}"))?;
    if !out.status.success() {
        bail!(
            "error running go build {package}: {}{}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(())
}

async fn with_spinner<T>(
    message: &str,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let spinner = ProgressBar::new_spinner().with_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let res = work.await;
    spinner.finish_with_message(format!("{message} done"));
    res
}

/// Build the full bundle from a dolt source tree: stage the toolchain,
/// cross-compile the two binaries, archive the test tree, and
/// content-address all three archives into the OS temp directory.
pub async fn build_bundle(dolt_src_dir: &Path, arch: &str) -> Result<ArtifactBundle> {
    let out_dir = std::env::temp_dir();
    let scratch = tempfile::Builder::new()
        .prefix("lambdabats-build-")
        .tempdir()
        .context("creating build scratch directory")?;

    let mut compile_env: Vec<(String, String)> = vec![
        ("GOOS".to_string(), "linux".to_string()),
        ("GOARCH".to_string(), arch.to_string()),
    ];

    let toolchain = with_spinner("downloading toolchain...", stage_toolchain())
        .await
        .context("unable to stage compiler toolchain")?;
    compile_env.extend(toolchain);

    let dolt_bin = scratch.path().join("dolt");
    with_spinner(
        "building dolt...",
        go_build(dolt_src_dir, "./cmd/dolt", &dolt_bin, &compile_env),
    )
    .await?;

    let remotesrv_bin = scratch.path().join("remotesrv");
    with_spinner(
        "building remotesrv...",
        go_build(dolt_src_dir, "./utils/remotesrv", &remotesrv_bin, &compile_env),
    )
    .await?;

    let tests_dir = dolt_src_dir.join("integration-tests");
    let bats_tar = with_spinner("building bats.tar...", async {
        let bats_src = tests_dir.join("bats");
        let meta = std::fs::metadata(&bats_src)
            .with_context(|| format!("missing bats directory {}", bats_src.display()))?;
        build_archive(&out_dir, |builder| {
            append_dir(builder, "bats/", entry_mode(&meta))?;
            append_tree(builder, "bats", &bats_src)
        })
    })
    .await?;

    let dolt_tar = build_archive(&out_dir, |builder| {
        append_dir(builder, "bin/", 0o777)?;
        append_file(builder, "bin/dolt", &dolt_bin, Some(0o777))
    })?;

    let bin_tar = build_archive(&out_dir, |builder| {
        append_dir(builder, "bin/", 0o777)?;
        append_file(builder, "bin/remotesrv", &remotesrv_bin, Some(0o777))
    })?;

    Ok(ArtifactBundle {
        dolt_tar,
        bin_tar,
        bats_tar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("helpers")).unwrap();
        std::fs::write(root.join("types.bats"), "@test \"t1\" {\n}\n").unwrap();
        std::fs::write(root.join("helpers/common.bash"), "setup_common() { :; }\n").unwrap();
    }

    fn archive_tree(out_dir: &Path, src: &Path) -> PathBuf {
        build_archive(out_dir, |builder| {
            append_dir(builder, "bats/", 0o755)?;
            append_tree(builder, "bats", src)
        })
        .unwrap()
    }

    #[test]
    fn archive_name_is_content_key() {
        let out = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        write_tree(src.path());

        let tar_path = archive_tree(out.path(), src.path());

        let bytes = std::fs::read(&tar_path).unwrap();
        let digest = Sha256::digest(&bytes);
        assert_eq!(key_from_path(&tar_path), artifact_key(&digest));
    }

    #[test]
    fn identical_trees_yield_identical_keys() {
        let out_a = TempDir::new().unwrap();
        let out_b = TempDir::new().unwrap();
        let src_a = TempDir::new().unwrap();
        let src_b = TempDir::new().unwrap();
        write_tree(src_a.path());
        write_tree(src_b.path());

        let a = archive_tree(out_a.path(), src_a.path());
        let b = archive_tree(out_b.path(), src_b.path());
        assert_eq!(key_from_path(&a), key_from_path(&b));
    }

    #[test]
    fn differing_trees_yield_differing_keys() {
        let out = TempDir::new().unwrap();
        let src_a = TempDir::new().unwrap();
        let src_b = TempDir::new().unwrap();
        write_tree(src_a.path());
        write_tree(src_b.path());
        std::fs::write(src_b.path().join("extra.bats"), "@test \"x\" {\n}\n").unwrap();

        let a = archive_tree(out.path(), src_a.path());
        let b = archive_tree(out.path(), src_b.path());
        assert_ne!(key_from_path(&a), key_from_path(&b));
    }

    #[test]
    fn archive_unpacks_to_original_tree() {
        let out = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        write_tree(src.path());

        let tar_path = archive_tree(out.path(), src.path());

        let unpack = TempDir::new().unwrap();
        tar::Archive::new(File::open(&tar_path).unwrap())
            .unpack(unpack.path())
            .unwrap();

        let types = std::fs::read_to_string(unpack.path().join("bats/types.bats")).unwrap();
        assert!(types.contains("@test \"t1\""));
        let helper =
            std::fs::read_to_string(unpack.path().join("bats/helpers/common.bash")).unwrap();
        assert!(helper.contains("setup_common"));
    }

    #[test]
    fn key_encoding_matches_base32hex() {
        let digest = Sha256::digest(b"archive bytes");
        let key = artifact_key(&digest);
        // 32-byte digest → 56 base32hex characters including padding.
        assert_eq!(key.len(), 56);
        assert!(key.ends_with('='));
        assert_eq!(BASE32HEX.decode(key.as_bytes()).unwrap(), digest.as_slice());
    }
}
