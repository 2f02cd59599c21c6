//! Byte transfer into the cache: HTTP downloads for feed images and the
//! external `oras` client for registry images.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::ImageError;

/// Writes the bytes behind a URL to a file.
pub trait Fetch {
    fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, ImageError>;
}

/// Pulls a registry reference into a directory.
pub trait Pull {
    fn pull(&self, registry_host: &str, reference: &str, outdir: &Path) -> Result<(), ImageError>;
}

/// Streams a URL to a file.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ImageError> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ImageError::DownloadFailed {
            code: 0,
            reason: format!("cannot build HTTP client: {e}"),
        })?;
        Ok(Self { client })
    }

    pub fn download(&self, uri: &str, dest: &Path) -> Result<u64, ImageError> {
        let mut response = self
            .client
            .get(uri)
            .send()
            .map_err(|e| ImageError::DownloadFailed {
                code: e.status().map_or(0, |s| i32::from(s.as_u16())),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::DownloadFailed {
                code: i32::from(status.as_u16()),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let mut out = File::create(dest)?;
        let written = response
            .copy_to(&mut out)
            .map_err(|e| ImageError::DownloadFailed {
                code: 0,
                reason: format!("reading body of {uri}: {e}"),
            })?;
        out.flush()?;
        debug!(uri, bytes = written, "download complete");
        Ok(written)
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, ImageError> {
        self.download(uri, dest)
    }
}

/// Credentials and transport options for one registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryLogin {
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
}

/// Runs `oras pull` for registry content.
#[derive(Debug, Clone)]
pub struct OrasPuller {
    binary: PathBuf,
    login: RegistryLogin,
}

impl OrasPuller {
    pub const BINARY: &'static str = "oras";

    pub fn new(login: RegistryLogin) -> Self {
        Self {
            binary: PathBuf::from(Self::BINARY),
            login,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, target: &str, outdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("pull").arg("--output").arg(outdir);
        if self.login.insecure {
            cmd.arg("--insecure");
        }
        if let Some(user) = &self.login.username {
            cmd.args(["--username", user.as_str(), "--password-stdin"]);
        }
        cmd.arg(target);
        cmd
    }

    /// Pull `<registry_host>/<reference>` into `outdir`.
    pub fn pull(&self, registry_host: &str, reference: &str, outdir: &Path) -> Result<(), ImageError> {
        let target = format!("{registry_host}/{reference}");
        let mut cmd = self.command(&target, outdir);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(target = %target, outdir = %outdir.display(), "running oras pull");
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ImageError::DownloadFailed {
                code: 127,
                reason: format!(
                    "'{}' not found, ensure the oras CLI is installed and in PATH",
                    self.binary.display()
                ),
            },
            _ => ImageError::Io(e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if self.login.username.is_some() {
                let password = self.login.password.as_deref().unwrap_or_default();
                stdin.write_all(password.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(ImageError::DownloadFailed {
                code: output.status.code().unwrap_or(-1),
                reason: format!(
                    "oras pull failed for {target}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Pull for OrasPuller {
    fn pull(&self, registry_host: &str, reference: &str, outdir: &Path) -> Result<(), ImageError> {
        OrasPuller::pull(self, registry_host, reference, outdir)
    }
}

/// The largest regular file under `dir`, taken as the image payload of a pull.
pub fn largest_file(dir: &Path) -> Result<PathBuf, ImageError> {
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| ImageError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map_err(|e| ImageError::Io(e.into()))?.len();
        if best.as_ref().map_or(true, |(largest, _)| size > *largest) {
            best = Some((size, entry.into_path()));
        }
    }
    best.map(|(_, path)| path).ok_or_else(|| ImageError::DownloadFailed {
        code: 1,
        reason: format!("pull into {} produced no files", dir.display()),
    })
}

/// Move `src` to `dest`, copying when they live on different filesystems.
pub fn move_file(src: &Path, dest: &Path) -> Result<(), ImageError> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)?;
    fs::remove_file(src)?;
    Ok(())
}
