//! Disk format normalization.
//!
//! The catalog only accepts a few disk formats. [`FormatConverter`] takes a
//! fetched descriptor and hands back a readable disk in an accepted format,
//! unpacking containers and shelling out to `qemu-img` when needed.
//! Converted output is kept next to the original as `<location>.<format>`
//! and reused on later runs.

pub mod ova;

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::descriptor::Descriptor;
use crate::error::ImageError;

/// External invocation that rewrites a disk image into another format.
pub trait ConversionTool {
    fn convert(
        &self,
        src_format: &str,
        dst_format: &str,
        input: &Path,
        output: &Path,
    ) -> Result<(), ImageError>;
}

/// `qemu-img convert`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub const BINARY: &'static str = "qemu-img";

    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(Self::BINARY),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, src_format: &str, dst_format: &str, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["convert", "-f", src_format, "-O", dst_format])
            .arg(input)
            .arg(output);
        cmd
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionTool for QemuImg {
    fn convert(
        &self,
        src_format: &str,
        dst_format: &str,
        input: &Path,
        output: &Path,
    ) -> Result<(), ImageError> {
        let output_result = self
            .command(src_format, dst_format, input, output)
            .output()
            .map_err(|e| ImageError::ConversionFailed {
                code: 127,
                diagnostics: format!("cannot run '{}': {e}", self.binary.display()),
            })?;

        if !output_result.status.success() {
            let diagnostics = String::from_utf8_lossy(&output_result.stderr)
                .trim()
                .to_string();
            error!(input = %input.display(), %diagnostics, "could not convert image");
            return Err(ImageError::ConversionFailed {
                code: output_result.status.code().unwrap_or(-1),
                diagnostics,
            });
        }
        Ok(())
    }
}

/// A disk ready for upload.
pub struct ResolvedDisk {
    pub format: String,
    pub reader: Box<dyn Read + Send>,
}

impl fmt::Debug for ResolvedDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedDisk")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Reads a file, keeping an extracted container member alive until dropped.
struct DiskReader {
    file: File,
    _scratch: Option<NamedTempFile>,
}

impl Read for DiskReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ResolvedDisk {
    fn open(format: String, path: &Path, scratch: Option<NamedTempFile>) -> Result<Self, ImageError> {
        let file = File::open(path)?;
        Ok(Self {
            format,
            reader: Box::new(DiskReader {
                file,
                _scratch: scratch,
            }),
        })
    }
}

/// Path of the cached conversion of `original` into `format`.
pub fn variant_path(original: &Path, format: &str) -> PathBuf {
    let mut name = original.as_os_str().to_os_string();
    name.push(".");
    name.push(format);
    PathBuf::from(name)
}

pub struct FormatConverter<'a> {
    tool: &'a dyn ConversionTool,
}

impl<'a> FormatConverter<'a> {
    pub fn new(tool: &'a dyn ConversionTool) -> Self {
        Self { tool }
    }

    /// Resolve the disk of `descriptor` into one of `accepted`.
    ///
    /// With `accepted` empty, or already holding the disk's format, the disk
    /// is returned as is. Otherwise it is converted to `accepted[0]` and the
    /// converted file is appended to the descriptor's locations.
    pub fn convert(
        &self,
        descriptor: &mut Descriptor,
        accepted: &[String],
    ) -> Result<ResolvedDisk, ImageError> {
        let original = descriptor
            .location()
            .map(Path::to_path_buf)
            .ok_or_else(|| ImageError::NotFound(PathBuf::from(descriptor.safe_filename())))?;
        if !original.is_file() {
            return Err(ImageError::NotFound(original));
        }
        let scratch_dir = original
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        let (format, disk_path, scratch) = if descriptor.disk_format.eq_ignore_ascii_case("ova") {
            let disk = ova::extract_disk(&original, &scratch_dir)?;
            debug!(identifier = %descriptor.identifier, format = %disk.format, "extracted disk from OVA");
            let path = disk.file.path().to_path_buf();
            (disk.format, path, Some(disk.file))
        } else {
            (descriptor.disk_format.to_ascii_lowercase(), original.clone(), None)
        };

        let target = match accepted.first() {
            Some(first) if !accepted.iter().any(|f| f.eq_ignore_ascii_case(&format)) => {
                first.to_ascii_lowercase()
            }
            _ => {
                debug!(identifier = %descriptor.identifier, %format, "no need to convert image");
                return ResolvedDisk::open(format, &disk_path, scratch);
            }
        };

        let converted = variant_path(&original, &target);
        if descriptor.verified && converted.is_file() {
            info!(identifier = %descriptor.identifier, "found converted image, not converting again");
        } else {
            info!(
                identifier = %descriptor.identifier,
                from = %format,
                to = %target,
                "converting image"
            );
            let tmp = NamedTempFile::new_in(&scratch_dir)?;
            self.tool.convert(&format, &target, &disk_path, tmp.path())?;
            tmp.persist(&converted).map_err(|e| ImageError::Io(e.error))?;
        }
        drop(scratch);

        if !descriptor.locations.contains(&converted) {
            descriptor.locations.push(converted.clone());
        }
        info!(
            identifier = %descriptor.identifier,
            location = %converted.display(),
            "image converted"
        );
        ResolvedDisk::open(target, &converted, None)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTool;
    use super::*;
    use crate::convert::ova::{write_ova, SAMPLE_OVF};
    use crate::descriptor::test_descriptor;
    use std::fs;
    use tempfile::TempDir;

    fn fetched(dir: &Path, format: &str, data: &[u8]) -> Descriptor {
        let mut d = test_descriptor("img");
        d.disk_format = format.to_string();
        let path = dir.join("img");
        fs::write(&path, data).unwrap();
        d.locations = vec![path];
        d
    }

    fn read_all(mut disk: ResolvedDisk) -> Vec<u8> {
        let mut out = Vec::new();
        disk.reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn accepted_format_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool::default();
        let mut d = fetched(tmp.path(), "QCOW2", b"disk");

        let disk = FormatConverter::new(&tool)
            .convert(&mut d, &["raw".to_string(), "qcow2".to_string()])
            .unwrap();
        assert_eq!(disk.format, "qcow2");
        assert_eq!(read_all(disk), b"disk");
        assert!(tool.calls.borrow().is_empty());
        assert_eq!(d.locations.len(), 1);
    }

    #[test]
    fn empty_accepted_set_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool::default();
        let mut d = fetched(tmp.path(), "vmdk", b"disk");

        let disk = FormatConverter::new(&tool).convert(&mut d, &[]).unwrap();
        assert_eq!(disk.format, "vmdk");
        assert!(tool.calls.borrow().is_empty());
    }

    #[test]
    fn converts_to_first_accepted_and_caches() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool::default();
        let mut d = fetched(tmp.path(), "vmdk", b"disk");
        let accepted = ["qcow2".to_string(), "raw".to_string()];

        let disk = FormatConverter::new(&tool).convert(&mut d, &accepted).unwrap();
        assert_eq!(disk.format, "qcow2");
        assert_eq!(read_all(disk), b"qcow2:disk");
        assert_eq!(d.locations[1], tmp.path().join("img.qcow2"));

        // Second run of a verified image reuses the cached variant.
        d.locations.truncate(1);
        FormatConverter::new(&tool).convert(&mut d, &accepted).unwrap();
        assert_eq!(tool.calls.borrow().len(), 1);
        assert_eq!(d.locations.len(), 2);
    }

    #[test]
    fn unverified_image_is_converted_again() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool::default();
        let mut d = fetched(tmp.path(), "vmdk", b"disk");
        fs::write(tmp.path().join("img.raw"), b"stale").unwrap();
        d.verified = false;

        let disk = FormatConverter::new(&tool)
            .convert(&mut d, &["raw".to_string()])
            .unwrap();
        assert_eq!(read_all(disk), b"raw:disk");
        assert_eq!(tool.calls.borrow().len(), 1);
    }

    #[test]
    fn ova_disk_is_extracted_before_conversion() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool::default();
        let mut d = test_descriptor("img");
        d.disk_format = "OVA".to_string();
        let ova = tmp.path().join("img");
        write_ova(
            &ova,
            &[
                ("img.ovf", SAMPLE_OVF.as_bytes()),
                ("appliance-disk1.vmdk", &b"vmdk-bytes"[..]),
            ],
        );
        d.locations = vec![ova];

        let disk = FormatConverter::new(&tool)
            .convert(&mut d, &["qcow2".to_string()])
            .unwrap();
        assert_eq!(read_all(disk), b"qcow2:vmdk-bytes");
        assert_eq!(
            tool.calls.borrow().as_slice(),
            [("vmdk".to_string(), "qcow2".to_string())]
        );
    }

    #[test]
    fn failure_carries_tool_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let tool = FakeTool {
            fail: true,
            ..Default::default()
        };
        let mut d = fetched(tmp.path(), "vmdk", b"disk");

        let err = FormatConverter::new(&tool)
            .convert(&mut d, &["qcow2".to_string()])
            .unwrap_err();
        assert!(matches!(err, ImageError::ConversionFailed { code: 1, .. }));
        assert!(!tmp.path().join("img.qcow2").exists());
        assert_eq!(d.locations.len(), 1);
    }

    #[test]
    fn missing_local_copy_is_not_found() {
        let tool = FakeTool::default();
        let mut d = test_descriptor("img");
        let err = FormatConverter::new(&tool)
            .convert(&mut d, &["qcow2".to_string()])
            .unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[test]
    fn qemu_img_command_line() {
        let cmd = QemuImg::new().command("vmdk", "qcow2", Path::new("/in"), Path::new("/out"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["convert", "-f", "vmdk", "-O", "qcow2", "/in", "/out"]);
    }
}
