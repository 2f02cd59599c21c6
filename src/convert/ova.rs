//! Disk extraction from OVA archives.
//!
//! An OVA is a tar archive holding an OVF descriptor plus the files it
//! references. We assume one disk per appliance. Members may be appended to
//! update an archive, so the last occurrence of a name wins.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::ImageError;

/// The disk carried inside a container, extracted to a scoped temp file.
#[derive(Debug)]
pub struct ContainedDisk {
    pub format: String,
    pub file: NamedTempFile,
}

/// Disk reference resolved from an OVF descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskReference {
    pub href: String,
    pub format: String,
}

fn element_re(name: &str) -> Regex {
    Regex::new(&format!(r"<(?:\w+:)?{name}\b[^>]*>")).expect("static element regex")
}

fn disk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| element_re("Disk"))
}

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| element_re("File"))
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:\w+:)?(\w+)\s*=\s*"([^"]*)""#).expect("static attribute regex"))
}

fn attributes(element: &str) -> BTreeMap<String, String> {
    attr_re()
        .captures_iter(element)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// `http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized` -> `vmdk`
fn format_from_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let segment = without_fragment
        .rsplit('/')
        .next()
        .unwrap_or(without_fragment);
    segment
        .split('.')
        .next()
        .unwrap_or(segment)
        .to_ascii_lowercase()
}

/// Find the first disk of an OVF descriptor and the file backing it.
pub fn disk_reference(ovf: &str) -> Option<DiskReference> {
    let disk = disk_re()
        .find_iter(ovf)
        .map(|m| attributes(m.as_str()))
        .find(|attrs| attrs.contains_key("fileRef"))?;
    let file_ref = disk.get("fileRef")?;
    let href = file_re()
        .find_iter(ovf)
        .map(|m| attributes(m.as_str()))
        .find(|attrs| attrs.get("id") == Some(file_ref))
        .and_then(|attrs| attrs.get("href").cloned())?;
    let format = disk
        .get("format")
        .map(|f| format_from_url(f))
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| {
            Path::new(&href)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("raw")
                .to_ascii_lowercase()
        });
    Some(DiskReference { href, format })
}

fn container_error(path: &Path, reason: impl ToString) -> ImageError {
    ImageError::Container {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// The last `.ovf` member of the archive.
fn read_ovf(ova: &Path) -> Result<String, ImageError> {
    let mut archive = tar::Archive::new(File::open(ova)?);
    let mut ovf = None;
    for entry in archive.entries().map_err(|e| container_error(ova, e))? {
        let mut entry = entry.map_err(|e| container_error(ova, e))?;
        let is_ovf = entry
            .path()
            .map_err(|e| container_error(ova, e))?
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ovf"));
        if is_ovf {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| container_error(ova, e))?;
            ovf = Some(text);
        }
    }
    ovf.ok_or_else(|| container_error(ova, "no OVF descriptor in archive"))
}

/// Extract the disk of an OVA into a temp file under `scratch`.
pub fn extract_disk(ova: &Path, scratch: &Path) -> Result<ContainedDisk, ImageError> {
    let ovf = read_ovf(ova)?;
    let reference =
        disk_reference(&ovf).ok_or_else(|| container_error(ova, "OVF names no disk file"))?;

    let mut archive = tar::Archive::new(File::open(ova)?);
    let mut extracted = None;
    for entry in archive.entries().map_err(|e| container_error(ova, e))? {
        let mut entry = entry.map_err(|e| container_error(ova, e))?;
        let matches = entry
            .path()
            .map_err(|e| container_error(ova, e))?
            .to_str()
            .is_some_and(|p| p.trim_start_matches("./") == reference.href);
        if matches {
            let mut file = NamedTempFile::new_in(scratch)?;
            io::copy(&mut entry, file.as_file_mut())?;
            extracted = Some(file);
        }
    }

    let file = extracted.ok_or_else(|| {
        container_error(ova, format!("disk '{}' missing from archive", reference.href))
    })?;
    Ok(ContainedDisk {
        format: reference.format,
        file,
    })
}

#[cfg(test)]
pub(crate) fn write_ova(path: &Path, members: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.finish().unwrap();
}

#[cfg(test)]
pub(crate) const SAMPLE_OVF: &str = r#"<?xml version="1.0"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
  <References>
    <File ovf:href="appliance-disk1.vmdk" ovf:id="file1" ovf:size="6"/>
  </References>
  <DiskSection>
    <Disk ovf:capacity="10" ovf:diskId="vmdisk1" ovf:fileRef="file1"
          ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
  </DiskSection>
</Envelope>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn resolves_disk_reference_and_format() {
        let reference = disk_reference(SAMPLE_OVF).unwrap();
        assert_eq!(
            reference,
            DiskReference {
                href: "appliance-disk1.vmdk".to_string(),
                format: "vmdk".to_string(),
            }
        );
    }

    #[test]
    fn format_falls_back_to_extension() {
        let ovf = r#"<File href="disk.QCOW2" id="f"/><Disk fileRef="f"/>"#;
        assert_eq!(disk_reference(ovf).unwrap().format, "qcow2");
    }

    #[test]
    fn extracts_last_appended_disk() {
        let tmp = TempDir::new().unwrap();
        let ova = tmp.path().join("app.ova");
        write_ova(
            &ova,
            &[
                ("app.ovf", SAMPLE_OVF.as_bytes()),
                ("appliance-disk1.vmdk", &b"old"[..]),
                ("appliance-disk1.vmdk", &b"newer"[..]),
            ],
        );

        let disk = extract_disk(&ova, tmp.path()).unwrap();
        assert_eq!(disk.format, "vmdk");
        assert_eq!(fs::read(disk.file.path()).unwrap(), b"newer");
    }

    #[test]
    fn archive_without_ovf_is_container_error() {
        let tmp = TempDir::new().unwrap();
        let ova = tmp.path().join("app.ova");
        write_ova(&ova, &[("disk.vmdk", &b"data"[..])]);

        let err = extract_disk(&ova, tmp.path()).unwrap_err();
        assert!(matches!(err, ImageError::Container { .. }));
    }
}
