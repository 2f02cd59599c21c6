//! Local image cache.
//!
//! Holds one verified file per descriptor, named after its identifier.
//! Payloads are written to a temporary file inside the cache, hashed, and
//! only then renamed into place, so a crash never leaves a half-written
//! image under a valid name.
//!
//! Layout:
//!
//! ```text
//! <cache>/
//!   <safe-identifier>            verified original
//!   <safe-identifier>.<format>   converted variant
//!   locks/<safe-identifier>.lock per-identifier writer lock
//! ```

pub mod transfer;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::checksum::{hash_file, verify, Algorithm, ContentHash};
use crate::convert::variant_path;
use crate::descriptor::{safe_filename, Descriptor};
use crate::error::ImageError;

/// Writes the raw payload of a descriptor to a path.
///
/// Implemented by each source kind: feed images are downloaded over HTTP,
/// registry images are pulled with an external client.
pub trait Retrieve {
    fn retrieve(&self, descriptor: &Descriptor, dest: &Path) -> Result<(), ImageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Bytes were downloaded (or re-downloaded) and verified.
    Fetched,
    /// A valid copy was already in the cache.
    Cached,
    /// The descriptor already has a local copy from this run.
    AlreadyPresent,
    /// Expired descriptors are never fetched.
    Expired,
}

#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
    /// Formats converted variants may be stored in.
    variant_formats: Vec<String>,
}

/// Exclusive per-identifier lock, released on drop.
#[derive(Debug)]
pub struct IdentifierLock {
    _file: File,
}

impl ImageCache {
    /// Open (and create if needed) the cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ImageError> {
        let cache = Self {
            root: root.into(),
            variant_formats: Vec::new(),
        };
        fs::create_dir_all(cache.locks_dir())?;
        Ok(cache)
    }

    /// Formats whose `<original>.<format>` variants are discarded whenever
    /// the original is downloaded again.
    pub fn with_variant_formats(mut self, formats: &[String]) -> Self {
        self.variant_formats = formats.iter().map(|f| f.to_ascii_lowercase()).collect();
        self
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn location_for(&self, descriptor: &Descriptor) -> PathBuf {
        self.root.join(descriptor.safe_filename())
    }

    /// Take the single-writer lock for `identifier`.
    ///
    /// Held across fetch and dispatch so that at most one process creates or
    /// replaces the catalog entry for an identifier at a time.
    pub fn lock(&self, identifier: &str) -> Result<IdentifierLock, ImageError> {
        let path = self
            .locks_dir()
            .join(format!("{}.lock", safe_filename(identifier)));

        // Never unlink lock files: a second process could then lock a fresh
        // inode at the same path while the first still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(ImageError::Locked {
                identifier: identifier.to_string(),
                path,
            });
        }

        Ok(IdentifierLock { _file: file })
    }

    /// Make sure a verified copy of `descriptor` is on disk.
    ///
    /// A cached copy that fails verification is removed and fetched again
    /// exactly once; a second mismatch is returned as
    /// [`ImageError::VerificationFailed`]. The caller is expected to hold
    /// the identifier's [`lock`](Self::lock).
    pub fn fetch(
        &self,
        descriptor: &mut Descriptor,
        retriever: &dyn Retrieve,
    ) -> Result<FetchOutcome, ImageError> {
        if descriptor.is_expired() {
            return Ok(FetchOutcome::Expired);
        }
        if descriptor.location().is_some() {
            return Ok(FetchOutcome::AlreadyPresent);
        }

        let location = self.location_for(descriptor);
        let outcome = if location.is_file() {
            info!(
                identifier = %descriptor.identifier,
                location = %location.display(),
                "image present in cache, verifying checksum"
            );
            match accept_payload(descriptor, &location) {
                Ok(hash) => {
                    descriptor.content_hash = Some(hash);
                    FetchOutcome::Cached
                }
                Err(ImageError::VerificationFailed { .. }) => {
                    warn!(
                        identifier = %descriptor.identifier,
                        location = %location.display(),
                        "cached image is not valid, downloading again"
                    );
                    descriptor.forget_locations();
                    fs::remove_file(&location)?;
                    self.discard_variants(&location)?;
                    self.download_and_verify(descriptor, &location, retriever)?;
                    FetchOutcome::Fetched
                }
                Err(e) => return Err(e),
            }
        } else {
            self.discard_variants(&location)?;
            self.download_and_verify(descriptor, &location, retriever)?;
            FetchOutcome::Fetched
        };

        descriptor.locations = vec![location];
        descriptor.verified = true;
        Ok(outcome)
    }

    /// Remove converted variants derived from an original that is gone.
    fn discard_variants(&self, location: &Path) -> Result<(), ImageError> {
        for format in &self.variant_formats {
            let variant = variant_path(location, format);
            if variant.is_file() {
                info!(variant = %variant.display(), "removing stale converted image");
                fs::remove_file(&variant)?;
            }
        }
        Ok(())
    }

    fn download_and_verify(
        &self,
        descriptor: &mut Descriptor,
        location: &Path,
        retriever: &dyn Retrieve,
    ) -> Result<(), ImageError> {
        info!(
            identifier = %descriptor.identifier,
            uri = %descriptor.source_uri,
            location = %location.display(),
            "downloading image"
        );
        let tmp = NamedTempFile::new_in(&self.root)?;
        retriever.retrieve(descriptor, tmp.path())?;

        let hash = match accept_payload(descriptor, tmp.path()) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(identifier = %descriptor.identifier, error = %e, "downloaded image failed verification");
                descriptor.forget_locations();
                return Err(e);
            }
        };
        tmp.persist(location).map_err(|e| ImageError::Io(e.error))?;
        descriptor.content_hash = Some(hash);
        info!(identifier = %descriptor.identifier, location = %location.display(), "image stored");
        Ok(())
    }
}

/// Hash a payload and decide whether it is the descriptor's content.
///
/// Returns the digest of the bytes on disk, which becomes the descriptor's
/// authoritative hash. Registry images discovered without a layer digest
/// adopt the post-pull sha256.
fn accept_payload(descriptor: &Descriptor, path: &Path) -> Result<ContentHash, ImageError> {
    match &descriptor.content_hash {
        Some(expected) => {
            verify(path, expected, &descriptor.identifier)?;
            Ok(expected.clone())
        }
        None if descriptor.is_registry() => hash_file(path, Algorithm::Sha256),
        None => Err(ImageError::MalformedHash(String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_reader;
    use crate::descriptor::test_descriptor;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    /// Serves a queue of payloads, one per retrieval.
    struct ScriptedRetriever {
        payloads: RefCell<Vec<&'static [u8]>>,
        calls: Cell<usize>,
    }

    impl ScriptedRetriever {
        fn new(payloads: &[&'static [u8]]) -> Self {
            Self {
                payloads: RefCell::new(payloads.iter().rev().copied().collect()),
                calls: Cell::new(0),
            }
        }
    }

    impl Retrieve for ScriptedRetriever {
        fn retrieve(&self, _descriptor: &Descriptor, dest: &Path) -> Result<(), ImageError> {
            self.calls.set(self.calls.get() + 1);
            let payload = self.payloads.borrow_mut().pop().expect("no payload left");
            fs::write(dest, payload)?;
            Ok(())
        }
    }

    fn descriptor_for(payload: &[u8]) -> Descriptor {
        let mut d = test_descriptor("img/one");
        d.verified = false;
        d.content_hash = Some(ContentHash::new(
            Algorithm::Sha256,
            hash_reader(Algorithm::Sha256, payload).unwrap(),
        ));
        d
    }

    #[test]
    fn fresh_download_is_verified_and_placed() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[&b"disk"[..]]);

        let outcome = cache.fetch(&mut d, &retriever).unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched);
        assert!(d.verified);
        assert_eq!(d.location(), Some(tmp.path().join("img_one").as_path()));
        assert_eq!(fs::read(tmp.path().join("img_one")).unwrap(), b"disk");
    }

    #[test]
    fn valid_cached_copy_is_reused() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("img_one"), b"disk").unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[]);

        assert_eq!(cache.fetch(&mut d, &retriever).unwrap(), FetchOutcome::Cached);
        assert_eq!(retriever.calls.get(), 0);
    }

    #[test]
    fn corrupt_cache_triggers_exactly_one_refetch() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("img_one"), b"corrupt").unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[&b"disk"[..]]);

        assert_eq!(cache.fetch(&mut d, &retriever).unwrap(), FetchOutcome::Fetched);
        assert_eq!(retriever.calls.get(), 1);
        assert!(d.verified);
    }

    #[test]
    fn refetched_original_discards_converted_variants() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path())
            .unwrap()
            .with_variant_formats(&["VMDK".to_string()]);
        fs::write(tmp.path().join("img_one"), b"corrupt").unwrap();
        fs::write(tmp.path().join("img_one.vmdk"), b"vmdk:corrupt").unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[&b"disk"[..]]);

        assert_eq!(cache.fetch(&mut d, &retriever).unwrap(), FetchOutcome::Fetched);
        assert!(!tmp.path().join("img_one.vmdk").exists());
        assert_eq!(d.locations, [tmp.path().join("img_one")]);
    }

    #[test]
    fn orphaned_variant_is_discarded_before_download() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path())
            .unwrap()
            .with_variant_formats(&["vmdk".to_string()]);
        fs::write(tmp.path().join("img_one.vmdk"), b"vmdk:old").unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[&b"disk"[..]]);

        cache.fetch(&mut d, &retriever).unwrap();
        assert!(!tmp.path().join("img_one.vmdk").exists());
    }

    #[test]
    fn valid_original_keeps_its_variants() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path())
            .unwrap()
            .with_variant_formats(&["vmdk".to_string()]);
        fs::write(tmp.path().join("img_one"), b"disk").unwrap();
        fs::write(tmp.path().join("img_one.vmdk"), b"vmdk:disk").unwrap();
        let mut d = descriptor_for(b"disk");

        assert_eq!(
            cache.fetch(&mut d, &ScriptedRetriever::new(&[])).unwrap(),
            FetchOutcome::Cached
        );
        assert!(tmp.path().join("img_one.vmdk").is_file());
    }

    #[test]
    fn second_mismatch_is_fatal_without_third_attempt() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("img_one"), b"corrupt").unwrap();
        let mut d = descriptor_for(b"disk");
        let retriever = ScriptedRetriever::new(&[&b"still corrupt"[..], &b"disk"[..]]);

        let err = cache.fetch(&mut d, &retriever).unwrap_err();
        assert!(matches!(err, ImageError::VerificationFailed { .. }));
        assert_eq!(retriever.calls.get(), 1);
        assert!(!d.verified);
        assert!(d.location().is_none());
        assert!(!tmp.path().join("img_one").exists());
    }

    #[test]
    fn expired_and_already_present_are_not_fetched() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        let retriever = ScriptedRetriever::new(&[]);

        let mut expired = descriptor_for(b"disk");
        expired.expires_at = Some(time::macros::datetime!(2000-01-01 00:00 UTC));
        assert_eq!(cache.fetch(&mut expired, &retriever).unwrap(), FetchOutcome::Expired);

        let mut present = descriptor_for(b"disk");
        present.locations = vec![tmp.path().join("elsewhere")];
        assert_eq!(
            cache.fetch(&mut present, &retriever).unwrap(),
            FetchOutcome::AlreadyPresent
        );
        assert_eq!(retriever.calls.get(), 0);
    }

    #[test]
    fn registry_image_adopts_post_pull_digest() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();
        let mut d = test_descriptor("registry.example.org/egi/img:1-sha256:aa");
        d.verified = false;
        d.content_hash = None;
        d.origin = crate::descriptor::Origin::Registry {
            registry_host: "registry.example.org".into(),
            reference: "egi/img:1".into(),
            artifact_digest: "sha256:aa".into(),
            list_name: "egi".into(),
        };
        let retriever = ScriptedRetriever::new(&[&b"pulled"[..]]);

        cache.fetch(&mut d, &retriever).unwrap();
        let expected = hash_reader(Algorithm::Sha256, &b"pulled"[..]).unwrap();
        assert_eq!(d.content_hash.unwrap().to_string(), format!("sha256:{expected}"));
    }

    #[test]
    fn second_lock_on_same_identifier_fails() {
        let tmp = TempDir::new().unwrap();
        let cache = ImageCache::open(tmp.path()).unwrap();

        let held = cache.lock("img/one").unwrap();
        assert!(matches!(
            cache.lock("img/one"),
            Err(ImageError::Locked { identifier, .. }) if identifier == "img/one"
        ));
        assert!(cache.lock("img/two").is_ok());
        drop(held);
        assert!(cache.lock("img/one").is_ok());
    }
}
