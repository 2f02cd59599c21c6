//! Normalized, source-agnostic image descriptors.
//!
//! A [`Descriptor`] is built fresh on every discovery pass by one of the
//! source adapters ([`feed`] for marketplace image lists, [`registry`] for
//! OCI registries). The shared record carries everything the cache, the
//! converter and the dispatcher need; [`Origin`] carries what only one
//! source kind knows about.

pub mod feed;
pub mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use time::OffsetDateTime;

use crate::checksum::ContentHash;

/// Free-form annotations carried into the catalog as properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub description: Option<String>,
    /// Provenance locator (marketplace URI, or the identifier for registry images).
    pub mpuri: Option<String>,
    pub os_distro: Option<String>,
    pub os_version: Option<String>,
    pub architecture: Option<String>,
    pub revision: Option<String>,
    pub source_url: Option<String>,
    /// Raw source-specific attributes, kept verbatim.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Source-specific part of a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Feed {
        hypervisor: String,
        version: String,
        size: String,
    },
    Registry {
        registry_host: String,
        /// `<repository>:<tag>` as selected during discovery.
        reference: String,
        /// Artifact digest asserted by the registry at discovery time.
        artifact_digest: String,
        list_name: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    /// Dedup key, stable across runs.
    pub identifier: String,
    pub title: String,
    pub source_uri: String,
    /// `None` only for registry images whose manifest did not name a layer
    /// digest; the post-pull digest fills it in.
    pub content_hash: Option<ContentHash>,
    /// Format of the artifact as published (may be a container such as `ova`).
    pub disk_format: String,
    pub container_format: String,
    /// `None` never expires.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub metadata: ImageMetadata,
    pub verified: bool,
    /// Local copies: the original first, converted variants after it.
    pub locations: Vec<PathBuf>,
    pub origin: Origin,
}

impl Descriptor {
    pub fn is_expired(&self) -> bool {
        self.expired_at(OffsetDateTime::now_utc())
    }

    pub fn expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    /// Dispatch-eligible iff verified and not expired.
    pub fn is_eligible(&self) -> bool {
        self.verified && !self.is_expired()
    }

    /// The verified original on disk, if fetched.
    pub fn location(&self) -> Option<&Path> {
        self.locations.first().map(PathBuf::as_path)
    }

    pub fn is_registry(&self) -> bool {
        matches!(self.origin, Origin::Registry { .. })
    }

    /// Drop every local path, e.g. after a verification failure.
    pub fn forget_locations(&mut self) {
        self.locations.clear();
        self.verified = false;
    }

    /// Cache file name derived from the identifier.
    ///
    /// `/` and `:` become `_`, as does anything outside `[A-Za-z0-9-_.]`.
    pub fn safe_filename(&self) -> String {
        safe_filename(&self.identifier)
    }
}

pub(crate) fn safe_filename(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_descriptor(identifier: &str) -> Descriptor {
    use crate::checksum::Algorithm;

    Descriptor {
        identifier: identifier.to_string(),
        title: format!("{identifier} title"),
        source_uri: format!("https://example.org/{identifier}.img"),
        content_hash: Some(ContentHash::new(Algorithm::Sha256, "00".repeat(32))),
        disk_format: "qcow2".to_string(),
        container_format: "bare".to_string(),
        expires_at: None,
        metadata: ImageMetadata::default(),
        verified: true,
        locations: Vec::new(),
        origin: Origin::Feed {
            hypervisor: "QEMU-KVM".to_string(),
            version: "1".to_string(),
            size: "5".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn safe_filename_replaces_separators() {
        assert_eq!(
            safe_filename("registry.example.org/egi/ubuntu:22.04-sha256:ab"),
            "registry.example.org_egi_ubuntu_22.04-sha256_ab"
        );
        assert_eq!(safe_filename("a b?c"), "a_b_c");
    }

    #[test]
    fn expiry_is_strictly_before_now() {
        let mut d = test_descriptor("x");
        let now = datetime!(2024-06-01 00:00 UTC);
        assert!(!d.expired_at(now));

        d.expires_at = Some(datetime!(2024-05-31 23:59 UTC));
        assert!(d.expired_at(now));

        d.expires_at = Some(datetime!(2024-06-02 00:00 UTC));
        assert!(!d.expired_at(now));
    }

    #[test]
    fn eligibility_requires_verification() {
        let mut d = test_descriptor("x");
        assert!(d.is_eligible());
        d.forget_locations();
        assert!(!d.is_eligible());

        let mut expired = test_descriptor("y");
        expired.expires_at = Some(datetime!(2000-01-01 00:00 UTC));
        assert!(!expired.is_eligible());
    }
}
