//! Descriptors built from OCI registry artifacts.

use std::collections::BTreeMap;

use tracing::debug;

use super::{Descriptor, ImageMetadata, Origin};
use crate::checksum::ContentHash;
use crate::error::ImageError;

/// Annotation that marks an artifact as published for synchronization.
pub const MANAGED_ANNOTATION: &str = "eu.egi.cloud.tag";
/// Annotation recording the reference the image was discovered under.
pub const IMAGE_REF_ANNOTATION: &str = "eu.egi.cloud.image_ref";
pub const DISK_FORMAT_ANNOTATION: &str = "org.openstack.glance.disk_format";
pub const CONTAINER_FORMAT_ANNOTATION: &str = "org.openstack.glance.container_format";

const DESCRIPTION_ANNOTATION: &str = "eu.egi.cloud.description";
const ARCH_ANNOTATION: &str = "org.openstack.glance.architecture";
const OS_DISTRO_ANNOTATION: &str = "org.openstack.glance.os_distro";
const OS_VERSION_ANNOTATION: &str = "org.openstack.glance.os_version";
const REVISION_ANNOTATION: &str = "org.opencontainers.image.revision";
const SOURCE_ANNOTATION: &str = "org.opencontainers.image.source";

/// What discovery resolved for one tagged artifact.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub registry_host: String,
    /// `<repository>:<tag>`
    pub reference: String,
    pub artifact_digest: String,
    /// Digest of the first content layer, when the manifest names one.
    pub layer_digest: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub list_name: String,
}

/// Composite identifier: unique across repositories and tags that point at
/// the same content.
pub fn identifier(registry_host: &str, reference: &str, artifact_digest: &str) -> String {
    format!("{registry_host}/{reference}-{artifact_digest}")
}

pub fn from_artifact(artifact: ResolvedArtifact) -> Result<Descriptor, ImageError> {
    let ResolvedArtifact {
        registry_host,
        reference,
        artifact_digest,
        layer_digest,
        mut annotations,
        list_name,
    } = artifact;

    let identifier = identifier(&registry_host, &reference, &artifact_digest);
    let content_hash = layer_digest
        .as_deref()
        .map(ContentHash::parse)
        .transpose()?;

    let disk_format = annotations
        .get(DISK_FORMAT_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| "raw".to_string());
    let container_format = annotations
        .get(CONTAINER_FORMAT_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| "bare".to_string());
    annotations.insert(IMAGE_REF_ANNOTATION.to_string(), reference.clone());

    let annotation = |key: &str| annotations.get(key).filter(|v| !v.is_empty()).cloned();
    let metadata = ImageMetadata {
        description: annotation(DESCRIPTION_ANNOTATION),
        mpuri: Some(identifier.clone()),
        os_distro: annotation(OS_DISTRO_ANNOTATION),
        os_version: annotation(OS_VERSION_ANNOTATION),
        architecture: annotation(ARCH_ANNOTATION),
        revision: annotation(REVISION_ANNOTATION),
        source_url: annotation(SOURCE_ANNOTATION),
        attributes: annotations
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    };

    debug!(identifier = %identifier, "registry image resolved");
    Ok(Descriptor {
        identifier,
        title: reference.clone(),
        source_uri: reference.clone(),
        content_hash,
        disk_format,
        container_format,
        expires_at: None,
        metadata,
        verified: false,
        locations: Vec::new(),
        origin: Origin::Registry {
            registry_host,
            reference,
            artifact_digest,
            list_name,
        },
    })
}
