//! Discovery over a Harbor project.
//!
//! Repositories of the project are listed, then the artifacts of each
//! repository. Every artifact contributes at most one descriptor, for the
//! first of its tags that passes the subscription filter. Only artifacts
//! carrying the managed annotation are published.

pub mod api;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use self::api::RegistryApi;
use super::{SourceAdapter, SourceSettings};
use crate::cache::transfer::{largest_file, move_file, Pull};
use crate::cache::Retrieve;
use crate::descriptor::registry::{from_artifact, ResolvedArtifact, MANAGED_ANNOTATION};
use crate::descriptor::{Descriptor, Origin};
use crate::error::{ImageError, SourceError};

const ARTIFACT_QUERY: &[(&str, &str)] = &[
    ("with_tag", "true"),
    ("with_scan_overview", "false"),
    ("with_label", "false"),
    ("with_accessory", "true"),
];

/// What became of one listed artifact.
#[derive(Debug)]
pub enum ArtifactOutcome {
    Resolved(Box<Descriptor>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoTags,
    NoMatchingTag,
    Unmanaged,
}

/// Pick the tag an artifact is published under.
///
/// Subscriptions (tag names or the artifact digest) win over the pattern,
/// which wins over taking the first tag. The pattern is anchored at the
/// start of the tag name.
pub fn select_tag<'a>(
    tags: &[&'a str],
    digest: &str,
    subscribed: &[String],
    pattern: Option<&Regex>,
) -> Option<&'a str> {
    tags.iter().copied().find(|tag| {
        if !subscribed.is_empty() {
            subscribed.iter().any(|s| s == tag || s == digest)
        } else if let Some(re) = pattern {
            re.find(tag).is_some_and(|m| m.start() == 0)
        } else {
            true
        }
    })
}

/// Artifact-level annotations overlaid with the first layer's.
///
/// Falls back to the artifact's top-level `annotations` when both are empty.
pub fn merge_annotations(
    artifact: &Value,
    layer: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = string_map(artifact.pointer("/extra_attrs/annotations"));
    merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    if merged.is_empty() {
        merged = string_map(artifact.get("annotations"));
    }
    merged
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct RegistrySource {
    settings: SourceSettings,
    api_url: Url,
    registry_host: String,
    project: String,
    tag_pattern: Option<Regex>,
    page_size: u32,
    api: Box<dyn RegistryApi>,
    puller: Box<dyn Pull>,
}

impl RegistrySource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SourceSettings,
        api_url: &str,
        registry_host: Option<&str>,
        project: &str,
        tag_pattern: Option<&str>,
        page_size: u32,
        api: Box<dyn RegistryApi>,
        puller: Box<dyn Pull>,
    ) -> Result<Self, SourceError> {
        let name = &settings.name;
        let api_url = Url::parse(api_url.trim_end_matches('/')).map_err(|e| {
            SourceError::InvalidConfig(format!("source '{name}': invalid api_url '{api_url}': {e}"))
        })?;
        let registry_host = match registry_host.filter(|h| !h.is_empty()) {
            Some(host) => host.to_string(),
            None => host_of(&api_url).ok_or_else(|| {
                SourceError::InvalidConfig(format!(
                    "registry_host must be provided for registry source '{name}'"
                ))
            })?,
        };
        if project.is_empty() {
            return Err(SourceError::InvalidConfig(format!(
                "registry source '{name}' has no project"
            )));
        }
        if page_size == 0 {
            return Err(SourceError::InvalidConfig(format!(
                "registry source '{name}': page_size must be positive"
            )));
        }
        let tag_pattern = tag_pattern
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                SourceError::InvalidConfig(format!("source '{name}': invalid tag_pattern: {e}"))
            })?;

        Ok(Self {
            settings,
            api_url,
            registry_host,
            project: project.to_string(),
            tag_pattern,
            page_size,
            api,
            puller,
        })
    }

    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    fn base(&self) -> String {
        self.api_url.as_str().trim_end_matches('/').to_string()
    }

    fn repositories_url(&self) -> String {
        format!("{}/projects/{}/repositories", self.base(), self.project)
    }

    /// Collect every item of a paged listing.
    ///
    /// The first request carries `page`/`page_size` plus `params`; later
    /// pages follow the `Link` target as given. An empty page ends listing.
    fn fetch_paginated(&self, url: &str, params: &[(&str, &str)]) -> Result<Vec<Value>, SourceError> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        query.push(("page".to_string(), "1".to_string()));
        query.push(("page_size".to_string(), self.page_size.to_string()));

        let mut results = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(url.to_string());
        let mut page = 1;
        while let Some(current) = next.take() {
            let absolute = self.api_url.join(&current).map_err(|e| SourceError::ListingFailed {
                code: 0,
                reason: format!("invalid continuation link '{current}': {e}"),
            })?;
            if !visited.insert(absolute.clone()) {
                warn!(source = %self.settings.name, url = %absolute, "pagination loops back, stopping");
                break;
            }

            debug!(source = %self.settings.name, url = %absolute, page, "fetching page");
            let response = self.api.get(absolute.as_str(), &query).inspect_err(|e| {
                error!(source = %self.settings.name, url = %absolute, error = %e, "registry API request failed");
            })?;
            let items = match response.body {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(SourceError::ListingFailed {
                        code: 0,
                        reason: format!("expected a JSON array from {absolute}, got {other}"),
                    })
                }
            };
            if items.is_empty() {
                debug!(url = %absolute, page, "no more data");
                break;
            }
            results.extend(items);
            next = response.link;
            query.clear();
            page += 1;
        }
        Ok(results)
    }

    fn process_repository(&self, repo_name: &str) -> Result<Vec<Descriptor>, SourceError> {
        let short = repo_name
            .split_once('/')
            .map_or(repo_name, |(_, rest)| rest);
        if short.is_empty() {
            warn!(repository = repo_name, "cannot extract repository name, skipping");
            return Ok(Vec::new());
        }

        let encoded: String = url::form_urlencoded::byte_serialize(short.as_bytes()).collect();
        let artifacts_url = format!("{}/{encoded}/artifacts", self.repositories_url());
        let artifacts = self.fetch_paginated(&artifacts_url, ARTIFACT_QUERY)?;
        debug!(repository = repo_name, count = artifacts.len(), "processing artifacts");

        let mut images = Vec::new();
        for artifact in &artifacts {
            match self.process_artifact(artifact, repo_name) {
                Ok(ArtifactOutcome::Resolved(d)) => {
                    debug!(identifier = %d.identifier, "added registry image");
                    images.push(*d);
                }
                Ok(ArtifactOutcome::Skipped(reason)) => {
                    debug!(repository = repo_name, ?reason, "artifact skipped");
                }
                Err(e) => {
                    error!(repository = repo_name, error = %e, "failed to process artifact");
                }
            }
        }
        Ok(images)
    }

    pub fn process_artifact(
        &self,
        artifact: &Value,
        repo_name: &str,
    ) -> Result<ArtifactOutcome, SourceError> {
        let digest = artifact
            .get("digest")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tags: Vec<&str> = artifact
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if tags.is_empty() {
            return Ok(ArtifactOutcome::Skipped(SkipReason::NoTags));
        }

        let Some(tag) = select_tag(
            &tags,
            digest,
            &self.settings.subscribed_images,
            self.tag_pattern.as_ref(),
        ) else {
            return Ok(ArtifactOutcome::Skipped(SkipReason::NoMatchingTag));
        };

        let reference = format!("{repo_name}:{tag}");
        let manifest = self.api.manifest(&reference)?;
        let first_layer = manifest.layers.into_iter().next().unwrap_or_default();
        let annotations = merge_annotations(artifact, &first_layer.annotations);
        if annotations.is_empty() {
            warn!(reference = %reference, "no annotations found");
        }
        if !annotations.contains_key(MANAGED_ANNOTATION) {
            warn!(reference = %reference, "no '{MANAGED_ANNOTATION}' annotation, ignoring");
            return Ok(ArtifactOutcome::Skipped(SkipReason::Unmanaged));
        }

        let descriptor = from_artifact(ResolvedArtifact {
            registry_host: self.registry_host.clone(),
            reference,
            artifact_digest: digest.to_string(),
            layer_digest: first_layer.digest,
            annotations,
            list_name: self.settings.name.clone(),
        })
        .map_err(|e| SourceError::InvalidImageList(e.to_string()))?;
        Ok(ArtifactOutcome::Resolved(Box::new(descriptor)))
    }
}

pub(crate) fn host_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

impl SourceAdapter for RegistrySource {
    fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        self.repositories_url()
    }

    fn discover(&self) -> Result<Vec<Descriptor>, SourceError> {
        info!(source = %self.settings.name, project = %self.project, "fetching images from registry");
        let repositories = self.fetch_paginated(&self.repositories_url(), &[])?;
        if repositories.is_empty() {
            warn!(source = %self.settings.name, project = %self.project, "no repositories found");
            return Ok(Vec::new());
        }
        info!(project = %self.project, count = repositories.len(), "found repositories");

        let mut images = Vec::new();
        for repo in &repositories {
            let Some(name) = repo.get("name").and_then(Value::as_str) else {
                warn!(source = %self.settings.name, "repository without a name, skipping");
                continue;
            };
            images.extend(self.process_repository(name)?);
        }
        info!(
            source = %self.settings.name,
            count = images.len(),
            "finished fetching registry source"
        );
        Ok(images)
    }

    /// Subscriptions were applied while choosing tags.
    fn subscribed(&self, images: &[Descriptor]) -> Vec<Descriptor> {
        images.to_vec()
    }

    fn describe(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), self.settings.name.clone().into());
        map.insert("url".into(), self.endpoint().into());
        map.insert("enabled".into(), self.settings.enabled.into());
        map.insert("project".into(), self.project.clone().into());
        map.insert("registry_host".into(), self.registry_host.clone().into());
        let subscribed = if self.settings.subscribed_images.is_empty() {
            Value::from("All (or by pattern)")
        } else {
            Value::from(self.settings.subscribed_images.clone())
        };
        map.insert("subscribed".into(), subscribed);
        if let Some(re) = &self.tag_pattern {
            map.insert("tag_pattern".into(), re.as_str().into());
        }
        map
    }
}

impl Retrieve for RegistrySource {
    fn retrieve(&self, descriptor: &Descriptor, dest: &Path) -> Result<(), ImageError> {
        let Origin::Registry {
            registry_host,
            reference,
            list_name,
            ..
        } = &descriptor.origin
        else {
            return Err(ImageError::DownloadFailed {
                code: 1,
                reason: format!("'{}' is not a registry image", descriptor.identifier),
            });
        };

        let outdir = tempfile::Builder::new()
            .prefix("pull-")
            .suffix(&format!("-{list_name}"))
            .tempdir()?;
        info!(
            identifier = %descriptor.identifier,
            reference = %reference,
            outdir = %outdir.path().display(),
            "pulling registry image"
        );
        self.puller
            .pull(registry_host, reference, outdir.path())
            .inspect_err(|e| error!(identifier = %descriptor.identifier, error = %e, "pull failed"))?;

        let payload = largest_file(outdir.path())?;
        debug!(identifier = %descriptor.identifier, payload = %payload.display(), "selected pulled file");
        move_file(&payload, dest)
    }
}
