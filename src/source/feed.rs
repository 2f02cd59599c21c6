//! Marketplace image-list source.
//!
//! The list is a JSON document under `hv:imagelist`, read from an http(s)
//! URL or a local path. Entries that fail validation are logged and left
//! out; the rest of the list still syncs.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use super::{SourceAdapter, SourceSettings};
use crate::cache::transfer::Fetch;
use crate::cache::Retrieve;
use crate::descriptor::feed::{from_entry, parse_timestamp, EXPIRES_KEY};
use crate::descriptor::Descriptor;
use crate::error::{ImageError, SourceError};

pub const LIST_KEY: &str = "hv:imagelist";
pub const IMAGES_KEY: &str = "hv:images";

pub struct FeedSource {
    settings: SourceSettings,
    url: String,
    fetcher: Box<dyn Fetch>,
}

impl FeedSource {
    pub fn new(
        settings: SourceSettings,
        url: &str,
        fetcher: Box<dyn Fetch>,
    ) -> Result<Self, SourceError> {
        if url.trim().is_empty() {
            return Err(SourceError::InvalidConfig(format!(
                "feed source '{}' has no url",
                settings.name
            )));
        }
        Ok(Self {
            settings,
            url: url.to_string(),
            fetcher,
        })
    }

    fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    fn load(&self) -> Result<Vec<u8>, SourceError> {
        if !self.is_remote() {
            return fs::read(&self.url).map_err(|e| SourceError::ListingFailed {
                code: 0,
                reason: format!("cannot read '{}': {e}", self.url),
            });
        }

        let scratch = NamedTempFile::new().map_err(|e| SourceError::ListingFailed {
            code: 0,
            reason: e.to_string(),
        })?;
        self.fetcher
            .fetch(&self.url, scratch.path())
            .map_err(|e| match e {
                ImageError::DownloadFailed { code, reason } => SourceError::ListingFailed {
                    code: u16::try_from(code).unwrap_or(0),
                    reason,
                },
                other => SourceError::ListingFailed {
                    code: 0,
                    reason: other.to_string(),
                },
            })?;
        fs::read(scratch.path()).map_err(|e| SourceError::ListingFailed {
            code: 0,
            reason: e.to_string(),
        })
    }
}

/// Turn an image-list document into descriptors.
pub fn parse_list(source: &str, bytes: &[u8]) -> Result<Vec<Descriptor>, SourceError> {
    let doc: Value = serde_json::from_slice(bytes)
        .map_err(|e| SourceError::InvalidImageList(format!("not JSON: {e}")))?;
    let list = doc
        .get(LIST_KEY)
        .and_then(Value::as_object)
        .ok_or_else(|| SourceError::InvalidImageList(format!("missing '{LIST_KEY}'")))?;

    let list_expired = match list.get(EXPIRES_KEY).and_then(Value::as_str) {
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => ts < time::OffsetDateTime::now_utc(),
            None => {
                return Err(SourceError::InvalidImageList(format!(
                    "cannot parse list expiry '{raw}'"
                )))
            }
        },
        None => false,
    };
    if list_expired {
        warn!(source = %source, "image list expired, every image in it is expired too");
    }

    let entries = list
        .get(IMAGES_KEY)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut images = Vec::with_capacity(entries.len());
    for entry in entries {
        match from_entry(entry, list_expired) {
            Ok(descriptor) => images.push(descriptor),
            Err(e) => error!(source = %source, error = %e, "skipping invalid image entry"),
        }
    }
    Ok(images)
}

impl SourceAdapter for FeedSource {
    fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    fn discover(&self) -> Result<Vec<Descriptor>, SourceError> {
        info!(source = %self.settings.name, url = %self.url, "fetching image list");
        let bytes = self.load()?;
        let images = parse_list(&self.settings.name, &bytes)?;
        info!(source = %self.settings.name, count = images.len(), "image list loaded");
        Ok(images)
    }
}

impl Retrieve for FeedSource {
    fn retrieve(&self, descriptor: &Descriptor, dest: &Path) -> Result<(), ImageError> {
        info!(identifier = %descriptor.identifier, uri = %descriptor.source_uri, "downloading image");
        let bytes = self.fetcher.fetch(&descriptor.source_uri, dest)?;
        info!(identifier = %descriptor.identifier, bytes, "image downloaded");
        Ok(())
    }
}
