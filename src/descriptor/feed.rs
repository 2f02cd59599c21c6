//! Descriptors built from marketplace image-list entries.
//!
//! Each entry is `{"hv:image": {...}}` with a fixed set of string fields.
//! A missing required field rejects that entry only.

use std::collections::BTreeMap;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::{datetime, format_description};
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use super::{Descriptor, ImageMetadata, Origin};
use crate::checksum::{Algorithm, ContentHash};
use crate::error::SourceError;

pub const IMAGE_KEY: &str = "hv:image";
pub const CHECKSUM_KEY: &str = "sl:checksum:sha512";
pub const EXPIRES_KEY: &str = "dc:date:expires";

/// Fields every entry must carry.
pub const REQUIRED_FIELDS: &[&str] = &[
    "ad:group",
    "ad:mpuri",
    "ad:user:fullname",
    "ad:user:guid",
    "ad:user:uri",
    "dc:description",
    "dc:identifier",
    "dc:title",
    "hv:hypervisor",
    "hv:format",
    "hv:size",
    "hv:uri",
    "hv:version",
    "sl:arch",
    "sl:comments",
    "sl:os",
    "sl:osname",
    "sl:osversion",
];

/// Absent expiry means already expired.
const DEFAULT_EXPIRY: OffsetDateTime = datetime!(2000-01-01 00:00 UTC);

/// Build a descriptor from one image-list entry.
///
/// `list_expired` marks the image expired regardless of its own date.
pub fn from_entry(entry: &Value, list_expired: bool) -> Result<Descriptor, SourceError> {
    let image = entry
        .get(IMAGE_KEY)
        .and_then(Value::as_object)
        .ok_or_else(|| {
            SourceError::InvalidImageList(format!("entry has no '{IMAGE_KEY}' object"))
        })?;

    let mut fields = BTreeMap::new();
    for key in REQUIRED_FIELDS {
        let value = image.get(*key).and_then(field_as_string).ok_or_else(|| {
            SourceError::InvalidImageList(format!("Invalid image definition, missing '{key}'"))
        })?;
        fields.insert(*key, value);
    }

    let sha512 = image
        .get(CHECKSUM_KEY)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SourceError::InvalidImageList("Missing sha512 value".to_string()))?;
    let content_hash = ContentHash::parse(&format!("{}:{}", Algorithm::Sha512.name(), sha512))
        .map_err(|e| SourceError::InvalidImageList(e.to_string()))?;

    let expires_at = match image.get(EXPIRES_KEY).and_then(Value::as_str) {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| {
            SourceError::InvalidImageList(format!("cannot parse expiry date '{raw}'"))
        })?,
        None => DEFAULT_EXPIRY,
    };

    let field = |key: &str| fields.get(key).cloned().unwrap_or_default();
    let identifier = field("dc:identifier");
    let descriptor = Descriptor {
        identifier: identifier.clone(),
        title: field("dc:title"),
        source_uri: field("hv:uri"),
        content_hash: Some(content_hash),
        disk_format: field("hv:format"),
        container_format: "bare".to_string(),
        expires_at: Some(if list_expired {
            expires_at.min(DEFAULT_EXPIRY)
        } else {
            expires_at
        }),
        metadata: ImageMetadata {
            description: Some(field("dc:description")),
            mpuri: Some(field("ad:mpuri")),
            os_distro: Some(field("sl:osname")),
            os_version: Some(field("sl:osversion")),
            architecture: Some(field("sl:arch")),
            revision: None,
            source_url: None,
            attributes: image.clone().into_iter().collect(),
        },
        verified: false,
        locations: Vec::new(),
        origin: Origin::Feed {
            hypervisor: field("hv:hypervisor"),
            version: field("hv:version"),
            size: field("hv:size"),
        },
    };

    if descriptor.is_expired() {
        warn!(identifier = %identifier, expires = %expires_at, "image expired");
    }
    Ok(descriptor)
}

/// Feeds carry sizes as numbers on occasion; accept scalars as strings.
fn field_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM[:SS]` or `YYYY-MM-DD`; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(ts);
    }
    let with_seconds = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let without_seconds = format_description!("[year]-[month]-[day] [hour]:[minute]");
    let iso_seconds = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    for format in [with_seconds, without_seconds, iso_seconds] {
        if let Ok(ts) = PrimitiveDateTime::parse(raw, format) {
            return Some(ts.assume_utc());
        }
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|d| d.midnight().assume_utc())
}

#[cfg(test)]
pub(crate) fn sample_entry(identifier: &str, expires: Option<&str>) -> Value {
    let mut image = serde_json::Map::new();
    for key in REQUIRED_FIELDS {
        image.insert(key.to_string(), Value::String(format!("{key}-value")));
    }
    image.insert("dc:identifier".into(), identifier.into());
    image.insert("dc:title".into(), format!("Title {identifier}").into());
    image.insert("hv:format".into(), "QCOW2".into());
    image.insert("hv:uri".into(), format!("https://example.org/{identifier}.qcow2").into());
    image.insert(CHECKSUM_KEY.into(), "ab".repeat(64).into());
    if let Some(expires) = expires {
        image.insert(EXPIRES_KEY.into(), expires.into());
    }
    let mut outer = serde_json::Map::new();
    outer.insert(IMAGE_KEY.to_string(), Value::Object(image));
    Value::Object(outer)
}
