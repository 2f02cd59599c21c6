//! The target image catalog, seen through the calls the dispatcher needs.
//!
//! The catalog service owns entries and membership grants; this crate only
//! drives it. [`glance`] binds the trait to the OpenStack Image v2 API.

pub mod glance;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Community,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Community => "community",
            Visibility::Public => "public",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Visibility::Private),
            "shared" => Ok(Visibility::Shared),
            "community" => Ok(Visibility::Community),
            "public" => Ok(Visibility::Public),
            other => Err(CatalogError::Decode(format!("unknown visibility '{other}'"))),
        }
    }
}

/// Remote entry status. Anything unrecognised is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Queued,
    Saving,
    Active,
    Deactivated,
    Killed,
    Deleted,
    Other(String),
}

impl EntryStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => EntryStatus::Queued,
            "saving" => EntryStatus::Saving,
            "active" => EntryStatus::Active,
            "deactivated" => EntryStatus::Deactivated,
            "killed" => EntryStatus::Killed,
            "deleted" | "pending_delete" => EntryStatus::Deleted,
            other => EntryStatus::Other(other.to_string()),
        }
    }

    /// Waiting for its bytes.
    pub fn awaits_content(&self) -> bool {
        matches!(self, EntryStatus::Queued)
    }
}

/// A catalog record as listed by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub status: EntryStatus,
    pub visibility: Visibility,
    pub owner: Option<String>,
    pub tags: Vec<String>,
    /// Custom properties, e.g. `appdb_id` and `image_hash`.
    pub properties: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Everything needed to create an entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntry {
    pub name: String,
    pub visibility: Visibility,
    pub disk_format: String,
    pub container_format: String,
    pub tags: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Pending,
    Accepted,
    Rejected,
}

impl MemberStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => MemberStatus::Accepted,
            "rejected" => MemberStatus::Rejected,
            _ => MemberStatus::Pending,
        }
    }
}

/// A membership grant of one entry to one consumer project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub project_id: String,
    pub status: MemberStatus,
}

/// Blocking catalog operations.
///
/// Everything but `create_entry` is expected to be idempotent on the
/// service side.
pub trait Catalog {
    /// Entries carrying `tag`.
    fn list_entries(&self, tag: &str) -> Result<Vec<CatalogEntry>, CatalogError>;
    fn create_entry(&self, entry: &NewEntry) -> Result<CatalogEntry, CatalogError>;
    fn upload(&self, id: &str, data: Box<dyn Read + Send>) -> Result<(), CatalogError>;
    fn update_visibility(&self, id: &str, visibility: Visibility) -> Result<(), CatalogError>;
    fn delete_entry(&self, id: &str) -> Result<(), CatalogError>;
    fn deactivate_entry(&self, id: &str) -> Result<(), CatalogError>;
    fn list_members(&self, id: &str) -> Result<Vec<Member>, CatalogError>;
    /// Fails with [`CatalogError::Conflict`] when already a member.
    fn add_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError>;
    /// Accept a pending grant on behalf of the consumer project.
    fn accept_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError>;
    fn remove_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_parses_case_insensitively() {
        assert_eq!("Shared".parse::<Visibility>().unwrap(), Visibility::Shared);
        assert!("hidden".parse::<Visibility>().is_err());
    }

    #[test]
    fn only_queued_entries_await_content() {
        assert!(EntryStatus::parse("queued").awaits_content());
        assert!(!EntryStatus::parse("active").awaits_content());
        assert_eq!(
            EntryStatus::parse("uploading"),
            EntryStatus::Other("uploading".to_string())
        );
    }
}
