//! Catalog reconciliation.
//!
//! [`Dispatcher::dispatch`] makes the catalog reflect one descriptor:
//!
//! ```text
//! ABSENT ──create──▶ QUEUED ──upload──▶ ACTIVE ──visibility/grants──▶ ACTIVE
//!    ▲                                     │
//!    └──────────── delete (hash changed) ◀─┘
//! ```
//!
//! [`Dispatcher::sync`] retires managed entries of one image list whose
//! identifiers are no longer valid. Entries are matched to descriptors by
//! the `appdb_id` property among entries carrying the managed tag.

pub mod sharing;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, error, info, warn};

use self::sharing::GrantChanges;
use crate::catalog::{Catalog, CatalogEntry, EntryStatus, NewEntry, Visibility};
use crate::convert::{ConversionTool, FormatConverter, ResolvedDisk};
use crate::descriptor::Descriptor;
use crate::error::{CatalogError, DispatchError};

pub const PROP_NAME: &str = "name";
pub const PROP_IDENTIFIER: &str = "appdb_id";
pub const PROP_HASH: &str = "image_hash";
pub const PROP_IMAGE_LIST: &str = "image_list";
pub const PROP_DESCRIPTION: &str = "vmcatcher_event_dc_description";
pub const PROP_MPURI: &str = "vmcatcher_event_ad_mpuri";
pub const PROP_ATTRIBUTES: &str = "APPLIANCE_ATTRIBUTES";

/// Keys the dispatcher computes itself; callers may not supply them.
pub const COMPUTED_PROPERTIES: &[&str] = &[
    PROP_NAME,
    "tags",
    "visibility",
    PROP_DESCRIPTION,
    PROP_MPURI,
    PROP_IDENTIFIER,
    PROP_HASH,
    "os_version",
    "os_distro",
    "architecture",
    PROP_ATTRIBUTES,
    "disk_format",
    "container_format",
];

/// Disk formats the catalog accepts.
pub const DISK_FORMATS: &[&str] = &[
    "ami", "ari", "aki", "vhd", "vhdx", "vmdk", "raw", "qcow2", "vdi", "iso", "ploop", "root-tar",
];

pub const DEFAULT_DISK_FORMAT: &str = "raw";

/// Lower-case `format`, replacing anything outside [`DISK_FORMATS`] with `raw`.
pub fn coerce_disk_format(format: &str) -> String {
    let format = format.to_ascii_lowercase();
    if DISK_FORMATS.contains(&format.as_str()) {
        format
    } else {
        DEFAULT_DISK_FORMAT.to_string()
    }
}

/// `ova` for `vmdk`, `bare` for everything else.
pub fn container_format_for(disk_format: &str) -> &'static str {
    if disk_format == "vmdk" {
        "ova"
    } else {
        "bare"
    }
}

/// Consumer group -> project id.
pub type ConsumerMap = BTreeMap<String, String>;

/// How one descriptor should appear in the catalog.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub name: String,
    /// Used when there are no consumers; with consumers the entry is shared.
    pub visibility: Visibility,
    pub consumers: Vec<String>,
    /// Caller properties, e.g. `image_list`.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Expired,
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published {
        entry_id: String,
        created: bool,
        uploaded: bool,
        replaced: bool,
        grants: GrantChanges,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: Vec<String>,
    /// Entries made private and deactivated because deletion was refused.
    pub demoted: Vec<String>,
    /// Entries left untouched because neither deletion nor demotion worked.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherSettings {
    /// Managed marker tag.
    pub tag: String,
    /// Accepted conversion targets; empty disables conversion.
    pub formats: Vec<String>,
    pub consumers: ConsumerMap,
}

pub struct Dispatcher<'a> {
    catalog: &'a dyn Catalog,
    converter: FormatConverter<'a>,
    settings: DispatcherSettings,
}

fn permission(action: &str, e: CatalogError) -> DispatchError {
    if e.is_forbidden() {
        error!(action, error = %e, "insufficient permissions on catalog");
        DispatchError::PermissionDenied {
            action: action.to_string(),
        }
    } else {
        DispatchError::Catalog(e)
    }
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        tool: &'a dyn ConversionTool,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            catalog,
            converter: FormatConverter::new(tool),
            settings,
        }
    }

    /// Accepted conversion targets, as configured.
    pub fn formats(&self) -> &[String] {
        &self.settings.formats
    }

    /// Properties derived from the descriptor alone.
    fn computed_properties(&self, descriptor: &Descriptor) -> BTreeMap<String, String> {
        let meta = &descriptor.metadata;
        let mut props = BTreeMap::new();
        props.insert(
            PROP_DESCRIPTION.to_string(),
            meta.description.clone().unwrap_or_default(),
        );
        props.insert(PROP_MPURI.to_string(), meta.mpuri.clone().unwrap_or_default());
        props.insert(PROP_IDENTIFIER.to_string(), descriptor.identifier.clone());
        props.insert(PROP_HASH.to_string(), content_hash(descriptor));
        for (key, value) in [
            ("os_version", &meta.os_version),
            ("os_distro", &meta.os_distro),
            ("architecture", &meta.architecture),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                props.insert(key.to_string(), value.clone());
            }
        }
        if !meta.attributes.is_empty() {
            if let Ok(json) = serde_json::to_string(&meta.attributes) {
                props.insert(PROP_ATTRIBUTES.to_string(), json);
            }
        }
        props
    }

    /// Project ids for the consumer groups; unmapped groups are skipped.
    fn consumer_projects(&self, identifier: &str, consumers: &[String]) -> BTreeSet<String> {
        consumers
            .iter()
            .filter_map(|group| {
                let project = self.settings.consumers.get(group).filter(|p| !p.is_empty());
                if project.is_none() {
                    warn!(identifier, group = %group, "no project associated with consumer, image won't be shared with it");
                }
                project.cloned()
            })
            .collect()
    }

    /// The single managed entry for `identifier`, if any.
    fn lookup(&self, identifier: &str) -> Result<Option<CatalogEntry>, DispatchError> {
        let mut matches: Vec<CatalogEntry> = self
            .catalog
            .list_entries(&self.settings.tag)?
            .into_iter()
            .filter(|e| e.property(PROP_IDENTIFIER) == Some(identifier))
            .collect();
        if matches.len() > 1 {
            let ids: Vec<String> = matches.into_iter().map(|e| e.id).collect();
            error!(identifier, ?ids, "several catalog entries for one image, remove them manually");
            return Err(DispatchError::DuplicateEntry {
                identifier: identifier.to_string(),
                ids,
            });
        }
        Ok(matches.pop())
    }

    fn resolve_disk(&self, descriptor: &mut Descriptor) -> Result<(String, ResolvedDisk), DispatchError> {
        let disk = self.converter.convert(descriptor, &self.settings.formats)?;
        let format = coerce_disk_format(&disk.format);
        if format != disk.format {
            warn!(
                identifier = %descriptor.identifier,
                format = %disk.format,
                "disk format not accepted by the catalog, using '{DEFAULT_DISK_FORMAT}'"
            );
        }
        Ok((format, disk))
    }

    /// Reconcile the catalog with one descriptor.
    pub fn dispatch(
        &self,
        descriptor: &mut Descriptor,
        request: &DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        if descriptor.is_expired() {
            return Ok(DispatchOutcome::Skipped(SkipReason::Expired));
        }
        if !descriptor.verified {
            return Ok(DispatchOutcome::Skipped(SkipReason::Unverified));
        }

        let mut properties = self.computed_properties(descriptor);
        for (key, value) in &request.extra {
            if COMPUTED_PROPERTIES.contains(&key.as_str()) {
                return Err(DispatchError::MetadataCollision { key: key.clone() });
            }
            properties.insert(key.clone(), value.clone());
        }

        info!(identifier = %descriptor.identifier, "dispatching image");
        let visibility = if request.consumers.is_empty() {
            request.visibility
        } else {
            Visibility::Shared
        };
        let hash = content_hash(descriptor);

        let mut replaced = false;
        let mut existing = self.lookup(&descriptor.identifier)?;
        if let Some(entry) = existing.take_if(|e| e.property(PROP_HASH).unwrap_or_default() != hash) {
            warn!(
                identifier = %descriptor.identifier,
                entry_id = %entry.id,
                "catalog entry has a different checksum, deleting it and uploading again"
            );
            self.catalog
                .delete_entry(&entry.id)
                .map_err(|e| permission("delete", e))?;
            replaced = true;
        }

        let mut disk = None;
        let mut created = false;
        let mut entry = match existing {
            Some(entry) => entry,
            None => {
                let (disk_format, resolved) = self.resolve_disk(descriptor)?;
                let new_entry = NewEntry {
                    name: request.name.clone(),
                    visibility,
                    container_format: container_format_for(&disk_format).to_string(),
                    disk_format,
                    tags: vec![self.settings.tag.clone()],
                    properties: properties.clone(),
                };
                debug!(identifier = %descriptor.identifier, "creating catalog entry");
                let entry = self
                    .catalog
                    .create_entry(&new_entry)
                    .map_err(|e| permission("create", e))?;
                disk = Some(resolved);
                created = true;
                entry
            }
        };

        let mut uploaded = false;
        if entry.status.awaits_content() {
            if disk.is_none() {
                disk = Some(self.resolve_disk(descriptor)?.1);
            }
            if let Some(resolved) = disk.take() {
                debug!(identifier = %descriptor.identifier, entry_id = %entry.id, "uploading image");
                self.catalog.upload(&entry.id, resolved.reader)?;
                entry.status = EntryStatus::Active;
                uploaded = true;
            }
        }

        if entry.status == EntryStatus::Active {
            if entry.visibility != visibility {
                info!(identifier = %descriptor.identifier, %visibility, "setting image visibility");
                self.catalog
                    .update_visibility(&entry.id, visibility)
                    .map_err(|e| permission("update", e))?;
                entry.visibility = visibility;
            }
            info!(identifier = %descriptor.identifier, entry_id = %entry.id, "image stored in catalog");
        }

        let mut grants = GrantChanges::default();
        if visibility == Visibility::Shared {
            let projects = self.consumer_projects(&descriptor.identifier, &request.consumers);
            sharing::grant(self.catalog, &mut entry, &projects, &mut grants)?;
            sharing::revoke_stale(self.catalog, &mut entry, &projects, visibility, &mut grants)?;
        }

        Ok(DispatchOutcome::Published {
            entry_id: entry.id,
            created,
            uploaded,
            replaced,
            grants,
        })
    }

    /// Retire managed entries of `image_list` whose identifier is not in `valid`.
    ///
    /// Deletion failures fall back to making the entry private and
    /// deactivating it.
    pub fn sync(
        &self,
        image_list: &str,
        valid: &HashSet<String>,
    ) -> Result<SyncReport, DispatchError> {
        let mut report = SyncReport::default();
        for entry in self.catalog.list_entries(&self.settings.tag)? {
            if entry.property(PROP_IMAGE_LIST) != Some(image_list) {
                continue;
            }
            let identifier = entry.property(PROP_IDENTIFIER).unwrap_or_default();
            if valid.contains(identifier) {
                continue;
            }

            warn!(entry_id = %entry.id, identifier, "catalog entry is not valid anymore, deleting it");
            match self.catalog.delete_entry(&entry.id) {
                Ok(()) => {
                    info!(entry_id = %entry.id, "deleted catalog entry");
                    report.deleted.push(entry.id);
                }
                Err(e) => {
                    warn!(
                        entry_id = %entry.id,
                        error = %e,
                        "failed to delete catalog entry, making it private and deactivating it instead"
                    );
                    let demoted = self
                        .catalog
                        .update_visibility(&entry.id, Visibility::Private)
                        .and_then(|()| self.catalog.deactivate_entry(&entry.id));
                    match demoted {
                        Ok(()) => report.demoted.push(entry.id),
                        Err(e) => {
                            error!(entry_id = %entry.id, error = %e, "cannot retire catalog entry");
                            report.failed.push(entry.id);
                        }
                    }
                }
            }
        }
        info!(image_list, "sync finished");
        Ok(report)
    }
}

fn content_hash(descriptor: &Descriptor) -> String {
    descriptor
        .content_hash
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default()
}
