//! Membership grants for shared entries.
//!
//! Grants converge on the declared consumer projects: missing grants are
//! added and accepted, grants to projects no longer declared are revoked.
//! Grants already in place are left alone.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogEntry, MemberStatus, Visibility};
use crate::error::CatalogError;

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantChanges {
    pub granted: Vec<String>,
    pub accepted: Vec<String>,
    pub revoked: Vec<String>,
}

/// Grant `projects` access to `entry` and accept on their behalf.
///
/// A project owning the entry needs no grant. An "already a member" answer
/// counts as success.
pub fn grant(
    catalog: &dyn Catalog,
    entry: &mut CatalogEntry,
    projects: &BTreeSet<String>,
    changes: &mut GrantChanges,
) -> Result<(), CatalogError> {
    let members = catalog.list_members(&entry.id)?;
    for project in projects {
        if entry.owner.as_deref() == Some(project.as_str()) {
            info!(entry_id = %entry.id, project = %project, "entry owned by consumer project");
            continue;
        }

        let existing = members.iter().find(|m| &m.project_id == project);
        if existing.is_some_and(|m| m.status == MemberStatus::Accepted) {
            debug!(entry_id = %entry.id, project = %project, "grant already accepted");
            continue;
        }

        if entry.visibility != Visibility::Shared {
            debug!(entry_id = %entry.id, "marking entry as shared");
            catalog.update_visibility(&entry.id, Visibility::Shared)?;
            entry.visibility = Visibility::Shared;
        }

        if existing.is_none() {
            match catalog.add_member(&entry.id, project) {
                Ok(()) => changes.granted.push(project.clone()),
                Err(e) if e.is_conflict() => {
                    debug!(entry_id = %entry.id, project = %project, "already a member");
                }
                Err(e) => return Err(e),
            }
        }
        catalog.accept_member(&entry.id, project)?;
        changes.accepted.push(project.clone());
        info!(entry_id = %entry.id, project = %project, "entry shared with project");
    }
    Ok(())
}

/// Revoke grants to projects outside `projects`.
///
/// Revocation happens with the entry shared; afterwards its visibility is
/// set to `visibility`.
pub fn revoke_stale(
    catalog: &dyn Catalog,
    entry: &mut CatalogEntry,
    projects: &BTreeSet<String>,
    visibility: Visibility,
    changes: &mut GrantChanges,
) -> Result<(), CatalogError> {
    let stale: Vec<String> = catalog
        .list_members(&entry.id)?
        .into_iter()
        .map(|m| m.project_id)
        .filter(|p| !projects.contains(p))
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    if entry.visibility != Visibility::Shared {
        catalog.update_visibility(&entry.id, Visibility::Shared)?;
        entry.visibility = Visibility::Shared;
    }
    for project in stale {
        catalog.remove_member(&entry.id, &project)?;
        info!(entry_id = %entry.id, project = %project, "project not a consumer anymore, stopped sharing");
        changes.revoked.push(project);
    }
    if entry.visibility != visibility {
        catalog.update_visibility(&entry.id, visibility)?;
        entry.visibility = visibility;
    }
    Ok(())
}
