//! One synchronization pass over every enabled source.
//!
//! Per source: discover, fetch and verify each subscribed image into the
//! cache, dispatch it to the catalog, then retire catalog entries the
//! source no longer lists. A failed listing skips the source entirely so a
//! broken upstream never retires entries.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::cache::{FetchOutcome, ImageCache};
use crate::descriptor::Descriptor;
use crate::dispatch::{
    DispatchOutcome, DispatchRequest, Dispatcher, SkipReason, SyncReport, PROP_IMAGE_LIST,
};
use crate::error::{DispatchError, ImageError};
use crate::source::SourceAdapter;

#[derive(Debug)]
pub struct ImageReport {
    pub identifier: String,
    pub outcome: Result<DispatchOutcome, DispatchError>,
}

impl ImageReport {
    pub fn failed(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Debug)]
pub struct SourceReport {
    pub name: String,
    /// Discovery or sync failure; discovery failures leave `images` empty.
    pub error: Option<String>,
    pub images: Vec<ImageReport>,
    pub sync: Option<SyncReport>,
}

impl SourceReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            error: None,
            images: Vec::new(),
            sync: None,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.error.is_some()
            || self.images.iter().any(ImageReport::failed)
            || self.sync.as_ref().is_some_and(|s| !s.failed.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.sources.iter().any(SourceReport::has_failures)
    }

    pub fn published(&self) -> usize {
        self.sources
            .iter()
            .flat_map(|s| &s.images)
            .filter(|i| matches!(i.outcome, Ok(DispatchOutcome::Published { .. })))
            .count()
    }
}

pub struct Runner<'a> {
    cache: ImageCache,
    dispatcher: Dispatcher<'a>,
    /// Catalog-wide name prefix, before the source's own.
    name_prefix: String,
}

impl<'a> Runner<'a> {
    pub fn new(cache: ImageCache, dispatcher: Dispatcher<'a>, name_prefix: impl Into<String>) -> Self {
        Self {
            cache: cache.with_variant_formats(dispatcher.formats()),
            dispatcher,
            name_prefix: name_prefix.into(),
        }
    }

    pub fn run(&self, sources: &[&dyn SourceAdapter]) -> RunReport {
        let mut report = RunReport::default();
        for source in sources {
            if !source.settings().enabled {
                debug!(source = %source.settings().name, "source disabled, skipping");
                continue;
            }
            report.sources.push(self.run_source(*source));
        }
        info!(
            sources = report.sources.len(),
            published = report.published(),
            failed = report.has_failures(),
            "run finished"
        );
        report
    }

    pub fn run_source(&self, source: &dyn SourceAdapter) -> SourceReport {
        let settings = source.settings();
        let mut report = SourceReport::new(&settings.name);

        let discovered = match source.discover() {
            Ok(images) => images,
            Err(e) => {
                error!(source = %settings.name, error = %e, "cannot list images, skipping source");
                report.error = Some(e.to_string());
                return report;
            }
        };

        let mut images = source.subscribed(&discovered);
        info!(
            source = %settings.name,
            discovered = discovered.len(),
            subscribed = images.len(),
            "syncing source"
        );
        for descriptor in &mut images {
            let outcome = self.process_image(source, descriptor);
            if let Err(e) = &outcome {
                error!(source = %settings.name, identifier = %descriptor.identifier, error = %e, "image failed");
            }
            report.images.push(ImageReport {
                identifier: descriptor.identifier.clone(),
                outcome,
            });
        }

        let valid: HashSet<String> = images
            .iter()
            .zip(&report.images)
            .filter(|(d, r)| keeps_entry(d, &r.outcome))
            .map(|(d, _)| d.identifier.clone())
            .collect();
        match self.dispatcher.sync(&settings.name, &valid) {
            Ok(sync) => {
                if !sync.failed.is_empty() {
                    warn!(source = %settings.name, failed = ?sync.failed, "some stale entries could not be retired");
                }
                report.sync = Some(sync);
            }
            Err(e) => {
                error!(source = %settings.name, error = %e, "sync failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }

    fn process_image(
        &self,
        source: &dyn SourceAdapter,
        descriptor: &mut Descriptor,
    ) -> Result<DispatchOutcome, DispatchError> {
        let _lock = self.cache.lock(&descriptor.identifier)?;
        match self.cache.fetch(descriptor, source)? {
            FetchOutcome::Expired => {
                info!(identifier = %descriptor.identifier, "image expired, not dispatching");
                return Ok(DispatchOutcome::Skipped(SkipReason::Expired));
            }
            outcome => debug!(identifier = %descriptor.identifier, ?outcome, "image ready"),
        }
        let request = self.request(source, descriptor);
        self.dispatcher.dispatch(descriptor, &request)
    }

    fn request(&self, source: &dyn SourceAdapter, descriptor: &Descriptor) -> DispatchRequest {
        let settings = source.settings();
        DispatchRequest {
            name: format!("{}{}{}", self.name_prefix, settings.prefix, descriptor.title),
            visibility: settings.visibility,
            consumers: settings.consumers.clone(),
            extra: BTreeMap::from([(PROP_IMAGE_LIST.to_string(), settings.name.clone())]),
        }
    }
}

/// Only expiry or bytes that failed verification retire an image's entry.
/// Anything else that stopped processing (a lock held by another writer, a
/// download error) leaves the entry for a later run to decide.
fn keeps_entry(descriptor: &Descriptor, outcome: &Result<DispatchOutcome, DispatchError>) -> bool {
    if descriptor.is_eligible() {
        return true;
    }
    !descriptor.is_expired()
        && !matches!(
            outcome,
            Err(DispatchError::Image(ImageError::VerificationFailed { .. }))
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Retrieve;
    use crate::catalog::testing::RecordingCatalog;
    use crate::catalog::{CatalogEntry, EntryStatus, Visibility};
    use crate::checksum::{hash_reader, Algorithm, ContentHash};
    use crate::convert::testing::FakeTool;
    use crate::descriptor::test_descriptor;
    use crate::dispatch::{DispatcherSettings, PROP_IDENTIFIER};
    use crate::error::SourceError;
    use crate::source::testing::settings;
    use crate::source::SourceSettings;
    use std::cell::Cell;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use time::macros::datetime;

    const TAG: &str = "atrope";

    struct StaticSource {
        settings: SourceSettings,
        images: Vec<Descriptor>,
        payloads: BTreeMap<String, Vec<u8>>,
        broken: bool,
        retrievals: Cell<usize>,
    }

    impl StaticSource {
        fn new(name: &str) -> Self {
            Self {
                settings: settings(name),
                images: Vec::new(),
                payloads: BTreeMap::new(),
                broken: false,
                retrievals: Cell::new(0),
            }
        }

        fn image(mut self, identifier: &str, payload: &[u8]) -> Self {
            let mut d = test_descriptor(identifier);
            d.verified = false;
            d.content_hash = Some(ContentHash::new(
                Algorithm::Sha256,
                hash_reader(Algorithm::Sha256, payload).unwrap(),
            ));
            self.images.push(d);
            self.payloads.insert(identifier.to_string(), payload.to_vec());
            self
        }
    }

    impl Retrieve for StaticSource {
        fn retrieve(&self, descriptor: &Descriptor, dest: &Path) -> Result<(), ImageError> {
            self.retrievals.set(self.retrievals.get() + 1);
            let payload = self
                .payloads
                .get(&descriptor.identifier)
                .ok_or_else(|| ImageError::DownloadFailed {
                    code: 404,
                    reason: format!("no payload for {}", descriptor.identifier),
                })?;
            fs::write(dest, payload)?;
            Ok(())
        }
    }

    impl SourceAdapter for StaticSource {
        fn settings(&self) -> &SourceSettings {
            &self.settings
        }
        fn endpoint(&self) -> String {
            "memory://".to_string()
        }
        fn discover(&self) -> Result<Vec<Descriptor>, SourceError> {
            if self.broken {
                return Err(SourceError::ListingFailed {
                    code: 503,
                    reason: "unavailable".to_string(),
                });
            }
            Ok(self.images.clone())
        }
    }

    fn dispatcher<'a>(catalog: &'a RecordingCatalog, tool: &'a FakeTool) -> Dispatcher<'a> {
        converting_dispatcher(catalog, tool, &[])
    }

    fn converting_dispatcher<'a>(
        catalog: &'a RecordingCatalog,
        tool: &'a FakeTool,
        formats: &[&str],
    ) -> Dispatcher<'a> {
        Dispatcher::new(
            catalog,
            tool,
            DispatcherSettings {
                tag: TAG.to_string(),
                formats: formats.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    fn managed_entry(id: &str, identifier: &str, list: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: identifier.to_string(),
            status: EntryStatus::Active,
            visibility: Visibility::Private,
            owner: Some("publisher".to_string()),
            tags: vec![TAG.to_string()],
            properties: BTreeMap::from([
                (PROP_IDENTIFIER.to_string(), identifier.to_string()),
                (PROP_IMAGE_LIST.to_string(), list.to_string()),
            ]),
        }
    }

    #[test]
    fn publishes_images_with_prefixed_names() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "[site] ");
        let mut source = StaticSource::new("vo").image("a", b"alpha").image("b", b"beta");
        source.settings.prefix = "VO: ".to_string();

        let report = runner.run(&[&source]);
        assert!(!report.has_failures());
        assert_eq!(report.published(), 2);

        let names: Vec<_> = catalog.created().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["[site] VO: a title", "[site] VO: b title"]);
        assert!(catalog
            .entries()
            .iter()
            .all(|e| e.property(PROP_IMAGE_LIST) == Some("vo")));
    }

    #[test]
    fn listing_failure_skips_sync() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("old-1", "gone", "vo"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo");
        source.broken = true;

        let report = runner.run(&[&source]);
        assert!(report.has_failures());
        assert!(report.sources[0].sync.is_none());
        assert!(catalog.mutating_calls().is_empty());
        assert_eq!(catalog.entries().len(), 1);
    }

    #[test]
    fn dropped_images_are_retired_per_list() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("old-1", "gone", "vo"));
        catalog.insert(managed_entry("other-1", "gone", "other-list"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let source = StaticSource::new("vo").image("a", b"alpha");

        let report = runner.run(&[&source]);
        let sync = report.sources[0].sync.as_ref().unwrap();
        assert_eq!(sync.deleted, ["old-1"]);
        assert!(catalog.entries().iter().any(|e| e.id == "other-1"));
    }

    #[test]
    fn verification_failure_does_not_stop_siblings() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo").image("bad", b"expected").image("good", b"fine");
        source.payloads.insert("bad".to_string(), b"tampered".to_vec());

        let report = runner.run(&[&source]);
        let images = &report.sources[0].images;
        assert!(matches!(
            images[0].outcome,
            Err(DispatchError::Image(ImageError::VerificationFailed { .. }))
        ));
        assert!(matches!(images[1].outcome, Ok(DispatchOutcome::Published { .. })));
        assert!(report.has_failures());
        // one download each; a fresh download is not retried
        assert_eq!(source.retrievals.get(), 2);
    }

    #[test]
    fn expired_images_are_neither_fetched_nor_kept() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("old-1", "a", "vo"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo").image("a", b"alpha");
        source.images[0].expires_at = Some(datetime!(2001-01-01 00:00 UTC));

        let report = runner.run(&[&source]);
        assert_eq!(source.retrievals.get(), 0);
        assert!(matches!(
            report.sources[0].images[0].outcome,
            Ok(DispatchOutcome::Skipped(SkipReason::Expired))
        ));
        assert_eq!(report.sources[0].sync.as_ref().unwrap().deleted, ["old-1"]);
    }

    #[test]
    fn disabled_sources_are_not_run() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo").image("a", b"alpha");
        source.settings.enabled = false;

        let report = runner.run(&[&source]);
        assert!(report.sources.is_empty());
        assert!(catalog.calls().is_empty());
    }

    #[test]
    fn refetched_image_is_converted_again() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), b"OLD").unwrap();
        fs::write(tmp.path().join("a.vmdk"), b"vmdk:OLD").unwrap();
        let catalog = RecordingCatalog::default();
        let tool = FakeTool::default();
        let runner = Runner::new(
            ImageCache::open(tmp.path()).unwrap(),
            converting_dispatcher(&catalog, &tool, &["vmdk"]),
            "",
        );
        let source = StaticSource::new("vo").image("a", b"NEW");

        let report = runner.run(&[&source]);
        assert!(!report.has_failures(), "{report:?}");
        assert_eq!(source.retrievals.get(), 1);
        assert_eq!(tool.calls.borrow().len(), 1);
        let uploads = catalog.state.borrow().uploads.clone();
        assert_eq!(uploads.values().collect::<Vec<_>>(), [b"vmdk:NEW"]);
        assert_eq!(fs::read(tmp.path().join("a.vmdk")).unwrap(), b"vmdk:NEW");
    }

    #[test]
    fn locked_image_keeps_its_catalog_entry() {
        let tmp = TempDir::new().unwrap();
        let other_writer = ImageCache::open(tmp.path()).unwrap();
        let _held = other_writer.lock("a").unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("live", "a", "vo"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let source = StaticSource::new("vo").image("a", b"alpha");

        let report = runner.run(&[&source]);
        assert!(matches!(
            report.sources[0].images[0].outcome,
            Err(DispatchError::Image(ImageError::Locked { .. }))
        ));
        assert_eq!(source.retrievals.get(), 0);
        assert!(report.sources[0].sync.as_ref().unwrap().deleted.is_empty());
        assert!(catalog.entries().iter().any(|e| e.id == "live"));
    }

    #[test]
    fn download_failure_keeps_its_catalog_entry() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("live", "a", "vo"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo").image("a", b"alpha");
        source.payloads.clear();

        let report = runner.run(&[&source]);
        assert!(matches!(
            report.sources[0].images[0].outcome,
            Err(DispatchError::Image(ImageError::DownloadFailed { code: 404, .. }))
        ));
        assert!(report.sources[0].sync.as_ref().unwrap().deleted.is_empty());
    }

    #[test]
    fn verification_failure_retires_the_entry() {
        let tmp = TempDir::new().unwrap();
        let catalog = RecordingCatalog::default();
        catalog.insert(managed_entry("stale", "bad", "vo"));
        let tool = FakeTool::default();
        let runner = Runner::new(ImageCache::open(tmp.path()).unwrap(), dispatcher(&catalog, &tool), "");
        let mut source = StaticSource::new("vo").image("bad", b"expected");
        source.payloads.insert("bad".to_string(), b"tampered".to_vec());

        let report = runner.run(&[&source]);
        assert_eq!(report.sources[0].sync.as_ref().unwrap().deleted, ["stale"]);
    }
}
