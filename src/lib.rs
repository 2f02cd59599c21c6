//! Appliance image synchronization.
//!
//! Keeps an image catalog in step with upstream appliance sources
//! (marketplace image lists and OCI registries):
//!
//! - **Sources** - discover images and normalize them into [`Descriptor`]s
//! - **Cache** - fetch payloads and verify them against their content hash
//! - **Conversion** - unpack OVA containers and convert disk formats
//! - **Dispatch** - create, upload, replace and share catalog entries
//! - **Sync** - retire entries a source no longer publishes
//!
//! # Architecture
//!
//! ```text
//! Source (feed | registry)
//!     │  discover()
//!     ▼
//! Descriptor ──► ImageCache::fetch ──► FormatConverter
//!                                          │
//!                                          ▼
//!                        Dispatcher::dispatch / sync ──► Catalog
//! ```
//!
//! Every remote collaborator sits behind a trait ([`catalog::Catalog`],
//! [`source::registry::api::RegistryApi`], [`cache::transfer::Fetch`],
//! [`cache::transfer::Pull`], [`convert::ConversionTool`]) so the whole
//! pipeline runs against in-memory fakes in tests.

pub mod cache;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod convert;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod preflight;
pub mod runner;
pub mod source;

pub use cache::{FetchOutcome, ImageCache};
pub use catalog::{Catalog, CatalogEntry, Visibility};
pub use checksum::ContentHash;
pub use config::Config;
pub use descriptor::Descriptor;
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use error::{CatalogError, DispatchError, ImageError, SourceError};
pub use runner::{RunReport, Runner};
pub use source::{Source, SourceAdapter};
