//! Configuration file.
//!
//! ```toml
//! [cache]
//! directory = "/var/cache/appliance-sync"
//!
//! [catalog]
//! endpoint = "https://image.example.org:9292"
//! token = "..."
//! formats = ["qcow2"]
//! consumer_map = "/etc/appliance-sync/consumers.toml"
//!
//! [[sources]]
//! kind = "feed"
//! name = "egi"
//! url = "https://appdb.example.org/imagelist.json"
//! consumers = ["vo.example.org"]
//!
//! [[sources]]
//! kind = "registry"
//! name = "harbor"
//! api_url = "https://harbor.example.org/api/v2.0"
//! project = "egi_vm_images"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::catalog::Visibility;
use crate::dispatch::ConsumerMap;

pub const DEFAULT_TAG: &str = "atrope";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub directory: Option<PathBuf>,
}

impl CacheConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("appliance-sync")
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    pub endpoint: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub project_tokens: BTreeMap<String, String>,
    pub consumer_map: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub timeout: Option<u64>,
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Settings every source kind shares.
///
/// Flattened into [`SourceConfig`], so unknown keys are tolerated.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonSourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub subscribed_images: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub consumers: Vec<String>,
}

/// One `[[sources]]` entry: the shared settings plus the kind-specific ones.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub common: CommonSourceConfig,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    Feed {
        /// http(s) URL or local path of the image list.
        url: String,
    },
    Registry {
        api_url: String,
        registry_host: Option<String>,
        project: String,
        tag_pattern: Option<String>,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
        #[serde(default = "default_true")]
        verify_tls: bool,
        #[serde(default = "default_page_size")]
        page_size: u32,
    },
}

impl SourceConfig {
    pub fn is_registry(&self) -> bool {
        matches!(self.kind, SourceKind::Registry { .. })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsumerToml {
    project_id: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.catalog.endpoint.trim().is_empty() {
            bail!("catalog endpoint is empty");
        }
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            let name = &source.common.name;
            if name.trim().is_empty() {
                bail!("every source needs a name");
            }
            if !seen.insert(name.as_str()) {
                bail!("source name '{name}' is used twice");
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.common.enabled)
    }

    /// Group -> project map, empty when no file is configured.
    pub fn consumer_map(&self) -> Result<ConsumerMap> {
        match &self.catalog.consumer_map {
            Some(path) => load_consumer_map(path),
            None => Ok(ConsumerMap::new()),
        }
    }
}

pub fn load_consumer_map(path: &Path) -> Result<ConsumerMap> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading consumer map '{}'", path.display()))?;
    parse_consumer_map(&text).with_context(|| format!("parsing consumer map '{}'", path.display()))
}

pub fn parse_consumer_map(text: &str) -> Result<ConsumerMap> {
    let raw: BTreeMap<String, ConsumerToml> = toml::from_str(text)?;
    Ok(raw
        .into_iter()
        .filter_map(|(group, entry)| {
            if entry.project_id.trim().is_empty() {
                warn!(group = %group, "consumer without project_id, ignoring");
                return None;
            }
            Some((group, entry.project_id))
        })
        .collect())
}
