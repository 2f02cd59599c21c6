//! Upstream image sources.
//!
//! Every source kind implements [`SourceAdapter`]: it discovers descriptors
//! and knows how to retrieve their bytes. [`Source`] picks the concrete
//! adapter from a `[[sources]]` config entry.

pub mod feed;
pub mod registry;

use std::time::Duration;

use serde_json::{Map, Value};

use self::feed::FeedSource;
use self::registry::api::{HarborApi, RegistryAuth};
use self::registry::RegistrySource;
use crate::cache::transfer::{HttpFetcher, OrasPuller, RegistryLogin};
use crate::cache::Retrieve;
use crate::catalog::Visibility;
use crate::config::{CommonSourceConfig, SourceConfig, SourceKind};
use crate::descriptor::Descriptor;
use crate::error::SourceError;

/// Settings shared by every source kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub name: String,
    pub enabled: bool,
    /// Identifiers (or digests, for registries) to sync; empty means all.
    pub subscribed_images: Vec<String>,
    /// Prepended to the title when naming catalog entries.
    pub prefix: String,
    pub visibility: Visibility,
    /// Consumer groups, resolved to projects through the consumer map.
    pub consumers: Vec<String>,
}

impl From<&CommonSourceConfig> for SourceSettings {
    fn from(common: &CommonSourceConfig) -> Self {
        Self {
            name: common.name.clone(),
            enabled: common.enabled,
            subscribed_images: common.subscribed_images.clone(),
            prefix: common.prefix.clone(),
            visibility: common.visibility,
            consumers: common.consumers.clone(),
        }
    }
}

pub trait SourceAdapter: Retrieve {
    fn settings(&self) -> &SourceSettings;

    /// Where the source lists its images.
    fn endpoint(&self) -> String;

    /// List every image currently published by the source.
    fn discover(&self) -> Result<Vec<Descriptor>, SourceError>;

    /// The images this site is subscribed to.
    fn subscribed(&self, images: &[Descriptor]) -> Vec<Descriptor> {
        let wanted = &self.settings().subscribed_images;
        if wanted.is_empty() {
            return images.to_vec();
        }
        images
            .iter()
            .filter(|d| wanted.contains(&d.identifier))
            .cloned()
            .collect()
    }

    /// Summary used by `list`.
    fn describe(&self) -> Map<String, Value> {
        let settings = self.settings();
        let mut map = Map::new();
        map.insert("name".into(), settings.name.clone().into());
        map.insert("url".into(), self.endpoint().into());
        map.insert("enabled".into(), settings.enabled.into());
        let subscribed = if settings.subscribed_images.is_empty() {
            Value::from("All")
        } else {
            Value::from(settings.subscribed_images.clone())
        };
        map.insert("subscribed".into(), subscribed);
        map
    }
}

pub enum Source {
    Feed(FeedSource),
    Registry(RegistrySource),
}

impl Source {
    pub fn from_config(config: &SourceConfig, timeout: Option<Duration>) -> Result<Self, SourceError> {
        let settings = SourceSettings::from(&config.common);
        match &config.kind {
            SourceKind::Feed { url } => {
                let fetcher = HttpFetcher::new(timeout).map_err(|e| {
                    SourceError::InvalidConfig(format!("source '{}': {e}", settings.name))
                })?;
                Ok(Source::Feed(FeedSource::new(settings, url, Box::new(fetcher))?))
            }
            SourceKind::Registry {
                api_url,
                registry_host,
                project,
                tag_pattern,
                username,
                password,
                token,
                verify_tls,
                page_size,
            } => {
                let auth = match (username, password, token) {
                    (Some(username), Some(password), _) => RegistryAuth::Basic {
                        username: username.clone(),
                        password: password.clone(),
                    },
                    (_, _, Some(token)) => RegistryAuth::Token(token.clone()),
                    _ => RegistryAuth::None,
                };
                let host = match registry_host {
                    Some(host) => host.clone(),
                    None => url::Url::parse(api_url)
                        .ok()
                        .as_ref()
                        .and_then(registry::host_of)
                        .unwrap_or_default(),
                };
                let api = HarborApi::new(&host, auth, *verify_tls, timeout)?;
                let puller = OrasPuller::new(RegistryLogin {
                    username: username.clone(),
                    password: password.clone(),
                    insecure: !verify_tls,
                });
                let source = RegistrySource::new(
                    settings,
                    api_url,
                    registry_host.as_deref(),
                    project,
                    tag_pattern.as_deref(),
                    *page_size,
                    Box::new(api),
                    Box::new(puller),
                )?;
                Ok(Source::Registry(source))
            }
        }
    }

    pub fn adapter(&self) -> &dyn SourceAdapter {
        match self {
            Source::Feed(s) => s,
            Source::Registry(s) => s,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::settings;
    use super::*;
    use crate::descriptor::test_descriptor;

    struct Listed(SourceSettings);

    impl Retrieve for Listed {
        fn retrieve(&self, _: &Descriptor, _: &std::path::Path) -> Result<(), crate::error::ImageError> {
            Ok(())
        }
    }

    impl SourceAdapter for Listed {
        fn settings(&self) -> &SourceSettings {
            &self.0
        }
        fn endpoint(&self) -> String {
            "file:///list.json".to_string()
        }
        fn discover(&self) -> Result<Vec<Descriptor>, SourceError> {
            Ok(vec![test_descriptor("a"), test_descriptor("b")])
        }
    }

    #[test]
    fn empty_subscription_keeps_everything() {
        let source = Listed(settings("s"));
        let images = source.discover().unwrap();
        assert_eq!(source.subscribed(&images).len(), 2);
    }

    #[test]
    fn subscription_filters_by_identifier() {
        let mut s = settings("s");
        s.subscribed_images = vec!["b".to_string(), "missing".to_string()];
        let source = Listed(s);
        let images = source.discover().unwrap();
        let kept: Vec<_> = source
            .subscribed(&images)
            .into_iter()
            .map(|d| d.identifier)
            .collect();
        assert_eq!(kept, ["b"]);
    }

    #[test]
    fn describe_reports_all_when_unsubscribed() {
        let map = Listed(settings("s")).describe();
        assert_eq!(map["subscribed"], "All");
        assert_eq!(map["url"], "file:///list.json");
    }

    #[test]
    fn registry_config_without_project_is_rejected() {
        let config: SourceConfig = toml::from_str(
            r#"
kind = "registry"
name = "harbor"
api_url = "https://harbor.example.org/api/v2.0"
project = ""
"#,
        )
        .unwrap();
        let err = Source::from_config(&config, None).err().unwrap();
        assert!(matches!(err, SourceError::InvalidConfig(_)), "{err}");
    }
}
