//! Registry REST surface: paged JSON listings and manifest fetches.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SourceError;

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// One page of a listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct ApiPage {
    pub body: serde_json::Value,
    /// Target of the `Link: <...>; rel="next"` header, if present.
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Layer {
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub layers: Vec<Layer>,
}

pub trait RegistryApi {
    /// GET an absolute URL with extra query parameters.
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<ApiPage, SourceError>;

    /// Image manifest for `<repository>:<tag>`.
    fn manifest(&self, reference: &str) -> Result<Manifest, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub enum RegistryAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    /// Sent verbatim as the `Authorization` header.
    Token(String),
}

/// Harbor API v2.0 client.
#[derive(Debug, Clone)]
pub struct HarborApi {
    client: Client,
    registry_host: String,
    auth: RegistryAuth,
}

impl HarborApi {
    pub fn new(
        registry_host: &str,
        auth: RegistryAuth,
        verify_tls: bool,
        timeout: Option<Duration>,
    ) -> Result<Self, SourceError> {
        if matches!(auth, RegistryAuth::None) {
            warn!(registry = registry_host, "no authentication configured for registry");
        }
        let mut builder = Client::builder().danger_accept_invalid_certs(!verify_tls);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SourceError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            registry_host: registry_host.to_string(),
            auth,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            RegistryAuth::None => request,
            RegistryAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            RegistryAuth::Token(token) => request.header(AUTHORIZATION, token),
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::blocking::Response, SourceError> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|e| SourceError::ListingFailed {
                code: e.status().map_or(0, |s| s.as_u16()),
                reason: format!("request to {what} failed: {e}"),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::ListingFailed {
                code: status.as_u16(),
                reason: format!("registry API returned {status} for {what}"),
            });
        }
        Ok(response)
    }
}

impl RegistryApi for HarborApi {
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<ApiPage, SourceError> {
        debug!(url, ?query, "fetching registry page");
        let response = self.send(self.client.get(url).query(query), url)?;
        let link = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);
        let body = response.json().map_err(|e| SourceError::ListingFailed {
            code: 0,
            reason: format!("cannot decode response from {url}: {e}"),
        })?;
        Ok(ApiPage { body, link })
    }

    fn manifest(&self, reference: &str) -> Result<Manifest, SourceError> {
        let (repository, tag) = split_reference(reference);
        let url = format!("https://{}/v2/{repository}/manifests/{tag}", self.registry_host);
        let response = self.send(
            self.client.get(&url).header(ACCEPT, MANIFEST_ACCEPT),
            &url,
        )?;
        response.json().map_err(|e| SourceError::ListingFailed {
            code: 0,
            reason: format!("cannot decode manifest of {reference}: {e}"),
        })
    }
}

/// `project/repo:tag` -> (`project/repo`, `tag`); a missing tag means `latest`.
pub fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^>]*)>((?:\s*;\s*[^,;<]*)*)").expect("static link regex"))
}

fn rel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\brel\s*=\s*"?([^";,]*)"?"#).expect("static rel regex"))
}

/// Extract the `rel="next"` target from a `Link` header value.
pub fn parse_next_link(header: &str) -> Option<String> {
    link_re().captures_iter(header).find_map(|c| {
        let params = c.get(2).map_or("", |m| m.as_str());
        rel_re()
            .captures(params)
            .filter(|rel| rel[1].split_whitespace().any(|r| r == "next"))
            .map(|_| c[1].to_string())
    })
}
