//! OpenStack Image service (v2) binding.
//!
//! Session construction is left to the operator: requests carry a
//! pre-issued token. Accepting a membership grant has to be done as the
//! consumer project, so per-project tokens are looked up separately.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use super::{Catalog, CatalogEntry, EntryStatus, Member, MemberStatus, NewEntry, Visibility};
use crate::error::CatalogError;

const TOKEN_HEADER: &str = "X-Auth-Token";
const JSON_PATCH: &str = "application/openstack-images-v2.1-json-patch";

/// Fields of an image record that are not custom properties.
const CORE_FIELDS: &[&str] = &[
    "id",
    "name",
    "status",
    "visibility",
    "owner",
    "tags",
    "checksum",
    "created_at",
    "updated_at",
    "file",
    "schema",
    "self",
    "size",
    "virtual_size",
    "min_disk",
    "min_ram",
    "protected",
    "os_hidden",
    "os_hash_algo",
    "os_hash_value",
    "locations",
    "direct_url",
];

pub trait TokenSource {
    /// Token scoped to the publishing project.
    fn token(&self) -> Result<String, CatalogError>;
    /// Token scoped to `project_id`, used to accept grants.
    fn project_token(&self, project_id: &str) -> Result<String, CatalogError>;
}

/// Tokens read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    pub token: String,
    pub project_tokens: BTreeMap<String, String>,
}

impl TokenSource for StaticTokens {
    fn token(&self) -> Result<String, CatalogError> {
        if self.token.is_empty() {
            return Err(CatalogError::Forbidden("no catalog token configured".to_string()));
        }
        Ok(self.token.clone())
    }

    fn project_token(&self, project_id: &str) -> Result<String, CatalogError> {
        self.project_tokens.get(project_id).cloned().ok_or_else(|| {
            CatalogError::Forbidden(format!("no token configured for project '{project_id}'"))
        })
    }
}

pub struct GlanceCatalog {
    client: Client,
    endpoint: Url,
    tokens: Box<dyn TokenSource>,
}

impl GlanceCatalog {
    pub fn new(
        endpoint: &str,
        tokens: Box<dyn TokenSource>,
        timeout: Option<Duration>,
    ) -> Result<Self, CatalogError> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| CatalogError::Transport(format!("invalid endpoint '{endpoint}': {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            tokens,
        })
    }

    fn url(&self, path: &str) -> Result<Url, CatalogError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| CatalogError::Transport(format!("invalid path '{path}': {e}")))
    }

    fn send(&self, request: RequestBuilder, token: &str) -> Result<Response, CatalogError> {
        let response = request
            .header(TOKEN_HEADER, token)
            .send()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().unwrap_or_default();
        Err(match status {
            StatusCode::FORBIDDEN => CatalogError::Forbidden(message),
            StatusCode::CONFLICT => CatalogError::Conflict(message),
            StatusCode::NOT_FOUND => CatalogError::NotFound(message),
            other => CatalogError::Http {
                status: other.as_u16(),
                message,
            },
        })
    }

    fn call(&self, request: RequestBuilder) -> Result<Response, CatalogError> {
        let token = self.tokens.token()?;
        self.send(request, &token)
    }

    fn json(response: Response) -> Result<Value, CatalogError> {
        response
            .json()
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }

    fn patch(&self, id: &str, ops: Value) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}"))?;
        let body = serde_json::to_vec(&ops).map_err(|e| CatalogError::Decode(e.to_string()))?;
        self.call(
            self.client
                .patch(url)
                .header(CONTENT_TYPE, JSON_PATCH)
                .body(body),
        )?;
        Ok(())
    }
}

/// Decode one image record of the listing or create response.
pub fn parse_entry(value: &Value) -> Result<CatalogEntry, CatalogError> {
    let image = value
        .as_object()
        .ok_or_else(|| CatalogError::Decode("image record is not an object".to_string()))?;
    let text = |key: &str| image.get(key).and_then(Value::as_str).unwrap_or_default();
    let id = text("id");
    if id.is_empty() {
        return Err(CatalogError::Decode("image record without id".to_string()));
    }

    let properties = image
        .iter()
        .filter(|(k, _)| !CORE_FIELDS.contains(&k.as_str()))
        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
        .collect();
    Ok(CatalogEntry {
        id: id.to_string(),
        name: text("name").to_string(),
        status: EntryStatus::parse(text("status")),
        visibility: text("visibility").parse().unwrap_or_default(),
        owner: image
            .get("owner")
            .and_then(Value::as_str)
            .map(str::to_string),
        tags: image
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        properties,
    })
}

fn create_body(entry: &NewEntry) -> Value {
    let mut body = Map::new();
    for (key, value) in &entry.properties {
        body.insert(key.clone(), Value::String(value.clone()));
    }
    body.insert("name".into(), entry.name.clone().into());
    body.insert("visibility".into(), entry.visibility.as_str().into());
    body.insert("disk_format".into(), entry.disk_format.clone().into());
    body.insert("container_format".into(), entry.container_format.clone().into());
    body.insert("tags".into(), entry.tags.clone().into());
    Value::Object(body)
}

impl Catalog for GlanceCatalog {
    fn list_entries(&self, tag: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut entries = Vec::new();
        let mut next = Some(format!("v2/images?tag={}", urlencode(tag)));
        while let Some(path) = next.take() {
            let url = self.url(&path)?;
            debug!(%url, "listing catalog entries");
            let body = Self::json(self.call(self.client.get(url))?)?;
            for image in body
                .get("images")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                entries.push(parse_entry(image)?);
            }
            next = body
                .get("next")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(entries)
    }

    fn create_entry(&self, entry: &NewEntry) -> Result<CatalogEntry, CatalogError> {
        let url = self.url("v2/images")?;
        let response = self.call(self.client.post(url).json(&create_body(entry)))?;
        parse_entry(&Self::json(response)?)
    }

    fn upload(&self, id: &str, data: Box<dyn Read + Send>) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}/file"))?;
        self.call(
            self.client
                .put(url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(Body::new(data)),
        )?;
        Ok(())
    }

    fn update_visibility(&self, id: &str, visibility: Visibility) -> Result<(), CatalogError> {
        self.patch(
            id,
            json!([{"op": "replace", "path": "/visibility", "value": visibility.as_str()}]),
        )
    }

    fn delete_entry(&self, id: &str) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}"))?;
        self.call(self.client.delete(url))?;
        Ok(())
    }

    fn deactivate_entry(&self, id: &str) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}/actions/deactivate"))?;
        self.call(self.client.post(url))?;
        Ok(())
    }

    fn list_members(&self, id: &str) -> Result<Vec<Member>, CatalogError> {
        let url = self.url(&format!("v2/images/{id}/members"))?;
        let body = Self::json(self.call(self.client.get(url))?)?;
        Ok(body
            .get("members")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|m| {
                let project_id = m.get("member_id")?.as_str()?.to_string();
                let status = MemberStatus::parse(m.get("status")?.as_str()?);
                Some(Member { project_id, status })
            })
            .collect())
    }

    fn add_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}/members"))?;
        self.call(self.client.post(url).json(&json!({ "member": project_id })))?;
        Ok(())
    }

    fn accept_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}/members/{project_id}"))?;
        let token = self.tokens.project_token(project_id)?;
        self.send(
            self.client.put(url).json(&json!({ "status": "accepted" })),
            &token,
        )?;
        Ok(())
    }

    fn remove_member(&self, id: &str, project_id: &str) -> Result<(), CatalogError> {
        let url = self.url(&format!("v2/images/{id}/members/{project_id}"))?;
        self.call(self.client.delete(url))?;
        Ok(())
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
