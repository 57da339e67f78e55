//! Legacy → Firebase identity mapping
//!
//! The data migrator never invents an identity: every legacy id is resolved
//! through an [`IdentityMapper`], either a prepared offline mapping
//! ([`StaticMapping`]) or the identity provider's lookup endpoint
//! ([`HttpLookup`]).

use async_trait::async_trait;
use clm_common::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Why a single legacy id could not be resolved
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("no mapping for legacy id '{0}'")]
    NotFound(String),

    #[error("mapping for legacy id '{0}' is empty")]
    EmptyUid(String),

    #[error("identity provider error: {0}")]
    Provider(String),
}

/// Resolves a legacy identity token into its Firebase uid
#[async_trait]
pub trait IdentityMapper: Send + Sync {
    async fn resolve(&self, legacy_id: &str) -> std::result::Result<String, MappingError>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Prepared offline mapping
#[derive(Debug, Clone, Default)]
pub struct StaticMapping {
    entries: HashMap<String, String>,
}

impl StaticMapping {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a mapping file.
    ///
    /// `.json` files hold an object `{ "<clerk id>": "<firebase uid>" }`;
    /// anything else is read as two-column CSV (`clerk_user_id,firebase_uid`)
    /// with an optional header row.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Mapping(format!("cannot read {}: {}", path.display(), e)))?;

        let mapping = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content)?,
            _ => Self::from_csv_str(&content)?,
        };

        info!("Loaded {} identity mapping(s) from {}", mapping.len(), path.display());
        Ok(mapping)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let entries: HashMap<String, String> = serde_json::from_str(content)
            .map_err(|e| Error::Mapping(format!("invalid JSON mapping: {}", e)))?;
        Ok(Self::new(entries))
    }

    pub fn from_csv_str(content: &str) -> Result<Self> {
        let mut entries = HashMap::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((legacy, uid)) = line.split_once(',') else {
                return Err(Error::Mapping(format!(
                    "line {}: expected 'clerk_user_id,firebase_uid'",
                    line_no + 1
                )));
            };
            let (legacy, uid) = (legacy.trim(), uid.trim());

            if line_no == 0 && legacy.eq_ignore_ascii_case("clerk_user_id") {
                continue;
            }
            if entries.insert(legacy.to_string(), uid.to_string()).is_some() {
                return Err(Error::Mapping(format!(
                    "line {}: legacy id '{}' mapped twice",
                    line_no + 1,
                    legacy
                )));
            }
        }

        Ok(Self::new(entries))
    }
}

#[async_trait]
impl IdentityMapper for StaticMapping {
    async fn resolve(&self, legacy_id: &str) -> std::result::Result<String, MappingError> {
        match self.entries.get(legacy_id) {
            Some(uid) if uid.trim().is_empty() => Err(MappingError::EmptyUid(legacy_id.to_string())),
            Some(uid) => Ok(uid.clone()),
            None => Err(MappingError::NotFound(legacy_id.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("static mapping ({} entries)", self.entries.len())
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    firebase_uid: Option<String>,
}

/// Identity provider lookup: `GET {base_url}/{legacy_id}` → `{"firebase_uid": "..."}`
pub struct HttpLookup {
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("clm-identity/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Mapping(e.to_string()))?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| Error::Config(format!("invalid lookup URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("lookup URL '{}' cannot carry a path", base_url)));
        }

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Lookup URL with `legacy_id` appended as a single percent-encoded segment
    pub fn lookup_url(&self, legacy_id: &str) -> std::result::Result<Url, MappingError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MappingError::Provider(format!("lookup URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(legacy_id);
        Ok(url)
    }
}

#[async_trait]
impl IdentityMapper for HttpLookup {
    async fn resolve(&self, legacy_id: &str) -> std::result::Result<String, MappingError> {
        let url = self.lookup_url(legacy_id)?;
        debug!(legacy_id = %legacy_id, url = %url, "Querying identity provider");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| MappingError::Provider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MappingError::NotFound(legacy_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MappingError::Provider(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| MappingError::Provider(format!("unreadable response: {}", e)))?;

        match body.firebase_uid {
            Some(uid) if !uid.trim().is_empty() => Ok(uid),
            _ => Err(MappingError::EmptyUid(legacy_id.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("identity provider at {}", self.base_url.as_str().trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_mapping_resolution() {
        let mapping = StaticMapping::new(HashMap::from([
            ("user_1".to_string(), "fb_1".to_string()),
            ("user_2".to_string(), "  ".to_string()),
        ]));

        assert_eq!(mapping.resolve("user_1").await, Ok("fb_1".to_string()));
        assert_eq!(
            mapping.resolve("user_2").await,
            Err(MappingError::EmptyUid("user_2".to_string()))
        );
        assert_eq!(
            mapping.resolve("user_3").await,
            Err(MappingError::NotFound("user_3".to_string()))
        );
    }

    #[test]
    fn test_csv_with_header_and_comments() {
        let mapping = StaticMapping::from_csv_str(
            "clerk_user_id,firebase_uid\n# exported 2024-09-01\nuser_1, fb_1\n\nuser_2,fb_2\n",
        )
        .unwrap();
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_csv_rejects_malformed_and_repeated_rows() {
        assert!(matches!(
            StaticMapping::from_csv_str("user_1 fb_1"),
            Err(Error::Mapping(_))
        ));
        assert!(matches!(
            StaticMapping::from_csv_str("user_1,fb_1\nuser_1,fb_2"),
            Err(Error::Mapping(_))
        ));
    }

    #[test]
    fn test_json_mapping_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, r#"{"user_1": "fb_1", "user_2": "fb_2"}"#).unwrap();

        let mapping = StaticMapping::from_path(&path).unwrap();
        assert_eq!(mapping.len(), 2);
        assert!(StaticMapping::from_path(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_http_lookup_trims_base_url() {
        let lookup = HttpLookup::new("http://127.0.0.1:9/users/").unwrap();
        assert_eq!(lookup.describe(), "identity provider at http://127.0.0.1:9/users");
    }

    #[test]
    fn test_http_lookup_encodes_legacy_id() {
        let lookup = HttpLookup::new("https://idp.example.com/v1/lookup/").unwrap();
        assert_eq!(
            lookup.lookup_url("user_1").unwrap().as_str(),
            "https://idp.example.com/v1/lookup/user_1"
        );
        // reserved characters stay inside the one path segment
        assert_eq!(
            lookup.lookup_url("a/b?c#d").unwrap().as_str(),
            "https://idp.example.com/v1/lookup/a%2Fb%3Fc%23d"
        );

        assert!(HttpLookup::new("not a url").is_err());
        assert!(HttpLookup::new("mailto:ops@example.com").is_err());
    }
}
