//! Client for the external identity authority.
//!
//! Speaks the Mojang-compatible profile API:
//!
//! | Lookup        | Request                                          | Reply                         |
//! |---------------|--------------------------------------------------|-------------------------------|
//! | name -> uuid  | `POST {base}/profiles/minecraft` `["name", ...]` | `[{"id", "name"}]`            |
//! | uuid -> name  | `GET {base}/user/profiles/{uuid}/names`          | `[{"name", "changedToAt"?}]`  |
//!
//! Name history is ordered oldest first; the last entry is the current name.

use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::RollcallError;
use serde::Deserialize;
use uuid::Uuid;

/// Errors that can occur while talking to the authority.
#[derive(Debug, thiserror::Error)]
pub enum ExternalLookupError {
    /// The request could not be sent or the reply not received.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The authority answered with a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The reply was not the expected JSON.
    #[error("Failed to parse authority reply: {0}")]
    ParseError(String),
}

impl From<ExternalLookupError> for RollcallError {
    fn from(err: ExternalLookupError) -> Self {
        RollcallError::external_lookup(err.to_string())
    }
}

/// Slow, authoritative source of name <-> uuid associations.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Current uuid and correctly-cased name for `name`, matched case-insensitively.
    async fn lookup_uuid(&self, name: &str) -> Result<Option<(Uuid, String)>, ExternalLookupError>;

    /// Current name of `uuid`.
    async fn lookup_name(&self, uuid: &Uuid) -> Result<Option<String>, ExternalLookupError>;
}

#[derive(Debug, Deserialize)]
struct ProfileReply {
    id: String,
    name: String,
}

// `changedToAt` is ignored; entries are already in order.
#[derive(Debug, Deserialize)]
struct NameHistoryEntry {
    name: String,
}

/// HTTP implementation of [`IdentityAuthority`].
pub struct MojangAuthority {
    http_client: reqwest::Client,
    base_url: String,
}

impl MojangAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExternalLookupError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rollcall/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExternalLookupError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityAuthority for MojangAuthority {
    async fn lookup_uuid(&self, name: &str) -> Result<Option<(Uuid, String)>, ExternalLookupError> {
        let url = format!("{}/profiles/minecraft", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&[name])
            .send()
            .await
            .map_err(|e| ExternalLookupError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ExternalLookupError::HttpError(status.as_u16()));
        }

        let profiles: Vec<ProfileReply> = response
            .json()
            .await
            .map_err(|e| ExternalLookupError::ParseError(e.to_string()))?;

        let Some(profile) = profiles
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        else {
            return Ok(None);
        };

        let uuid = Uuid::parse_str(&profile.id)
            .map_err(|e| ExternalLookupError::ParseError(format!("profile id {}: {e}", profile.id)))?;
        Ok(Some((uuid, profile.name)))
    }

    async fn lookup_name(&self, uuid: &Uuid) -> Result<Option<String>, ExternalLookupError> {
        let url = format!("{}/user/profiles/{}/names", self.base_url, uuid.simple());
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExternalLookupError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ExternalLookupError::HttpError(status.as_u16()));
        }

        let history: Vec<NameHistoryEntry> = response
            .json()
            .await
            .map_err(|e| ExternalLookupError::ParseError(e.to_string()))?;

        Ok(history.into_iter().last().map(|entry| entry.name))
    }
}
