//! Credentials for the image API.
//!
//! Either a static API key, or a service account key that is signed into a
//! PS256 JWT and exchanged for a short-lived IAM token. IAM tokens are cached
//! until shortly before they expire.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Refresh IAM tokens this long before their reported expiry.
const REFRESH_MARGIN_MINUTES: i64 = 5;
/// Lifetime of the signed JWT presented to the IAM endpoint.
const JWT_LIFETIME_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Failed to read service account key: {0}")]
    KeyFile(String),

    #[error("Failed to sign token request: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("Token exchange failed: {0}")]
    Exchange(String),
}

/// Authorization attached to image API requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    IamToken(String),
    None,
}

impl Credentials {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::ApiKey(key) => request.header("Authorization", format!("Api-Key {}", key)),
            Credentials::IamToken(token) => request.bearer_auth(token),
            Credentials::None => request,
        }
    }
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Credentials valid for at least the next few minutes.
    async fn credentials(&self) -> Result<Credentials, CredentialsError>;
}

pub struct StaticApiKey(String);

impl StaticApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

#[async_trait]
impl CredentialsProvider for StaticApiKey {
    async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Ok(Credentials::ApiKey(self.0.clone()))
    }
}

/// For providers that need no authorization (mock, local gateways).
pub struct NoCredentials;

#[async_trait]
impl CredentialsProvider for NoCredentials {
    async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Ok(Credentials::None)
    }
}

/// Authorized key JSON as downloaded from the cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub id: String,
    pub service_account_id: String,
    pub private_key: String,
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, CredentialsError> {
        let mut key: ServiceAccountKey =
            serde_json::from_str(json).map_err(|e| CredentialsError::KeyFile(e.to_string()))?;
        key.private_key = strip_pem_preamble(&key.private_key).to_string();
        Ok(key)
    }

    pub async fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CredentialsError::KeyFile(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

/// Console-issued keys prefix the PEM with a warning line.
fn strip_pem_preamble(pem: &str) -> &str {
    pem.find("-----BEGIN").map(|start| &pem[start..]).unwrap_or(pem)
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize)]
struct IamTokenRequest<'a> {
    jwt: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamTokenResponse {
    iam_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

pub struct ServiceAccountCredentials {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    iam_url: String,
    client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountCredentials {
    pub fn new(key: ServiceAccountKey, iam_url: impl Into<String>) -> Result<Self, CredentialsError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| CredentialsError::Exchange(e.to_string()))?;

        Ok(Self {
            key,
            encoding_key,
            iam_url: iam_url.into(),
            client,
            cached: Mutex::new(None),
        })
    }

    fn signed_jwt(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let claims = JwtClaims {
            iss: &self.key.service_account_id,
            aud: &self.iam_url,
            iat: now.timestamp(),
            exp: now.timestamp() + JWT_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::PS256);
        header.kid = Some(self.key.id.clone());

        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<CachedToken, CredentialsError> {
        let jwt = self.signed_jwt(now)?;
        let response = self
            .client
            .post(&self.iam_url)
            .json(&IamTokenRequest { jwt: &jwt })
            .send()
            .await
            .map_err(|e| CredentialsError::Exchange(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialsError::Exchange(format!("IAM returned {}: {}", status, body)));
        }

        let body: IamTokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialsError::Exchange(e.to_string()))?;

        let expires_at = body
            .expires_at
            .unwrap_or_else(|| now + ChronoDuration::hours(1));

        tracing::info!(
            service_account_id = %self.key.service_account_id,
            %expires_at,
            "Obtained IAM token"
        );

        Ok(CachedToken {
            token: body.iam_token,
            refresh_at: expires_at - ChronoDuration::minutes(REFRESH_MARGIN_MINUTES),
        })
    }
}

#[async_trait]
impl CredentialsProvider for ServiceAccountCredentials {
    async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        // Held across the exchange so concurrent callers share one request.
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref().filter(|t| t.refresh_at > now) {
            return Ok(Credentials::IamToken(token.token.clone()));
        }

        let fresh = self.exchange(now).await?;
        let credentials = Credentials::IamToken(fresh.token.clone());
        *cached = Some(fresh);
        Ok(credentials)
    }
}
