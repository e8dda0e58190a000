use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{AuthEncoder, Credentials, Refresher};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Access token refresher for GCR and Artifact Registry. Tokens come either
/// from a service-account key file (`GOOGLE_APPLICATION_CREDENTIALS`) via an
/// OAuth2 JWT assertion, or from the GCE metadata service when running on a
/// GCE instance.
#[derive(Default)]
pub struct GcrRefresher {
    expiry: Option<DateTime<Utc>>,
}

impl GcrRefresher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Refresher for GcrRefresher {
    async fn refresh(&mut self, creds: &mut Credentials) -> Result<()> {
        if let Some(expiry) = self.expiry {
            if Utc::now() < expiry {
                return Ok(());
            }
        }

        let (token, expiry) = if std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok() {
            token_from_key_file().await?
        } else if is_gce_instance().await {
            token_from_metadata().await?
        } else {
            bail!("neither GOOGLE_APPLICATION_CREDENTIALS set, nor a GCE instance");
        };

        if token.is_empty() {
            bail!("no auth token received");
        }

        creds.set_basic(
            "oauth2accesstoken".to_string(),
            token,
            AuthEncoder::BasicJson,
        );
        self.expiry = Some(expiry);

        Ok(())
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Exchange a signed service-account JWT assertion for an access token.
async fn token_from_key_file() -> Result<(String, DateTime<Utc>)> {
    let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")?;
    let data = std::fs::read(&path)
        .with_context(|| format!("cannot read service account key file '{}'", path))?;
    let key: ServiceAccountKey =
        serde_json::from_slice(&data).context("invalid service account key file")?;

    let token_uri = key.token_uri.as_deref().unwrap_or(OAUTH_TOKEN_URL);
    let now = Utc::now();
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: STORAGE_SCOPE,
        aud: token_uri,
        iat: now.timestamp(),
        exp: (now + Duration::hours(1)).timestamp(),
    };

    let assertion = encode(
        &Header::new(Algorithm::RS256),
        &claims,
        &EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("invalid private key in service account key file")?,
    )?;

    debug!(email = %key.client_email, "exchanging JWT assertion for access token");

    let start = Utc::now();
    let resp: TokenResponse = reqwest::Client::new()
        .post(token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok((
        resp.access_token,
        start + Duration::seconds(resp.expires_in),
    ))
}

async fn is_gce_instance() -> bool {
    let client = match reqwest::Client::builder()
        .timeout(StdDuration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.head(METADATA_TOKEN_URL).send().await {
        Ok(resp) => resp
            .headers()
            .get("Metadata-Flavor")
            .map(|v| v == "Google")
            .unwrap_or(false),
        Err(_) => false,
    }
}

async fn token_from_metadata() -> Result<(String, DateTime<Utc>)> {
    debug!("getting access token from GCE metadata service");

    let start = Utc::now();
    let resp: TokenResponse = reqwest::Client::new()
        .get(METADATA_TOKEN_URL)
        .header("Accept", "application/json")
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok((
        resp.access_token,
        start + Duration::seconds(resp.expires_in),
    ))
}
