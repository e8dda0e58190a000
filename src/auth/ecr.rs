use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::Region;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::auth::{AuthEncoder, Credentials, Refresher};

/// Token refresher for private ECR registries. A refresh interval of zero
/// disables the refresher; otherwise a new authorization token is fetched
/// whenever the previous one is older than the interval.
pub struct EcrRefresher {
    account: String,
    region: String,
    interval: Duration,
    profile: Option<String>,
    expiry: DateTime<Utc>,
}

impl EcrRefresher {
    pub fn new(account: &str, region: &str, interval: Duration, profile: Option<String>) -> Self {
        Self {
            account: account.to_string(),
            region: region.to_string(),
            interval,
            profile,
            expiry: DateTime::<Utc>::MIN_UTC,
        }
    }
}

#[async_trait]
impl Refresher for EcrRefresher {
    async fn refresh(&mut self, creds: &mut Credentials) -> Result<()> {
        if self.interval.is_zero() || Utc::now() < self.expiry {
            return Ok(());
        }

        debug!(account = %self.account, region = %self.region, "getting ECR auth token");

        let conf = aws_conf(&self.region, self.profile.as_deref()).await;
        let client = aws_sdk_ecr::Client::new(&conf);

        let resp = client
            .get_authorization_token()
            .registry_ids(self.account.as_str())
            .send()
            .await
            .context("failed to get ECR authorization token")?;

        let token = resp
            .authorization_data()
            .first()
            .and_then(|d| d.authorization_token())
            .with_context(|| format!("no authorization data for '{}'", self.account))?;

        store_token(creds, token)?;
        self.expiry = Utc::now() + self.interval;

        Ok(())
    }
}

/// Token refresher for public ECR (`public.ecr.aws`). Same contract as the
/// private refresher, but the public token API takes no registry id.
pub struct EcrPublicRefresher {
    region: String,
    interval: Duration,
    profile: Option<String>,
    expiry: DateTime<Utc>,
}

impl EcrPublicRefresher {
    pub fn new(region: &str, interval: Duration, profile: Option<String>) -> Self {
        let region = if region.is_empty() {
            // the public ECR token endpoint only exists in us-east-1
            "us-east-1".to_string()
        } else {
            region.to_string()
        };
        Self {
            region,
            interval,
            profile,
            expiry: DateTime::<Utc>::MIN_UTC,
        }
    }
}

#[async_trait]
impl Refresher for EcrPublicRefresher {
    async fn refresh(&mut self, creds: &mut Credentials) -> Result<()> {
        if self.interval.is_zero() || Utc::now() < self.expiry {
            return Ok(());
        }

        debug!(region = %self.region, "getting public ECR auth token");

        let conf = aws_conf(&self.region, self.profile.as_deref()).await;
        let client = aws_sdk_ecrpublic::Client::new(&conf);

        let resp = client
            .get_authorization_token()
            .send()
            .await
            .context("failed to get public ECR authorization token")?;

        let token = resp
            .authorization_data()
            .and_then(|d| d.authorization_token())
            .context("no authorization data in public ECR response")?;

        store_token(creds, token)?;
        self.expiry = Utc::now() + self.interval;

        Ok(())
    }
}

/// Decode the base64 `user:password` token returned by the token APIs and
/// store it on the credentials with the JSON wire encoding.
fn store_token(creds: &mut Credentials, token: &str) -> Result<()> {
    let decoded = BASE64
        .decode(token)
        .context("failed to decode ECR authorization token")?;
    let decoded = String::from_utf8(decoded).context("ECR token is not valid UTF-8")?;

    let Some((user, pass)) = decoded.split_once(':') else {
        bail!("failed to parse ECR credentials");
    };

    creds.set_basic(
        user.trim().to_string(),
        pass.trim().to_string(),
        AuthEncoder::BasicJson,
    );

    Ok(())
}

pub(crate) async fn aws_conf(region: &str, profile: Option<&str>) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(region.to_string()));
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}
