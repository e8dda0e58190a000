use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::ecr::{EcrPublicRefresher, EcrRefresher};
use crate::auth::gcr::GcrRefresher;
use crate::auth::{Credentials, SharedCredentials};
use crate::registry::{classify, ListSourceType, RegistryKind};
use crate::sync::config::parse_duration;

pub fn minimum_auth_refresh() -> Duration {
    Duration::hours(1)
}

/// Per-location lister settings from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ListerSettings {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(rename = "aws-profile", default)]
    pub aws_profile: Option<String>,
}

/// One side of a task: a registry, how to authenticate against it, and how
/// to list its repositories.
#[derive(Deserialize)]
pub struct Location {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub auth: String,
    #[serde(rename = "skip-tls-verify", default)]
    pub skip_tls_verify: bool,
    #[serde(rename = "auth-refresh", default)]
    pub auth_refresh: Option<String>,
    #[serde(default)]
    pub lister: Option<ListerSettings>,

    #[serde(skip)]
    kind: RegistryKind,
    #[serde(skip)]
    creds: SharedCredentials,
}

impl Location {
    pub fn validate(&mut self) -> Result<()> {
        if self.registry.is_empty() {
            bail!("registry not set");
        }

        self.kind = classify(&self.registry);

        if let Some(lister) = &self.lister {
            let typ = ListSourceType::parse(&lister.source_type)?;
            if typ == ListSourceType::Index
                && lister.search.as_deref().unwrap_or_default().is_empty()
            {
                bail!("index lister requires a search expression");
            }
        }

        let disable_auth = self.auth == "none";
        if disable_auth {
            self.auth = String::new();
        }

        // move auth into credentials
        let creds = if self.auth.is_empty() {
            Credentials::default()
        } else {
            let creds = Credentials::from_auth(&self.auth).context("invalid auth")?;
            self.auth = String::new();
            creds
        };
        self.creds = SharedCredentials::new(creds.into());

        let mut interval = Duration::zero();
        if let Some(refresh) = &self.auth_refresh {
            interval = Duration::from_std(parse_duration(refresh)?)
                .context("auth-refresh interval out of range")?;
            if !interval.is_zero() && interval < minimum_auth_refresh() {
                warn!(
                    registry = %self.registry,
                    "auth-refresh too short, setting to minimum: {}h",
                    minimum_auth_refresh().num_hours()
                );
                interval = minimum_auth_refresh();
            }
        }

        let profile = self
            .lister
            .as_ref()
            .and_then(|l| l.aws_profile.clone());

        match &self.kind {
            RegistryKind::EcrPrivate { region, account } if !disable_auth => {
                let refresher = EcrRefresher::new(account, region, interval, profile);
                self.set_refresher(Box::new(refresher));
            }
            RegistryKind::EcrPublic { region, .. } if !disable_auth => {
                let refresher = EcrPublicRefresher::new(region, interval, profile);
                self.set_refresher(Box::new(refresher));
            }
            kind if kind.is_ecr() => {} // auth explicitly disabled
            _ if !interval.is_zero() => {
                bail!(
                    "'{}' wants authentication refresh, but is not an ECR registry",
                    self.registry
                );
            }
            RegistryKind::Gcr | RegistryKind::Gar if !disable_auth => {
                self.set_refresher(Box::new(GcrRefresher::new()));
            }
            _ => {}
        }

        Ok(())
    }

    fn set_refresher(&self, refresher: Box<dyn crate::auth::Refresher>) {
        self.creds
            .try_lock()
            .expect("credentials locked during setup")
            .set_refresher(refresher);
    }

    pub fn kind(&self) -> &RegistryKind {
        &self.kind
    }

    pub fn credentials(&self) -> SharedCredentials {
        self.creds.clone()
    }

    pub fn aws_profile(&self) -> Option<&str> {
        self.lister.as_ref().and_then(|l| l.aws_profile.as_deref())
    }

    /// The wire-format credential string handed to relays, empty when
    /// anonymous.
    pub async fn get_auth(&self) -> String {
        self.creds.lock().await.auth()
    }

    pub async fn refresh_auth(&self) -> Result<()> {
        debug!(registry = %self.registry, "refreshing credentials");
        self.creds.lock().await.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(registry: &str) -> Location {
        Location {
            registry: registry.to_string(),
            auth: String::new(),
            skip_tls_verify: false,
            auth_refresh: None,
            lister: None,
            kind: RegistryKind::Plain,
            creds: SharedCredentials::default(),
        }
    }

    #[test]
    fn test_registry_required() {
        assert!(location("").validate().is_err());
    }

    #[test]
    fn test_classification_on_validate() {
        let mut loc = location("123456789012.dkr.ecr.eu-west-1.amazonaws.com");
        loc.validate().unwrap();
        assert!(loc.kind().is_ecr());

        let mut loc = location("eu.gcr.io");
        loc.validate().unwrap();
        assert_eq!(*loc.kind(), RegistryKind::Gcr);

        let mut loc = location("registry.example.com");
        loc.validate().unwrap();
        assert_eq!(*loc.kind(), RegistryKind::Plain);
    }

    #[test]
    fn test_auth_refresh_floor() {
        let mut loc = location("123456789012.dkr.ecr.eu-west-1.amazonaws.com");
        loc.auth_refresh = Some("10m".to_string());
        // raised to the minimum without failing validation
        loc.validate().unwrap();
    }

    #[test]
    fn test_auth_refresh_requires_ecr() {
        let mut loc = location("registry.example.com");
        loc.auth_refresh = Some("2h".to_string());
        assert!(loc.validate().is_err());
    }

    #[test]
    fn test_zero_auth_refresh_is_allowed_anywhere() {
        let mut loc = location("registry.example.com");
        loc.auth_refresh = Some("0s".to_string());
        loc.validate().unwrap();
    }

    #[test]
    fn test_auth_none_disables_auth() {
        let mut loc = location("eu.gcr.io");
        loc.auth = "none".to_string();
        loc.validate().unwrap();
        assert!(loc.auth.is_empty());
    }

    #[test]
    fn test_index_lister_requires_search() {
        let mut loc = location("registry.example.com");
        loc.lister = Some(ListerSettings {
            source_type: "index".to_string(),
            search: None,
            aws_profile: None,
        });
        assert!(loc.validate().is_err());
    }

    #[tokio::test]
    async fn test_get_auth_roundtrip() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        let mut loc = location("registry.example.com");
        loc.auth = BASE64.encode("johndoe:secret");
        loc.validate().unwrap();
        assert_eq!(loc.get_auth().await, BASE64.encode("johndoe:secret"));
    }
}
