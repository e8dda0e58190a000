use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::SharedCredentials;
use crate::registry::catalog::scheme_for;
use crate::registry::ListSource;

/// Lister using the registry index fulltext search (`/v1/search`). Requires
/// a search expression; on registries other than DockerHub the expression is
/// prefixed with the registry host, matching how the index service scopes
/// results.
pub struct IndexLister {
    registry: String,
    filter: String,
    insecure: bool,
    creds: SharedCredentials,
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    name: String,
}

impl IndexLister {
    pub fn new(registry: &str, filter: &str, insecure: bool, creds: SharedCredentials) -> Self {
        let filter = if is_dockerhub(registry) {
            filter.to_string()
        } else {
            format!("{}/{}", registry, filter)
        };
        Self {
            registry: registry.to_string(),
            filter,
            insecure,
            creds,
        }
    }

    fn search_host(&self) -> String {
        if is_dockerhub(&self.registry) {
            "https://index.docker.io".to_string()
        } else {
            format!("{}://{}", scheme_for(&self.registry), self.registry)
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .context("cannot build HTTP client")
    }
}

#[async_trait]
impl ListSource for IndexLister {
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>> {
        let client = self.http_client()?;

        let mut req = client
            .get(format!("{}/v1/search", self.search_host()))
            .header("Accept", "application/json")
            .query(&[("q", self.filter.as_str())]);
        if max_items > 0 {
            req = req.query(&[("n", max_items.to_string())]);
        }

        {
            let creds = self.creds.lock().await;
            if !creds.username().is_empty() || !creds.password().is_empty() {
                req = req.basic_auth(creds.username(), Some(creds.password()));
            }
        }

        let res: SearchResults = req
            .send()
            .await
            .context("index search failed")?
            .error_for_status()
            .context("index search failed")?
            .json()
            .await?;

        Ok(res.results.into_iter().map(|r| r.name).collect())
    }

    async fn ping(&mut self) -> Result<()> {
        let client = self.http_client()?;
        client
            .get(format!("{}/v1/_ping", self.search_host()))
            .send()
            .await?
            .error_for_status()
            .context("index ping failed")?;
        Ok(())
    }
}

fn is_dockerhub(registry: &str) -> bool {
    registry.is_empty()
        || registry == "docker.com"
        || registry == "docker.io"
        || registry.ends_with(".docker.com")
        || registry.ends_with(".docker.io")
}
