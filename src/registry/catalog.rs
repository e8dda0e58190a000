use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::auth::SharedCredentials;
use crate::registry::ListSource;

const PAGE_SIZE: usize = 100;

/// Lister speaking the standard Docker registry catalog API,
/// `/v2/_catalog?last=X&n=100`.
pub struct CatalogLister {
    registry: String,
    insecure: bool,
    // GCR fronts the catalog with bearer tokens instead of basic auth
    bearer: bool,
    creds: SharedCredentials,
}

#[derive(Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

impl CatalogLister {
    pub fn new(registry: &str, insecure: bool, bearer: bool, creds: SharedCredentials) -> Self {
        Self {
            registry: registry.to_string(),
            insecure,
            bearer,
            creds,
        }
    }

    fn base_url(&self) -> String {
        format!("{}://{}", scheme_for(&self.registry), self.registry)
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .context("cannot build HTTP client")
    }

    async fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let creds = self.creds.lock().await;
        if self.bearer {
            if creds.password().is_empty() {
                req
            } else {
                req.bearer_auth(creds.password())
            }
        } else if creds.username().is_empty() && creds.password().is_empty() {
            req
        } else {
            req.basic_auth(creds.username(), Some(creds.password()))
        }
    }
}

/// Registries addressed as localhost get plain HTTP, everything else HTTPS.
pub(crate) fn scheme_for(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or_default();
    if host == "localhost" || host == "127.0.0.1" {
        "http"
    } else {
        "https"
    }
}

#[async_trait]
impl ListSource for CatalogLister {
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>> {
        {
            let mut creds = self.creds.lock().await;
            creds
                .refresh()
                .await
                .context("error refreshing credentials")?;
        }

        let client = self.http_client()?;
        let url = format!("{}/v2/_catalog", self.base_url());

        let mut list: Vec<String> = Vec::new();
        let mut last = String::new();

        loop {
            let mut req = client
                .get(&url)
                .query(&[("n", PAGE_SIZE.to_string())]);
            if !last.is_empty() {
                req = req.query(&[("last", last.as_str())]);
            }

            let page: CatalogPage = self
                .authorize(req)
                .await
                .send()
                .await
                .context("error getting catalog page")?
                .error_for_status()
                .context("error getting catalog page")?
                .json()
                .await?;

            debug!(count = page.repositories.len(), "received catalog page");

            if let Some(tail) = page.repositories.last() {
                last = tail.clone();
                list.extend(page.repositories.iter().cloned());
            }

            if page.repositories.len() < PAGE_SIZE
                || (max_items > 0 && list.len() as i64 > max_items)
            {
                return Ok(list);
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let client = self.http_client()?;
        let req = client.get(format!("{}/v2/", self.base_url()));
        self.authorize(req)
            .await
            .send()
            .await?
            .error_for_status()
            .context("registry API ping failed")?;
        Ok(())
    }
}
