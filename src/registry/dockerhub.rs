use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::auth::token::Token;
use crate::auth::SharedCredentials;
use crate::registry::ListSource;

const LOGIN_URL: &str = "https://hub.docker.com/v2/users/login/";

/// Lister for DockerHub, which hides the catalog API behind its own
/// two-step scheme: log in for a JWT, then page through the user's
/// repositories.
pub struct DockerHubLister {
    creds: SharedCredentials,
}

#[derive(Deserialize)]
struct RepoPage {
    #[serde(default)]
    results: Vec<RepoDescriptor>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct RepoDescriptor {
    name: String,
    namespace: String,
    #[serde(rename = "repository_type", default)]
    repo_type: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

impl DockerHubLister {
    pub fn new(creds: SharedCredentials) -> Self {
        Self { creds }
    }

    async fn get_token(&self) -> Result<Token> {
        debug!("getting DockerHub token");

        let (username, password) = {
            let creds = self.creds.lock().await;
            (creds.username().to_string(), creds.password().to_string())
        };

        let resp = reqwest::Client::new()
            .post(LOGIN_URL)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await
            .context("DockerHub login failed")?;

        if !resp.status().is_success() {
            bail!("DockerHub login failed: {}", resp.status());
        }

        let login: LoginResponse = resp.json().await.context("invalid login response")?;
        debug!("received DockerHub token");
        Ok(Token::new(&login.token))
    }

    /// The cached login token, renewed once expired.
    async fn ensure_token(&mut self) -> Result<Token> {
        {
            let creds = self.creds.lock().await;
            if let Some(token) = creds.token() {
                if !token.is_expired() {
                    debug!("token already present and still valid");
                    return Ok(token.clone());
                }
            }
        }

        let token = self.get_token().await?;
        self.creds.lock().await.set_token(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl ListSource for DockerHubLister {
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>> {
        let token = self.ensure_token().await?;
        let user = self.creds.lock().await.username().to_string();

        let client = reqwest::Client::new();
        let mut url = format!(
            "https://hub.docker.com/v2/repositories/{}/?page_size=100",
            user
        );
        let mut ret: Vec<String> = Vec::new();

        loop {
            let page: RepoPage = client
                .get(&url)
                .header("Accept", "application/json")
                .header("Authorization", format!("JWT {}", token.raw()))
                .send()
                .await?
                .error_for_status()
                .context("error listing DockerHub repositories")?
                .json()
                .await?;

            for r in &page.results {
                if r.repo_type == "image" {
                    ret.push(format!("{}/{}", r.namespace, r.name));
                }
            }

            match page.next {
                Some(next) if !next.is_empty() && !(max_items > 0 && ret.len() as i64 > max_items) => {
                    url = next;
                }
                _ => return Ok(ret),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.get_token().await.map(|_| ())
    }
}
