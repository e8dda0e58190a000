use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bollard::auth::DockerCredentials;
use bollard::image::{CreateImageOptions, ListImagesOptions, PushImageOptions, TagImageOptions};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::util;

/// A locally pulled image with the tags it carries.
#[derive(Debug, Clone)]
pub struct LocalImage {
    pub id: String,
    pub registry: String,
    pub repo: String,
    pub tags: Vec<String>,
}

impl LocalImage {
    pub fn reference(&self) -> String {
        if self.registry.is_empty() {
            self.repo.clone()
        } else {
            format!("{}/{}", self.registry, self.repo)
        }
    }

    pub fn ref_with_tags(&self) -> String {
        format!("{}:{:?}", self.reference(), self.tags)
    }
}

/// Thin wrapper around the bollard daemon client, narrowed to what the relay
/// needs: ping with retries, pull, tag, push, local image listing and an API
/// capability probe.
pub struct DockerClient {
    client: Docker,
}

impl DockerClient {
    pub fn new(host: &str, api_version: &str) -> Result<Self> {
        let version = parse_client_version(api_version)?;
        let version = version.as_ref().unwrap_or(API_DEFAULT_VERSION);

        let client = if host.is_empty() {
            Docker::connect_with_local_defaults()
        } else if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(path, 120, version)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, version)
        } else {
            Docker::connect_with_socket(host, 120, version)
        }
        .context("cannot create Docker client")?;

        Ok(Self { client })
    }

    /// Ping the daemon, retrying `attempts` times with `sleep` in between.
    /// The daemon may not be up yet when we are, e.g. next to a
    /// Docker-in-Docker container coming up in the same pod.
    pub async fn ping(&self, attempts: usize, sleep: Duration) -> Result<()> {
        let mut last_err = None;
        for i in 1..=attempts {
            match self.client.ping().await {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            if i < attempts {
                tokio::time::sleep(sleep).await;
            }
        }
        bail!(
            "unsuccessfully pinged Docker server {} times, last error: {}",
            attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )
    }

    pub async fn close(&mut self) -> Result<()> {
        // bollard connections close on drop
        Ok(())
    }

    pub async fn pull_image(
        &self,
        reference: &str,
        all_tags: bool,
        platform: &str,
        auth: &str,
        verbose: bool,
    ) -> Result<()> {
        let (reg, repo, tag) = util::split_ref(reference);
        let from_image = if reg.is_empty() {
            repo.to_string()
        } else {
            format!("{}/{}", reg, repo)
        };

        let opts = CreateImageOptions {
            from_image,
            // an empty tag makes the daemon pull all tags
            tag: if all_tags { String::new() } else { tag.to_string() },
            platform: platform.to_string(),
            ..Default::default()
        };

        let mut stream = self
            .client
            .create_image(Some(opts), None, docker_credentials(auth));

        while let Some(item) = stream.next().await {
            let item = item.with_context(|| format!("error pulling '{}'", reference))?;
            if let Some(err) = item.error {
                bail!("error pulling '{}': {}", reference, err);
            }
            if verbose {
                if let Some(status) = item.status {
                    debug!("{}", status);
                }
            }
        }

        Ok(())
    }

    pub async fn push_image(&self, reference: &str, auth: &str, verbose: bool) -> Result<()> {
        let (reg, repo, tag) = util::split_ref(reference);
        let name = if reg.is_empty() {
            repo.to_string()
        } else {
            format!("{}/{}", reg, repo)
        };

        // an empty tag pushes all tags of the repository
        let opts = PushImageOptions {
            tag: tag.to_string(),
        };

        let mut stream = self
            .client
            .push_image(&name, Some(opts), docker_credentials(auth));

        while let Some(item) = stream.next().await {
            let item = item.with_context(|| format!("error pushing '{}'", reference))?;
            if let Some(err) = item.error {
                bail!("error pushing '{}': {}", reference, err);
            }
            if verbose {
                if let Some(status) = item.status {
                    debug!("{}", status);
                }
            }
        }

        Ok(())
    }

    pub async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (reg, repo, tag) = util::split_ref(target);
        let repo = if reg.is_empty() {
            repo.to_string()
        } else {
            format!("{}/{}", reg, repo)
        };

        self.client
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo,
                    tag: tag.to_string(),
                }),
            )
            .await
            .with_context(|| format!("error tagging '{}'", target))
    }

    /// Local images matching `reference`, which may carry a tag or digest
    /// filter. Only consults the daemon's local store, never a registry.
    pub async fn list_images(&self, reference: &str) -> Result<Vec<LocalImage>> {
        debug!(%reference, "listing images");

        let imgs = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("error listing images")?;

        let (f_reg, f_repo, f_tag) = util::split_ref(reference);
        let (name, digest) = util::split_tag(f_tag);
        let by_digest = !digest.is_empty();
        let filter_tag = if by_digest { digest } else { name };

        let mut list: Vec<LocalImage> = Vec::new();

        for img in imgs {
            // match against repo digests when filtering by digest, repo tags
            // otherwise
            let col = if by_digest {
                &img.repo_digests
            } else {
                &img.repo_tags
            };

            let mut current: Option<usize> = None;

            for rt in col {
                if rt.as_str() == "<none>:<none>" || rt.as_str() == "<none>@<none>" {
                    continue;
                }
                let (reg, repo, tag) = util::split_ref(rt);
                let matched = (f_reg.is_empty() || f_reg == reg)
                    && (f_repo.is_empty() || f_repo == repo)
                    && (filter_tag.is_empty() || filter_tag == tag);
                if !matched {
                    continue;
                }

                let ix = match current {
                    Some(ix) => ix,
                    None => {
                        list.push(LocalImage {
                            id: img.id.clone(),
                            registry: reg.to_string(),
                            repo: repo.to_string(),
                            tags: Vec::new(),
                        });
                        let ix = list.len() - 1;
                        current = Some(ix);
                        ix
                    }
                };

                if !tag.is_empty() {
                    // when filtering by digest, keep the full filter tag: it
                    // may contain a name that the local digest entry lacks
                    let tag = if by_digest { f_tag } else { tag };
                    list[ix].tags.push(tag.to_string());
                }
            }
        }

        Ok(list)
    }

    pub async fn api_version(&self) -> Result<String> {
        let version = self
            .client
            .version()
            .await
            .context("cannot get daemon version")?;
        version.api_version.context("daemon reports no API version")
    }

    /// Whether the daemon API is recent enough for per-platform pushes
    /// (requires at least 1.46).
    pub async fn supports_platform_push(&self) -> bool {
        let ver = match self.api_version().await {
            Ok(v) => v,
            Err(e) => {
                warn!("could not determine Docker API version: {:#}", e);
                return false;
            }
        };
        match crate::tags::parse_tolerant(&ver) {
            Some(v) => v >= semver::Version::new(1, 46, 0),
            None => {
                warn!("could not parse Docker API version: {}", ver);
                false
            }
        }
    }
}

/// Decode a base64 auth blob into daemon credentials. The daemon accepts
/// requests without credentials for public sources.
fn docker_credentials(auth: &str) -> Option<DockerCredentials> {
    if auth.is_empty() {
        return None;
    }

    #[derive(Deserialize)]
    struct Creds {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    }

    let decoded = BASE64.decode(auth).ok()?;
    match serde_json::from_slice::<Creds>(&decoded) {
        Ok(c) => Some(DockerCredentials {
            username: Some(c.username),
            password: Some(c.password),
            ..Default::default()
        }),
        Err(_) => {
            let plain = String::from_utf8(decoded).ok()?;
            let (user, pass) = plain.split_once(':')?;
            Some(DockerCredentials {
                username: Some(user.to_string()),
                password: Some(pass.to_string()),
                ..Default::default()
            })
        }
    }
}

fn parse_client_version(api_version: &str) -> Result<Option<ClientVersion>> {
    if api_version.is_empty() {
        return Ok(None);
    }
    let mut parts = api_version.split('.');
    let (major, minor) = match (parts.next(), parts.next(), parts.next()) {
        (Some(major), Some(minor), None) => (major, minor),
        _ => bail!("invalid Docker API version '{}'", api_version),
    };
    Ok(Some(ClientVersion {
        major_version: major
            .parse()
            .with_context(|| format!("invalid Docker API version '{}'", api_version))?,
        minor_version: minor
            .parse()
            .with_context(|| format!("invalid Docker API version '{}'", api_version))?,
    }))
}
