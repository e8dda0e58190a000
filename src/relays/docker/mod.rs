mod client;

pub use client::{DockerClient, LocalImage};

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::relays::{skopeo, Relay, SyncOptions};
use crate::util;

pub const RELAY_ID: &str = "docker";

// a Docker tag may be at most 128 characters
const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub dockerhost: String,
    #[serde(rename = "api-version", default)]
    pub api_version: String,
}

/// The daemon cannot pull every platform of a multi-platform image at once.
pub fn platform_supported(p: &str) -> Result<()> {
    if p == "all" {
        bail!(
            "relay '{}' does not support mappings with 'platform: all'",
            RELAY_ID
        );
    }
    Ok(())
}

/// Relay syncing through a local Docker daemon: pull from the source,
/// re-tag, push to the target.
pub struct DockerRelay {
    client: DockerClient,
    dry_run: bool,
}

impl DockerRelay {
    pub fn new(conf: Option<&DockerConfig>, dry_run: bool) -> Result<Self> {
        let (host, api_version) = match conf {
            Some(c) => (c.dockerhost.as_str(), c.api_version.as_str()),
            None => ("", ""),
        };
        Ok(Self {
            client: DockerClient::new(host, api_version)?,
            dry_run,
        })
    }
}

#[async_trait]
impl Relay for DockerRelay {
    async fn prepare(&mut self) -> Result<()> {
        // the daemon may not be ready yet, e.g. when we run side by side
        // with a Docker-in-Docker container inside a pod
        info!("pinging Docker daemon...");
        self.client.ping(30, Duration::from_secs(10)).await?;
        info!(relay = RELAY_ID, "ok, relay ready");
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        info!(relay = RELAY_ID, "disposing relay");
        self.client.close().await
    }

    async fn sync(&mut self, opt: &SyncOptions) -> Result<()> {
        info!(ref_ = %opt.src_ref, platform = %opt.platform, "pulling source image");

        if opt.platform == "all" {
            bail!("'platform: all' sync option not supported");
        }

        if !opt.platform.is_empty() && !self.client.supports_platform_push().await {
            warn!(
                "per-platform pushing requires Docker API version 1.46 or newer, \
                 the platform constraint only applies to the pull"
            );
        }

        // with a completely empty tag set a plain pull without a tag gets
        // all tags, so no listing is needed in that case
        let mut tags: Vec<String> = Vec::new();
        if !opt.tags.is_empty() {
            let src_creds = util::decode_json_auth(&opt.src_auth);
            let (src_repo, _, _) = util::split_ref(&opt.src_ref);
            let src_cert_dir = if src_repo.is_empty() {
                String::new()
            } else {
                skopeo::default_certs_dir_for_repo(src_repo)
            };
            tags = opt
                .tags
                .expand(|| {
                    skopeo::list_all_tags(
                        "skopeo",
                        &opt.src_ref,
                        &src_creds,
                        &src_cert_dir,
                        opt.src_skip_tls_verify,
                    )
                })
                .await
                .context("error expanding tags")?;
        }

        if self.dry_run {
            info!(
                task = %opt.task,
                mapping = opt.index,
                source = %opt.src_ref,
                target = %opt.trgt_ref,
                "[dry-run] would pull, tag and push {} tag(s) and {} digest(s): {:?}",
                tags.len(),
                opt.digests.iter().count(),
                tags,
            );
            return Ok(());
        }

        let mut errs = false;

        let mut pulled: Vec<String> = Vec::new();
        if tags.is_empty() && opt.digests.is_empty() {
            self.client
                .pull_image(&opt.src_ref, true, &opt.platform, &opt.src_auth, opt.verbose)
                .await
                .with_context(|| format!("error pulling source image '{}'", opt.src_ref))?;
            pulled.push(opt.src_ref.clone());
        } else {
            for tag in &tags {
                let src_tagged = format!("{}:{}", opt.src_ref, tag);
                match self
                    .client
                    .pull_image(&src_tagged, false, &opt.platform, &opt.src_auth, opt.verbose)
                    .await
                {
                    Ok(()) => pulled.push(src_tagged),
                    Err(e) => {
                        error!("error pulling source image '{}': {:#}", src_tagged, e);
                        errs = true;
                    }
                }
            }
            for digest in opt.digests.iter() {
                let src_digest = format!("{}@{}", opt.src_ref, digest);
                match self
                    .client
                    .pull_image(&src_digest, false, &opt.platform, &opt.src_auth, opt.verbose)
                    .await
                {
                    Ok(()) => pulled.push(src_digest),
                    Err(e) => {
                        error!("error pulling source image '{}': {:#}", src_digest, e);
                        errs = true;
                    }
                }
            }
        }

        info!("relevant tags:");
        let mut src_images: Vec<LocalImage> = Vec::new();
        for reference in &pulled {
            match self.client.list_images(reference).await {
                Ok(imgs) => src_images.extend(imgs),
                Err(e) => error!("error listing source image '{}': {:#}", reference, e),
            }
        }
        for img in &src_images {
            info!(" - {}", img.ref_with_tags());
        }

        info!(ref_ = %opt.trgt_ref, "setting tags for target image");
        for img in &src_images {
            for tag in &img.tags {
                let push_tag = push_tag_for(tag);
                let target = format!("{}:{}", opt.trgt_ref, push_tag);
                if let Err(e) = self.client.tag_image(&img.id, &target).await {
                    error!("error setting tag: {:#}", e);
                    errs = true;
                }
            }
        }

        info!(ref_ = %opt.trgt_ref, platform = %opt.platform, "pushing target image");
        if let Err(e) = self
            .client
            .push_image(&opt.trgt_ref, &opt.trgt_auth, opt.verbose)
            .await
        {
            error!("error pushing target image: {:#}", e);
            errs = true;
        }

        if errs {
            bail!("errors during sync");
        }
        Ok(())
    }
}

/// The tag to push under. The daemon rejects push-by-digest, so digest-only
/// references get a synthetic tag derived from the digest hex.
fn push_tag_for(tag: &str) -> String {
    let (name, digest) = util::split_tag(tag);
    if !name.is_empty() {
        return name.to_string();
    }
    if digest.is_empty() {
        return tag.to_string();
    }
    let mut synthetic = format!(
        "dregsy-{}",
        digest.trim_start_matches(util::DIGEST_PREFIX)
    );
    synthetic.truncate(MAX_TAG_LEN);
    synthetic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_supported() {
        assert!(platform_supported("").is_ok());
        assert!(platform_supported("linux/arm64").is_ok());
        assert!(platform_supported("all").is_err());
    }

    #[test]
    fn test_push_tag_for_digest() {
        let d = "sha256:1d8a02c7e2bf5b547ccac7d1c272ab1a2d8f4d16bf486e12e05ba2b26a3573ea";
        let tag = push_tag_for(d);
        assert_eq!(
            tag,
            "dregsy-1d8a02c7e2bf5b547ccac7d1c272ab1a2d8f4d16bf486e12e05ba2b26a3573ea"
        );
        assert!(tag.len() <= MAX_TAG_LEN);
    }

    #[test]
    fn test_push_tag_for_name() {
        assert_eq!(push_tag_for("1.31"), "1.31");
        let d = "sha256:1d8a02c7e2bf5b547ccac7d1c272ab1a2d8f4d16bf486e12e05ba2b26a3573ea";
        // name wins over digest when both are present
        assert_eq!(push_tag_for(&format!("1.31@{}", d)), "1.31");
    }
}
