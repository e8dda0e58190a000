use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::relays::{Relay, SyncOptions};
use crate::util;

pub const RELAY_ID: &str = "skopeo";

const DEFAULT_BINARY: &str = "skopeo";
const DEFAULT_CERTS_BASE_DIR: &str = "/etc/skopeo/certs.d";

#[derive(Debug, Clone, Deserialize)]
pub struct SkopeoConfig {
    #[serde(default)]
    pub binary: String,
    #[serde(rename = "certs-dir", default)]
    pub certs_dir: String,
}

/// The skopeo relay never syncs multi-platform images implicitly, so any
/// platform value is acceptable.
pub fn platform_supported(_p: &str) -> Result<()> {
    Ok(())
}

/// Relay that shells out to the skopeo binary, one `copy` per tag.
pub struct SkopeoRelay {
    binary: String,
    certs_base_dir: String,
    dry_run: bool,
}

/// Certs directory for a repository under the default base dir, for callers
/// outside a configured relay.
pub fn default_certs_dir_for_repo(repo: &str) -> String {
    format!("{}/{}", DEFAULT_CERTS_BASE_DIR, without_port(repo))
}

impl SkopeoRelay {
    pub fn new(conf: Option<&SkopeoConfig>, dry_run: bool) -> Self {
        let mut relay = Self {
            binary: DEFAULT_BINARY.to_string(),
            certs_base_dir: DEFAULT_CERTS_BASE_DIR.to_string(),
            dry_run,
        };
        if let Some(conf) = conf {
            if !conf.binary.is_empty() {
                relay.binary = conf.binary.clone();
            }
            if !conf.certs_dir.is_empty() {
                relay.certs_base_dir = conf.certs_dir.clone();
            }
        }
        relay
    }

    fn certs_dir_for_repo(&self, repo: &str) -> String {
        format!("{}/{}", self.certs_base_dir, without_port(repo))
    }
}

#[async_trait]
impl Relay for SkopeoRelay {
    async fn prepare(&mut self) -> Result<()> {
        let out = run_skopeo(&self.binary, &["--version".to_string()])
            .await
            .context("cannot execute skopeo")?;
        info!("{}", out.trim());
        info!(relay = RELAY_ID, "relay ready");
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }

    async fn sync(&mut self, opt: &SyncOptions) -> Result<()> {
        let src_creds = util::decode_json_auth(&opt.src_auth);
        let dest_creds = util::decode_json_auth(&opt.trgt_auth);

        let mut cmd: Vec<String> = vec!["--insecure-policy".into(), "copy".into()];

        if opt.src_skip_tls_verify {
            cmd.push("--src-tls-verify=false".into());
        }
        if opt.trgt_skip_tls_verify {
            cmd.push("--dest-tls-verify=false".into());
        }

        let mut src_cert_dir = String::new();
        let (src_repo, _, _) = util::split_ref(&opt.src_ref);
        if !src_repo.is_empty() {
            src_cert_dir = self.certs_dir_for_repo(src_repo);
            cmd.push(format!("--src-cert-dir={}", src_cert_dir));
        }
        let (trgt_repo, _, _) = util::split_ref(&opt.trgt_ref);
        if !trgt_repo.is_empty() {
            cmd.push(format!("--dest-cert-dir={}", self.certs_dir_for_repo(trgt_repo)));
        }

        if !src_creds.is_empty() {
            cmd.push(format!("--src-creds={}", src_creds));
        }
        if !dest_creds.is_empty() {
            cmd.push(format!("--dest-creds={}", dest_creds));
        }

        let tags = opt
            .tags
            .expand(|| {
                list_all_tags(
                    &self.binary,
                    &opt.src_ref,
                    &src_creds,
                    &src_cert_dir,
                    opt.src_skip_tls_verify,
                )
            })
            .await
            .context("error expanding tags")?;

        if self.dry_run {
            return self
                .report_dry_run(opt, &tags, &dest_creds)
                .await;
        }

        let mut errs = false;

        for digest in opt.digests.iter() {
            info!(digest = %digest, "syncing digest");
            let mut rc = cmd.clone();
            rc.push("--preserve-digests".into());
            rc.push(format!("docker://{}@{}", opt.src_ref, digest));
            rc.push(format!("docker://{}", opt.trgt_ref));
            if let Err(e) = run_copy(&self.binary, &rc, opt.verbose).await {
                error!("{:#}", e);
                errs = true;
            }
        }

        for t in &tags {
            info!(tag = %t, platform = %opt.platform, "syncing tag");

            let mut rc = cmd.clone();
            rc.push(format!("docker://{}:{}", opt.src_ref, t));
            rc.push(format!("docker://{}:{}", opt.trgt_ref, t));

            match opt.platform.as_str() {
                "" => {}
                "all" => rc.push("--all".into()),
                p => add_platform_overrides(&mut rc, p),
            }

            if let Err(e) = run_copy(&self.binary, &rc, opt.verbose).await {
                error!("{:#}", e);
                errs = true;
            }
        }

        if errs {
            bail!("errors during sync");
        }
        Ok(())
    }
}

impl SkopeoRelay {
    /// Log what a real run would copy, without touching the target. The
    /// target tag list is best-effort: a missing target repository simply
    /// reads as empty.
    async fn report_dry_run(
        &self,
        opt: &SyncOptions,
        tags: &[String],
        dest_creds: &str,
    ) -> Result<()> {
        let (trgt_repo, _, _) = util::split_ref(&opt.trgt_ref);
        let trgt_cert_dir = if trgt_repo.is_empty() {
            String::new()
        } else {
            self.certs_dir_for_repo(trgt_repo)
        };

        let trgt_tags = match list_all_tags(
            &self.binary,
            &opt.trgt_ref,
            dest_creds,
            &trgt_cert_dir,
            opt.trgt_skip_tls_verify,
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    "[dry-run] could not list target tags for '{}', treating as empty: {:#}",
                    opt.trgt_ref, e
                );
                Vec::new()
            }
        };

        let pending: Vec<&String> = tags.iter().filter(|t| !trgt_tags.contains(t)).collect();
        info!(
            task = %opt.task,
            mapping = opt.index,
            source = %opt.src_ref,
            target = %opt.trgt_ref,
            "[dry-run] would copy {} tag(s) ({} already on target): {:?}",
            pending.len(),
            tags.len() - pending.len(),
            pending,
        );
        Ok(())
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// List all tags of a repository via `skopeo list-tags`.
pub async fn list_all_tags(
    binary: &str,
    reference: &str,
    creds: &str,
    cert_dir: &str,
    skip_tls_verify: bool,
) -> Result<Vec<String>> {
    let mut cmd: Vec<String> = vec!["list-tags".into()];

    if skip_tls_verify {
        cmd.push("--tls-verify=false".into());
    }
    if !creds.is_empty() {
        cmd.push(format!("--creds={}", creds));
    }
    if !cert_dir.is_empty() {
        cmd.push(format!("--cert-dir={}", cert_dir));
    }
    cmd.push(format!("docker://{}", reference));

    let out = run_skopeo(binary, &cmd)
        .await
        .with_context(|| format!("error listing image tags for ref '{}'", reference))?;

    let list: TagList = serde_json::from_str(&out).context("cannot decode tag list")?;
    Ok(list.tags)
}

async fn run_copy(binary: &str, args: &[String], verbose: bool) -> Result<()> {
    let out = run_skopeo(binary, args).await?;
    if verbose && !out.is_empty() {
        for line in out.lines() {
            info!("{}", line);
        }
    }
    Ok(())
}

async fn run_skopeo(binary: &str, args: &[String]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("cannot run '{}'", binary))?;

    if !output.status.success() {
        bail!(
            "'{} {}' failed: {}",
            binary,
            args.first().map(String::as_str).unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn add_platform_overrides(cmd: &mut Vec<String>, platform: &str) {
    let (os, arch, variant) = util::split_platform(platform);
    if !os.is_empty() {
        cmd.push(format!("--override-os={}", os));
    }
    if !arch.is_empty() {
        cmd.push(format!("--override-arch={}", arch));
    }
    if !variant.is_empty() {
        cmd.push(format!("--override-variant={}", variant));
    }
}

fn without_port(repo: &str) -> &str {
    match repo.find(':') {
        Some(ix) => &repo[..ix],
        None => repo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_overrides() {
        let mut cmd = Vec::new();
        add_platform_overrides(&mut cmd, "linux/arm/v7");
        assert_eq!(
            cmd,
            vec!["--override-os=linux", "--override-arch=arm", "--override-variant=v7"]
        );

        let mut cmd = Vec::new();
        add_platform_overrides(&mut cmd, "linux");
        assert_eq!(cmd, vec!["--override-os=linux"]);
    }

    #[test]
    fn test_without_port() {
        assert_eq!(without_port("registry.example.com:5000"), "registry.example.com");
        assert_eq!(without_port("registry.example.com"), "registry.example.com");
    }

    #[test]
    fn test_certs_dir_for_repo() {
        let relay = SkopeoRelay::new(
            Some(&SkopeoConfig {
                binary: String::new(),
                certs_dir: "/certs".to_string(),
            }),
            false,
        );
        assert_eq!(
            relay.certs_dir_for_repo("registry.example.com:5000"),
            "/certs/registry.example.com"
        );
    }

    #[test]
    fn test_config_defaults() {
        let relay = SkopeoRelay::new(None, false);
        assert_eq!(relay.binary, DEFAULT_BINARY);
        assert_eq!(relay.certs_base_dir, DEFAULT_CERTS_BASE_DIR);
    }
}
