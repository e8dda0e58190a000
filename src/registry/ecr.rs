use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::auth::ecr::aws_conf;
use crate::registry::ListSource;
use crate::util;

const PAGE_SIZE: i32 = 100;

/// Lister for private ECR registries, based on the SDK's repository
/// pagination.
pub struct EcrLister {
    region: String,
    account: String,
    profile: Option<String>,
}

impl EcrLister {
    pub fn new(region: &str, account: &str, profile: Option<String>) -> Self {
        Self {
            region: region.to_string(),
            account: account.to_string(),
            profile,
        }
    }

    async fn client(&self) -> aws_sdk_ecr::Client {
        aws_sdk_ecr::Client::new(&aws_conf(&self.region, self.profile.as_deref()).await)
    }
}

#[async_trait]
impl ListSource for EcrLister {
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>> {
        debug!("ECR retrieving repository list");

        let client = self.client().await;
        let mut pages = client
            .describe_repositories()
            .registry_id(self.account.as_str())
            .max_results(PAGE_SIZE)
            .into_paginator()
            .send();

        let mut ret: Vec<String> = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context("error listing ECR repositories")?;
            for r in page.repositories() {
                ret.push(r.repository_name().unwrap_or_default().to_string());
            }
            if max_items > 0 && ret.len() as i64 >= max_items {
                break;
            }
        }

        Ok(ret)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client()
            .await
            .describe_registry()
            .send()
            .await
            .context("ECR registry ping failed")?;
        Ok(())
    }
}

/// Lister for public ECR registries.
pub struct EcrPublicLister {
    region: String,
    account: String,
    profile: Option<String>,
}

impl EcrPublicLister {
    pub fn new(region: &str, account: &str, profile: Option<String>) -> Self {
        let region = if region.is_empty() {
            "us-east-1".to_string()
        } else {
            region.to_string()
        };
        Self {
            region,
            account: account.to_string(),
            profile,
        }
    }

    async fn client(&self) -> aws_sdk_ecrpublic::Client {
        aws_sdk_ecrpublic::Client::new(&aws_conf(&self.region, self.profile.as_deref()).await)
    }
}

#[async_trait]
impl ListSource for EcrPublicLister {
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>> {
        debug!("public ECR retrieving repository list");

        let client = self.client().await;
        let mut req = client.describe_repositories().max_results(PAGE_SIZE);
        if !self.account.is_empty() {
            req = req.registry_id(self.account.as_str());
        }
        let mut pages = req.into_paginator().send();

        let mut ret: Vec<String> = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context("error listing public ECR repositories")?;
            for r in page.repositories() {
                ret.push(r.repository_name().unwrap_or_default().to_string());
            }
            if max_items > 0 && ret.len() as i64 >= max_items {
                break;
            }
        }

        Ok(ret)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client()
            .await
            .describe_registries()
            .max_results(1)
            .send()
            .await
            .context("public ECR registry ping failed")?;
        Ok(())
    }
}

/// Make sure the ECR repository behind `reference` exists, creating it when
/// the describe call reports it missing. Other registry types are assumed to
/// be pre-provisioned.
pub async fn create_ecr_target(
    reference: &str,
    region: &str,
    account: &str,
    public: bool,
    profile: Option<&str>,
) -> Result<()> {
    let (_, repo, _) = util::split_ref(reference);
    if repo.is_empty() {
        return Ok(());
    }

    if public {
        create_public_target(reference, repo, region, account, profile).await
    } else {
        create_private_target(reference, repo, region, account, profile).await
    }
}

async fn create_private_target(
    reference: &str,
    repo: &str,
    region: &str,
    account: &str,
    profile: Option<&str>,
) -> Result<()> {
    let client = aws_sdk_ecr::Client::new(&aws_conf(region, profile).await);

    match client
        .describe_repositories()
        .registry_id(account)
        .repository_names(repo)
        .send()
        .await
    {
        Ok(out) if !out.repositories().is_empty() => {
            info!(%reference, "target already exists");
            return Ok(());
        }
        Ok(_) => {}
        Err(err) => {
            let err = err.into_service_error();
            if !err.is_repository_not_found_exception() {
                return Err(err.into());
            }
        }
    }

    info!(%reference, "creating target");
    client
        .create_repository()
        .repository_name(repo)
        .send()
        .await
        .context("cannot create ECR repository")?;

    Ok(())
}

async fn create_public_target(
    reference: &str,
    repo: &str,
    region: &str,
    account: &str,
    profile: Option<&str>,
) -> Result<()> {
    let region = if region.is_empty() { "us-east-1" } else { region };
    let client = aws_sdk_ecrpublic::Client::new(&aws_conf(region, profile).await);

    // public repositories are addressed by their short name
    let short = repo.split_once('/').map(|(_, r)| r).unwrap_or(repo);
    debug!(long = repo, short, "repo");

    let mut describe = client.describe_repositories().repository_names(short);
    if !account.is_empty() {
        describe = describe.registry_id(account);
    }

    match describe.send().await {
        Ok(out) if !out.repositories().is_empty() => {
            info!(%reference, "public ECR target already exists");
            return Ok(());
        }
        Ok(_) => {}
        Err(err) => {
            let err = err.into_service_error();
            if !err.is_repository_not_found_exception() {
                return Err(err.into());
            }
        }
    }

    info!(%reference, "creating public ECR target");
    client
        .create_repository()
        .repository_name(short)
        .send()
        .await
        .context("cannot create public ECR repository")?;

    Ok(())
}
