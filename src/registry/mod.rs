//! Repository listing: enumerating the repositories of a registry through
//! whichever catalog protocol the registry speaks, behind a shared cache.

pub mod catalog;
pub mod dockerhub;
pub mod ecr;
pub mod index;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::auth::{Credentials, SharedCredentials};

pub const DEFAULT_LISTER_MAX_ITEMS: i64 = 100;

pub fn default_lister_cache_duration() -> Duration {
    Duration::hours(1)
}

/// How a registry classifies by its host name. ECR and GCP registries get
/// dedicated credential refreshers and, for ECR, a dedicated lister.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RegistryKind {
    #[default]
    Plain,
    EcrPrivate {
        region: String,
        account: String,
    },
    EcrPublic {
        region: String,
        account: String,
    },
    Gcr,
    Gar,
}

impl RegistryKind {
    pub fn is_ecr(&self) -> bool {
        matches!(
            self,
            RegistryKind::EcrPrivate { .. } | RegistryKind::EcrPublic { .. }
        )
    }

    pub fn is_gcp(&self) -> bool {
        matches!(self, RegistryKind::Gcr | RegistryKind::Gar)
    }
}

/// Classify a registry host. Private ECR hosts look like
/// `<account>.dkr.ecr.<region>.amazonaws.com[.cn]`, public ECR is
/// `public.ecr.aws` with an optional `<account>:<region>@` prefix, GCR hosts
/// end in `.gcr.io` and Artifact Registry hosts in `-docker.pkg.dev`.
pub fn classify(registry: &str) -> RegistryKind {
    if registry.ends_with("public.ecr.aws") {
        let mut account = String::new();
        let mut region = String::new();
        if let Some(ix) = registry.find('@') {
            account = registry[..ix].to_string();
            if let Some(ix) = account.find(':') {
                region = account[ix + 1..].to_string();
                account.truncate(ix);
            }
        }
        return RegistryKind::EcrPublic { region, account };
    }

    let parts: Vec<&str> = registry.split('.').collect();
    let ecr = (parts.len() == 6 || parts.len() == 7)
        && parts[1] == "dkr"
        && parts[2] == "ecr"
        && parts[4] == "amazonaws"
        && parts[5] == "com"
        && (parts.len() == 6 || parts[6] == "cn");
    if ecr {
        return RegistryKind::EcrPrivate {
            region: parts[3].to_string(),
            account: parts[0].to_string(),
        };
    }

    if registry.ends_with(".gcr.io") {
        return RegistryKind::Gcr;
    }
    if registry.ends_with("-docker.pkg.dev") {
        return RegistryKind::Gar;
    }

    RegistryKind::Plain
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ListSourceType {
    Catalog,
    DockerHub,
    Index,
}

impl ListSourceType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "catalog" => Ok(ListSourceType::Catalog),
            "dockerhub" => Ok(ListSourceType::DockerHub),
            "index" => Ok(ListSourceType::Index),
            other => bail!("invalid list source type '{}'", other),
        }
    }
}

/// A source of repository paths in a registry.
#[async_trait]
pub trait ListSource: Send + Sync {
    /// Retrieve up to `max_items` repository paths; zero or negative means
    /// unlimited.
    async fn retrieve(&mut self, max_items: i64) -> Result<Vec<String>>;
    async fn ping(&mut self) -> Result<()>;
}

/// Options for constructing a [`RepoList`], beyond what the registry host
/// itself determines.
#[derive(Debug, Clone, Default)]
pub struct ListerOptions {
    pub source_type: Option<ListSourceType>,
    pub search: Option<String>,
    pub aws_profile: Option<String>,
    pub insecure: bool,
}

/// The repository lister for one registry: a chosen [`ListSource`] behind an
/// expiring cache.
pub struct RepoList {
    registry: String,
    source: Box<dyn ListSource>,
    max_items: i64,
    cache_duration: Duration,
    expiry: DateTime<Utc>,
    repos: Option<Vec<String>>,
}

impl RepoList {
    pub fn new(registry: &str, opts: ListerOptions, creds: SharedCredentials) -> Result<Self> {
        let server = registry.split(':').next().unwrap_or_default();

        // DockerHub does not expose the registry catalog API, but separate
        // listing and searching APIs with their own token scheme, so the
        // credentials are cloned for list use
        let mut list_creds = creds;
        if server == "registry.hub.docker.com" {
            let cloned = {
                let guard = list_creds.try_lock().expect("credentials locked during setup");
                Credentials::from_basic(guard.username(), guard.password())
            };
            list_creds = SharedCredentials::new(cloned.into());
            if !matches!(
                opts.source_type,
                Some(ListSourceType::DockerHub) | Some(ListSourceType::Index)
            ) {
                bail!("DockerHub only supports list types 'dockerhub' and 'index'");
            }
        }

        let source: Box<dyn ListSource> = match opts.source_type {
            Some(ListSourceType::DockerHub) => Box::new(dockerhub::DockerHubLister::new(list_creds)),

            Some(ListSourceType::Index) => match &opts.search {
                Some(filter) if !filter.is_empty() => Box::new(index::IndexLister::new(
                    registry,
                    filter,
                    opts.insecure,
                    list_creds,
                )),
                _ => bail!("index lister requires a search expression"),
            },

            Some(ListSourceType::Catalog) | None => match classify(registry) {
                // the standard catalog API does not paginate under ECR (it
                // needs a non-standard NextToken), so ECR registries always
                // get the SDK-based lister
                RegistryKind::EcrPrivate { region, account } => {
                    info!("using dedicated ECR lister instead of standard catalog");
                    Box::new(ecr::EcrLister::new(
                        &region,
                        &account,
                        opts.aws_profile.clone(),
                    ))
                }
                RegistryKind::EcrPublic { region, account } => {
                    info!("using dedicated public ECR lister instead of standard catalog");
                    Box::new(ecr::EcrPublicLister::new(
                        &region,
                        &account,
                        opts.aws_profile.clone(),
                    ))
                }
                kind => Box::new(catalog::CatalogLister::new(
                    registry,
                    opts.insecure,
                    kind.is_gcp(),
                    list_creds,
                )),
            },
        };

        Ok(Self {
            registry: registry.to_string(),
            source,
            max_items: DEFAULT_LISTER_MAX_ITEMS,
            cache_duration: default_lister_cache_duration(),
            expiry: Utc::now(),
            repos: None,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn set_max_items(&mut self, max: i64) {
        self.max_items = max;
    }

    pub fn set_cache_duration(&mut self, d: Duration) {
        self.cache_duration = d;
        self.expiry = Utc::now();
        self.repos = None;
    }

    fn is_cache_valid(&self) -> bool {
        self.repos.is_some() && Utc::now() < self.expiry
    }

    /// The repository paths of this registry, from cache while valid.
    pub async fn get(&mut self) -> Result<Vec<String>> {
        if self.is_cache_valid() {
            debug!("repository list still valid, re-using");
            return Ok(self.repos.clone().unwrap_or_default());
        }

        self.repos = None;
        debug!("retrieving repository list");

        let repos = self.source.retrieve(self.max_items).await?;
        if self.cache_duration > Duration::zero() {
            debug!("caching repository list");
            self.expiry = Utc::now() + self.cache_duration;
            self.repos = Some(repos.clone());
        } else {
            debug!("not caching repository list");
        }
        Ok(repos)
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.source.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("123456789012.dkr.ecr.eu-west-1.amazonaws.com"),
            RegistryKind::EcrPrivate {
                region: "eu-west-1".to_string(),
                account: "123456789012".to_string(),
            }
        );
        assert_eq!(
            classify("123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn"),
            RegistryKind::EcrPrivate {
                region: "cn-north-1".to_string(),
                account: "123456789012".to_string(),
            }
        );
        assert_eq!(
            classify("public.ecr.aws"),
            RegistryKind::EcrPublic {
                region: String::new(),
                account: String::new(),
            }
        );
        assert_eq!(
            classify("123456789012:us-east-1@public.ecr.aws"),
            RegistryKind::EcrPublic {
                region: "us-east-1".to_string(),
                account: "123456789012".to_string(),
            }
        );
        assert_eq!(classify("eu.gcr.io"), RegistryKind::Gcr);
        assert_eq!(classify("europe-west3-docker.pkg.dev"), RegistryKind::Gar);
        assert_eq!(classify("registry.example.com:5000"), RegistryKind::Plain);
        assert_eq!(classify("docker.io"), RegistryKind::Plain);
    }

    #[test]
    fn test_list_source_type_parse() {
        assert_eq!(
            ListSourceType::parse("catalog").unwrap(),
            ListSourceType::Catalog
        );
        assert_eq!(
            ListSourceType::parse("dockerhub").unwrap(),
            ListSourceType::DockerHub
        );
        assert_eq!(ListSourceType::parse("index").unwrap(), ListSourceType::Index);
        assert!(ListSourceType::parse("bogus").is_err());
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ListSource for Counting {
        async fn retrieve(&mut self, _max_items: i64) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["library/busybox".to_string()])
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn counting_list(cache: Duration) -> (RepoList, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = RepoList {
            registry: "registry.example.com".to_string(),
            source: Box::new(Counting {
                calls: calls.clone(),
            }),
            max_items: DEFAULT_LISTER_MAX_ITEMS,
            cache_duration: cache,
            expiry: Utc::now(),
            repos: None,
        };
        (list, calls)
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_second_retrieve() {
        let (mut list, calls) = counting_list(Duration::hours(1));
        list.get().await.unwrap();
        let repos = list.get().await.unwrap();
        assert_eq!(repos, vec!["library/busybox"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_cache_duration_disables_caching() {
        let (mut list, calls) = counting_list(Duration::zero());
        list.get().await.unwrap();
        list.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dockerhub_registry_requires_hub_lister() {
        let creds = SharedCredentials::default();
        let res = RepoList::new(
            "registry.hub.docker.com",
            ListerOptions {
                source_type: Some(ListSourceType::Catalog),
                ..Default::default()
            },
            creds,
        );
        assert!(res.is_err());
    }
}
