use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::registry::{ecr, ListSourceType, ListerOptions, RegistryKind, RepoList};
use crate::sync::config::ListerDefaults;
use crate::sync::location::Location;
use crate::sync::mapping::Mapping;

pub const MINIMUM_TASK_INTERVAL: i64 = 30;

// tick period used when a zero-interval task is launched periodically
// anyway, e.g. in tests
const DEFAULT_TICK_SECS: u64 = 3;

struct Ticker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// One configured source→target pairing with a schedule.
#[derive(Deserialize)]
pub struct Task {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub interval: i64,
    pub source: Location,
    pub target: Location,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub verbose: bool,

    #[serde(skip)]
    ticker: Option<Ticker>,
    #[serde(skip)]
    last_tick: Option<Instant>,
    #[serde(skip)]
    pub failed: bool,
    #[serde(skip)]
    repo_list: Option<RepoList>,
}

impl Task {
    pub fn validate(&mut self, lister_defaults: &ListerDefaults) -> Result<()> {
        if self.name.is_empty() {
            bail!("a task requires a name");
        }

        if self.interval < 0 {
            bail!("task interval needs to be 0 or a positive integer");
        }
        if 0 < self.interval && self.interval < MINIMUM_TASK_INTERVAL {
            bail!("minimum task interval is {} seconds", MINIMUM_TASK_INTERVAL);
        }

        self.source
            .validate()
            .with_context(|| format!("source registry in task '{}' invalid", self.name))?;
        self.target
            .validate()
            .with_context(|| format!("target registry in task '{}' invalid", self.name))?;

        for m in &mut self.mappings {
            m.validate()
                .with_context(|| format!("invalid mapping in task '{}'", self.name))?;
        }

        // regex mappings resolve against the source's repository list
        if self.mappings.iter().any(|m| m.is_from_regex()) {
            let settings = &self.source.lister;
            let opts = ListerOptions {
                source_type: settings
                    .as_ref()
                    .map(|s| ListSourceType::parse(&s.source_type))
                    .transpose()?,
                search: settings.as_ref().and_then(|s| s.search.clone()),
                aws_profile: settings.as_ref().and_then(|s| s.aws_profile.clone()),
                insecure: self.source.skip_tls_verify,
            };
            let mut list =
                RepoList::new(&self.source.registry, opts, self.source.credentials())
                    .with_context(|| {
                        format!("cannot create repo lister for task '{}'", self.name)
                    })?;
            list.set_max_items(lister_defaults.max_items);
            list.set_cache_duration(lister_defaults.cache_duration()?);
            self.repo_list = Some(list);
        }

        Ok(())
    }

    /// Start the tick loop for this task, sending `index` onto `tx` once
    /// immediately and then every interval.
    pub fn start_ticking(&mut self, index: usize, tx: mpsc::Sender<usize>) {
        debug!(task = %self.name, "task starts ticking");

        let secs = if self.interval > 0 {
            self.interval as u64
        } else {
            DEFAULT_TICK_SECS
        };

        // back-date the last tick so the first fire is never "too soon"
        self.last_tick = Instant::now().checked_sub(Duration::from_secs(secs * 2));

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                tokio::select! {
                    // the first tick completes immediately
                    _ = ticker.tick() => {
                        debug!(task = %name, "task firing");
                        if tx.send(index).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut stop_rx => {
                        debug!(task = %name, "task exiting");
                        return;
                    }
                }
            }
        });

        self.ticker = Some(Ticker {
            stop: stop_tx,
            handle,
        });
    }

    /// Stop the tick loop and wait for it to exit.
    pub async fn stop_ticking(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.stop.send(());
            let _ = ticker.handle.await;
        }
        debug!(task = %self.name, "task exited");
    }

    /// Guard against spurious tick bursts: skip a fire when less than half
    /// the interval has elapsed since the last completed sync.
    pub fn too_soon(&self) -> bool {
        if self.interval == 0 {
            return false;
        }
        match self.last_tick {
            Some(last) => {
                Instant::now() < last + Duration::from_secs(self.interval as u64) / 2
            }
            None => false,
        }
    }

    pub fn mark_ticked(&mut self) {
        self.last_tick = Some(Instant::now());
    }

    pub fn fail(&mut self, failed: bool) {
        self.failed = self.failed || failed;
    }

    /// Resolve one mapping into concrete (source, target) ref pairs. Literal
    /// mappings produce exactly one pair; regex mappings produce one pair
    /// per matching repository of the source.
    pub async fn resolve_mapping(&mut self, index: usize) -> Result<Vec<(String, String)>> {
        let Task {
            mappings,
            repo_list,
            source,
            target,
            ..
        } = self;
        let m = &mappings[index];

        if !m.is_from_regex() {
            return Ok(vec![(
                format!("{}{}", source.registry, m.from),
                format!("{}{}", target.registry, m.map_path(&m.from)),
            )]);
        }

        let list = repo_list
            .as_mut()
            .context("no repo lister bound for regex mapping")?;
        let repos = list.get().await.context("cannot list source repositories")?;

        let mut ret = Vec::new();
        for repo in repos {
            let path = if repo.starts_with('/') {
                repo
            } else {
                format!("/{}", repo)
            };
            if m.matches_repo(&path) {
                ret.push((
                    format!("{}{}", source.registry, path),
                    format!("{}{}", target.registry, m.map_path(&path)),
                ));
            }
        }

        Ok(ret)
    }

    /// Make sure the target repository behind `reference` exists. ECR
    /// registries are provisioned on demand, all others are assumed to be
    /// pre-provisioned.
    pub async fn ensure_target_exists(&self, reference: &str) -> Result<()> {
        match self.target.kind() {
            RegistryKind::EcrPrivate { region, account } => {
                ecr::create_ecr_target(reference, region, account, false, self.target.aws_profile())
                    .await
            }
            RegistryKind::EcrPublic { region, account } => {
                ecr::create_ecr_target(reference, region, account, true, self.target.aws_profile())
                    .await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::config::ListerDefaults;

    fn task(interval: i64) -> Task {
        let yaml = format!(
            r#"
name: test
interval: {}
source:
  registry: registry.example.com
target:
  registry: target.example.com
mappings:
  - from: test/image
"#,
            interval
        );
        let mut t: Task = serde_yaml::from_str(&yaml).unwrap();
        t.validate(&ListerDefaults::default()).unwrap();
        t
    }

    #[test]
    fn test_validation() {
        let mut t = task(0);
        t.name = String::new();
        assert!(t.validate(&ListerDefaults::default()).is_err());

        let mut t = task(0);
        t.interval = 10;
        assert!(t.validate(&ListerDefaults::default()).is_err());

        let mut t = task(0);
        t.interval = -1;
        assert!(t.validate(&ListerDefaults::default()).is_err());

        let mut t = task(0);
        t.interval = 30;
        t.validate(&ListerDefaults::default()).unwrap();
    }

    #[tokio::test]
    async fn test_literal_mapping_resolves_to_one_pair() {
        let mut t = task(0);
        let pairs = t.resolve_mapping(0).await.unwrap();
        assert_eq!(
            pairs,
            vec![(
                "registry.example.com/test/image".to_string(),
                "target.example.com/test/image".to_string(),
            )]
        );
    }

    #[test]
    fn test_too_soon() {
        let mut t = task(30);
        assert!(!t.too_soon());
        t.mark_ticked();
        assert!(t.too_soon());

        // zero-interval tasks are never too soon
        let mut t = task(0);
        t.mark_ticked();
        assert!(!t.too_soon());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_immediately_and_periodically() {
        let mut t = task(30);
        let (tx, mut rx) = mpsc::channel(1);
        t.start_ticking(7, tx);

        // initial fire
        assert_eq!(rx.recv().await, Some(7));
        // next fire one interval later
        let fired = tokio::time::timeout(Duration::from_secs(31), rx.recv())
            .await
            .expect("tick within interval");
        assert_eq!(fired, Some(7));

        t.stop_ticking().await;
        assert!(rx.recv().await.is_none());
    }
}
