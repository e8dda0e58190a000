//! The sync engine: relay selection, one-off and periodic task dispatch,
//! signal handling, config-watch driven restarts, and graceful shutdown.

pub mod config;
pub mod location;
pub mod mapping;
pub mod task;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{error, info};

use crate::relays::docker::{self, DockerRelay};
use crate::relays::skopeo::{self, SkopeoRelay};
use crate::relays::{Relay, SyncOptions};
use crate::sync::config::SyncConfig;
use crate::sync::task::Task;
use crate::sync::watch::ConfigWatcher;
use crate::util;

// events from the config watch are debounced to absorb partial writes
const WATCH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Handle for nudging a running engine from the outside, mainly used by
/// tests: request a shutdown and wait for the engine's acknowledging tick.
#[derive(Clone)]
pub struct SyncHandle {
    shutdown: mpsc::Sender<()>,
    ticks: Arc<Notify>,
}

impl SyncHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(()).await;
        self.wait_for_tick().await;
    }

    pub async fn wait_for_tick(&self) {
        self.ticks.notified().await;
    }
}

pub struct Sync {
    relay: Box<dyn Relay>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    ticks: Arc<Notify>,
}

impl Sync {
    pub fn new(conf: &SyncConfig, dry_run: bool) -> Result<Self> {
        let relay: Box<dyn Relay> = match conf.relay.as_str() {
            id if id == docker::RELAY_ID => Box::new(
                DockerRelay::new(conf.docker.as_ref(), dry_run)
                    .context("cannot create sync relay")?,
            ),
            id if id == skopeo::RELAY_ID => {
                Box::new(SkopeoRelay::new(conf.skopeo.as_ref(), dry_run))
            }
            other => bail!("relay type '{}' not supported", other),
        };

        Ok(Self::with_relay(relay))
    }

    pub fn with_relay(relay: Box<dyn Relay>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            relay,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            ticks: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            shutdown: self.shutdown_tx.clone(),
            ticks: self.ticks.clone(),
        }
    }

    pub async fn dispose(&mut self) {
        if let Err(e) = self.relay.dispose().await {
            error!("error disposing relay: {:#}", e);
        }
    }

    fn tick(&self) {
        self.ticks.notify_one();
    }

    /// Run all matching tasks of the configuration: zero-interval tasks once,
    /// periodic tasks until a signal, shutdown request, or config change
    /// stops the engine. Returns whether a restart (config reload) was
    /// requested; any task failure turns into an error after the loop exits.
    pub async fn sync_from_config(
        &mut self,
        conf: &mut SyncConfig,
        task_filter: &str,
    ) -> Result<bool> {
        self.relay.prepare().await?;

        let filter = if task_filter.is_empty() {
            None
        } else {
            Some(
                util::compile_regex(task_filter, true)
                    .context("invalid task filter expression")?,
            )
        };

        // one-off tasks
        for ix in 0..conf.tasks.len() {
            let t = &conf.tasks[ix];
            if t.interval == 0 && matches_filter(&filter, &t.name) {
                self.sync_task(&mut conf.tasks[ix]).await;
            }
        }

        // periodic tasks
        let (tick_tx, mut tick_rx) = mpsc::channel::<usize>(1);
        let mut ticking = false;

        for ix in 0..conf.tasks.len() {
            let t = &mut conf.tasks[ix];
            if t.interval > 0 && matches_filter(&filter, &t.name) {
                t.start_ticking(ix, tick_tx.clone());
                ticking = true;
            }
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut watcher = ConfigWatcher::new(conf.path(), conf.watch, conf.sha1().to_vec())
            .context("cannot watch config file")?;

        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .context("sync engine already running")?;

        let debounce = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(debounce);
        let mut debounce_armed = false;

        let mut restart = false;

        while ticking {
            info!("waiting for next sync task...");
            tokio::select! {
                Some(ix) = tick_rx.recv() => {
                    self.sync_task(&mut conf.tasks[ix]).await;
                    self.tick();
                }
                _ = sigint.recv() => {
                    info!("received interrupt signal, stopping...");
                    ticking = false;
                }
                _ = sigterm.recv() => {
                    info!("received termination signal, stopping...");
                    ticking = false;
                }
                _ = sighup.recv() => {
                    info!("received hangup signal, restarting...");
                    ticking = false;
                    restart = true;
                }
                event = watcher.next() => {
                    if watcher.is_changed(&event) {
                        debounce.as_mut().reset(Instant::now() + WATCH_DEBOUNCE);
                        debounce_armed = true;
                    }
                }
                _ = &mut debounce, if debounce_armed => {
                    info!("configuration changed, restarting...");
                    ticking = false;
                    restart = true;
                }
                Some(_) = shutdown_rx.recv() => {
                    info!("shutdown flagged, stopping...");
                    ticking = false;
                    self.tick(); // release the shutdown client
                }
            }
        }

        self.shutdown_rx = Some(shutdown_rx);

        let mut errs = false;
        for t in &mut conf.tasks {
            t.stop_ticking().await;
            errs = errs || t.failed;
        }

        if errs {
            bail!("one or more sync tasks had errors, please see log for details");
        }

        info!("all done");
        Ok(restart)
    }

    async fn sync_task(&mut self, t: &mut Task) {
        if t.too_soon() {
            info!(task = %t.name, "task fired too soon, skipping");
            return;
        }

        info!(
            task = %t.name,
            source = %t.source.registry,
            target = %t.target.registry,
            "syncing task"
        );
        t.failed = false;

        for ix in 0..t.mappings.len() {
            info!(
                from = %t.mappings[ix].from,
                to = %t.mappings[ix].to,
                "mapping"
            );

            if let Err(e) = t.source.refresh_auth().await {
                error!("error refreshing source auth: {:#}", e);
                t.fail(true);
                continue;
            }
            if let Err(e) = t.target.refresh_auth().await {
                error!("error refreshing target auth: {:#}", e);
                t.fail(true);
                continue;
            }

            let pairs = match t.resolve_mapping(ix).await {
                Ok(pairs) => pairs,
                Err(e) => {
                    error!("error resolving mapping: {:#}", e);
                    t.fail(true);
                    continue;
                }
            };

            for (src, trgt) in pairs {
                if let Err(e) = t.ensure_target_exists(&trgt).await {
                    error!("cannot ensure target '{}' exists: {:#}", trgt, e);
                    t.fail(true);
                    break;
                }

                let opt = SyncOptions {
                    src_ref: src,
                    src_auth: t.source.get_auth().await,
                    src_skip_tls_verify: t.source.skip_tls_verify,
                    trgt_ref: trgt,
                    trgt_auth: t.target.get_auth().await,
                    trgt_skip_tls_verify: t.target.skip_tls_verify,
                    tags: t.mappings[ix].tag_set().clone(),
                    digests: t.mappings[ix].digests().clone(),
                    platform: t.mappings[ix].platform.clone(),
                    verbose: t.verbose,
                    task: t.name.clone(),
                    index: ix,
                };

                if let Err(e) = self.relay.sync(&opt).await {
                    error!("sync error: {:#}", e);
                    t.fail(true);
                }
            }
        }

        t.mark_ticked();
    }
}

fn matches_filter(filter: &Option<Regex>, name: &str) -> bool {
    match filter {
        Some(re) => re.is_match(name),
        None => true,
    }
}
