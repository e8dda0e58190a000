use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use dregsy::relays::{Relay, SyncOptions};
use dregsy::sync::{config, Sync};

#[derive(Default)]
struct RecordingRelay {
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl Relay for RecordingRelay {
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }

    async fn sync(&mut self, _opt: &SyncOptions) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        Ok(())
    }
}

const CONFIG: &str = r#"relay: skopeo
watch: true
tasks:
  - name: watched
    interval: 60
    source:
      registry: registry.example.com
    target:
      registry: target.example.com
    mappings:
      - from: test/image
        tags: ["latest"]
"#;

/// Rewriting the watched config file makes the engine leave its loop with a
/// restart request, within the debounce window (5s) plus some slack.
#[tokio::test]
async fn restart_on_config_change() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let mut conf = config::load_config(&path).unwrap();

    let relay = RecordingRelay::default();
    let calls = relay.calls.clone();
    let mut sync = Sync::with_relay(Box::new(relay));
    let handle = sync.handle();

    let engine = tokio::spawn(async move { sync.sync_from_config(&mut conf, "").await });

    // wait until the initial tick's sync went through, then rewrite the file
    handle.wait_for_tick().await;
    assert_eq!(*calls.lock().unwrap(), 1);

    let rewritten = Instant::now();
    let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(f, "# rotated").unwrap();
    f.flush().unwrap();
    drop(f);

    let restart = tokio::time::timeout(Duration::from_secs(10), engine)
        .await
        .expect("engine exits after config change")
        .unwrap()
        .unwrap();

    assert!(restart, "config change must request a restart");
    let elapsed = rewritten.elapsed();
    assert!(
        elapsed >= Duration::from_secs(4),
        "engine exited before the debounce window: {:?}",
        elapsed
    );
}
