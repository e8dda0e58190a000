use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::registry;
use crate::relays::docker::{self, DockerConfig};
use crate::relays::skopeo::{self, SkopeoConfig};
use crate::sync::task::Task;
use crate::util;

/// Defaults applied to every task's repository lister.
#[derive(Debug, Clone, Deserialize)]
pub struct ListerDefaults {
    #[serde(rename = "maxItems", default = "default_max_items")]
    pub max_items: i64,
    #[serde(rename = "cacheDuration", default)]
    pub cache_duration: Option<String>,
}

fn default_max_items() -> i64 {
    registry::DEFAULT_LISTER_MAX_ITEMS
}

impl Default for ListerDefaults {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            cache_duration: None,
        }
    }
}

impl ListerDefaults {
    /// The cache duration as a chrono duration; a leading `-` (or zero)
    /// disables caching.
    pub fn cache_duration(&self) -> Result<chrono::Duration> {
        let raw = match &self.cache_duration {
            Some(d) => d.trim(),
            None => return Ok(registry::default_lister_cache_duration()),
        };
        if let Some(negated) = raw.strip_prefix('-') {
            parse_duration(negated)?;
            return Ok(chrono::Duration::zero());
        }
        chrono::Duration::from_std(parse_duration(raw)?)
            .context("lister cache duration out of range")
    }
}

/// The top-level sync configuration, loaded from YAML.
#[derive(Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub relay: String,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub skopeo: Option<SkopeoConfig>,
    // deprecated top-level docker settings, folded into `docker` on load
    #[serde(default)]
    pub dockerhost: String,
    #[serde(rename = "api-version", default)]
    pub api_version: String,
    #[serde(default)]
    pub lister: Option<ListerDefaults>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    sha1: Vec<u8>,
}

impl SyncConfig {
    fn validate(&mut self) -> Result<()> {
        if self.relay.is_empty() {
            self.relay = docker::RELAY_ID.to_string();
        }

        match self.relay.as_str() {
            id if id == docker::RELAY_ID => {
                if self.docker.is_none() {
                    if self.dockerhost.is_empty() && self.api_version.is_empty() {
                        warn!("not specifying the 'docker' config item is deprecated");
                    }
                    if !self.dockerhost.is_empty() {
                        warn!(
                            "the top-level 'dockerhost' setting is deprecated, \
                             use 'docker' config item instead"
                        );
                    }
                    if !self.api_version.is_empty() {
                        warn!(
                            "the top-level 'api-version' setting is deprecated, \
                             use 'docker' config item instead"
                        );
                    }
                    self.docker = Some(DockerConfig {
                        dockerhost: std::mem::take(&mut self.dockerhost),
                        api_version: std::mem::take(&mut self.api_version),
                    });
                } else {
                    if !self.dockerhost.is_empty() {
                        warn!(
                            "discarding deprecated top-level 'dockerhost' setting and \
                             using 'docker' config item instead"
                        );
                        self.dockerhost = String::new();
                    }
                    if !self.api_version.is_empty() {
                        warn!(
                            "discarding deprecated top-level 'api-version' setting and \
                             using 'docker' config item instead"
                        );
                        self.api_version = String::new();
                    }
                }
            }

            id if id == skopeo::RELAY_ID => {
                if !self.dockerhost.is_empty() {
                    bail!(
                        "setting 'dockerhost' implies '{}' relay, but relay is set to '{}'",
                        docker::RELAY_ID,
                        self.relay
                    );
                }
            }

            other => bail!(
                "invalid relay type: '{}', must be either '{}' or '{}'",
                other,
                docker::RELAY_ID,
                skopeo::RELAY_ID
            ),
        }

        if self.tasks.is_empty() {
            bail!("no sync tasks defined");
        }

        let lister_defaults = self.lister.clone().unwrap_or_default();
        for t in &mut self.tasks {
            t.validate(&lister_defaults)?;

            for m in &t.mappings {
                if !m.platform.is_empty() {
                    match self.relay.as_str() {
                        id if id == docker::RELAY_ID => docker::platform_supported(&m.platform)?,
                        _ => skopeo::platform_supported(&m.platform)?,
                    }
                }
            }
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha1(&self) -> &[u8] {
        &self.sha1
    }
}

/// Load and validate the sync configuration from a YAML file.
pub fn load_config(file: &Path) -> Result<SyncConfig> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("error loading config file '{}'", file.display()))?;

    let mut config: SyncConfig = serde_yaml::from_str(&data)
        .with_context(|| format!("error parsing config file '{}'", file.display()))?;

    config.validate()?;

    config.path = file.to_path_buf();
    config.sha1 = util::compute_sha1(file)?;

    Ok(config)
}

/// Parse a duration string (e.g. "30s", "10m", "12h", "7d").
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("duration string is empty");
    }

    // a bare number counts as seconds
    if let Ok(num) = s.parse::<u64>() {
        return Ok(Duration::from_secs(num));
    }

    let (num_str, unit) = if let Some(num_str) = s.strip_suffix("ms") {
        (num_str, "ms")
    } else {
        (&s[..s.len() - 1], &s[s.len() - 1..])
    };

    let num: u64 = num_str.parse().context("invalid duration number")?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => bail!("invalid duration unit '{}', use ms, s, m, h or d", unit),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    const BASE_TASKS: &str = r#"
tasks:
  - name: test
    interval: 60
    source:
      registry: registry.example.com
    target:
      registry: target.example.com
    mappings:
      - from: test/image
        to: archive/image
"#;

    #[test]
    fn test_load_minimal_config() {
        let f = write_config(BASE_TASKS);
        let conf = load_config(f.path()).unwrap();
        assert_eq!(conf.relay, "docker");
        assert!(conf.docker.is_some());
        assert_eq!(conf.tasks.len(), 1);
        assert_eq!(conf.tasks[0].mappings[0].from, "/test/image");
        assert!(!conf.sha1().is_empty());
    }

    #[test]
    fn test_legacy_dockerhost_is_folded() {
        let yaml = format!("dockerhost: unix:///var/run/docker.sock\n{}", BASE_TASKS);
        let f = write_config(&yaml);
        let conf = load_config(f.path()).unwrap();
        assert!(conf.dockerhost.is_empty());
        assert_eq!(
            conf.docker.unwrap().dockerhost,
            "unix:///var/run/docker.sock"
        );
    }

    #[test]
    fn test_nested_docker_wins_over_legacy() {
        let yaml = format!(
            "dockerhost: tcp://old:2375\ndocker:\n  dockerhost: unix:///var/run/docker.sock\n{}",
            BASE_TASKS
        );
        let f = write_config(&yaml);
        let conf = load_config(f.path()).unwrap();
        assert!(conf.dockerhost.is_empty());
        assert_eq!(
            conf.docker.unwrap().dockerhost,
            "unix:///var/run/docker.sock"
        );
    }

    #[test]
    fn test_skopeo_relay_rejects_dockerhost() {
        let yaml = format!(
            "relay: skopeo\ndockerhost: unix:///var/run/docker.sock\n{}",
            BASE_TASKS
        );
        let f = write_config(&yaml);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_invalid_relay_rejected() {
        let yaml = format!("relay: teleport\n{}", BASE_TASKS);
        let f = write_config(&yaml);
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_tasks_required() {
        let f = write_config("relay: skopeo\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_docker_relay_rejects_platform_all() {
        let yaml = r#"
tasks:
  - name: test
    source:
      registry: registry.example.com
    target:
      registry: target.example.com
    mappings:
      - from: test/image
        platform: all
"#;
        let f = write_config(yaml);
        assert!(load_config(f.path()).is_err());

        let yaml = format!("relay: skopeo{}", yaml);
        let f = write_config(&yaml);
        assert!(load_config(f.path()).is_ok());
    }

    #[test]
    fn test_lister_defaults() {
        let defaults = ListerDefaults::default();
        assert_eq!(defaults.max_items, 100);
        assert_eq!(
            defaults.cache_duration().unwrap(),
            chrono::Duration::hours(1)
        );

        let defaults = ListerDefaults {
            max_items: -1,
            cache_duration: Some("-1s".to_string()),
        };
        assert_eq!(defaults.cache_duration().unwrap(), chrono::Duration::zero());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10y").is_err());
    }
}
