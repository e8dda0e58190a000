use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::tags::{DigestList, TagSet};
use crate::util;

const REGEX_PREFIX: &str = "regex:";

/// A source/target path pair within a task, with tag and platform
/// selection. `from` is either a literal repository path or a regex over the
/// source's repository list; `to` is a literal path, a prefix (when `from`
/// is a regex), or a `regex:PATTERN,REPLACEMENT` substitution.
#[derive(Deserialize, Default)]
pub struct Mapping {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub platform: String,

    #[serde(skip)]
    from_expr: Option<Regex>,
    #[serde(skip)]
    to_expr: Option<(Regex, String)>,
    #[serde(skip)]
    tag_set: TagSet,
    #[serde(skip)]
    digests: DigestList,
}

impl Mapping {
    pub fn validate(&mut self) -> Result<()> {
        if self.from.is_empty() {
            bail!("mapping without 'from' path");
        }

        if let Some(pattern) = self.from.strip_prefix(REGEX_PREFIX) {
            self.from_expr = Some(
                util::compile_regex(pattern.trim(), true)
                    .with_context(|| format!("invalid 'from' expression '{}'", pattern))?,
            );
        } else {
            self.from = normalize_path(&self.from);
        }

        if let Some(subst) = self.to.strip_prefix(REGEX_PREFIX) {
            let Some((pattern, replacement)) = subst.split_once(',') else {
                bail!("'to' substitution '{}' is missing a replacement", subst);
            };
            let expr = Regex::new(pattern.trim())
                .with_context(|| format!("invalid 'to' expression '{}'", pattern))?;
            self.to_expr = Some((expr, replacement.trim().to_string()));
        } else if !self.to.is_empty() {
            self.to = normalize_path(&self.to);
        }

        // digest entries bypass tag expansion and travel separately
        let (digests, tags): (Vec<String>, Vec<String>) = self
            .tags
            .iter()
            .cloned()
            .partition(|t| util::is_digest(t));
        self.digests = DigestList::new(&digests)?;
        self.tag_set = TagSet::new(&tags)
            .with_context(|| format!("invalid tag set in mapping '{}'", self.from))?;

        Ok(())
    }

    pub fn is_from_regex(&self) -> bool {
        self.from_expr.is_some()
    }

    /// Whether a repository path from the source's repo list is selected by
    /// this mapping's `from` expression.
    pub fn matches_repo(&self, path: &str) -> bool {
        match &self.from_expr {
            Some(expr) => expr.is_match(path),
            None => false,
        }
    }

    /// Map a source repository path to the target path.
    pub fn map_path(&self, path: &str) -> String {
        if let Some((expr, replacement)) = &self.to_expr {
            return expr.replace_all(path, replacement.as_str()).into_owned();
        }
        if self.to.is_empty() {
            return path.to_string();
        }
        if self.is_from_regex() {
            // a literal 'to' acts as a prefix for regex-matched paths
            return format!("{}{}", self.to, path);
        }
        self.to.clone()
    }

    pub fn tag_set(&self) -> &TagSet {
        &self.tag_set
    }

    pub fn digests(&self) -> &DigestList {
        &self.digests
    }
}

fn normalize_path(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{}", p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(from: &str, to: &str) -> Mapping {
        let mut m = Mapping {
            from: from.to_string(),
            to: to.to_string(),
            ..Default::default()
        };
        m.validate().unwrap();
        m
    }

    #[test]
    fn test_from_required() {
        let mut m = Mapping::default();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_paths_get_normalized() {
        let m = mapping("library/busybox", "mirror/busybox");
        assert_eq!(m.from, "/library/busybox");
        assert_eq!(m.to, "/mirror/busybox");
    }

    #[test]
    fn test_literal_to_literal() {
        let m = mapping("library/busybox", "mirror/busybox");
        assert_eq!(m.map_path("/library/busybox"), "/mirror/busybox");
    }

    #[test]
    fn test_literal_without_to_keeps_path() {
        let m = mapping("library/busybox", "");
        assert_eq!(m.map_path("/library/busybox"), "/library/busybox");
    }

    #[test]
    fn test_regex_from_with_prefix_to() {
        let m = mapping("regex:/library/.*", "mirror");
        assert!(m.is_from_regex());
        assert!(m.matches_repo("/library/busybox"));
        assert!(!m.matches_repo("/other/busybox"));
        assert_eq!(m.map_path("/library/busybox"), "/mirror/library/busybox");
    }

    #[test]
    fn test_regex_substitution_to() {
        let m = mapping("regex:/library/.*", "regex:^/library/(.*),/mirror/$1");
        assert_eq!(m.map_path("/library/busybox"), "/mirror/busybox");
    }

    #[test]
    fn test_substitution_requires_replacement() {
        let mut m = Mapping {
            from: "library/busybox".to_string(),
            to: "regex:^/library/(.*)".to_string(),
            ..Default::default()
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_digest_entries_split_from_tags() {
        let d = "sha256:1d8a02c7e2bf5b547ccac7d1c272ab1a2d8f4d16bf486e12e05ba2b26a3573ea";
        let mut m = Mapping {
            from: "library/busybox".to_string(),
            tags: vec!["1.31".to_string(), d.to_string()],
            ..Default::default()
        };
        m.validate().unwrap();
        assert!(!m.digests().is_empty());
        assert!(!m.tag_set().is_empty());
        assert!(!m.tag_set().needs_expansion());
    }
}
