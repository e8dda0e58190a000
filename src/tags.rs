//! The tag selection language: verbatim names, semver ranges, regular
//! expressions, keep filters and latest-N reduction, expanded against the
//! live tag list of a source repository.

use std::collections::BTreeSet;
use std::future::Future;

use anyhow::{bail, Context, Result};
use semver::Version;
use tracing::debug;

use crate::util::{self, Matcher};

pub const SEMVER_PREFIX: &str = "semver:";
pub const REGEX_PREFIX: &str = "regex:";
pub const KEEP_PREFIX: &str = "keep:";

const KEEP_LATEST: &str = "latest";

/// A composite tag selector, built from the raw entries of a mapping's
/// `tags` list.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    verbatim: Vec<String>,
    semver: Vec<SemverRange>,
    regex: Vec<Matcher>,
    keep: Vec<Matcher>,
    keep_latest: Option<usize>,
}

impl TagSet {
    pub fn new(tags: &[String]) -> Result<Self> {
        let mut ret = TagSet::default();
        for t in tags {
            if let Some(range) = t.strip_prefix(SEMVER_PREFIX) {
                ret.semver.push(
                    SemverRange::parse(range)
                        .with_context(|| format!("invalid semver range '{}'", range))?,
                );
            } else if let Some(re) = t.strip_prefix(REGEX_PREFIX) {
                ret.regex.push(Matcher::new(re)?);
            } else if let Some(keep) = t.strip_prefix(KEEP_PREFIX) {
                ret.add_keep(keep)?;
            } else {
                ret.verbatim.push(t.clone());
            }
        }
        Ok(ret)
    }

    fn add_keep(&mut self, keep: &str) -> Result<()> {
        let keep = keep.trim();
        if let Some(count) = keep.strip_prefix(KEEP_LATEST) {
            let count = count.trim();
            if !count.is_empty() {
                let n: usize = count
                    .parse()
                    .with_context(|| format!("invalid keep count '{}'", count))?;
                if self.keep_latest.is_some() {
                    bail!("only one 'keep: latest <n>' entry is allowed");
                }
                self.keep_latest = Some(n);
                return Ok(());
            }
        }
        self.keep.push(Matcher::new(keep)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.verbatim.is_empty()
            && self.semver.is_empty()
            && self.regex.is_empty()
            && self.keep.is_empty()
            && self.keep_latest.is_none()
    }

    pub fn has_verbatim(&self) -> bool {
        !self.verbatim.is_empty()
    }

    pub fn has_semver(&self) -> bool {
        !self.semver.is_empty()
    }

    pub fn has_regex(&self) -> bool {
        !self.regex.is_empty()
    }

    /// Whether expanding this tag set requires the live tag list of the
    /// source repository.
    pub fn needs_expansion(&self) -> bool {
        self.is_empty() || self.has_semver() || self.has_regex()
    }

    /// Expand this tag set into the sorted, deduplicated list of tags to
    /// sync. `lister` is only invoked when the expansion needs the live tag
    /// list.
    pub async fn expand<F, Fut>(&self, lister: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let mut set: BTreeSet<String> = BTreeSet::new();

        if self.needs_expansion() {
            let tags = lister()
                .await
                .context("failed listing tags during tag set expansion")?;

            if !self.has_semver() && !self.has_regex() {
                // tag set is completely empty
                set.extend(tags);
            } else {
                for t in &tags {
                    if let Some(v) = parse_tolerant(t) {
                        if self.semver.iter().any(|r| r.matches(&v)) {
                            set.insert(t.clone());
                            continue;
                        }
                    }
                    if self.regex.iter().any(|m| m.matches(t)) {
                        set.insert(t.clone());
                    }
                }
            }
        }

        // verbatim tags go in unconditionally: they need not exist on the
        // source, which allows exact-name sync even when listing is denied
        if self.has_verbatim() {
            debug!("verbatim tags: {:?}", self.verbatim);
            set.extend(self.verbatim.iter().cloned());
        }

        if !self.keep.is_empty() {
            set.retain(|t| self.keep.iter().all(|k| k.matches(t)));
        }

        let set = self.apply_keep_latest(set);

        Ok(set.into_iter().collect())
    }

    /// Retain at most N tags. When the set contains parseable semvers, the N
    /// highest versions survive and non-semver tags pass through untouched;
    /// otherwise the lexicographically last N survive.
    fn apply_keep_latest(&self, set: BTreeSet<String>) -> BTreeSet<String> {
        let n = match self.keep_latest {
            Some(n) if n > 0 => n,
            _ => return set,
        };

        let mut versions: Vec<(Version, String)> = Vec::new();
        let mut rest: BTreeSet<String> = BTreeSet::new();

        for t in set {
            match parse_tolerant(&t) {
                Some(v) => versions.push((v, t)),
                None => {
                    rest.insert(t);
                }
            }
        }

        if versions.is_empty() {
            let len = rest.len();
            return rest.into_iter().skip(len.saturating_sub(n)).collect();
        }

        versions.sort_by(|a, b| b.0.cmp(&a.0));
        rest.extend(versions.into_iter().take(n).map(|(_, t)| t));
        rest
    }
}

/// A blang-style semver range: comparators separated by whitespace form a
/// conjunction, `||` separates alternatives. Pre-release versions take part
/// in ordinary version ordering, so `>=1.31.0 <1.32.0` accepts
/// `1.31.1-musl`.
#[derive(Debug, Clone)]
pub struct SemverRange {
    groups: Vec<Vec<Comparator>>,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl SemverRange {
    pub fn parse(expr: &str) -> Result<Self> {
        let mut groups = Vec::new();
        for group in expr.split("||") {
            let mut comparators = Vec::new();
            for term in group.split_whitespace() {
                comparators.push(Comparator::parse(term)?);
            }
            if comparators.is_empty() {
                bail!("empty range expression");
            }
            groups.push(comparators);
        }
        Ok(Self { groups })
    }

    pub fn matches(&self, v: &Version) -> bool {
        self.groups
            .iter()
            .any(|g| g.iter().all(|c| c.matches(v)))
    }
}

impl Comparator {
    fn parse(term: &str) -> Result<Self> {
        let (op, rest) = if let Some(r) = term.strip_prefix(">=") {
            (Op::Ge, r)
        } else if let Some(r) = term.strip_prefix("<=") {
            (Op::Le, r)
        } else if let Some(r) = term.strip_prefix("!=") {
            (Op::Ne, r)
        } else if let Some(r) = term.strip_prefix("==") {
            (Op::Eq, r)
        } else if let Some(r) = term.strip_prefix('>') {
            (Op::Gt, r)
        } else if let Some(r) = term.strip_prefix('<') {
            (Op::Lt, r)
        } else if let Some(r) = term.strip_prefix('=') {
            (Op::Eq, r)
        } else {
            (Op::Eq, term)
        };

        let version = parse_tolerant(rest)
            .with_context(|| format!("invalid version in range term '{}'", term))?;

        Ok(Self { op, version })
    }

    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => *v == self.version,
            Op::Ne => *v != self.version,
            Op::Lt => *v < self.version,
            Op::Le => *v <= self.version,
            Op::Gt => *v > self.version,
            Op::Ge => *v >= self.version,
        }
    }
}

/// Parse a version leniently: a leading `v` is stripped and missing minor or
/// patch components are padded with zeroes, so `1.31` parses as `1.31.0`.
/// Returns `None` for strings that are not versions at all.
pub fn parse_tolerant(s: &str) -> Option<Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);

    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }

    // pad the numeric core to three components, keeping any pre-release or
    // build suffix
    let core_end = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(core_end);
    let missing = 2usize.saturating_sub(core.matches('.').count());
    let padded = format!("{}{}{}", core, ".0".repeat(missing), suffix);

    Version::parse(&padded).ok()
}

/// A list of image digests from a mapping's tag entries, synced verbatim and
/// bypassing tag expansion. Skopeo rejects references carrying both a tag
/// and a digest, so digests travel separately from the tag set.
#[derive(Debug, Clone, Default)]
pub struct DigestList {
    digests: Vec<String>,
}

impl DigestList {
    pub fn new(digests: &[String]) -> Result<Self> {
        for d in digests {
            if !is_valid_digest(d) {
                bail!("invalid digest '{}': expected sha256:<64 lowercase hex>", d);
            }
        }
        Ok(Self {
            digests: digests.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.digests.iter()
    }
}

fn is_valid_digest(d: &str) -> bool {
    match d.strip_prefix(util::DIGEST_PREFIX) {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
        None => false,
    }
}
