use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};

pub const DIGEST_PREFIX: &str = "sha256:";

/// Split an image reference into registry, repository path and tag.
///
/// The segment before the first `/` is only treated as a registry when it
/// contains a `.` or `:`, or equals `localhost`; anything else is part of the
/// repository path (`busybox` and `library/busybox` have no registry). Inside
/// the remainder, the first `:` or `@` (whichever comes first) terminates the
/// repository and starts the tag.
pub fn split_ref(reference: &str) -> (&str, &str, &str) {
    let (reg, mut repo) = match reference.find('/') {
        Some(ix) => {
            let head = &reference[..ix];
            if head.contains('.') || head.contains(':') || head == "localhost" {
                (head, &reference[ix + 1..])
            } else {
                ("", reference)
            }
        }
        None => ("", reference),
    };

    // a registry port would sit left of the first slash, so any ':' found in
    // repo at this point belongs to the tag
    let ix_colon = repo.find(':');
    let ix_at = repo.find('@');

    let ix = match (ix_colon, ix_at) {
        (Some(c), Some(a)) => Some(c.min(a)),
        (Some(c), None) => Some(c),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };

    let mut tag = "";
    if let Some(ix) = ix {
        tag = &repo[ix + 1..];
        repo = &repo[..ix];
    }

    (reg, repo, tag)
}

/// Split a tag into its name and digest parts. A lone `sha256:...` is
/// classified as digest, anything else as name.
pub fn split_tag(tag: &str) -> (&str, &str) {
    let tag = tag.strip_prefix(':').unwrap_or(tag);
    if tag.is_empty() {
        return ("", "");
    }
    match tag.split_once('@') {
        Some((name, digest)) => (name, digest),
        None => {
            if is_digest(tag) {
                ("", tag)
            } else {
                (tag, "")
            }
        }
    }
}

/// Whether tag has or is a name.
pub fn has_name(tag: &str) -> bool {
    !split_tag(tag).0.is_empty()
}

/// Whether tag has or is a digest.
pub fn has_digest(tag: &str) -> bool {
    !split_tag(tag).1.is_empty()
}

/// Whether d is a digest string. This only checks for the `sha256:` prefix,
/// so malformed digests surface as errors downstream instead of costing a
/// regex match on every well-formed one.
pub fn is_digest(d: &str) -> bool {
    d.starts_with(DIGEST_PREFIX)
}

pub fn join_tag(name: &str, digest: &str) -> String {
    if digest.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return digest.to_string();
    }
    format!("{}@{}", name, digest)
}

/// Join ref with tag, inserting `:` or `@` depending on whether tag contains
/// a name part or is purely a digest.
pub fn join_ref_and_tag(reference: &str, tag: &str) -> String {
    if has_name(tag) {
        format!("{}:{}", reference, tag)
    } else {
        format!("{}@{}", reference, tag)
    }
}

/// Join the source and target ref for a sync action each with tag: if tag
/// contains a digest, the source is joined with only the digest and the
/// target with the name part if present (some relays reject combined
/// name+digest references, and some registries reject push-by-digest).
/// Otherwise both sides are joined with the tag name.
pub fn join_refs_and_tag(src_ref: &str, trgt_ref: &str, tag: &str) -> (String, String) {
    let (name, digest) = split_tag(tag);
    if !digest.is_empty() {
        let src = format!("{}@{}", src_ref, digest);
        let trgt = if !name.is_empty() {
            format!("{}:{}", trgt_ref, name)
        } else {
            format!("{}@{}", trgt_ref, digest)
        };
        (src, trgt)
    } else {
        (
            format!("{}:{}", src_ref, name),
            format!("{}:{}", trgt_ref, name),
        )
    }
}

/// Split a platform string `os[/arch[/variant]]` into its components.
pub fn split_platform(p: &str) -> (&str, &str, &str) {
    let (os, rest) = match p.find('/') {
        Some(ix) => (&p[..ix], &p[ix + 1..]),
        None => (p, ""),
    };
    let (arch, variant) = match rest.find('/') {
        Some(ix) => (&rest[..ix], &rest[ix + 1..]),
        None => (rest, ""),
    };
    (os, arch, variant)
}

/// Compile a regular expression, anchoring it to match complete lines when
/// `line_match` is set.
pub fn compile_regex(v: &str, line_match: bool) -> Result<Regex> {
    let mut v = v.to_string();
    if line_match {
        if !v.starts_with('^') {
            v = format!("^{}", v);
        }
        if !v.ends_with('$') {
            v = format!("{}$", v);
        }
    }
    Regex::new(&v).with_context(|| format!("invalid regular expression '{}'", v))
}

/// A line-anchored regex matcher with optional inversion (leading `!`).
#[derive(Debug, Clone)]
pub struct Matcher {
    expr: Regex,
    inverted: bool,
}

impl Matcher {
    pub fn new(r: &str) -> Result<Self> {
        let mut r = r.trim();
        let inverted = r.starts_with('!');
        if inverted {
            r = &r[1..];
        }
        Ok(Self {
            expr: compile_regex(r, true)?,
            inverted,
        })
    }

    pub fn matches(&self, s: &str) -> bool {
        if self.inverted {
            !self.expr.is_match(s)
        } else {
            self.expr.is_match(s)
        }
    }
}

#[derive(Deserialize)]
struct JsonCreds {
    #[serde(rename = "username", default)]
    user: String,
    #[serde(rename = "password", default)]
    pass: String,
}

/// Decode a base64 JSON auth blob (`{"username","password"}`) into the
/// `user:password` form expected by external copy tools. Returns an empty
/// string when the input is empty or cannot be decoded.
pub fn decode_json_auth(auth_base64: &str) -> String {
    if auth_base64.is_empty() {
        return String::new();
    }

    let decoded = match BASE64.decode(auth_base64) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("cannot decode auth: {}", e);
            return String::new();
        }
    };

    match serde_json::from_slice::<JsonCreds>(&decoded) {
        Ok(creds) => format!("{}:{}", creds.user, creds.pass),
        Err(e) => {
            tracing::error!("cannot unmarshal auth: {}", e);
            String::new()
        }
    }
}

/// SHA-1 digest of a file's content.
pub fn compute_sha1(file: &Path) -> Result<Vec<u8>> {
    let mut f = File::open(file)
        .with_context(|| format!("cannot open '{}' for hashing", file.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ref() {
        assert_eq!(split_ref("busybox"), ("", "busybox", ""));
        assert_eq!(split_ref("library/busybox"), ("", "library/busybox", ""));
        assert_eq!(
            split_ref("docker.io/library/busybox"),
            ("docker.io", "library/busybox", "")
        );
        assert_eq!(
            split_ref("docker.io/library/busybox:1.31"),
            ("docker.io", "library/busybox", "1.31")
        );
        assert_eq!(
            split_ref("localhost/test/image:latest"),
            ("localhost", "test/image", "latest")
        );
        assert_eq!(
            split_ref("registry:5000/test/image"),
            ("registry:5000", "test/image", "")
        );
        assert_eq!(
            split_ref("registry:5000/test/image:latest"),
            ("registry:5000", "test/image", "latest")
        );
    }

    #[test]
    fn test_split_ref_with_digest() {
        let d = "sha256:f271e74b17ced29b915d351685fd4644785c6d1559dd1f2d4189a5e851ef753a";
        let by_digest = format!("docker.io/library/alpine@{}", d);
        let (reg, repo, tag) = split_ref(&by_digest);
        assert_eq!(reg, "docker.io");
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, d);

        // with both tag and digest, the tag part starts at the first ':'
        let by_both = format!("docker.io/library/alpine:3.17@{}", d);
        let (_, repo, tag) = split_ref(&by_both);
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, format!("3.17@{}", d));
    }

    #[test]
    fn test_split_tag() {
        let d = "sha256:f271e74b17ced29b915d351685fd4644785c6d1559dd1f2d4189a5e851ef753a";
        assert_eq!(split_tag(""), ("", ""));
        assert_eq!(split_tag("latest"), ("latest", ""));
        assert_eq!(split_tag(d), ("", d));
        let both = format!("3.17@{}", d);
        assert_eq!(split_tag(&both), ("3.17", d));
    }

    #[test]
    fn test_join_tag_roundtrip() {
        let d = "sha256:f271e74b17ced29b915d351685fd4644785c6d1559dd1f2d4189a5e851ef753a";
        for (name, digest) in [("3.17", d), ("3.17", ""), ("", d)] {
            let joined = join_tag(name, digest);
            assert_eq!(split_tag(&joined), (name, digest));
        }
    }

    #[test]
    fn test_join_refs_and_tag() {
        let d = "sha256:f271e74b17ced29b915d351685fd4644785c6d1559dd1f2d4189a5e851ef753a";
        let src_ref = "docker.io/library/alpine";
        let trgt_ref = "registry.example.com/mirror/alpine";

        // name only: both sides get the name
        let (s, t) = join_refs_and_tag(src_ref, trgt_ref, "3.17");
        assert_eq!(s, format!("{}:3.17", src_ref));
        assert_eq!(t, format!("{}:3.17", trgt_ref));

        // digest only: both sides get the digest
        let (s, t) = join_refs_and_tag(src_ref, trgt_ref, d);
        assert_eq!(s, format!("{}@{}", src_ref, d));
        assert_eq!(t, format!("{}@{}", trgt_ref, d));

        // both: source pulls by digest, target pushes by name
        let (s, t) = join_refs_and_tag(src_ref, trgt_ref, &join_tag("3.17", d));
        assert_eq!(s, format!("{}@{}", src_ref, d));
        assert_eq!(t, format!("{}:3.17", trgt_ref));
    }

    #[test]
    fn test_split_platform() {
        assert_eq!(split_platform("linux"), ("linux", "", ""));
        assert_eq!(split_platform("linux/arm64"), ("linux", "arm64", ""));
        assert_eq!(split_platform("linux/arm/v7"), ("linux", "arm", "v7"));
    }

    #[test]
    fn test_matcher() {
        let m = Matcher::new("1\\.26\\.1.*").unwrap();
        assert!(m.matches("1.26.1-musl"));
        assert!(!m.matches("x1.26.1")); // anchored
        let inv = Matcher::new("!.*musl.*").unwrap();
        assert!(!inv.matches("1.26.1-musl"));
        assert!(inv.matches("1.26.1-uclibc"));
    }

    #[test]
    fn test_decode_json_auth() {
        let auth = BASE64.encode(r#"{"username": "johndoe", "password": "secret"}"#);
        assert_eq!(decode_json_auth(&auth), "johndoe:secret");
        assert_eq!(decode_json_auth(""), "");
        assert_eq!(decode_json_auth("not base64!!"), "");
    }
}
