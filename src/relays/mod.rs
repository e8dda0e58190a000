//! Relays physically move image bytes from source to target. The engine
//! only sees the contract: bring the relay up once, hand it fully
//! materialised sync options per mapping, dispose on shutdown.

pub mod docker;
pub mod skopeo;

use anyhow::Result;
use async_trait::async_trait;

use crate::tags::{DigestList, TagSet};

/// Everything a relay needs for one sync action. An image digest is
/// formatted like `sha256:f271e74b17ce...`; references carrying both a tag
/// and a digest are not given to relays, the digest list travels separately.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub src_ref: String,
    pub src_auth: String,
    pub src_skip_tls_verify: bool,

    pub trgt_ref: String,
    pub trgt_auth: String,
    pub trgt_skip_tls_verify: bool,

    pub tags: TagSet,
    pub digests: DigestList,
    pub platform: String,
    pub verbose: bool,

    pub task: String,
    pub index: usize,
}

#[async_trait]
pub trait Relay: Send {
    /// Bring-up, e.g. wait for a daemon or probe an external binary.
    async fn prepare(&mut self) -> Result<()>;

    /// Release resources.
    async fn dispose(&mut self) -> Result<()>;

    /// Copy the selected tags of one ref pair. Per-tag errors are logged and
    /// aggregated; the remaining tags are still attempted.
    async fn sync(&mut self, opt: &SyncOptions) -> Result<()>;
}
