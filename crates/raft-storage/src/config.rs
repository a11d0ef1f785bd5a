//! # config
//!
//! why: collect everything a log instance needs before it is opened
//! relations: consumed by log.rs; codec.rs supplies the default codec
//! what: LogConfig builder, LogHooks trait, NoopHooks

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::{Codec, Crc32Codec};
use crate::error::Result;
use crate::Seq;

/// default number of index entries read per iterator batch
pub const DEFAULT_STEP: usize = 64;

/// callbacks run at fixed points of the durability protocol
#[async_trait]
pub trait LogHooks: Send + Sync + 'static {
    /// runs once data up to `seq` is durable, before the lock record is cleared
    async fn pre_commit(&self, _seq: Seq) -> Result<()> {
        Ok(())
    }

    /// runs once a truncation down to `seq` is durable
    async fn post_truncate(&self, _seq: Seq) -> Result<()> {
        Ok(())
    }
}

/// hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LogHooks for NoopHooks {}

/// construction parameters for a [`crate::Log`]
#[derive(Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub name: String,
    pub step: usize,
    pub codec: Arc<dyn Codec>,
    pub hooks: Arc<dyn LogHooks>,
}

impl LogConfig {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            step: DEFAULT_STEP,
            codec: Arc::new(Crc32Codec),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// index entries fetched per iterator batch (at least 1)
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step.max(1);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LogHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn body_path(&self) -> PathBuf {
        self.stream_path("body")
    }

    pub fn index_path(&self) -> PathBuf {
        self.stream_path("index")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.stream_path("lock")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stream_path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, ext))
    }
}

impl fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}
