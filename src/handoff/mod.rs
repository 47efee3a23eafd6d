//! Where finished captures go once the pipeline is done with them.

pub mod messages;
pub mod nats;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::capture::CaptureResult;

pub use messages::CaptureMessage;
pub use nats::{capture_message, capture_subject, NatsSink};

#[async_trait::async_trait]
pub trait CaptureSink: Send + Sync {
    async fn deliver(&self, result: &CaptureResult) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes each capture into a directory under its own file name.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait::async_trait]
impl CaptureSink for DirectorySink {
    async fn deliver(&self, result: &CaptureResult) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create output directory: {:?}", self.dir))?;

        let path = self.dir.join(&result.file_name);
        tokio::fs::write(&path, &result.bytes)
            .await
            .with_context(|| format!("Failed to write capture: {:?}", path))?;

        info!("Saved capture to {} ({} bytes)", path.display(), result.size());
        Ok(())
    }

    fn name(&self) -> &str {
        "directory"
    }
}
