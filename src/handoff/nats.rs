use anyhow::{Context, Result};
use async_nats::Client;
use base64::Engine;
use tracing::info;

use super::messages::CaptureMessage;
use super::CaptureSink;
use crate::capture::CaptureResult;

/// Subject prefix; the session id is appended
pub const CAPTURE_SUBJECT_PREFIX: &str = "voice.capture";

pub fn capture_subject(session_id: &str) -> String {
    format!("{CAPTURE_SUBJECT_PREFIX}.{session_id}")
}

pub fn capture_message(result: &CaptureResult) -> CaptureMessage {
    CaptureMessage {
        session_id: result.session_id.clone(),
        file_name: result.file_name.clone(),
        mime_type: result.mime_type.clone(),
        audio: base64::engine::general_purpose::STANDARD.encode(&result.bytes),
        size: result.size(),
        duration_ms: result.duration_ms,
        timestamp: chrono::Utc::now().to_rfc3339(),
        speech_start_ms: result.speech.map(|s| s.start_ms),
        speech_end_ms: result.speech.map(|s| s.end_ms),
    }
}

pub struct NatsSink {
    client: Client,
}

impl NatsSink {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl CaptureSink for NatsSink {
    async fn deliver(&self, result: &CaptureResult) -> Result<()> {
        let subject = capture_subject(&result.session_id);
        let payload = serde_json::to_vec(&capture_message(result))?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish capture")?;
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;

        info!(
            "Published capture to {} ({}, {} bytes)",
            subject,
            result.file_name,
            result.size()
        );

        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
