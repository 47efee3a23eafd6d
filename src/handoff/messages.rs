use serde::{Deserialize, Serialize};

/// Finished capture published to NATS for transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMessage {
    pub session_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub audio: String,  // Base64-encoded file bytes
    pub size: usize,
    pub duration_ms: u64,
    pub timestamp: String,  // RFC3339 timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_start_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_end_ms: Option<u64>,
}
