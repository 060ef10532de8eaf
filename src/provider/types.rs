//! Request and response bodies for the provider's HTTP API.
//!
//! Message payloads follow the provider's camelCase JSON layout; each
//! [`MessageBlock`] maps to exactly one endpoint.

use serde::{Deserialize, Serialize};

use crate::job::{MessageBlock, VerificationResult};

/// `POST /message/sendText/{instance}`
#[derive(Debug, Clone, Serialize)]
pub struct TextMessage<'a> {
    pub number: &'a str,
    pub text: &'a str,
}

/// `POST /message/sendMedia/{instance}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage<'a> {
    pub number: &'a str,
    pub mediatype: &'static str,
    pub media: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<&'a str>,
}

/// `POST /message/sendWhatsAppAudio/{instance}`
#[derive(Debug, Clone, Serialize)]
pub struct AudioMessage<'a> {
    pub number: &'a str,
    pub audio: &'a str,
}

/// Endpoint name and JSON body for sending `block` to `number`.
pub fn outbound(number: &str, block: &MessageBlock) -> (&'static str, serde_json::Value) {
    let body = match block {
        MessageBlock::Text { text } => serde_json::to_value(TextMessage { number, text }),
        MessageBlock::Image { url, caption } => serde_json::to_value(MediaMessage {
            number,
            mediatype: "image",
            media: url,
            caption: caption.as_deref(),
            file_name: None,
        }),
        MessageBlock::Video { url, caption } => serde_json::to_value(MediaMessage {
            number,
            mediatype: "video",
            media: url,
            caption: caption.as_deref(),
            file_name: None,
        }),
        MessageBlock::Document {
            url,
            file_name,
            caption,
        } => serde_json::to_value(MediaMessage {
            number,
            mediatype: "document",
            media: url,
            caption: caption.as_deref(),
            file_name: file_name.as_deref(),
        }),
        MessageBlock::Audio { url } => serde_json::to_value(AudioMessage { number, audio: url }),
    };

    let endpoint = match block {
        MessageBlock::Text { .. } => "sendText",
        MessageBlock::Audio { .. } => "sendWhatsAppAudio",
        _ => "sendMedia",
    };

    // Serializing plain borrowed structs cannot fail.
    (endpoint, body.unwrap_or_default())
}

/// Body for creating a verification job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub instances: Vec<String>,
    pub numbers: Vec<String>,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedJob {
    pub job_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProgress {
    pub current: usize,
    pub total: usize,
}

/// Authoritative job state as reported by the verification server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    pub status: String,
    pub progress: RemoteProgress,
    #[serde(default)]
    pub results: Vec<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJobSummary {
    pub id: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveJobs {
    pub jobs: Vec<RemoteJobSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_block_goes_to_send_text() {
        let (endpoint, body) = outbound("5511988887777", &MessageBlock::text("hello"));
        assert_eq!(endpoint, "sendText");
        assert_eq!(body, serde_json::json!({"number": "5511988887777", "text": "hello"}));
    }

    #[test]
    fn document_block_uses_camel_case_file_name() {
        let block = MessageBlock::Document {
            url: "https://cdn.example/report.pdf".into(),
            file_name: Some("report.pdf".into()),
            caption: None,
        };
        let (endpoint, body) = outbound("551100", &block);
        assert_eq!(endpoint, "sendMedia");
        assert_eq!(body["mediatype"], "document");
        assert_eq!(body["fileName"], "report.pdf");
        assert!(body.get("caption").is_none());
    }

    #[test]
    fn audio_block_goes_to_audio_endpoint() {
        let block = MessageBlock::Audio {
            url: "https://cdn.example/v.ogg".into(),
        };
        let (endpoint, body) = outbound("551100", &block);
        assert_eq!(endpoint, "sendWhatsAppAudio");
        assert_eq!(body["audio"], "https://cdn.example/v.ogg");
    }

    #[test]
    fn remote_status_deserializes_from_api_format() {
        let raw = r#"{
            "status": "running",
            "progress": {"current": 4, "total": 10},
            "results": [{"number": "5511", "exists": true, "jid": "5511@s.whatsapp.net"}]
        }"#;
        let status: RemoteJobStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.progress.current, 4);
        assert_eq!(status.results.len(), 1);
        assert!(status.results[0].exists);
        assert!(status.error.is_none());
    }
}
