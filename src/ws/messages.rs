//! # WebSocket Wire Protocol
//!
//! JSON message types exchanged with streaming clients. All frames are text;
//! the field spellings (a mix of camelCase and snake_case) are part of the
//! public contract with deployed clients and must not be "cleaned up".

use serde::{Deserialize, Serialize};

/// Voice-activity annotations a client may attach to an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Speech started (possibly `vad_offset_ms` milliseconds in the past)
    Start,
    /// Speech ended (possibly `vad_offset_ms` milliseconds into this frame)
    End,
    /// Short silence: request a speculative transcript of the open utterance
    CacheAsrTrigger,
    /// Client retracted its most recent prefetch request
    CacheAsrDrop,
}

impl VadState {
    /// Parse the wire spelling. Unknown values are ignored by the session
    /// (the frame is still counted and archived), so this returns `None`
    /// rather than failing the whole message.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "start" => Some(VadState::Start),
            "end" => Some(VadState::End),
            "cache_asr_trigger" => Some(VadState::CacheAsrTrigger),
            "cache_asr_drop" => Some(VadState::CacheAsrDrop),
            _ => None,
        }
    }
}

/// Messages a client sends to the gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message on every connection: present the one-use ticket
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        ticket: Option<String>,
    },

    /// Reset the stream clock and caches for a fresh recording
    #[serde(rename = "audio_stream_start")]
    AudioStreamStart,

    /// One 128 ms audio frame with optional VAD annotation
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64-encoded PCM payload; may be absent or empty
        #[serde(default)]
        data: Option<String>,

        /// VAD annotation, wire-spelled; unknown values are ignored
        #[serde(default)]
        vad_state: Option<String>,

        /// Offset in milliseconds relative to this frame's position
        #[serde(default)]
        vad_offset_ms: Option<i64>,

        /// Accepted for forward compatibility; not forwarded to providers
        #[serde(default)]
        #[allow(dead_code)]
        asr_prompt: Option<String>,
    },

    /// End of the recording; the session stays open for another start
    #[serde(rename = "audio_stream_end")]
    AudioStreamEnd,
}

/// Per-request timing breakdown attached to every transcript.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionPerformance {
    pub total_processing_ms: u64,
    pub wav_creation_ms: u64,
    pub api_fetch_ms: u64,
    pub worker_timestamp: String,
    pub provider: String,
}

/// Messages the gateway sends to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth_success")]
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: String,
    },

    #[serde(rename = "auth_error")]
    AuthError { error: String, timestamp: String },

    #[serde(rename = "audio_stream_start_ack")]
    AudioStreamStartAck {
        timestamp: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "audio_stream_end_ack")]
    AudioStreamEndAck {
        #[serde(rename = "receivedChunks")]
        received_chunks: u64,
        timestamp: String,
    },

    /// Utterance accumulation opened; intentionally carries no timestamp
    #[serde(rename = "vad_cache_start")]
    VadCacheStart,

    #[serde(rename = "vad_cache_end")]
    VadCacheEnd { timestamp: String },

    #[serde(rename = "transcription_result")]
    TranscriptionResult {
        text: String,
        #[serde(rename = "speechStartTimeMs")]
        speech_start_time_ms: i64,
        #[serde(rename = "speechEndTimeMs")]
        speech_end_time_ms: i64,
        timestamp: String,
        is_prefetch: bool,
        performance: TranscriptionPerformance,
    },

    #[serde(rename = "transcription_error")]
    TranscriptionError {
        error: String,
        details: serde_json::Value,
        is_prefetch: bool,
        timestamp: String,
    },

    /// Pre-dispatch copy of the exact WAV sent upstream; `DEBUG_MODE` only
    #[serde(rename = "debug_audio")]
    DebugAudio {
        #[serde(rename = "audioData")]
        audio_data: String,
        #[serde(rename = "speechStartTimeMs")]
        speech_start_time_ms: i64,
        #[serde(rename = "speechEndTimeMs")]
        speech_end_time_ms: i64,
        timestamp: String,
    },
}

/// Current instant in the ISO-8601 form every outbound frame carries.
pub fn wire_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_auth_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","ticket":"abcd"}"#).unwrap();
        match msg {
            ClientMessage::Auth { ticket } => assert_eq!(ticket.as_deref(), Some("abcd")),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_audio_chunk_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"audio_chunk"}"#).unwrap();
        match msg {
            ClientMessage::AudioChunk {
                data,
                vad_state,
                vad_offset_ms,
                ..
            } => {
                assert!(data.is_none());
                assert!(vad_state.is_none());
                assert!(vad_offset_ms.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_audio_chunk_with_vad_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"audio_chunk","data":"AAAA","vad_state":"start","vad_offset_ms":-64}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::AudioChunk {
                data,
                vad_state,
                vad_offset_ms,
                ..
            } => {
                assert_eq!(data.as_deref(), Some("AAAA"));
                assert_eq!(vad_state.as_deref().and_then(VadState::from_wire), Some(VadState::Start));
                assert_eq!(vad_offset_ms, Some(-64));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_serde_error() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_vad_state_wire_spellings() {
        assert_eq!(VadState::from_wire("start"), Some(VadState::Start));
        assert_eq!(VadState::from_wire("end"), Some(VadState::End));
        assert_eq!(
            VadState::from_wire("cache_asr_trigger"),
            Some(VadState::CacheAsrTrigger)
        );
        assert_eq!(
            VadState::from_wire("cache_asr_drop"),
            Some(VadState::CacheAsrDrop)
        );
        assert_eq!(VadState::from_wire("pause"), None);
    }

    #[test]
    fn test_server_frame_field_spellings() {
        let json = serde_json::to_value(ServerMessage::AuthSuccess {
            user_id: "user_42".to_string(),
            timestamp: "t".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "auth_success");
        assert_eq!(json["userId"], "user_42");

        let json = serde_json::to_value(ServerMessage::TranscriptionResult {
            text: "hi".to_string(),
            speech_start_time_ms: 192,
            speech_end_time_ms: 928,
            timestamp: "t".to_string(),
            is_prefetch: false,
            performance: TranscriptionPerformance {
                total_processing_ms: 10,
                wav_creation_ms: 1,
                api_fetch_ms: 9,
                worker_timestamp: "t".to_string(),
                provider: "groq".to_string(),
            },
        })
        .unwrap();
        assert_eq!(json["speechStartTimeMs"], 192);
        assert_eq!(json["speechEndTimeMs"], 928);
        assert_eq!(json["is_prefetch"], false);
        assert_eq!(json["performance"]["provider"], "groq");

        let json = serde_json::to_value(ServerMessage::VadCacheStart).unwrap();
        assert_eq!(json, serde_json::json!({"type": "vad_cache_start"}));
    }
}
