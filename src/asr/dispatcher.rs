//! # Transcription Provider Dispatch
//!
//! Converts a finished (or prefetched) utterance into a WAV upload against
//! whichever speech-to-text provider the process is configured for, and
//! packages the outcome as wire frames for the session to deliver.
//!
//! ## Providers:
//! - **Groq**: OpenAI-compatible transcription endpoint,
//!   `whisper-large-v3-turbo`, `verbose_json` responses
//! - **Fireworks**: dedicated audio endpoint, `whisper-v3-turbo`,
//!   deterministic decoding (`temperature=0`)
//!
//! Both accept a multipart form with the WAV under `file`. Selection is a
//! process-wide flag, not per-request; per-session failover is a non-goal.

use crate::audio::wav;
use crate::config::ProvidersConfig;
use crate::ws::messages::{wire_timestamp, ServerMessage, TranscriptionPerformance};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const GROQ_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const FIREWORKS_URL: &str =
    "https://audio-turbo.us-virginia-1.direct.fireworks.ai/v1/audio/transcriptions";

/// Which upstream service transcribes this process's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrProvider {
    Groq,
    Fireworks,
}

impl AsrProvider {
    pub fn name(&self) -> &'static str {
        match self {
            AsrProvider::Groq => "groq",
            AsrProvider::Fireworks => "fireworks",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            AsrProvider::Groq => GROQ_URL,
            AsrProvider::Fireworks => FIREWORKS_URL,
        }
    }

    fn model(&self) -> &'static str {
        match self {
            AsrProvider::Groq => "whisper-large-v3-turbo",
            AsrProvider::Fireworks => "whisper-v3-turbo",
        }
    }
}

/// One submission's outcome, already shaped for the wire.
///
/// The first element (when present) is the `debug_audio` frame; the last is
/// always the `transcription_result` or `transcription_error`.
pub type DispatchFrames = Vec<ServerMessage>;

/// Stateless-per-request dispatcher; cheap to clone into session actors.
#[derive(Clone)]
pub struct AsrDispatcher {
    client: reqwest::Client,
    provider: AsrProvider,
    api_key: Option<String>,
    debug_mode: bool,
}

impl AsrDispatcher {
    /// Build a dispatcher from process configuration.
    ///
    /// The provider is fixed for the process lifetime by `use_fireworks`;
    /// a missing API key is tolerated here and reported per-submission so
    /// the audio path keeps working without transcription.
    pub fn new(config: &ProvidersConfig) -> Self {
        let provider = if config.use_fireworks {
            AsrProvider::Fireworks
        } else {
            AsrProvider::Groq
        };
        let api_key = match provider {
            AsrProvider::Groq => config.groq_api_key.clone(),
            AsrProvider::Fireworks => config.fireworks_api_key.clone(),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            provider,
            api_key,
            debug_mode: config.debug_mode,
        }
    }

    pub fn provider(&self) -> AsrProvider {
        self.provider
    }

    /// Transcribe one utterance.
    ///
    /// ## Parameters:
    /// - **segments**: ordered PCM segments of the utterance
    /// - **speech_start_ms / speech_end_ms**: stream-clock bounds the client
    ///   correlates replies with
    /// - **is_prefetch**: speculative (`cache_asr_trigger`) vs final (`end`)
    ///
    /// ## Returns:
    /// Wire frames to deliver in order. Empty input produces no frames at
    /// all; every other path produces exactly one terminal result or error
    /// frame (plus a leading `debug_audio` frame when enabled).
    pub async fn transcribe(
        &self,
        segments: Vec<Vec<u8>>,
        speech_start_ms: i64,
        speech_end_ms: i64,
        is_prefetch: bool,
    ) -> DispatchFrames {
        let total_bytes: usize = segments.iter().map(Vec::len).sum();
        if segments.is_empty() || total_bytes == 0 {
            debug!(is_prefetch, "skipping ASR submission with no audio");
            return Vec::new();
        }

        let started = Instant::now();
        let wav_bytes = wav::assemble_wav(&segments);
        let wav_creation_ms = started.elapsed().as_millis() as u64;

        let mut frames = Vec::new();
        if self.debug_mode {
            frames.push(ServerMessage::DebugAudio {
                audio_data: BASE64_STANDARD.encode(&wav_bytes),
                speech_start_time_ms: speech_start_ms,
                speech_end_time_ms: speech_end_ms,
                timestamp: wire_timestamp(),
            });
        }

        let api_key = match &self.api_key {
            Some(key) => key.clone(),
            None => {
                error!(provider = self.provider.name(), "ASR API key not configured");
                frames.push(self.error_frame(
                    "Transcription provider not configured",
                    json!({ "provider": self.provider.name() }),
                    is_prefetch,
                ));
                return frames;
            }
        };

        let fetch_started = Instant::now();
        let response = self
            .client
            .post(self.provider.endpoint())
            .bearer_auth(api_key)
            .multipart(self.build_form(wav_bytes))
            .send()
            .await;
        let api_fetch_ms = fetch_started.elapsed().as_millis() as u64;

        let outcome = match response {
            Err(e) => Err((
                "Transcription request failed".to_string(),
                json!(e.to_string()),
            )),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    Err((
                        format!("Transcription API returned {}", status.as_u16()),
                        json!(truncate(&body, 500)),
                    ))
                } else {
                    extract_text(&body)
                        .map_err(|e| ("Invalid transcription response".to_string(), json!(e)))
                }
            }
        };

        match outcome {
            Ok(text) => {
                let total_processing_ms = started.elapsed().as_millis() as u64;
                info!(
                    provider = self.provider.name(),
                    is_prefetch,
                    total_processing_ms,
                    chars = text.len(),
                    "transcription completed"
                );
                frames.push(ServerMessage::TranscriptionResult {
                    text,
                    speech_start_time_ms: speech_start_ms,
                    speech_end_time_ms: speech_end_ms,
                    timestamp: wire_timestamp(),
                    is_prefetch,
                    performance: TranscriptionPerformance {
                        total_processing_ms,
                        wav_creation_ms,
                        api_fetch_ms,
                        worker_timestamp: wire_timestamp(),
                        provider: self.provider.name().to_string(),
                    },
                });
            }
            Err((message, details)) => {
                error!(
                    provider = self.provider.name(),
                    is_prefetch,
                    error = %message,
                    "transcription failed"
                );
                frames.push(self.error_frame(&message, details, is_prefetch));
            }
        }

        frames
    }

    fn build_form(&self, wav_bytes: Vec<u8>) -> Form {
        let file_part = Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .unwrap_or_else(|_| Part::bytes(Vec::new()).file_name("audio.wav"));

        let form = Form::new()
            .part("file", file_part)
            .text("model", self.provider.model());

        match self.provider {
            AsrProvider::Groq => form.text("response_format", "verbose_json"),
            AsrProvider::Fireworks => form.text("temperature", "0"),
        }
    }

    fn error_frame(
        &self,
        message: &str,
        details: serde_json::Value,
        is_prefetch: bool,
    ) -> ServerMessage {
        ServerMessage::TranscriptionError {
            error: message.to_string(),
            details,
            is_prefetch,
            timestamp: wire_timestamp(),
        }
    }
}

/// Pull the `text` field out of a provider response body.
fn extract_text(body: &str) -> Result<String, String> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("response is not JSON: {}", e))?;
    match value.get("text").and_then(|t| t.as_str()) {
        Some(text) => Ok(text.to_string()),
        None => Err("response missing 'text' field".to_string()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
