//! # Configuration Management
//!
//! Loads gateway configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix
//! - The flat process variables the deployment platform sets
//!   (`GROQ_API_KEY`, `CLERK_JWT_KEY`, `OBJECT_STORE_BUCKET`, …)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Flat process variables and APP_* environment variables
//! 2. Configuration file (config.toml)
//! 3. Default values
//!
//! Secrets (API keys, the JWT verification key) only ever arrive through
//! the environment; the TOML file carries the tunables.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::archive::ArchiverConfig;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub providers: ProvidersConfig,
    pub archive: ArchiveSettings,
    pub tickets: TicketsConfig,
}

/// Bind address for the HTTP/WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Identity-provider integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// PEM-encoded RS256 public key for bearer token verification.
    /// Unset disables the ticket endpoint.
    pub clerk_jwt_key: Option<String>,

    /// Comma-separated origin allowlist shared by the token `azp` check and
    /// the WebSocket Origin check
    pub authorized_parties: String,
}

impl AuthConfig {
    /// The allowlist split into entries, empty and whitespace-only dropped.
    pub fn authorized_party_list(&self) -> Vec<String> {
        self.authorized_parties
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Speech-to-text provider selection and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub groq_api_key: Option<String>,
    pub fireworks_api_key: Option<String>,

    /// Route transcription to Fireworks instead of Groq (process-wide)
    pub use_fireworks: bool,

    /// Mirror every outbound WAV back to the client as a `debug_audio` frame
    pub debug_mode: bool,
}

/// Archival tunables plus the bucket binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSettings {
    pub window_size_ms: i64,
    pub upload_interval_ms: i64,
    pub max_memory_mb: f64,
    pub store_original_audio: bool,
    pub store_vad_segments: bool,

    /// Directory (or bucket) audio chunks are archived to. Unset disables
    /// archival; sessions then run transcription-only.
    pub object_store_bucket: Option<String>,
}

impl ArchiveSettings {
    /// The per-session view of these settings.
    pub fn to_archiver_config(&self) -> ArchiverConfig {
        ArchiverConfig {
            window_size_ms: self.window_size_ms,
            upload_interval_ms: self.upload_interval_ms,
            max_memory_mb: self.max_memory_mb,
            store_original_audio: self.store_original_audio,
            store_vad_segments: self.store_vad_segments,
        }
    }
}

/// Ticket store binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketsConfig {
    /// Name of the external KV binding tickets should live in. This build
    /// ships the in-process store; the binding name is logged so a
    /// misconfigured deployment is visible.
    pub store_binding: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthConfig {
                clerk_jwt_key: None,
                authorized_parties: String::new(),
            },
            providers: ProvidersConfig {
                groq_api_key: None,
                fireworks_api_key: None,
                use_fireworks: false,
                debug_mode: false,
            },
            archive: ArchiveSettings {
                window_size_ms: 120_000,     // 2 minute sliding window
                upload_interval_ms: 60_000,  // rolling chunk every minute
                max_memory_mb: 10.0,
                store_original_audio: true,
                store_vad_segments: false,
                object_store_bucket: None,
            },
            tickets: TicketsConfig {
                store_binding: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // The flat variables the gateway's deployment contract enumerates
        if let Ok(key) = env::var("GROQ_API_KEY") {
            settings = settings.set_override("providers.groq_api_key", key)?;
        }
        if let Ok(key) = env::var("FIREWORKS_API_KEY") {
            settings = settings.set_override("providers.fireworks_api_key", key)?;
        }
        if let Ok(flag) = env::var("USE_FIREWORKS") {
            settings = settings.set_override("providers.use_fireworks", parse_bool_flag(&flag))?;
        }
        if let Ok(flag) = env::var("DEBUG_MODE") {
            settings = settings.set_override("providers.debug_mode", parse_bool_flag(&flag))?;
        }
        if let Ok(key) = env::var("CLERK_JWT_KEY") {
            settings = settings.set_override("auth.clerk_jwt_key", key)?;
        }
        if let Ok(parties) = env::var("CLERK_AUTHORIZED_PARTIES") {
            settings = settings.set_override("auth.authorized_parties", parties)?;
        }
        if let Ok(bucket) = env::var("OBJECT_STORE_BUCKET") {
            settings = settings.set_override("archive.object_store_bucket", bucket)?;
        }
        if let Ok(binding) = env::var("TICKET_STORE_BINDING") {
            settings = settings.set_override("tickets.store_binding", binding)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.archive.window_size_ms <= 0 {
            return Err(anyhow::anyhow!("Archive window size must be positive"));
        }
        if self.archive.upload_interval_ms <= 0 {
            return Err(anyhow::anyhow!("Archive upload interval must be positive"));
        }
        if self.archive.max_memory_mb <= 0.0 {
            return Err(anyhow::anyhow!("Archive memory limit must be positive"));
        }
        Ok(())
    }
}

/// Interpret the string-typed boolean flags deployment platforms pass.
fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
