//! # Audio Primitives
//!
//! Byte-level audio building blocks shared by the session state machine and
//! the archiver.
//!
//! ## Key Components:
//! - **Ring Buffer**: fixed-capacity preroll window for VAD look-behind
//! - **WAV Assembly**: RIFF/WAVE container for outbound transcription and
//!   archive blobs
//!
//! ## Audio Format Contract:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! The gateway never resamples or re-encodes; clients are contracted to send
//! this format and the WAV header simply declares it.

pub mod ring;      // Preroll ring buffer for look-behind recovery
pub mod wav;       // RIFF/WAVE assembly and header readback

pub use ring::RingBuffer;
