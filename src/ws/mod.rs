//! # WebSocket Audio Sessions
//!
//! The full-duplex surface of the gateway: connection upgrade, the
//! first-message authentication phase, and the streaming phase that turns
//! VAD-annotated audio frames into transcripts and archive chunks.
//!
//! ## Key Components:
//! - **Connection Handler**: upgrade + origin allowlist (`/api/ws`)
//! - **Session Actor**: per-connection phase machine and outbound writer
//! - **Stream Engine**: pure frame-handling logic (clock, caches, VAD)
//! - **Messages**: the JSON wire protocol
//!
//! ## Concurrency Model:
//! Each connection is one actor; its mailbox serializes inbound handling
//! and outbound writes. ASR calls and archive uploads run on spawned tasks
//! whose results are posted back into the mailbox (or dropped if the
//! session ended first).

pub mod connection;   // upgrade handling and origin checks
pub mod messages;     // wire protocol types
pub mod session;      // per-connection actor
pub mod stream;       // frame-level state machine

pub use connection::ws_upgrade;
