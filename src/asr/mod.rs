//! # ASR Dispatch
//!
//! Hands assembled utterance WAVs to one of the external speech-to-text
//! providers and normalizes the outcome into wire frames. Submissions run on
//! their own tasks so the session worker never waits on an upstream HTTP
//! round trip.

pub mod dispatcher;

pub use dispatcher::{AsrDispatcher, AsrProvider};
