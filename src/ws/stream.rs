//! # Streaming State Machine
//!
//! The per-connection audio-chunk logic, kept free of sockets, actors, and
//! async so every timing and caching rule is directly testable. The actor
//! shell in `session.rs` feeds decoded frames in and carries the returned
//! actions out (wire frames, ASR submissions, archiver forwards).
//!
//! ## Time Base:
//! The stream clock advances exactly 128 ms per `audio_chunk`, by contract,
//! regardless of how many bytes the frame carried. Speech boundaries are
//! computed against the clock value at frame entry, then the clock advances;
//! a VAD offset shifts the boundary backward (negative, recovered from the
//! preroll ring) or forward into the current frame (positive).
//!
//! ## Caching Rules:
//! - `start` opens the utterance cache, pulling look-behind bytes from the
//!   preroll when the offset is negative.
//! - While caching, every non-empty payload is appended (the `end` frame's
//!   payload is instead trimmed to the offset).
//! - `cache_asr_trigger` submits a copy of the open cache as a prefetch and
//!   leaves the cache intact.
//! - `cache_asr_drop` suppresses further prefetches for this utterance.
//! - `end` closes the cache and submits the snapshot as the final take.

use crate::audio::wav::BYTES_PER_MS;
use crate::audio::RingBuffer;
use crate::ws::messages::{wire_timestamp, ServerMessage, VadState};

/// Frame cadence contract: one `audio_chunk` is 128 ms of stream time.
pub const FRAME_MS: i64 = 128;

/// Preroll window: 256 ms of look-behind at 32 bytes/ms.
pub const PREROLL_CAPACITY: usize = 8192;

/// Side effects of one frame, in emission order.
#[derive(Debug)]
pub enum StreamAction {
    /// Send a wire frame to this client
    Emit(ServerMessage),

    /// Forward the frame to the session archiver (fire-and-forget)
    Archive {
        payload: Vec<u8>,
        vad_state: Option<VadState>,
        vad_offset_ms: Option<i64>,
    },

    /// Submit an utterance to the ASR dispatcher (fire-and-forget)
    SubmitAsr {
        segments: Vec<Vec<u8>>,
        speech_start_ms: i64,
        speech_end_ms: i64,
        is_prefetch: bool,
    },
}

/// Per-connection streaming state. One instance per session; reset whole by
/// `audio_stream_start`.
pub struct StreamEngine {
    frame_count: u64,
    global_time_ms: i64,
    caching: bool,
    utterance_cache: Vec<Vec<u8>>,
    preroll: RingBuffer,
    speech_start_ms: i64,
    prefetch_suppressed: bool,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            global_time_ms: 0,
            caching: false,
            utterance_cache: Vec::new(),
            preroll: RingBuffer::new(PREROLL_CAPACITY),
            speech_start_ms: 0,
            prefetch_suppressed: false,
        }
    }

    /// `audio_stream_start`: return every counter and cache to its initial
    /// state. Safe at any time, including mid-utterance.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.global_time_ms = 0;
        self.caching = false;
        self.utterance_cache.clear();
        self.preroll.clear();
        self.speech_start_ms = 0;
        self.prefetch_suppressed = false;
    }

    /// Frames received since the last reset; reported in the end-of-stream ack.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn global_time_ms(&self) -> i64 {
        self.global_time_ms
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    #[cfg(test)]
    fn cached_bytes(&self) -> usize {
        self.utterance_cache.iter().map(Vec::len).sum()
    }

    /// Process one decoded `audio_chunk`.
    ///
    /// `payload` is the base64-decoded PCM (possibly empty), `vad_state` the
    /// recognized VAD annotation if any, `vad_offset_ms` its offset.
    pub fn handle_chunk(
        &mut self,
        payload: Vec<u8>,
        vad_state: Option<VadState>,
        vad_offset_ms: Option<i64>,
    ) -> Vec<StreamAction> {
        let mut actions = Vec::new();

        self.frame_count += 1;
        // Boundary arithmetic uses the clock as it stood when this frame
        // arrived; the 128 ms advance lands after the frame is handled.
        let frame_time_ms = self.global_time_ms;
        let offset = vad_offset_ms.unwrap_or(0);

        if vad_state == Some(VadState::Start) {
            self.caching = true;
            self.utterance_cache.clear();
            self.prefetch_suppressed = false;
            self.speech_start_ms = frame_time_ms + offset;

            if offset < 0 {
                // Look-behind recovery: the client noticed speech late, so
                // the missed audio is still sitting in the preroll window.
                let preroll = self.preroll.snapshot();
                let need = (-offset) as usize * BYTES_PER_MS;
                let take = need.min(preroll.len());
                if take > 0 {
                    self.utterance_cache
                        .push(preroll[preroll.len() - take..].to_vec());
                }
            }

            actions.push(StreamAction::Emit(ServerMessage::VadCacheStart));
        }

        if self.caching && !payload.is_empty() && vad_state != Some(VadState::End) {
            self.utterance_cache.push(payload.clone());
        }

        // The preroll tracks the raw stream independently of caching state
        if !payload.is_empty() {
            self.preroll.append(&payload);
        }

        actions.push(StreamAction::Archive {
            payload: payload.clone(),
            vad_state,
            vad_offset_ms,
        });

        match vad_state {
            Some(VadState::CacheAsrTrigger) if self.caching => {
                let speech_end_ms = frame_time_ms + offset;
                if self.prefetch_suppressed {
                    // The client retracted its previous prefetch for this
                    // utterance; stay quiet until the final submission.
                } else {
                    let mut segments = self.utterance_cache.clone();
                    if !payload.is_empty() {
                        if offset > 0 {
                            let take = (offset as usize * BYTES_PER_MS).min(payload.len());
                            segments.push(payload[..take].to_vec());
                        } else {
                            segments.push(payload.clone());
                        }
                    }
                    actions.push(StreamAction::SubmitAsr {
                        segments,
                        speech_start_ms: self.speech_start_ms,
                        speech_end_ms,
                        is_prefetch: true,
                    });
                }
            }
            Some(VadState::CacheAsrDrop) if self.caching => {
                self.prefetch_suppressed = true;
            }
            Some(VadState::End) if self.caching => {
                let speech_end_ms = frame_time_ms + offset;
                if !payload.is_empty() {
                    if offset > 0 {
                        let take = (offset as usize * BYTES_PER_MS).min(payload.len());
                        self.utterance_cache.push(payload[..take].to_vec());
                    } else {
                        self.utterance_cache.push(payload.clone());
                    }
                }

                self.caching = false;
                self.prefetch_suppressed = false;
                let segments = std::mem::take(&mut self.utterance_cache);

                actions.push(StreamAction::Emit(ServerMessage::VadCacheEnd {
                    timestamp: wire_timestamp(),
                }));
                actions.push(StreamAction::SubmitAsr {
                    segments,
                    speech_start_ms: self.speech_start_ms,
                    speech_end_ms,
                    is_prefetch: false,
                });
            }
            // `end` without a preceding `start` is ignored, as are
            // trigger/drop outside an utterance
            _ => {}
        }

        self.global_time_ms += FRAME_MS;
        actions
    }
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 4096; // 128 ms of PCM

    fn frame_bytes(fill: u8) -> Vec<u8> {
        vec![fill; FRAME]
    }

    fn submissions(actions: &[StreamAction]) -> Vec<(&Vec<Vec<u8>>, i64, i64, bool)> {
        actions
            .iter()
            .filter_map(|a| match a {
                StreamAction::SubmitAsr {
                    segments,
                    speech_start_ms,
                    speech_end_ms,
                    is_prefetch,
                } => Some((segments, *speech_start_ms, *speech_end_ms, *is_prefetch)),
                _ => None,
            })
            .collect()
    }

    fn emitted_types(actions: &[StreamAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                StreamAction::Emit(msg) => {
                    let v = serde_json::to_value(msg).unwrap();
                    Some(v["type"].as_str().unwrap().to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_clock_advances_128ms_per_chunk() {
        let mut engine = StreamEngine::new();
        for n in 1..=10u64 {
            engine.handle_chunk(frame_bytes(0), None, None);
            assert_eq!(engine.global_time_ms(), 128 * n as i64);
            assert_eq!(engine.frame_count(), n);
        }
    }

    #[test]
    fn test_empty_chunk_still_advances_clock() {
        let mut engine = StreamEngine::new();
        let actions = engine.handle_chunk(Vec::new(), None, None);
        assert_eq!(engine.global_time_ms(), 128);
        assert_eq!(engine.frame_count(), 1);
        assert!(engine.preroll.is_empty());
        assert_eq!(engine.cached_bytes(), 0);
        // The (empty) frame is still forwarded to the archiver
        assert!(matches!(actions[0], StreamAction::Archive { .. }));
    }

    #[test]
    fn test_cache_empty_while_not_caching() {
        let mut engine = StreamEngine::new();
        for _ in 0..5 {
            engine.handle_chunk(frame_bytes(1), None, None);
            assert!(!engine.is_caching());
            assert_eq!(engine.cached_bytes(), 0);
        }
    }

    #[test]
    fn test_preroll_bounded_at_capacity() {
        let mut engine = StreamEngine::new();
        for _ in 0..10 {
            engine.handle_chunk(frame_bytes(3), None, None);
            assert!(engine.preroll.snapshot().len() <= PREROLL_CAPACITY);
        }
        assert_eq!(engine.preroll.snapshot().len(), PREROLL_CAPACITY);
    }

    #[test]
    fn test_start_with_negative_offset_recovers_preroll() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), None, None);
        engine.handle_chunk(frame_bytes(2), None, None);

        let actions = engine.handle_chunk(frame_bytes(3), Some(VadState::Start), Some(-64));
        assert_eq!(emitted_types(&actions), vec!["vad_cache_start"]);
        assert!(engine.is_caching());
        // speech start: 2 frames in (256 ms) minus 64 ms look-behind
        assert_eq!(engine.speech_start_ms, 192);
        // 64 ms * 32 B/ms of preroll plus the start frame itself
        assert_eq!(engine.cached_bytes(), 2048 + FRAME);
        // Recovered bytes are the most recent preroll bytes (from frame 2)
        assert_eq!(engine.utterance_cache[0], vec![2u8; 2048]);
    }

    #[test]
    fn test_start_offset_larger_than_preroll_takes_everything() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(vec![9u8; 1000], None, None);

        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), Some(-500));
        // 500 ms would need 16000 bytes; only 1000 exist
        assert_eq!(engine.utterance_cache[0], vec![9u8; 1000]);
    }

    #[test]
    fn test_start_on_silent_stream_has_no_recovery_segment() {
        let mut engine = StreamEngine::new();
        let actions = engine.handle_chunk(frame_bytes(1), Some(VadState::Start), Some(-64));
        assert_eq!(emitted_types(&actions), vec!["vad_cache_start"]);
        // No preroll existed; cache holds only the start frame
        assert_eq!(engine.cached_bytes(), FRAME);
    }

    #[test]
    fn test_end_without_start_is_ignored() {
        let mut engine = StreamEngine::new();
        let actions = engine.handle_chunk(frame_bytes(1), Some(VadState::End), Some(32));
        assert!(emitted_types(&actions).is_empty());
        assert!(submissions(&actions).is_empty());
        // Clock still advances
        assert_eq!(engine.global_time_ms(), 128);
    }

    #[test]
    fn test_trigger_and_drop_outside_utterance_are_ignored() {
        let mut engine = StreamEngine::new();
        let actions = engine.handle_chunk(frame_bytes(1), Some(VadState::CacheAsrTrigger), Some(64));
        assert!(submissions(&actions).is_empty());
        let actions = engine.handle_chunk(frame_bytes(1), Some(VadState::CacheAsrDrop), None);
        assert!(submissions(&actions).is_empty());
    }

    /// The full happy-path utterance: 10 frames, start on frame 3 with
    /// -64 ms look-behind, end on frame 8 trimmed to +32 ms.
    #[test]
    fn test_vad_segment_boundaries_and_bytes() {
        let mut engine = StreamEngine::new();
        let mut final_submission = None;

        for n in 1..=10 {
            let (vad, offset) = match n {
                3 => (Some(VadState::Start), Some(-64)),
                8 => (Some(VadState::End), Some(32)),
                _ => (None, None),
            };
            let actions = engine.handle_chunk(frame_bytes(n as u8), vad, offset);

            match n {
                3 => assert_eq!(emitted_types(&actions), vec!["vad_cache_start"]),
                8 => {
                    assert_eq!(emitted_types(&actions), vec!["vad_cache_end"]);
                    let subs = submissions(&actions);
                    assert_eq!(subs.len(), 1);
                    let (segments, start, end, is_prefetch) = (&subs[0].0, subs[0].1, subs[0].2, subs[0].3);
                    assert_eq!(start, 2 * 128 - 64);
                    assert_eq!(end, 7 * 128 + 32);
                    assert!(!is_prefetch);
                    final_submission = Some(
                        segments.iter().map(Vec::len).sum::<usize>(),
                    );
                }
                _ => assert!(emitted_types(&actions).is_empty()),
            }
        }

        // preroll recovery (64 ms) + frames 3..=7 + 32 ms of frame 8
        let expected = 64 * BYTES_PER_MS + 5 * FRAME + 32 * BYTES_PER_MS;
        assert_eq!(final_submission, Some(expected));

        // Utterance closed: cache empty, caching off
        assert!(!engine.is_caching());
        assert_eq!(engine.cached_bytes(), 0);
    }

    #[test]
    fn test_end_with_nonpositive_offset_appends_whole_payload() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        let actions = engine.handle_chunk(frame_bytes(2), Some(VadState::End), None);
        let subs = submissions(&actions);
        assert_eq!(subs[0].0.iter().map(Vec::len).sum::<usize>(), 2 * FRAME);

        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        let actions = engine.handle_chunk(frame_bytes(2), Some(VadState::End), Some(-16));
        let subs = submissions(&actions);
        assert_eq!(subs[0].0.iter().map(Vec::len).sum::<usize>(), 2 * FRAME);
    }

    #[test]
    fn test_end_offset_prefix_clamped_to_payload() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        // 1000 ms prefix is far past the 4096-byte payload
        let actions = engine.handle_chunk(frame_bytes(2), Some(VadState::End), Some(1000));
        let subs = submissions(&actions);
        assert_eq!(subs[0].0.iter().map(Vec::len).sum::<usize>(), 2 * FRAME);
    }

    /// Prefetch mid-utterance: submission is a copy, the cache survives and
    /// the final take still covers the whole utterance.
    #[test]
    fn test_prefetch_then_final() {
        let mut engine = StreamEngine::new();
        let mut prefetch = None;
        let mut final_take = None;

        for n in 1..=10 {
            let (vad, offset) = match n {
                3 => (Some(VadState::Start), Some(-64)),
                6 => (Some(VadState::CacheAsrTrigger), Some(64)),
                8 => (Some(VadState::End), Some(32)),
                _ => (None, None),
            };
            let actions = engine.handle_chunk(frame_bytes(n as u8), vad, offset);
            for (segments, start, end, is_prefetch) in submissions(&actions) {
                let total: usize = segments.iter().map(Vec::len).sum();
                if is_prefetch {
                    prefetch = Some((total, start, end));
                } else {
                    final_take = Some((total, start, end));
                }
            }
            if n == 6 {
                // Trigger must not clear the cache
                assert!(engine.is_caching());
                assert!(engine.cached_bytes() > 0);
            }
        }

        let (_, p_start, p_end) = prefetch.expect("prefetch emitted");
        assert_eq!(p_start, 192);
        assert_eq!(p_end, 5 * 128 + 64);

        let (f_total, f_start, f_end) = final_take.expect("final emitted");
        assert_eq!(f_start, 192);
        assert_eq!(f_end, 928);
        assert_eq!(f_total, 64 * BYTES_PER_MS + 5 * FRAME + 32 * BYTES_PER_MS);
    }

    #[test]
    fn test_prefetch_segments_are_a_snapshot() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        let actions = engine.handle_chunk(frame_bytes(2), Some(VadState::CacheAsrTrigger), None);
        let subs = submissions(&actions);
        let prefetch_total: usize = subs[0].0.iter().map(Vec::len).sum();

        // Mutating the stream afterwards cannot shrink what was submitted:
        // the engine keeps caching and later frames only grow its own cache.
        engine.handle_chunk(frame_bytes(3), None, None);
        assert!(engine.cached_bytes() > 0);
        // cache(frame1 + frame2) + trigger's own full-payload append
        assert_eq!(prefetch_total, 3 * FRAME);
    }

    #[test]
    fn test_drop_suppresses_later_prefetch_until_end() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        engine.handle_chunk(frame_bytes(2), Some(VadState::CacheAsrDrop), None);

        // Suppressed: the trigger produces no submission
        let actions = engine.handle_chunk(frame_bytes(3), Some(VadState::CacheAsrTrigger), Some(64));
        assert!(submissions(&actions).is_empty());

        // The final take is unaffected
        let actions = engine.handle_chunk(frame_bytes(4), Some(VadState::End), None);
        let subs = submissions(&actions);
        assert_eq!(subs.len(), 1);
        assert!(!subs[0].3);

        // A fresh utterance prefetches again
        engine.handle_chunk(frame_bytes(5), Some(VadState::Start), None);
        let actions = engine.handle_chunk(frame_bytes(6), Some(VadState::CacheAsrTrigger), None);
        assert_eq!(submissions(&actions).len(), 1);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), Some(-32));
        engine.handle_chunk(frame_bytes(2), None, None);
        assert!(engine.is_caching());

        engine.reset();
        assert_eq!(engine.frame_count(), 0);
        assert_eq!(engine.global_time_ms(), 0);
        assert!(!engine.is_caching());
        assert_eq!(engine.cached_bytes(), 0);
        assert!(engine.preroll.is_empty());
        assert_eq!(engine.speech_start_ms, 0);
    }

    #[test]
    fn test_restart_mid_utterance_reopens_cache() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), Some(VadState::Start), None);
        engine.handle_chunk(frame_bytes(2), None, None);

        // A second start clears and restarts the utterance
        let actions = engine.handle_chunk(frame_bytes(3), Some(VadState::Start), None);
        assert_eq!(emitted_types(&actions), vec!["vad_cache_start"]);
        assert_eq!(engine.cached_bytes(), FRAME);
        assert_eq!(engine.speech_start_ms, 2 * 128);
    }

    #[test]
    fn test_speech_start_never_exceeds_clock_while_caching() {
        let mut engine = StreamEngine::new();
        engine.handle_chunk(frame_bytes(1), None, None);
        engine.handle_chunk(frame_bytes(2), Some(VadState::Start), Some(-64));
        for _ in 0..20 {
            engine.handle_chunk(frame_bytes(0), None, None);
            assert!(engine.speech_start_ms <= engine.global_time_ms());
        }
    }
}
