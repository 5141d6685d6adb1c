//! # Session Audio Archiver
//!
//! Per-session sliding window over the raw inbound PCM, periodically
//! snapshotted and uploaded to the object store as rolling WAV chunks. The
//! archive path is strictly best-effort: it shares nothing with the
//! transcription path and its failures never surface to the client.
//!
//! ## Operation:
//! - Every frame the session receives is appended to a time-stamped window
//!   (regardless of VAD state); entries older than `window_size_ms` are
//!   evicted from the head.
//! - An upload ticker fires every `upload_interval_ms` and uploads a
//!   snapshot of the whole window WITHOUT clearing it; adjacent chunks
//!   therefore overlap by up to `window_size_ms − upload_interval_ms`,
//!   trading storage for loss-safety.
//! - A cleanup ticker evicts on a 30 s cadence even when no audio arrives.
//! - If the window outgrows `max_memory_mb`, an emergency upload runs and
//!   the window is halved.
//! - Shutdown cancels both tickers and performs one final bounded flush.

use crate::archive::store::ObjectStore;
use crate::audio::wav;
use crate::ws::messages::VadState;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Cadence of the head-eviction sweep, independent of audio arrival.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on the shutdown flush.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for one session's archiver.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// How much trailing audio the window retains (ms)
    pub window_size_ms: i64,

    /// How often a rolling chunk is uploaded (ms)
    pub upload_interval_ms: i64,

    /// Window size that triggers an emergency upload (MB)
    pub max_memory_mb: f64,

    /// Archive the raw inbound stream
    pub store_original_audio: bool,

    /// Reserved: archive per-utterance VAD segments as separate blobs
    pub store_vad_segments: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 120_000,
            upload_interval_ms: 60_000,
            max_memory_mb: 10.0,
            store_original_audio: true,
            store_vad_segments: false,
        }
    }
}

/// Counters mirrored out of the archiver task for logging and health.
#[derive(Debug, Clone, Default)]
pub struct ArchiverStats {
    pub total_chunks: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub memory_usage_mb: f64,
    pub last_upload_at: Option<String>,
}

/// One frame as recorded into the window.
#[derive(Debug, Clone)]
struct WindowEntry {
    timestamp_ms: i64,
    payload: Vec<u8>,
}

/// Snapshot handed to an upload: the bytes plus the metadata that describes
/// them, computed from the entries' own timestamps.
struct UploadSnapshot {
    key: String,
    wav_bytes: Vec<u8>,
    metadata: HashMap<String, String>,
}

/// Deterministic core of the archiver: the window, its eviction rules, and
/// snapshot/metadata construction. All clock values are passed in, which is
/// what makes the arithmetic testable.
struct ArchiveWindow {
    session_id: String,
    config: ArchiverConfig,
    entries: Vec<WindowEntry>,
}

impl ArchiveWindow {
    fn new(session_id: String, config: ArchiverConfig) -> Self {
        Self {
            session_id,
            config,
            entries: Vec::new(),
        }
    }

    /// Record one frame at `now_ms` and evict anything that fell out of the
    /// window. Returns true when the memory cap was crossed.
    fn record(&mut self, payload: Vec<u8>, now_ms: i64) -> bool {
        if self.config.store_original_audio {
            self.entries.push(WindowEntry {
                timestamp_ms: now_ms,
                payload,
            });
        }
        self.evict(now_ms);
        self.memory_usage_mb() > self.config.max_memory_mb
    }

    /// Drop entries whose timestamp is at or before `now_ms − window_size`.
    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.config.window_size_ms;
        self.entries.retain(|entry| entry.timestamp_ms > cutoff);
    }

    fn memory_usage_mb(&self) -> f64 {
        let bytes: usize = self.entries.iter().map(|e| e.payload.len()).sum();
        bytes as f64 / (1024.0 * 1024.0)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Keep only the most recent half of the window (round up), the
    /// post-emergency-upload state.
    fn retain_recent_half(&mut self) {
        let keep = self.entries.len().div_ceil(2);
        let drop = self.entries.len() - keep;
        self.entries.drain(..drop);
    }

    /// Build the upload for the current window contents. `None` when there
    /// is nothing to upload.
    ///
    /// The live window is left untouched; rolling uploads rely on time-based
    /// eviction alone, so consecutive chunks overlap deliberately.
    fn snapshot(&self, now_ms: i64) -> Option<UploadSnapshot> {
        if self.entries.is_empty() {
            return None;
        }

        let chunk_index = now_ms / self.config.upload_interval_ms.max(1);
        let key = format!(
            "audio-sessions/session_{}_original_{}.wav",
            self.session_id, chunk_index
        );

        let start_ms = self.entries.first().map(|e| e.timestamp_ms).unwrap_or(now_ms);
        let end_ms = self.entries.last().map(|e| e.timestamp_ms).unwrap_or(now_ms);
        let duration_seconds = (end_ms - start_ms) as f64 / 1000.0;

        let segments: Vec<Vec<u8>> = self.entries.iter().map(|e| e.payload.clone()).collect();
        let wav_bytes = wav::assemble_wav(&segments);

        let mut metadata = HashMap::new();
        metadata.insert("sessionId".to_string(), self.session_id.clone());
        metadata.insert("audioType".to_string(), "original".to_string());
        metadata.insert("chunkIndex".to_string(), chunk_index.to_string());
        metadata.insert("chunkCount".to_string(), self.entries.len().to_string());
        metadata.insert("startTimestamp".to_string(), start_ms.to_string());
        metadata.insert("endTimestamp".to_string(), end_ms.to_string());
        metadata.insert("durationSeconds".to_string(), duration_seconds.to_string());
        metadata.insert("uploadedAt".to_string(), chrono::Utc::now().to_rfc3339());

        Some(UploadSnapshot {
            key,
            wav_bytes,
            metadata,
        })
    }
}

enum Command {
    Frame { payload: Vec<u8> },
    Shutdown,
}

/// Cheap handle the session holds; dropping it (or calling `shutdown`)
/// winds the task down with a final flush.
#[derive(Clone)]
pub struct ArchiverHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<RwLock<ArchiverStats>>,
}

impl ArchiverHandle {
    /// Forward one inbound frame. Fire-and-forget: a closed task means the
    /// archiver already shut down and the frame is silently dropped.
    ///
    /// VAD annotations are accepted for the future segment-archival mode;
    /// the current configuration archives the original stream only.
    pub fn process(
        &self,
        payload: Vec<u8>,
        _vad_state: Option<VadState>,
        _vad_offset_ms: Option<i64>,
    ) {
        let _ = self.tx.send(Command::Frame { payload });
    }

    /// Request the final flush and task exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Point-in-time copy of the counters.
    pub fn stats(&self) -> ArchiverStats {
        self.stats.read().unwrap().clone()
    }
}

/// Spawn the archiver task for an authenticated session.
pub fn spawn_archiver(
    session_id: &str,
    config: ArchiverConfig,
    store: Arc<dyn ObjectStore>,
) -> ArchiverHandle {
    if config.store_vad_segments {
        // Recognized but not wired up; the original-audio path is the only
        // archival mode this build performs.
        warn!(session_id, "store_vad_segments requested but VAD-segment archival is not implemented");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(RwLock::new(ArchiverStats::default()));

    let task_stats = stats.clone();
    let task_session = session_id.to_string();
    tokio::spawn(run_archiver(task_session, config, store, rx, task_stats));

    ArchiverHandle { tx, stats }
}

async fn run_archiver(
    session_id: String,
    config: ArchiverConfig,
    store: Arc<dyn ObjectStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<RwLock<ArchiverStats>>,
) {
    let mut window = ArchiveWindow::new(session_id.clone(), config.clone());

    let mut upload_ticker = interval(Duration::from_millis(config.upload_interval_ms.max(1) as u64));
    upload_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first real upload happens one full interval in.
    upload_ticker.tick().await;

    let mut cleanup_ticker = interval(CLEANUP_INTERVAL);
    cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    cleanup_ticker.tick().await;

    debug!(session_id = %session_id, "archiver started");

    // Uploads are awaited inline in this loop, so they can never overlap:
    // the select body runs each arm to completion before polling again.
    // Frames arriving during an upload queue in the channel and are
    // recorded afterwards; the session side is never blocked.
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Frame { payload }) => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let over_budget = window.record(payload, now_ms);
                    {
                        let mut s = stats.write().unwrap();
                        if config.store_original_audio {
                            s.total_chunks += 1;
                        }
                        s.memory_usage_mb = window.memory_usage_mb();
                    }
                    if over_budget {
                        warn!(
                            session_id = %session_id,
                            memory_mb = window.memory_usage_mb(),
                            "archive window over memory budget, emergency upload"
                        );
                        upload_snapshot(&window, store.as_ref(), &stats).await;
                        window.retain_recent_half();
                        stats.write().unwrap().memory_usage_mb = window.memory_usage_mb();
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = upload_ticker.tick() => {
                if !window.is_empty() {
                    upload_snapshot(&window, store.as_ref(), &stats).await;
                }
            }
            _ = cleanup_ticker.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                window.evict(now_ms);
                stats.write().unwrap().memory_usage_mb = window.memory_usage_mb();
            }
        }
    }

    // Final flush, bounded so a wedged store cannot hold the task forever
    if !window.is_empty() {
        let flush = upload_snapshot(&window, store.as_ref(), &stats);
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, flush).await.is_err() {
            error!(session_id = %session_id, "final archive flush timed out");
        }
    }

    let final_stats = stats.read().unwrap().clone();
    info!(
        session_id = %session_id,
        total_chunks = final_stats.total_chunks,
        uploads_completed = final_stats.uploads_completed,
        uploads_failed = final_stats.uploads_failed,
        "archiver stopped"
    );
}

/// Upload the current window. Failures bump a counter and wait for the next
/// tick; there is no per-upload retry loop.
async fn upload_snapshot(
    window: &ArchiveWindow,
    store: &dyn ObjectStore,
    stats: &Arc<RwLock<ArchiverStats>>,
) {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let Some(snapshot) = window.snapshot(now_ms) else {
        return;
    };

    let result = store
        .put(&snapshot.key, snapshot.wav_bytes, "audio/wav", snapshot.metadata)
        .await;

    let mut s = stats.write().unwrap();
    match result {
        Ok(()) => {
            s.uploads_completed += 1;
            s.last_upload_at = Some(chrono::Utc::now().to_rfc3339());
            debug!(key = %snapshot.key, entries = window.len(), "archive chunk uploaded");
        }
        Err(e) => {
            s.uploads_failed += 1;
            error!(key = %snapshot.key, error = %e, "archive upload failed");
        }
    }
}
