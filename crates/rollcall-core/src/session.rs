//! Live recognition session.
//!
//! One frame at a time: extract → match against the current registry
//! snapshot → de-duplicate and record. Per-frame failures become a
//! [`FrameStatus`]; nothing short of cancellation, the source closing or the
//! idle timeout ends the loop.

use crate::dedup::{DedupError, DedupOutcome, Deduplicator};
use crate::extractor::{EncodingExtractor, ExtractError, QualityIssue};
use crate::matcher::{EuclideanMatcher, MatchOutcome, Matcher, DEFAULT_THRESHOLD};
use crate::registry::{IdentityRegistry, RegistryError};
use crate::store::{AttendanceStore, RegistryStore};
use crate::types::{AttendanceRecord, Encoding, FaceImage, PersonId, SessionKey};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Matching,
    Accepted,
    Rejected,
    Unknown,
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    NoFace,
    MultipleFaces { count: usize },
    LowQuality { issue: QualityIssue },
    ExtractorFailed { error: String },
    MatchFailed { error: String },
    /// The frame source produced nothing within the frame timeout.
    FrameMissing,
    Marked { record: AttendanceRecord, name: String, distance: f32 },
    AlreadyMarked { person_id: PersonId, name: String, distance: f32 },
    /// Closest person not below the threshold, or tied with another person.
    Rejected { distance: f32, ambiguous: bool },
    /// Nobody is enrolled.
    Unknown,
    /// Recognized, but the attendance write failed; a later frame retries.
    StorageFailed { person_id: PersonId, error: String },
}

impl FrameStatus {
    /// Decision state this frame ended in.
    pub fn state(&self) -> SessionState {
        match self {
            Self::Marked { .. } | Self::AlreadyMarked { .. } | Self::StorageFailed { .. } => SessionState::Accepted,
            Self::Rejected { .. } => SessionState::Rejected,
            Self::Unknown => SessionState::Unknown,
            _ => SessionState::Idle,
        }
    }

    /// Whether a face was in view, recognized or not. A face rejected as too
    /// small or uncertain still counts.
    pub fn face_seen(&self) -> bool {
        matches!(
            self,
            Self::LowQuality {
                issue: QualityIssue::FaceTooSmall { .. } | QualityIssue::LowConfidence { .. }
            } | Self::Marked { .. }
                | Self::AlreadyMarked { .. }
                | Self::Rejected { .. }
                | Self::Unknown
                | Self::StorageFailed { .. }
                | Self::MatchFailed { .. }
                | Self::MultipleFaces { .. }
        )
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFace => f.write_str("No face detected"),
            Self::MultipleFaces { count } => write!(f, "{count} faces in view, one at a time please"),
            Self::LowQuality { issue } => write!(f, "Image not usable: {issue}"),
            Self::ExtractorFailed { error } => write!(f, "Face processing failed: {error}"),
            Self::MatchFailed { error } => write!(f, "Matching failed: {error}"),
            Self::FrameMissing => f.write_str("No frame from camera"),
            Self::Marked { record, name, .. } => write!(f, "Marked present: {name} ({})", record.person_id),
            Self::AlreadyMarked { person_id, name, .. } => write!(f, "Already marked: {name} ({person_id})"),
            Self::Rejected { ambiguous: true, .. } => f.write_str("Not recognized (ambiguous match)"),
            Self::Rejected { distance, .. } => write!(f, "Not recognized (distance {distance:.3})"),
            Self::Unknown => f.write_str("Unknown face, nobody enrolled"),
            Self::StorageFailed { person_id, error } => {
                write!(f, "Recognized {person_id} but attendance was not saved: {error}")
            }
        }
    }
}

/// Result of polling a [`FrameSource`].
#[derive(Debug)]
pub enum FrameFetch {
    Frame(FaceImage),
    TimedOut,
    Closed,
}

/// Blocking supplier of frames.
pub trait FrameSource {
    fn next_frame(&mut self, timeout: Duration) -> FrameFetch;
}

impl FrameSource for Receiver<FaceImage> {
    fn next_frame(&mut self, timeout: Duration) -> FrameFetch {
        match self.recv_timeout(timeout) {
            Ok(frame) => FrameFetch::Frame(frame),
            Err(RecvTimeoutError::Timeout) => FrameFetch::TimedOut,
            Err(RecvTimeoutError::Disconnected) => FrameFetch::Closed,
        }
    }
}

/// Shared stop flag, checked at every frame boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub threshold: f32,
    /// How long to wait for each frame before reporting it missing.
    pub frame_timeout: Duration,
    /// End the session when no face has been seen for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            frame_timeout: Duration::from_secs(2),
            idle_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub missing_frames: u64,
    pub no_face: u64,
    pub rejected: u64,
    pub unknown: u64,
    pub marked: u64,
    pub already_marked: u64,
    pub failures: u64,
}

impl SessionStats {
    /// Account for one frame outcome.
    pub fn tally(&mut self, status: &FrameStatus) {
        match status {
            FrameStatus::FrameMissing => {
                self.missing_frames += 1;
                return;
            }
            FrameStatus::NoFace | FrameStatus::MultipleFaces { .. } | FrameStatus::LowQuality { .. } => {
                self.no_face += 1
            }
            FrameStatus::Rejected { .. } => self.rejected += 1,
            FrameStatus::Unknown => self.unknown += 1,
            FrameStatus::Marked { .. } => self.marked += 1,
            FrameStatus::AlreadyMarked { .. } => self.already_marked += 1,
            FrameStatus::ExtractorFailed { .. }
            | FrameStatus::MatchFailed { .. }
            | FrameStatus::StorageFailed { .. } => self.failures += 1,
        }
        self.frames += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Cancelled,
    SourceClosed,
    IdleTimeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub end: SessionEnd,
    pub stats: SessionStats,
}

#[derive(Error, Debug)]
pub enum ManualMarkError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
}

/// Mark a registered person present without a camera match.
pub fn mark_manual<S, A>(
    registry: &IdentityRegistry<S>,
    dedup: &mut Deduplicator<A>,
    id: &PersonId,
    at: DateTime<Local>,
) -> Result<DedupOutcome, ManualMarkError>
where
    S: RegistryStore,
    A: AttendanceStore,
{
    let person = registry.lookup(id)?;
    let outcome = dedup.mark(&person.id, at)?;
    tracing::info!(person = %person.id, marked = matches!(outcome, DedupOutcome::Marked(_)), "manual attendance");
    Ok(outcome)
}

/// One recognition session over a shared registry.
pub struct RecognitionSession<S, E, A> {
    id: Uuid,
    registry: Arc<IdentityRegistry<S>>,
    extractor: E,
    matcher: Box<dyn Matcher + Send>,
    dedup: Deduplicator<A>,
    config: SessionConfig,
    state: SessionState,
    stats: SessionStats,
}

impl<S, E, A> RecognitionSession<S, E, A>
where
    S: RegistryStore,
    E: EncodingExtractor,
    A: AttendanceStore,
{
    pub fn new(registry: Arc<IdentityRegistry<S>>, extractor: E, dedup: Deduplicator<A>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            extractor,
            matcher: Box::new(EuclideanMatcher),
            dedup,
            config,
            state: SessionState::Idle,
            stats: SessionStats::default(),
        }
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + Send + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session key the deduplicator would use at `at`.
    pub fn session_key(&self, at: DateTime<Local>) -> SessionKey {
        self.dedup.session_key(at)
    }

    /// Pre-load already stored attendees for the session key at `at`.
    pub fn seed(&mut self, at: DateTime<Local>) -> Result<usize, DedupError> {
        let key = self.dedup.session_key(at);
        self.dedup.seed(&key)
    }

    pub fn mark_manual(&mut self, id: &PersonId, at: DateTime<Local>) -> Result<DedupOutcome, ManualMarkError> {
        mark_manual(self.registry.as_ref(), &mut self.dedup, id, at)
    }

    /// Run one frame through extract → match → record.
    pub fn process_frame(&mut self, image: &FaceImage, at: DateTime<Local>) -> FrameStatus {
        self.enter(SessionState::Capturing);
        let status = match self.extractor.extract(image) {
            Ok(encoding) => {
                self.enter(SessionState::Matching);
                self.match_and_record(&encoding, at)
            }
            Err(e) => extract_status(e),
        };

        self.enter(status.state());
        self.stats.tally(&status);
        tracing::debug!(session = %self.id, %status, "frame processed");
        self.enter(SessionState::Idle);
        status
    }

    /// Account for a frame the source failed to deliver.
    pub fn frame_missing(&mut self) -> FrameStatus {
        let status = FrameStatus::FrameMissing;
        self.stats.tally(&status);
        status
    }

    /// Pull frames from `source` until cancelled, the source closes, or the
    /// idle timeout passes without a face.
    pub fn run<F, C>(&mut self, source: &mut F, cancel: &CancelToken, mut on_status: C) -> SessionSummary
    where
        F: FrameSource + ?Sized,
        C: FnMut(&FrameStatus),
    {
        match self.seed(Local::now()) {
            Ok(count) if count > 0 => tracing::info!(session = %self.id, count, "already marked this session"),
            Ok(_) => {}
            Err(e) => tracing::warn!(session = %self.id, error = %e, "could not pre-load attendance, relying on store"),
        }
        tracing::info!(session = %self.id, threshold = self.config.threshold, "recognition session started");

        let mut last_face = Instant::now();
        let end = loop {
            if cancel.is_cancelled() {
                break SessionEnd::Cancelled;
            }
            if let Some(idle) = self.config.idle_timeout {
                if last_face.elapsed() >= idle {
                    break SessionEnd::IdleTimeout;
                }
            }

            let status = match source.next_frame(self.config.frame_timeout) {
                FrameFetch::Frame(image) => self.process_frame(&image, Local::now()),
                FrameFetch::TimedOut => self.frame_missing(),
                FrameFetch::Closed => break SessionEnd::SourceClosed,
            };
            if status.face_seen() {
                last_face = Instant::now();
            }
            on_status(&status);
        };

        tracing::info!(
            session = %self.id,
            ?end,
            frames = self.stats.frames,
            marked = self.stats.marked,
            "recognition session ended"
        );
        SessionSummary {
            id: self.id,
            end,
            stats: self.stats,
        }
    }

    fn match_and_record(&mut self, encoding: &Encoding, at: DateTime<Local>) -> FrameStatus {
        let gallery = self.registry.snapshot();
        let result = match self.matcher.compare(encoding, &gallery, self.config.threshold) {
            Ok(r) => r,
            Err(e) => return FrameStatus::MatchFailed { error: e.to_string() },
        };

        match result.outcome {
            MatchOutcome::Unknown => FrameStatus::Unknown,
            MatchOutcome::Rejected | MatchOutcome::Ambiguous => FrameStatus::Rejected {
                distance: result.distance.unwrap_or(f32::INFINITY),
                ambiguous: result.outcome == MatchOutcome::Ambiguous,
            },
            MatchOutcome::Accepted => {
                let name = result.name.clone().unwrap_or_default();
                let distance = result.distance.unwrap_or_default();
                match self.dedup.record(&result, at) {
                    Ok(DedupOutcome::Marked(record)) => FrameStatus::Marked { record, name, distance },
                    Ok(DedupOutcome::AlreadyMarked { person_id, .. }) => FrameStatus::AlreadyMarked {
                        person_id,
                        name,
                        distance,
                    },
                    Err(e) => FrameStatus::StorageFailed {
                        person_id: result.person_id.clone().unwrap_or_else(|| PersonId::new("")),
                        error: e.to_string(),
                    },
                }
            }
        }
    }

    fn enter(&mut self, next: SessionState) {
        tracing::trace!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

fn extract_status(error: ExtractError) -> FrameStatus {
    match error {
        ExtractError::NoFaceDetected => FrameStatus::NoFace,
        ExtractError::MultipleFacesDetected { count } => FrameStatus::MultipleFaces { count },
        ExtractError::LowQualityInput(issue) => FrameStatus::LowQuality { issue },
        other => FrameStatus::ExtractorFailed {
            error: other.to_string(),
        },
    }
}
