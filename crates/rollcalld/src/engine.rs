use crate::config::Config;
use crate::seal::EncodingCipher;
use crate::store::SqliteStore;
use chrono::{DateTime, Local};
use rollcall_core::dedup::{DedupOutcome, Deduplicator, SessionKeyPolicy};
use rollcall_core::enrollment::{EnrollError, EnrollmentPipeline, EnrollmentSummary};
use rollcall_core::extractor::{ExtractError, OnnxExtractor};
use rollcall_core::registry::IdentityRegistry;
use rollcall_core::session::{
    self, CancelToken, FrameStatus, ManualMarkError, RecognitionSession, SessionStats, SessionSummary,
};
use rollcall_core::store::StoreError;
use rollcall_core::types::{FaceImage, FaceImageError, PersonId, SessionKey};
use rollcall_hw::frame::Frame;
use rollcall_hw::{Camera, CameraError, Clahe};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Statuses kept for `SessionStatus` replies.
const RECENT_STATUSES: usize = 20;

pub type Registry = IdentityRegistry<SqliteStore>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    Model(#[from] ExtractError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    ManualMark(#[from] ManualMarkError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot use image {path}: {source}")]
    Image { path: PathBuf, source: FaceImageError },
    #[error("camera delivered no usable frames ({dark} dark)")]
    NoFramesCaptured { dark: usize },
    #[error("a recognition session is already running")]
    SessionActive,
    #[error("no recognition session is running")]
    NoSession,
    #[error("camera is in use by the running session")]
    CameraInUse,
    #[error("cannot start thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Reply to a manual mark.
#[derive(Debug, Clone, Serialize)]
pub struct MarkReply {
    pub person_id: PersonId,
    pub name: String,
    pub session_key: SessionKey,
    /// False when the person was already marked for the session.
    pub marked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkedEntry {
    pub person_id: PersonId,
    pub name: String,
    pub at: DateTime<Local>,
}

/// Live view of a recognition session, shared with the session thread.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMonitor {
    pub id: Uuid,
    pub policy: SessionKeyPolicy,
    pub session_key: SessionKey,
    pub started_at: DateTime<Local>,
    pub stats: SessionStats,
    pub marked: Vec<MarkedEntry>,
    pub recent: VecDeque<RecentStatus>,
    /// Set once the session has ended.
    pub summary: Option<SessionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentStatus {
    pub at: DateTime<Local>,
    pub message: String,
    #[serde(flatten)]
    pub status: FrameStatus,
}

impl SessionMonitor {
    pub fn new(id: Uuid, policy: SessionKeyPolicy, started_at: DateTime<Local>) -> Self {
        Self {
            id,
            session_key: policy.key_for(started_at),
            policy,
            started_at,
            stats: SessionStats::default(),
            marked: Vec::new(),
            recent: VecDeque::with_capacity(RECENT_STATUSES),
            summary: None,
        }
    }

    pub fn observe(&mut self, status: &FrameStatus, at: DateTime<Local>) {
        self.stats.tally(status);
        if let FrameStatus::Marked { record, name, .. } = status {
            self.marked.push(MarkedEntry {
                person_id: record.person_id.clone(),
                name: name.clone(),
                at: record.timestamp,
            });
            self.session_key = record.session_key.clone();
        }
        // Missing frames only repeat; keep the list readable.
        if matches!(status, FrameStatus::FrameMissing)
            && matches!(self.recent.back(), Some(r) if r.status == FrameStatus::FrameMissing)
        {
            return;
        }
        if self.recent.len() == RECENT_STATUSES {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentStatus {
            at,
            message: status.to_string(),
            status: status.clone(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusReport {
    pub active: bool,
    pub session: Option<SessionMonitor>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    EnrollFiles {
        id: PersonId,
        name: String,
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<EnrollmentSummary, EngineError>>,
    },
    EnrollCamera {
        id: PersonId,
        name: String,
        reply: oneshot::Sender<Result<EnrollmentSummary, EngineError>>,
    },
    ReEnroll {
        id: PersonId,
        /// Captures from the camera when `None`.
        paths: Option<Vec<PathBuf>>,
        reply: oneshot::Sender<Result<EnrollmentSummary, EngineError>>,
    },
    StartSession {
        policy: Option<SessionKeyPolicy>,
        reply: oneshot::Sender<Result<SessionMonitor, EngineError>>,
    },
    StopSession {
        reply: oneshot::Sender<Result<SessionSummary, EngineError>>,
    },
    SessionStatus {
        reply: oneshot::Sender<SessionStatusReport>,
    },
    MarkManual {
        id: PersonId,
        reply: oneshot::Sender<Result<MarkReply, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll a new person from image files.
    pub async fn enroll_files(
        &self,
        id: PersonId,
        name: String,
        paths: Vec<PathBuf>,
    ) -> Result<EnrollmentSummary, EngineError> {
        self.call(|reply| EngineRequest::EnrollFiles { id, name, paths, reply })
            .await?
    }

    /// Enroll a new person from live camera frames.
    pub async fn enroll_camera(&self, id: PersonId, name: String) -> Result<EnrollmentSummary, EngineError> {
        self.call(|reply| EngineRequest::EnrollCamera { id, name, reply }).await?
    }

    pub async fn re_enroll(
        &self,
        id: PersonId,
        paths: Option<Vec<PathBuf>>,
    ) -> Result<EnrollmentSummary, EngineError> {
        self.call(|reply| EngineRequest::ReEnroll { id, paths, reply }).await?
    }

    pub async fn start_session(&self, policy: Option<SessionKeyPolicy>) -> Result<SessionMonitor, EngineError> {
        self.call(|reply| EngineRequest::StartSession { policy, reply }).await?
    }

    pub async fn stop_session(&self) -> Result<SessionSummary, EngineError> {
        self.call(|reply| EngineRequest::StopSession { reply }).await?
    }

    pub async fn session_status(&self) -> Result<SessionStatusReport, EngineError> {
        self.call(|reply| EngineRequest::SessionStatus { reply }).await
    }

    pub async fn mark_manual(&self, id: PersonId) -> Result<MarkReply, EngineError> {
        self.call(|reply| EngineRequest::MarkManual { id, reply }).await?
    }
}

struct ActiveSession {
    cancel: CancelToken,
    monitor: Arc<Mutex<SessionMonitor>>,
    worker: JoinHandle<SessionSummary>,
    capture: JoinHandle<()>,
}

impl ActiveSession {
    fn snapshot(&self) -> SessionMonitor {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cancel, wait for both threads and return the final summary.
    fn shut_down(self) -> SessionSummary {
        self.cancel.cancel();
        let summary = match self.worker.join() {
            Ok(summary) => summary,
            Err(_) => {
                tracing::error!("session thread panicked");
                let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
                SessionSummary {
                    id: monitor.id,
                    end: rollcall_core::session::SessionEnd::Cancelled,
                    stats: monitor.stats,
                }
            }
        };
        if self.capture.join().is_err() {
            tracing::error!("capture thread panicked");
        }
        summary
    }
}

struct Engine {
    config: Config,
    cipher: Option<EncodingCipher>,
    registry: Arc<Registry>,
    extractor: OnnxExtractor,
    pipeline: EnrollmentPipeline,
    session: Option<ActiveSession>,
    /// Last finished session, kept for status queries.
    last: Option<SessionMonitor>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models up front and fails fast if they are missing. The
/// camera is opened per operation so file enrollment and reports work on a
/// machine without one.
pub fn spawn_engine(
    config: Config,
    cipher: Option<EncodingCipher>,
    registry: Arc<Registry>,
) -> Result<EngineHandle, EngineError> {
    let extractor = OnnxExtractor::load(&config.model_dir)?;
    tracing::info!(dir = %config.model_dir.display(), "SCRFD and ArcFace models loaded");

    let mut engine = Engine {
        pipeline: EnrollmentPipeline::new(config.min_enroll_samples),
        config,
        cipher,
        registry,
        extractor,
        session: None,
        last: None,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            if let Some(active) = engine.session.take() {
                active.shut_down();
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl Engine {
    fn handle(&mut self, req: EngineRequest) {
        self.reap_finished();
        match req {
            EngineRequest::EnrollFiles { id, name, paths, reply } => {
                let result = load_images(&paths).and_then(|images| self.enroll(id, &name, &images));
                let _ = reply.send(result);
            }
            EngineRequest::EnrollCamera { id, name, reply } => {
                let result = self.capture_enrollment().and_then(|images| self.enroll(id, &name, &images));
                let _ = reply.send(result);
            }
            EngineRequest::ReEnroll { id, paths, reply } => {
                let images = match paths {
                    Some(paths) => load_images(&paths),
                    None => self.capture_enrollment(),
                };
                let result = images.and_then(|images| self.re_enroll(&id, &images));
                let _ = reply.send(result);
            }
            EngineRequest::StartSession { policy, reply } => {
                let _ = reply.send(self.start_session(policy));
            }
            EngineRequest::StopSession { reply } => {
                let _ = reply.send(self.stop_session());
            }
            EngineRequest::SessionStatus { reply } => {
                let report = match &self.session {
                    Some(active) => SessionStatusReport {
                        active: true,
                        session: Some(active.snapshot()),
                    },
                    None => SessionStatusReport {
                        active: false,
                        session: self.last.clone(),
                    },
                };
                let _ = reply.send(report);
            }
            EngineRequest::MarkManual { id, reply } => {
                let _ = reply.send(self.mark_manual(&id));
            }
        }
    }

    fn open_store(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.config.db_path, self.config.store_timeout(), self.cipher.clone())
    }

    fn enroll(&mut self, id: PersonId, name: &str, images: &[FaceImage]) -> Result<EnrollmentSummary, EngineError> {
        let report = self
            .pipeline
            .enroll(&*self.registry, &mut self.extractor, id, name, images)?;
        Ok(report.summary())
    }

    fn re_enroll(&mut self, id: &PersonId, images: &[FaceImage]) -> Result<EnrollmentSummary, EngineError> {
        let report = self
            .pipeline
            .re_enroll(&*self.registry, &mut self.extractor, id, images)?;
        Ok(report.summary())
    }

    /// Capture enrollment frames, skipping dark ones.
    fn capture_enrollment(&self) -> Result<Vec<FaceImage>, EngineError> {
        if self.session.is_some() {
            return Err(EngineError::CameraInUse);
        }
        let cfg = &self.config;
        let camera = Camera::open(&cfg.camera_device, cfg.camera_width, cfg.camera_height)?
            .with_timeout(cfg.frame_timeout());
        let clahe = cfg.enhance_contrast.then(Clahe::default);
        let batch = camera.capture_frames(cfg.frames_per_enroll, cfg.warmup_frames, clahe.as_ref())?;
        tracing::info!(captured = batch.frames.len(), dark = batch.dark, "enrollment frames captured");

        if batch.frames.is_empty() {
            return Err(EngineError::NoFramesCaptured { dark: batch.dark });
        }
        batch
            .frames
            .into_iter()
            .map(|frame| {
                frame_to_image(frame).map_err(|source| EngineError::Image {
                    path: PathBuf::from(&cfg.camera_device),
                    source,
                })
            })
            .collect()
    }

    fn start_session(&mut self, policy: Option<SessionKeyPolicy>) -> Result<SessionMonitor, EngineError> {
        if self.session.is_some() {
            return Err(EngineError::SessionActive);
        }
        let cfg = &self.config;
        let policy = policy.unwrap_or_else(|| cfg.session_policy.clone());

        let camera = Camera::open(&cfg.camera_device, cfg.camera_width, cfg.camera_height)?
            .with_timeout(cfg.frame_timeout());
        let extractor = OnnxExtractor::load(&cfg.model_dir)?;
        let dedup = Deduplicator::new(self.open_store()?, policy.clone());
        let mut session = RecognitionSession::new(Arc::clone(&self.registry), extractor, dedup, cfg.session_config());

        let cancel = CancelToken::new();
        let monitor = Arc::new(Mutex::new(SessionMonitor::new(session.id(), policy, Local::now())));
        let (tx, rx) = sync_channel::<FaceImage>(2);

        let capture = {
            let cancel = cancel.clone();
            let clahe = cfg.enhance_contrast.then(Clahe::default);
            let warmup = cfg.warmup_frames;
            std::thread::Builder::new()
                .name("rollcall-capture".into())
                .spawn(move || run_capture(camera, tx, cancel, warmup, clahe))
                .map_err(EngineError::Spawn)?
        };

        let worker = {
            let cancel = cancel.clone();
            let monitor = Arc::clone(&monitor);
            std::thread::Builder::new()
                .name("rollcall-session".into())
                .spawn(move || {
                    let mut frames = rx;
                    let summary = session.run(&mut frames, &cancel, |status| {
                        monitor
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .observe(status, Local::now());
                    });
                    // Stops the capture thread when the session ends on its own.
                    cancel.cancel();
                    monitor.lock().unwrap_or_else(PoisonError::into_inner).summary = Some(summary.clone());
                    summary
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                cancel.cancel();
                let _ = capture.join();
                return Err(EngineError::Spawn(e));
            }
        };

        let active = ActiveSession {
            cancel,
            monitor,
            worker,
            capture,
        };
        let snapshot = active.snapshot();
        tracing::info!(session = %snapshot.id, key = %snapshot.session_key, "session started");
        self.session = Some(active);
        Ok(snapshot)
    }

    fn stop_session(&mut self) -> Result<SessionSummary, EngineError> {
        let active = self.session.take().ok_or(EngineError::NoSession)?;
        let monitor = Arc::clone(&active.monitor);
        let summary = active.shut_down();

        let mut last = monitor.lock().unwrap_or_else(PoisonError::into_inner).clone();
        last.summary = Some(summary.clone());
        self.last = Some(last);
        tracing::info!(session = %summary.id, marked = summary.stats.marked, "session stopped");
        Ok(summary)
    }

    /// Collect a session whose thread ended by itself (idle timeout, camera gone).
    fn reap_finished(&mut self) {
        if self.session.as_ref().is_some_and(ActiveSession::is_finished) {
            if let Some(active) = self.session.take() {
                let monitor = Arc::clone(&active.monitor);
                let summary = active.shut_down();
                tracing::info!(session = %summary.id, end = ?summary.end, "session ended on its own");
                self.last = Some(monitor.lock().unwrap_or_else(PoisonError::into_inner).clone());
            }
        }
    }

    fn mark_manual(&mut self, id: &PersonId) -> Result<MarkReply, EngineError> {
        let policy = match &self.session {
            Some(active) => active.snapshot().policy,
            None => self.config.session_policy.clone(),
        };
        let mut dedup = Deduplicator::new(self.open_store()?, policy);
        let now = Local::now();
        let outcome = session::mark_manual(&*self.registry, &mut dedup, id, now)?;
        let name = self.registry.lookup(id).map(|p| p.name).unwrap_or_default();

        let (session_key, marked) = match outcome {
            DedupOutcome::Marked(record) => {
                if let Some(active) = &self.session {
                    active
                        .monitor
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .marked
                        .push(MarkedEntry {
                            person_id: id.clone(),
                            name: name.clone(),
                            at: record.timestamp,
                        });
                }
                (record.session_key, true)
            }
            DedupOutcome::AlreadyMarked { session_key, .. } => (session_key, false),
        };

        Ok(MarkReply {
            person_id: id.clone(),
            name,
            session_key,
            marked,
        })
    }
}

/// Consecutive hard camera errors before the producer gives up.
const MAX_CAPTURE_FAILURES: u32 = 10;

/// Why the capture producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureEnd {
    Cancelled,
    ReceiverGone,
    CameraFailed,
}

/// Camera thread body. Every frame wait is bounded by the camera timeout so
/// cancellation is noticed even when the device stalls.
fn run_capture(
    camera: Camera,
    tx: SyncSender<FaceImage>,
    cancel: CancelToken,
    warmup: usize,
    clahe: Option<Clahe>,
) {
    let mut stream = match camera.stream() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "cannot start camera stream");
            return;
        }
    };
    for _ in 0..warmup {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = stream.next_frame() {
            tracing::warn!(error = %e, "warmup frame failed");
        }
    }

    let end = capture_loop(|| stream.next_frame(), &tx, &cancel, clahe.as_ref());
    tracing::debug!(?end, "capture thread exiting");
}

/// Feed frames from `next_frame` into the bounded channel until cancelled,
/// the session drops its receiver, or the camera keeps failing.
fn capture_loop(
    mut next_frame: impl FnMut() -> Result<Frame, CameraError>,
    tx: &SyncSender<FaceImage>,
    cancel: &CancelToken,
    clahe: Option<&Clahe>,
) -> CaptureEnd {
    let mut failures = 0u32;
    while !cancel.is_cancelled() {
        let mut frame = match next_frame() {
            Ok(frame) => {
                failures = 0;
                frame
            }
            // A stalled device; the session reports missing frames meanwhile.
            Err(CameraError::Timeout(waited)) => {
                tracing::debug!(?waited, "no frame from camera");
                continue;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "frame capture failed");
                if failures >= MAX_CAPTURE_FAILURES {
                    tracing::error!("camera keeps failing, stopping capture");
                    return CaptureEnd::CameraFailed;
                }
                continue;
            }
        };
        if let Some(clahe) = clahe {
            clahe.apply(&mut frame.data, frame.width, frame.height);
        }
        let image = match frame_to_image(frame) {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed frame");
                continue;
            }
        };
        if tx.send(image).is_err() {
            return CaptureEnd::ReceiverGone;
        }
    }
    CaptureEnd::Cancelled
}

fn frame_to_image(frame: Frame) -> Result<FaceImage, FaceImageError> {
    FaceImage::from_luma(frame.data, frame.width, frame.height)
}

fn load_images(paths: &[PathBuf]) -> Result<Vec<FaceImage>, EngineError> {
    paths
        .iter()
        .map(|path| {
            FaceImage::open(path).map_err(|source| EngineError::Image {
                path: path.clone(),
                source,
            })
        })
        .collect()
}
