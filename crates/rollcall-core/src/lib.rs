//! rollcall-core: face encodings, identity registry and attendance engine.
//!
//! Encodings come from SCRFD detection plus ArcFace recognition over ONNX
//! Runtime. Matching, de-duplication, enrollment and the recognition loop are
//! pure logic over the [`store`] traits, so they run the same against SQLite
//! in the daemon and the in-memory [`fakes`] in tests.

pub mod alignment;
pub mod dedup;
pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod fakes;
pub mod matcher;
pub mod recognizer;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use dedup::{DedupError, DedupOutcome, Deduplicator, SessionKeyPolicy};
pub use enrollment::{EnrollError, EnrollmentPipeline, EnrollmentReport};
pub use extractor::{EncodingExtractor, ExtractError, OnnxExtractor, QualityIssue};
pub use matcher::{EuclideanMatcher, MatchOutcome, MatchResult, Matcher};
pub use registry::{Gallery, IdentityRegistry, RegistryError};
pub use session::{CancelToken, FrameSource, FrameStatus, RecognitionSession, SessionConfig};
pub use store::{AttendanceStore, RegistryStore, StoreError};
pub use types::{
    AttendanceRecord, AttendanceRow, BoundingBox, Encoding, EncodingId, EncodingSpec, FaceImage, Person, PersonId,
    SessionKey,
};

/// Default location of `det_10g.onnx` and `w600k_r50.onnx`.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/var/lib/rollcall/models")
}
