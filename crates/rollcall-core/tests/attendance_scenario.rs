//! Enroll one person, recognize them, and confirm a stranger is never logged.

use chrono::Local;
use rollcall_core::dedup::SessionKeyPolicy;
use rollcall_core::enrollment::EnrollmentPipeline;
use rollcall_core::fakes::{FakeExtractor, FakeFace, MemoryStore};
use rollcall_core::session::{FrameStatus, RecognitionSession, SessionConfig};
use rollcall_core::{Deduplicator, Encoding, EncodingSpec, IdentityRegistry, PersonId};
use std::sync::Arc;
use std::time::Duration;

const SPEC: EncodingSpec = EncodingSpec::new(4, true);

// Markers 1-4 are images of A, 20 is B who never enrolls.
fn extractor() -> FakeExtractor {
    FakeExtractor::new(SPEC)
        .with(1, FakeFace::Encode(Encoding::normalized(vec![1.0, 0.10, 0.0, 0.0])))
        .with(2, FakeFace::Encode(Encoding::normalized(vec![1.0, 0.0, 0.10, 0.0])))
        .with(3, FakeFace::Encode(Encoding::normalized(vec![1.0, 0.0, 0.0, 0.10])))
        .with(4, FakeFace::Encode(Encoding::normalized(vec![1.0, 0.05, 0.05, 0.0])))
        .with(20, FakeFace::Encode(Encoding::normalized(vec![0.0, 1.0, 0.0, 1.0])))
}

#[test]
fn enroll_recognize_and_deduplicate() {
    let store = MemoryStore::new();
    let registry = Arc::new(IdentityRegistry::open(store.clone(), SPEC).unwrap());
    let mut extractor = extractor();

    let samples: Vec<_> = [1, 2, 3].iter().map(|m| FakeExtractor::image(*m)).collect();
    let report = EnrollmentPipeline::default()
        .enroll(&*registry, &mut extractor, PersonId::new("1"), "A", &samples)
        .unwrap();
    assert_eq!(report.person.encodings.len(), 3);
    assert_eq!(store.encoding_count(), 3);

    let config = SessionConfig {
        threshold: 0.6,
        frame_timeout: Duration::from_millis(10),
        idle_timeout: None,
    };
    let dedup = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);
    let mut session = RecognitionSession::new(Arc::clone(&registry), extractor, dedup, config);

    let now = Local::now();
    let today = now.format("%Y-%m-%d").to_string();

    match session.process_frame(&FakeExtractor::image(4), now) {
        FrameStatus::Marked { record, name, distance } => {
            assert_eq!(record.person_id, PersonId::new("1"));
            assert_eq!(record.session_key.as_str(), today);
            assert_eq!(name, "A");
            assert!(distance < 0.6);
        }
        other => panic!("expected a new record, got {other:?}"),
    }

    let again = session.process_frame(&FakeExtractor::image(4), now);
    assert!(matches!(again, FrameStatus::AlreadyMarked { ref person_id, .. } if person_id.as_str() == "1"));

    let stranger = session.process_frame(&FakeExtractor::image(20), now);
    assert!(matches!(stranger, FrameStatus::Rejected { .. }));

    let records = store.attendance();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].person_id, PersonId::new("1"));
}

#[test]
fn failed_enrollment_leaves_nothing_behind() {
    let store = MemoryStore::new();
    let registry = IdentityRegistry::open(store.clone(), SPEC).unwrap();
    let mut extractor = extractor();

    // Marker 99 is unscripted and reads as an empty frame.
    let samples: Vec<_> = [1, 99, 99].iter().map(|m| FakeExtractor::image(*m)).collect();
    let result = EnrollmentPipeline::default().enroll(&registry, &mut extractor, "1".into(), "A", &samples);

    assert!(result.is_err());
    assert!(registry.snapshot().is_empty());
    assert_eq!(store.person_count(), 0);
    assert_eq!(store.encoding_count(), 0);
}
