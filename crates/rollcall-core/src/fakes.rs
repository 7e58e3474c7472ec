//! In-memory fakes (testing only).
//!
//! `MemoryStore` satisfies both storage traits; clones share state so one
//! instance can back a registry and a deduplicator while a test inspects it.
//! `FakeExtractor` maps a marker pixel to a scripted extraction result.

use crate::extractor::{EncodingExtractor, ExtractError, QualityIssue};
use crate::store::{AttendanceStore, InsertOutcome, RegistryStore, StoreError};
use crate::types::{
    AttendanceRecord, AttendanceRow, Encoding, EncodingId, EncodingSpec, FaceImage, Person, PersonId, SessionKey,
    StoredEncoding,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MemoryState {
    persons: Vec<Person>,
    attendance: Vec<AttendanceRecord>,
    next_encoding: i64,
    unavailable: bool,
}

impl MemoryState {
    fn writable(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Backend("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn stored(&mut self, encodings: &[Encoding]) -> Vec<StoredEncoding> {
        encodings
            .iter()
            .map(|encoding| {
                self.next_encoding += 1;
                StoredEncoding {
                    id: EncodingId(self.next_encoding),
                    encoding: encoding.clone(),
                }
            })
            .collect()
    }
}

/// Shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a backend error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn person_count(&self) -> usize {
        self.state.lock().unwrap().persons.len()
    }

    pub fn encoding_count(&self) -> usize {
        self.state.lock().unwrap().persons.iter().map(|p| p.encodings.len()).sum()
    }

    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        self.state.lock().unwrap().attendance.clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load_persons(&mut self) -> Result<Vec<Person>, StoreError> {
        let state = self.state.lock().unwrap();
        state.writable()?;
        Ok(state.persons.clone())
    }

    fn insert_person(
        &mut self,
        id: &PersonId,
        name: &str,
        created_at: DateTime<Utc>,
        encodings: &[Encoding],
    ) -> Result<Vec<EncodingId>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.writable()?;
        if state.persons.iter().any(|p| &p.id == id) {
            return Err(StoreError::Conflict(id.clone()));
        }
        let stored = state.stored(encodings);
        let ids = stored.iter().map(|s| s.id).collect();
        state.persons.push(Person {
            id: id.clone(),
            name: name.to_string(),
            encodings: stored,
            created_at,
        });
        Ok(ids)
    }

    fn insert_encodings(&mut self, id: &PersonId, encodings: &[Encoding]) -> Result<Vec<EncodingId>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.writable()?;
        if !state.persons.iter().any(|p| &p.id == id) {
            return Err(StoreError::MissingPerson(id.clone()));
        }
        let stored = state.stored(encodings);
        let ids = stored.iter().map(|s| s.id).collect();
        if let Some(person) = state.persons.iter_mut().find(|p| &p.id == id) {
            person.encodings.extend(stored);
        }
        Ok(ids)
    }

    fn delete_encoding(&mut self, id: &PersonId, encoding: EncodingId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.writable()?;
        let Some(person) = state.persons.iter_mut().find(|p| &p.id == id) else {
            return Ok(false);
        };
        let before = person.encodings.len();
        person.encodings.retain(|e| e.id != encoding);
        Ok(person.encodings.len() != before)
    }

    fn delete_person(&mut self, id: &PersonId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.writable()?;
        let before = state.persons.len();
        state.persons.retain(|p| &p.id != id);
        state.attendance.retain(|r| &r.person_id != id);
        Ok(state.persons.len() != before)
    }
}

impl AttendanceStore for MemoryStore {
    fn insert_attendance(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.writable()?;
        let exists = state
            .attendance
            .iter()
            .any(|r| r.person_id == record.person_id && r.session_key == record.session_key);
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }
        state.attendance.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn session_attendees(&mut self, key: &SessionKey) -> Result<Vec<PersonId>, StoreError> {
        let state = self.state.lock().unwrap();
        state.writable()?;
        Ok(state
            .attendance
            .iter()
            .filter(|r| &r.session_key == key)
            .map(|r| r.person_id.clone())
            .collect())
    }

    fn attendance_between(
        &mut self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        let state = self.state.lock().unwrap();
        state.writable()?;
        let mut rows: Vec<AttendanceRow> = state
            .attendance
            .iter()
            .filter(|r| {
                let day = r.timestamp.date_naive();
                from.map_or(true, |f| day >= f) && to.map_or(true, |t| day <= t)
            })
            .filter_map(|r| {
                let person = state.persons.iter().find(|p| p.id == r.person_id)?;
                Some(AttendanceRow {
                    person_id: r.person_id.clone(),
                    name: person.name.clone(),
                    timestamp: r.timestamp,
                    session_key: r.session_key.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }
}

/// Scripted extraction result for one marker value.
#[derive(Debug, Clone)]
pub enum FakeFace {
    Encode(Encoding),
    NoFace,
    MultipleFaces(usize),
    LowQuality(QualityIssue),
}

/// Deterministic extractor keyed by the first pixel of the image.
///
/// Unscripted markers behave like an empty frame.
#[derive(Debug, Clone)]
pub struct FakeExtractor {
    spec: EncodingSpec,
    faces: HashMap<u8, FakeFace>,
}

impl FakeExtractor {
    pub fn new(spec: EncodingSpec) -> Self {
        Self {
            spec,
            faces: HashMap::new(),
        }
    }

    pub fn with(mut self, marker: u8, face: FakeFace) -> Self {
        self.faces.insert(marker, face);
        self
    }

    /// A small uniform image carrying `marker`.
    pub fn image(marker: u8) -> FaceImage {
        FaceImage::from_luma(vec![marker; 16], 4, 4).expect("4x4 buffer")
    }
}

impl EncodingExtractor for FakeExtractor {
    fn spec(&self) -> EncodingSpec {
        self.spec.clone()
    }

    fn extract(&mut self, image: &FaceImage) -> Result<Encoding, ExtractError> {
        let marker = image.data().first().copied().unwrap_or(0);
        match self.faces.get(&marker) {
            Some(FakeFace::Encode(e)) => Ok(e.clone()),
            Some(FakeFace::MultipleFaces(count)) => Err(ExtractError::MultipleFacesDetected { count: *count }),
            Some(FakeFace::LowQuality(issue)) => Err(ExtractError::LowQualityInput(issue.clone())),
            Some(FakeFace::NoFace) | None => Err(ExtractError::NoFaceDetected),
        }
    }
}
