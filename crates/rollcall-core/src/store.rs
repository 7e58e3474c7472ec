//! Storage contracts for the registry and the attendance log.
//!
//! The core only reaches persistence through these traits; it never issues
//! queries of its own.

use crate::types::{AttendanceRecord, AttendanceRow, Encoding, EncodingId, Person, PersonId, SessionKey};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("storage busy: timed out waiting for a lock")]
    Timeout,
    #[error("person {0} already stored")]
    Conflict(PersonId),
    #[error("person {0} is not stored")]
    MissingPerson(PersonId),
    #[error("corrupt encoding for {person}: {reason}")]
    Corrupt { person: PersonId, reason: String },
}

/// Outcome of an attendance insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The (person, session key) pair was already stored.
    Duplicate,
}

/// Durable persons and encodings.
///
/// Every method that writes more than one row must be atomic.
pub trait RegistryStore: Send {
    fn load_persons(&mut self) -> Result<Vec<Person>, StoreError>;

    /// Insert a new person and their encodings; returns the new encoding ids in order.
    fn insert_person(
        &mut self,
        id: &PersonId,
        name: &str,
        created_at: DateTime<Utc>,
        encodings: &[Encoding],
    ) -> Result<Vec<EncodingId>, StoreError>;

    fn insert_encodings(&mut self, id: &PersonId, encodings: &[Encoding]) -> Result<Vec<EncodingId>, StoreError>;

    /// Returns false if the encoding did not exist.
    fn delete_encoding(&mut self, id: &PersonId, encoding: EncodingId) -> Result<bool, StoreError>;

    /// Delete a person and everything that references them. Returns false if absent.
    fn delete_person(&mut self, id: &PersonId) -> Result<bool, StoreError>;
}

/// Durable attendance records.
pub trait AttendanceStore: Send {
    fn insert_attendance(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;

    /// Persons already recorded under `key`.
    fn session_attendees(&mut self, key: &SessionKey) -> Result<Vec<PersonId>, StoreError>;

    /// Records joined with names, newest first, bounded by inclusive local dates.
    fn attendance_between(
        &mut self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRow>, StoreError>;
}
