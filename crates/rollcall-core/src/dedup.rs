//! Attendance de-duplication.
//!
//! The [`Deduplicator`] is the only writer of attendance records: one record
//! per (person, session key), however many frames recognize the person.

use crate::matcher::MatchResult;
use crate::store::{AttendanceStore, InsertOutcome, StoreError};
use crate::types::{AttendanceRecord, PersonId, SessionKey};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How timestamps are bucketed into session keys.
///
/// Serialized as its display form (`daily`, `window:300`, `fixed:exam-1`),
/// the same text accepted from the environment, D-Bus and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionKeyPolicy {
    /// One session per local calendar day (`YYYY-MM-DD`).
    #[default]
    Daily,
    /// Fixed windows of `seconds`, aligned to the Unix epoch. Keys name the
    /// window start in UTC so a repeated local hour never reuses a key.
    Window { seconds: u64 },
    /// A single named session regardless of time.
    Fixed { name: String },
}

impl SessionKeyPolicy {
    pub fn key_for(&self, at: DateTime<Local>) -> SessionKey {
        match self {
            Self::Daily => SessionKey::new(at.format("%Y-%m-%d").to_string()),
            Self::Window { seconds } => {
                let len = (*seconds).max(1) as i64;
                let start = at.timestamp().div_euclid(len) * len;
                let start = Utc
                    .timestamp_opt(start, 0)
                    .single()
                    .unwrap_or_else(|| at.with_timezone(&Utc));
                SessionKey::new(format!("{}/{len}s", start.format("%Y-%m-%dT%H:%M:%SZ")))
            }
            Self::Fixed { name } => SessionKey::new(name.clone()),
        }
    }
}

impl fmt::Display for SessionKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Window { seconds } => write!(f, "window:{seconds}"),
            Self::Fixed { name } => write!(f, "fixed:{name}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid session policy {0:?}: expected daily, window:<seconds> or fixed:<name>")]
pub struct ParsePolicyError(String);

impl FromStr for SessionKeyPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParsePolicyError(s.to_string());
        match s.trim().split_once(':') {
            None if s.trim().eq_ignore_ascii_case("daily") => Ok(Self::Daily),
            Some(("window", secs)) => match secs.trim().parse::<u64>() {
                Ok(seconds) if seconds > 0 => Ok(Self::Window { seconds }),
                _ => Err(invalid()),
            },
            Some(("fixed", name)) if !name.trim().is_empty() => Ok(Self::Fixed {
                name: name.trim().to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for SessionKeyPolicy {
    type Error = ParsePolicyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionKeyPolicy> for String {
    fn from(policy: SessionKeyPolicy) -> Self {
        policy.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// A new record was written.
    Marked(AttendanceRecord),
    /// The person already has a record for this session key.
    AlreadyMarked { person_id: PersonId, session_key: SessionKey },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DedupError {
    #[error("match result carries no identity")]
    Unmatched,
    #[error("attendance not recorded: {0}")]
    Storage(#[from] StoreError),
}

/// Per-session log of who has been marked, backed by durable storage.
pub struct Deduplicator<A> {
    policy: SessionKeyPolicy,
    store: A,
    log: HashSet<(PersonId, SessionKey)>,
}

impl<A: AttendanceStore> Deduplicator<A> {
    pub fn new(store: A, policy: SessionKeyPolicy) -> Self {
        Self {
            policy,
            store,
            log: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &SessionKeyPolicy {
        &self.policy
    }

    pub fn session_key(&self, at: DateTime<Local>) -> SessionKey {
        self.policy.key_for(at)
    }

    /// Load already-stored attendees for `key` into the log.
    pub fn seed(&mut self, key: &SessionKey) -> Result<usize, DedupError> {
        let attendees = self.store.session_attendees(key)?;
        let count = attendees.len();
        self.log.extend(attendees.into_iter().map(|id| (id, key.clone())));
        tracing::debug!(session = %key, count, "dedup log seeded");
        Ok(count)
    }

    /// Record an accepted match.
    pub fn record(&mut self, result: &MatchResult, at: DateTime<Local>) -> Result<DedupOutcome, DedupError> {
        match (&result.person_id, result.is_match()) {
            (Some(id), true) => self.mark(id, at),
            _ => Err(DedupError::Unmatched),
        }
    }

    /// Record `person_id` as present at `at`, unless already marked for the session.
    ///
    /// On a storage failure the log is left untouched so a later attempt retries.
    pub fn mark(&mut self, person_id: &PersonId, at: DateTime<Local>) -> Result<DedupOutcome, DedupError> {
        let session_key = self.policy.key_for(at);
        let entry = (person_id.clone(), session_key);

        if self.log.contains(&entry) {
            let (person_id, session_key) = entry;
            return Ok(DedupOutcome::AlreadyMarked { person_id, session_key });
        }

        let record = AttendanceRecord {
            person_id: entry.0.clone(),
            timestamp: at,
            session_key: entry.1.clone(),
        };

        match self.store.insert_attendance(&record) {
            Ok(InsertOutcome::Inserted) => {
                self.log.insert(entry);
                tracing::info!(person = %record.person_id, session = %record.session_key, "attendance marked");
                Ok(DedupOutcome::Marked(record))
            }
            Ok(InsertOutcome::Duplicate) => {
                tracing::debug!(person = %record.person_id, "attendance already stored for session");
                self.log.insert(entry);
                let (person_id, session_key) = (record.person_id, record.session_key);
                Ok(DedupOutcome::AlreadyMarked { person_id, session_key })
            }
            Err(e) => {
                tracing::warn!(person = %record.person_id, error = %e, "attendance write failed");
                Err(e.into())
            }
        }
    }

    pub fn is_marked(&self, person_id: &PersonId, key: &SessionKey) -> bool {
        self.log.contains(&(person_id.clone(), key.clone()))
    }

    /// Number of (person, session) pairs in the log.
    pub fn logged(&self) -> usize {
        self.log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryStore;
    use crate::matcher::{MatchOutcome, MatchResult};
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, min: u32) -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    fn accepted(id: &str) -> MatchResult {
        MatchResult {
            outcome: MatchOutcome::Accepted,
            person_id: Some(PersonId::new(id)),
            name: Some(id.to_uppercase()),
            distance: Some(0.2),
            threshold: 1.0,
        }
    }

    #[test]
    fn test_second_mark_same_day_is_suppressed() {
        let store = MemoryStore::new();
        let mut dedup = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);

        let first = dedup.record(&accepted("1"), at(2, 9, 0)).unwrap();
        assert!(matches!(first, DedupOutcome::Marked(ref r) if r.session_key.as_str() == "2026-03-02"));

        let second = dedup.record(&accepted("1"), at(2, 15, 30)).unwrap();
        assert!(matches!(second, DedupOutcome::AlreadyMarked { .. }));
        assert_eq!(store.attendance().len(), 1);
    }

    #[test]
    fn test_next_day_is_a_new_session() {
        let store = MemoryStore::new();
        let mut dedup = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);
        dedup.record(&accepted("1"), at(2, 9, 0)).unwrap();
        let next = dedup.record(&accepted("1"), at(3, 9, 0)).unwrap();
        assert!(matches!(next, DedupOutcome::Marked(_)));
        assert_eq!(store.attendance().len(), 2);
    }

    #[test]
    fn test_unmatched_result_is_refused() {
        let mut dedup = Deduplicator::new(MemoryStore::new(), SessionKeyPolicy::Daily);
        let err = dedup.record(&MatchResult::unknown(1.0), at(2, 9, 0)).unwrap_err();
        assert_eq!(err, DedupError::Unmatched);
        assert_eq!(dedup.logged(), 0);
    }

    #[test]
    fn test_stored_duplicate_reports_already_marked() {
        let store = MemoryStore::new();
        Deduplicator::new(store.clone(), SessionKeyPolicy::Daily)
            .record(&accepted("1"), at(2, 9, 0))
            .unwrap();

        // A fresh log (daemon restart) still must not double-log.
        let mut dedup = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);
        let outcome = dedup.record(&accepted("1"), at(2, 10, 0)).unwrap();
        assert!(matches!(outcome, DedupOutcome::AlreadyMarked { .. }));
        assert!(dedup.is_marked(&"1".into(), &SessionKey::new("2026-03-02")));
        assert_eq!(store.attendance().len(), 1);
    }

    #[test]
    fn test_seed_loads_existing_attendees() {
        let store = MemoryStore::new();
        let mut first = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);
        first.record(&accepted("1"), at(2, 9, 0)).unwrap();
        first.record(&accepted("2"), at(2, 9, 1)).unwrap();

        let mut dedup = Deduplicator::new(store, SessionKeyPolicy::Daily);
        assert_eq!(dedup.seed(&SessionKey::new("2026-03-02")).unwrap(), 2);
        assert!(dedup.is_marked(&"2".into(), &SessionKey::new("2026-03-02")));
    }

    #[test]
    fn test_storage_failure_is_reported_and_retried() {
        let store = MemoryStore::new();
        let mut dedup = Deduplicator::new(store.clone(), SessionKeyPolicy::Daily);

        store.set_unavailable(true);
        let err = dedup.record(&accepted("1"), at(2, 9, 0)).unwrap_err();
        assert!(matches!(err, DedupError::Storage(_)));
        assert_eq!(dedup.logged(), 0);

        store.set_unavailable(false);
        let retry = dedup.record(&accepted("1"), at(2, 9, 1)).unwrap();
        assert!(matches!(retry, DedupOutcome::Marked(_)));
    }

    #[test]
    fn test_window_policy_buckets() {
        let policy = SessionKeyPolicy::Window { seconds: 300 };
        let a = policy.key_for(at(2, 9, 1));
        let b = policy.key_for(at(2, 9, 4));
        let c = policy.key_for(at(2, 9, 6));
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_window_keys_follow_the_instant_not_the_wall_clock() {
        let policy = SessionKeyPolicy::Window { seconds: 3600 };
        // 01:30 local twice on a fall-back night: one hour apart in UTC.
        let first = Utc.with_ymd_and_hms(2026, 11, 1, 5, 30, 0).unwrap().with_timezone(&Local);
        let second = Utc.with_ymd_and_hms(2026, 11, 1, 6, 30, 0).unwrap().with_timezone(&Local);

        assert_eq!(policy.key_for(first).as_str(), "2026-11-01T05:00:00Z/3600s");
        assert_eq!(policy.key_for(second).as_str(), "2026-11-01T06:00:00Z/3600s");

        let mut dedup = Deduplicator::new(MemoryStore::new(), policy);
        dedup.record(&accepted("1"), first).unwrap();
        let later = dedup.record(&accepted("1"), second).unwrap();
        assert!(matches!(later, DedupOutcome::Marked(_)));
    }

    #[test]
    fn test_policy_serde_uses_display_form() {
        let policy = SessionKeyPolicy::Window { seconds: 300 };
        assert_eq!(serde_json::to_value(&policy).unwrap(), "window:300");
        let parsed: SessionKeyPolicy = serde_json::from_str("\"fixed:exam-1\"").unwrap();
        assert_eq!(parsed, SessionKeyPolicy::Fixed { name: "exam-1".into() });
        assert!(serde_json::from_str::<SessionKeyPolicy>("\"weekly\"").is_err());
    }

    #[test]
    fn test_fixed_policy_ignores_time() {
        let policy = SessionKeyPolicy::Fixed { name: "exam-1".into() };
        assert_eq!(policy.key_for(at(2, 9, 0)), policy.key_for(at(9, 17, 0)));
        assert_eq!(policy.key_for(at(2, 9, 0)).as_str(), "exam-1");
    }

    #[test]
    fn test_policy_parse_round_trip() {
        for text in ["daily", "window:300", "fixed:lecture-3"] {
            let policy: SessionKeyPolicy = text.parse().unwrap();
            assert_eq!(policy.to_string(), text);
        }
        assert!("window:0".parse::<SessionKeyPolicy>().is_err());
        assert!("weekly".parse::<SessionKeyPolicy>().is_err());
        assert!("fixed:".parse::<SessionKeyPolicy>().is_err());
    }
}
