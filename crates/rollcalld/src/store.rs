//! SQLite persistence for persons, encodings and attendance.

use crate::seal::EncodingCipher;
use chrono::{DateTime, Local, NaiveDate, Utc};
use rollcall_core::store::{AttendanceStore, InsertOutcome, RegistryStore, StoreError};
use rollcall_core::types::{
    AttendanceRecord, AttendanceRow, Encoding, EncodingId, Person, PersonId, SessionKey, StoredEncoding,
};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS persons (
        identifier TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS encodings (
        id INTEGER PRIMARY KEY,
        person_identifier TEXT NOT NULL REFERENCES persons(identifier) ON DELETE CASCADE,
        vector BLOB NOT NULL,
        dimensionality INTEGER NOT NULL,
        normalized INTEGER NOT NULL DEFAULT 1,
        model_version TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY,
        person_identifier TEXT NOT NULL REFERENCES persons(identifier) ON DELETE CASCADE,
        timestamp TEXT NOT NULL,
        session_key TEXT NOT NULL,
        UNIQUE (person_identifier, session_key)
    );

    CREATE INDEX IF NOT EXISTS idx_encodings_person ON encodings(person_identifier);
    CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance(session_key);
    CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);

    INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '1');
";

/// SQLite-backed registry and attendance store.
///
/// One connection per owner: the registry, each recognition session and
/// one-off operations each open their own. WAL mode lets them read while
/// another writes; writers wait up to the busy timeout and then fail with
/// [`StoreError::Timeout`].
pub struct SqliteStore {
    conn: Connection,
    cipher: Option<EncodingCipher>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration, cipher: Option<EncodingCipher>) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Backend(format!("cannot create {}: {e}", dir.display())))?;
        }
        let conn = Connection::open(path).map_err(sql_error)?;
        conn.busy_timeout(busy_timeout).map_err(sql_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")
            .map_err(sql_error)?;
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(Self { conn, cipher })
    }

    /// Fresh in-memory database (for testing).
    pub fn in_memory(cipher: Option<EncodingCipher>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(sql_error)?;
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        Ok(Self { conn, cipher })
    }

    fn decode_vector(&self, person: &PersonId, blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            person: person.clone(),
            reason,
        };
        let plain = match &self.cipher {
            Some(cipher) => cipher.open(blob).map_err(|e| corrupt(e.to_string()))?,
            None => blob.to_vec(),
        };
        if plain.len() != dimension * 4 {
            return Err(corrupt(format!(
                "vector is {} bytes, expected {} for dimension {dimension}",
                plain.len(),
                dimension * 4
            )));
        }
        Ok(plain
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn person_exists(&self, id: &PersonId) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM persons WHERE identifier = ?1)",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_error)
    }
}

impl RegistryStore for SqliteStore {
    fn load_persons(&mut self) -> Result<Vec<Person>, StoreError> {
        let mut persons: Vec<Person> = {
            let mut stmt = self
                .conn
                .prepare("SELECT identifier, name, created_at FROM persons ORDER BY created_at, rowid")
                .map_err(sql_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })
                .map_err(sql_error)?;

            let mut persons = Vec::new();
            for row in rows {
                let (id, name, created_at) = row.map_err(sql_error)?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                persons.push(Person {
                    id: PersonId::new(id),
                    name,
                    encodings: Vec::new(),
                    created_at,
                });
            }
            persons
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, person_identifier, vector, dimensionality, normalized, model_version
                 FROM encodings ORDER BY id",
            )
            .map_err(sql_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(sql_error)?;

        for row in rows {
            let (id, owner, blob, dimension, normalized, model_version) = row.map_err(sql_error)?;
            let owner = PersonId::new(owner);
            let values = self.decode_vector(&owner, &blob, dimension.max(0) as usize)?;
            let Some(person) = persons.iter_mut().find(|p| p.id == owner) else {
                tracing::warn!(person = %owner, encoding = id, "orphan encoding skipped");
                continue;
            };
            person.encodings.push(StoredEncoding {
                id: EncodingId(id),
                encoding: Encoding::from_parts(values, normalized, model_version),
            });
        }

        Ok(persons)
    }

    fn insert_person(
        &mut self,
        id: &PersonId,
        name: &str,
        created_at: DateTime<Utc>,
        encodings: &[Encoding],
    ) -> Result<Vec<EncodingId>, StoreError> {
        let tx = self.conn.transaction().map_err(sql_error)?;
        let added = tx
            .execute(
                "INSERT OR IGNORE INTO persons (identifier, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), name, created_at.to_rfc3339()],
            )
            .map_err(sql_error)?;
        if added == 0 {
            return Err(StoreError::Conflict(id.clone()));
        }
        let ids = insert_vectors(&tx, self.cipher.as_ref(), id, encodings)?;
        tx.commit().map_err(sql_error)?;
        Ok(ids)
    }

    fn insert_encodings(&mut self, id: &PersonId, encodings: &[Encoding]) -> Result<Vec<EncodingId>, StoreError> {
        if !self.person_exists(id)? {
            return Err(StoreError::MissingPerson(id.clone()));
        }
        let tx = self.conn.transaction().map_err(sql_error)?;
        let ids = insert_vectors(&tx, self.cipher.as_ref(), id, encodings)?;
        tx.commit().map_err(sql_error)?;
        Ok(ids)
    }

    fn delete_encoding(&mut self, id: &PersonId, encoding: EncodingId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM encodings WHERE id = ?1 AND person_identifier = ?2",
                params![encoding.0, id.as_str()],
            )
            .map_err(sql_error)?;
        Ok(removed > 0)
    }

    fn delete_person(&mut self, id: &PersonId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM persons WHERE identifier = ?1", params![id.as_str()])
            .map_err(sql_error)?;
        Ok(removed > 0)
    }
}

impl AttendanceStore for SqliteStore {
    fn insert_attendance(&mut self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let result = self.conn.execute(
            "INSERT OR IGNORE INTO attendance (person_identifier, timestamp, session_key) VALUES (?1, ?2, ?3)",
            params![
                record.person_id.as_str(),
                record.timestamp.to_rfc3339(),
                record.session_key.as_str()
            ],
        );
        match result {
            Ok(0) => Ok(InsertOutcome::Duplicate),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(StoreError::MissingPerson(record.person_id.clone()))
            }
            Err(e) => Err(sql_error(e)),
        }
    }

    fn session_attendees(&mut self, key: &SessionKey) -> Result<Vec<PersonId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT person_identifier FROM attendance WHERE session_key = ?1")
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![key.as_str()], |row| row.get::<_, String>(0))
            .map_err(sql_error)?;
        let attendees = rows.map(|r| r.map(PersonId::new).map_err(sql_error)).collect();
        attendees
    }

    fn attendance_between(
        &mut self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        let day = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.person_identifier, p.name, a.timestamp, a.session_key
                 FROM attendance a JOIN persons p ON p.identifier = a.person_identifier
                 WHERE (?1 IS NULL OR substr(a.timestamp, 1, 10) >= ?1)
                   AND (?2 IS NULL OR substr(a.timestamp, 1, 10) <= ?2)
                 ORDER BY a.timestamp DESC, a.id DESC",
            )
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![day(from), day(to)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sql_error)?;

        let mut out = Vec::new();
        for row in rows {
            let (person_id, name, timestamp, session_key) = row.map_err(sql_error)?;
            let person_id = PersonId::new(person_id);
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| StoreError::Corrupt {
                    person: person_id.clone(),
                    reason: format!("bad attendance timestamp {timestamp:?}: {e}"),
                })?
                .with_timezone(&Local);
            out.push(AttendanceRow {
                person_id,
                name,
                timestamp,
                session_key: SessionKey::new(session_key),
            });
        }
        Ok(out)
    }
}

fn encode_vector(cipher: Option<&EncodingCipher>, encoding: &Encoding) -> Result<Vec<u8>, StoreError> {
    let plain: Vec<u8> = encoding.values().iter().flat_map(|v| v.to_le_bytes()).collect();
    match cipher {
        Some(cipher) => cipher.seal(&plain).map_err(|e| StoreError::Backend(e.to_string())),
        None => Ok(plain),
    }
}

fn insert_vectors(
    tx: &rusqlite::Transaction<'_>,
    cipher: Option<&EncodingCipher>,
    id: &PersonId,
    encodings: &[Encoding],
) -> Result<Vec<EncodingId>, StoreError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO encodings (person_identifier, vector, dimensionality, normalized, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(sql_error)?;

    let mut ids = Vec::with_capacity(encodings.len());
    for encoding in encodings {
        let blob = encode_vector(cipher, encoding)?;
        stmt.execute(params![
            id.as_str(),
            blob,
            encoding.dimension() as i64,
            encoding.is_normalized(),
            encoding.model_version(),
            now,
        ])
        .map_err(sql_error)?;
        ids.push(EncodingId(tx.last_insert_rowid()));
    }
    Ok(ids)
}

fn sql_error(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreError::Timeout,
        _ => StoreError::Backend(e.to_string()),
    }
}
