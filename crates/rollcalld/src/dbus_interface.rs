use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, Registry};
use crate::seal::EncodingCipher;
use crate::store::SqliteStore;
use chrono::NaiveDate;
use rollcall_core::dedup::SessionKeyPolicy;
use rollcall_core::enrollment::EnrollError;
use rollcall_core::registry::RegistryError;
use rollcall_core::store::AttendanceStore;
use rollcall_core::types::{EncodingId, PersonId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured replies are JSON strings.
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
    pub cipher: Option<EncodingCipher>,
}

#[derive(Serialize)]
struct PersonListing {
    person_id: PersonId,
    name: String,
    encodings: Vec<EncodingId>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a new person from image files readable by the daemon.
    async fn enroll(&self, person_id: &str, name: &str, images: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(person_id, name, images = images.len(), "enroll requested");
        let paths = images.into_iter().map(PathBuf::from).collect();
        let summary = self
            .engine
            .enroll_files(PersonId::new(person_id), name.to_string(), paths)
            .await
            .map_err(engine_error)?;
        to_json(&summary)
    }

    /// Enroll a new person from live camera frames.
    async fn enroll_from_camera(&self, person_id: &str, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(person_id, name, "camera enroll requested");
        let summary = self
            .engine
            .enroll_camera(PersonId::new(person_id), name.to_string())
            .await
            .map_err(engine_error)?;
        to_json(&summary)
    }

    /// Add encodings to an existing person. An empty image list captures from the camera.
    async fn re_enroll(&self, person_id: &str, images: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(person_id, images = images.len(), "re-enroll requested");
        let paths = (!images.is_empty()).then(|| images.into_iter().map(PathBuf::from).collect());
        let summary = self
            .engine
            .re_enroll(PersonId::new(person_id), paths)
            .await
            .map_err(engine_error)?;
        to_json(&summary)
    }

    async fn remove_person(&self, person_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(person_id, "remove_person requested");
        let registry = Arc::clone(&self.registry);
        let id = PersonId::new(person_id);
        let result = tokio::task::spawn_blocking(move || registry.remove_person(&id))
            .await
            .map_err(join_error)?;
        match result {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(e) => Err(registry_error(e)),
        }
    }

    async fn remove_encoding(&self, person_id: &str, encoding_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(person_id, encoding_id, "remove_encoding requested");
        let registry = Arc::clone(&self.registry);
        let id = PersonId::new(person_id);
        let result = tokio::task::spawn_blocking(move || registry.remove_encoding(&id, EncodingId(encoding_id)))
            .await
            .map_err(join_error)?;
        match result {
            Ok(()) => Ok(true),
            Err(RegistryError::NotFound(_) | RegistryError::EncodingNotFound { .. }) => Ok(false),
            Err(e) => Err(registry_error(e)),
        }
    }

    async fn list_persons(&self) -> zbus::fdo::Result<String> {
        let gallery = self.registry.snapshot();
        let listing: Vec<PersonListing> = gallery
            .persons()
            .iter()
            .map(|p| PersonListing {
                person_id: p.id.clone(),
                name: p.name.clone(),
                encodings: p.encodings.iter().map(|e| e.id).collect(),
                created_at: p.created_at,
            })
            .collect();
        to_json(&listing)
    }

    /// Start a recognition session. An empty policy uses the configured one.
    async fn start_session(&self, policy: &str) -> zbus::fdo::Result<String> {
        let policy = if policy.trim().is_empty() {
            None
        } else {
            Some(
                policy
                    .parse::<SessionKeyPolicy>()
                    .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?,
            )
        };
        tracing::info!(policy = ?policy, "start_session requested");
        let monitor = self.engine.start_session(policy).await.map_err(engine_error)?;
        to_json(&monitor)
    }

    async fn stop_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_session requested");
        let summary = self.engine.stop_session().await.map_err(engine_error)?;
        to_json(&summary)
    }

    async fn session_status(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.session_status().await.map_err(engine_error)?;
        to_json(&report)
    }

    /// Mark a registered person present without a camera match.
    async fn mark_manual(&self, person_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(person_id, "manual mark requested");
        let reply = self
            .engine
            .mark_manual(PersonId::new(person_id))
            .await
            .map_err(engine_error)?;
        to_json(&reply)
    }

    /// Attendance rows between two inclusive `YYYY-MM-DD` dates, newest first.
    /// Empty strings leave that bound open.
    async fn attendance(&self, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let from = parse_date(from)?;
        let to = parse_date(to)?;
        let path = self.config.db_path.clone();
        let timeout = self.config.store_timeout();
        let cipher = self.cipher.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut store = SqliteStore::open(&path, timeout, cipher)?;
            store.attendance_between(from, to)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.registry.snapshot();
        let session = self.engine.session_status().await.map_err(engine_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.config.camera_device,
            "model_dir": self.config.model_dir,
            "database": self.config.db_path,
            "persons": gallery.person_count(),
            "encodings": gallery.encoding_count(),
            "encoding_spec": gallery.spec().to_string(),
            "threshold": self.config.match_threshold,
            "session_policy": self.config.session_policy.to_string(),
            "session_active": session.active,
            "encrypted": self.cipher.is_some(),
        })
        .to_string())
    }
}

fn parse_date(s: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date {s:?}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn join_error(e: tokio::task::JoinError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("worker task failed: {e}"))
}

fn registry_error(e: RegistryError) -> zbus::fdo::Error {
    match e {
        RegistryError::InvalidIdentity | RegistryError::DimensionMismatch(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Enroll(EnrollError::Registry(inner)) => registry_error(inner),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("").unwrap(), None);
        assert_eq!(parse_date(" 2024-03-05 ").unwrap(), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert!(matches!(parse_date("05/03/2024"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_registry_error_mapping() {
        let err = registry_error(RegistryError::InvalidIdentity);
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
        let err = engine_error(EngineError::NoSession);
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }
}
