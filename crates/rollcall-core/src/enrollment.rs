//! Enrollment: several captured images of one person in, one committed
//! [`Person`] out.
//!
//! Per-sample extraction failures are collected, not fatal. The person is
//! only committed when enough samples succeed; otherwise nothing is written.

use crate::extractor::{EncodingExtractor, ExtractError};
use crate::registry::{IdentityRegistry, RegistryError};
use crate::store::RegistryStore;
use crate::types::{Encoding, EncodingId, FaceImage, Person, PersonId};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// One image that did not yield an encoding.
#[derive(Debug)]
pub struct SampleFailure {
    /// Position of the image in the submitted batch.
    pub index: usize,
    pub error: ExtractError,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("only {succeeded} of {attempted} samples usable, {required} required")]
    InsufficientSamples {
        succeeded: usize,
        required: usize,
        attempted: usize,
        failures: Vec<SampleFailure>,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of a committed enrollment or re-enrollment.
#[derive(Debug)]
pub struct EnrollmentReport {
    /// The person as stored after the commit.
    pub person: Person,
    /// Ids of the encodings added by this call.
    pub committed: Vec<EncodingId>,
    /// Samples that were skipped.
    pub failures: Vec<SampleFailure>,
}

/// Compact view of a report for logs and replies.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSummary {
    pub person_id: PersonId,
    pub name: String,
    pub committed: usize,
    pub total_encodings: usize,
    pub skipped: Vec<String>,
}

impl EnrollmentReport {
    pub fn summary(&self) -> EnrollmentSummary {
        EnrollmentSummary {
            person_id: self.person.id.clone(),
            name: self.person.name.clone(),
            committed: self.committed.len(),
            total_encodings: self.person.encodings.len(),
            skipped: self
                .failures
                .iter()
                .map(|f| format!("sample {}: {}", f.index, f.error))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentPipeline {
    min_samples: usize,
}

impl Default for EnrollmentPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLES)
    }
}

impl EnrollmentPipeline {
    /// `min_samples` is clamped to at least 1.
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(1),
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Enroll a new person from `images`.
    pub fn enroll<S, E>(
        &self,
        registry: &IdentityRegistry<S>,
        extractor: &mut E,
        id: PersonId,
        name: &str,
        images: &[FaceImage],
    ) -> Result<EnrollmentReport, EnrollError>
    where
        S: RegistryStore,
        E: EncodingExtractor + ?Sized,
    {
        if registry.contains(&id) {
            return Err(RegistryError::DuplicatePerson(id).into());
        }

        let (encodings, failures) = self.extract_all(extractor, &id, images)?;
        let person = registry.enroll_person(id, name, encodings)?;
        let committed = person.encodings.iter().map(|e| e.id).collect();

        tracing::info!(
            person = %person.id,
            committed = person.encodings.len(),
            skipped = failures.len(),
            "enrollment committed"
        );
        Ok(EnrollmentReport {
            person,
            committed,
            failures,
        })
    }

    /// Append encodings from `images` to an existing person.
    pub fn re_enroll<S, E>(
        &self,
        registry: &IdentityRegistry<S>,
        extractor: &mut E,
        id: &PersonId,
        images: &[FaceImage],
    ) -> Result<EnrollmentReport, EnrollError>
    where
        S: RegistryStore,
        E: EncodingExtractor + ?Sized,
    {
        if !registry.contains(id) {
            return Err(RegistryError::UnknownPerson(id.clone()).into());
        }

        let (encodings, failures) = self.extract_all(extractor, id, images)?;
        let committed = registry.append_encodings(id, encodings)?;
        let person = registry.lookup(id)?;

        tracing::info!(
            person = %id,
            added = committed.len(),
            total = person.encodings.len(),
            skipped = failures.len(),
            "re-enrollment committed"
        );
        Ok(EnrollmentReport {
            person,
            committed,
            failures,
        })
    }

    fn extract_all<E>(
        &self,
        extractor: &mut E,
        id: &PersonId,
        images: &[FaceImage],
    ) -> Result<(Vec<Encoding>, Vec<SampleFailure>), EnrollError>
    where
        E: EncodingExtractor + ?Sized,
    {
        let mut encodings = Vec::with_capacity(images.len());
        let mut failures = Vec::new();

        for (index, image) in images.iter().enumerate() {
            match extractor.extract(image) {
                Ok(encoding) => encodings.push(encoding),
                Err(error) => {
                    tracing::debug!(person = %id, index, %error, "enrollment sample skipped");
                    failures.push(SampleFailure { index, error });
                }
            }
        }

        if encodings.len() < self.min_samples {
            tracing::warn!(
                person = %id,
                succeeded = encodings.len(),
                required = self.min_samples,
                "enrollment aborted, not enough usable samples"
            );
            return Err(EnrollError::InsufficientSamples {
                succeeded: encodings.len(),
                required: self.min_samples,
                attempted: images.len(),
                failures,
            });
        }
        Ok((encodings, failures))
    }
}
