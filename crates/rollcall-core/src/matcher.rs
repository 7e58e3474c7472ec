//! Matching a live encoding against the registry gallery.

use crate::registry::Gallery;
use crate::types::{Encoding, PersonId, SpecMismatch};
use serde::Serialize;
use thiserror::Error;

/// Default acceptance threshold for L2-normalized encodings.
///
/// Unit vectors are 0–2 apart; 1.0 corresponds to a cosine similarity of 0.5.
pub const DEFAULT_THRESHOLD: f32 = 1.0;

/// Two persons closer than this to each other's best distance count as tied.
pub const TIE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    /// A single person is strictly below the threshold.
    Accepted,
    /// The closest person is not below the threshold.
    Rejected,
    /// Two or more persons share the smallest distance.
    Ambiguous,
    /// The gallery is empty.
    Unknown,
}

/// Result of matching one live encoding. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub outcome: MatchOutcome,
    /// Matched person; set only when `outcome` is `Accepted`.
    pub person_id: Option<PersonId>,
    /// Display name of the matched person.
    pub name: Option<String>,
    /// Smallest person distance seen, if the gallery was not empty.
    pub distance: Option<f32>,
    pub threshold: f32,
}

impl MatchResult {
    pub fn unknown(threshold: f32) -> Self {
        Self {
            outcome: MatchOutcome::Unknown,
            person_id: None,
            name: None,
            distance: None,
            threshold,
        }
    }

    pub fn is_match(&self) -> bool {
        self.outcome == MatchOutcome::Accepted
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe encoding does not fit the gallery: {0}")]
    DimensionMismatch(#[from] SpecMismatch),
}

/// Strategy for comparing a probe encoding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Encoding, gallery: &Gallery, threshold: f32) -> Result<MatchResult, MatchError>;
}

/// Euclidean matcher with best-of-samples scoring per person.
///
/// A person's distance is the minimum over their reference encodings. Every
/// gallery entry is visited exactly once, no early exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Encoding, gallery: &Gallery, threshold: f32) -> Result<MatchResult, MatchError> {
        gallery.spec().check(probe)?;

        // (person index, distance) of the best and runner-up persons
        let mut best: Option<(usize, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for (idx, person) in gallery.persons().iter().enumerate() {
            let mut person_best = f32::INFINITY;
            for stored in &person.encodings {
                let d = probe.distance(&stored.encoding)?;
                person_best = person_best.min(d);
            }
            if !person_best.is_finite() {
                // person without encodings cannot be matched
                continue;
            }

            match best {
                Some((_, d)) if person_best >= d => {
                    runner_up = Some(runner_up.map_or(person_best, |r| r.min(person_best)));
                }
                _ => {
                    runner_up = best.map(|(_, d)| d).or(runner_up);
                    best = Some((idx, person_best));
                }
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(MatchResult::unknown(threshold));
        };

        let tied = runner_up.is_some_and(|r| r - distance <= TIE_EPSILON);
        let outcome = if tied {
            MatchOutcome::Ambiguous
        } else if distance < threshold {
            MatchOutcome::Accepted
        } else {
            MatchOutcome::Rejected
        };

        let person = &gallery.persons()[idx];
        let accepted = outcome == MatchOutcome::Accepted;
        Ok(MatchResult {
            outcome,
            person_id: accepted.then(|| person.id.clone()),
            name: accepted.then(|| person.name.clone()),
            distance: Some(distance),
            threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Gallery;
    use crate::types::{EncodingId, EncodingSpec, Person, StoredEncoding};
    use chrono::Utc;

    const SPEC: EncodingSpec = EncodingSpec::new(3, true);

    fn enc(v: [f32; 3]) -> Encoding {
        Encoding::normalized(v.to_vec())
    }

    fn person(id: &str, refs: &[[f32; 3]]) -> Person {
        Person {
            id: PersonId::new(id),
            name: format!("Person {id}"),
            encodings: refs
                .iter()
                .enumerate()
                .map(|(i, v)| StoredEncoding {
                    id: EncodingId(i as i64),
                    encoding: enc(*v),
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn gallery(persons: Vec<Person>) -> Gallery {
        Gallery::new(SPEC, persons)
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &gallery(vec![]), 1.0).unwrap();
        assert_eq!(r.outcome, MatchOutcome::Unknown);
        assert_eq!(r.distance, None);
        assert!(!r.is_match());
    }

    #[test]
    fn test_own_reference_matches_at_zero() {
        let g = gallery(vec![person("1", &[[1.0, 0.0, 0.0], [0.9, 0.1, 0.0], [0.8, 0.2, 0.1]])]);
        for probe in [[1.0, 0.0, 0.0], [0.9, 0.1, 0.0], [0.8, 0.2, 0.1]] {
            let r = EuclideanMatcher.compare(&enc(probe), &g, 0.6).unwrap();
            assert_eq!(r.person_id, Some(PersonId::new("1")));
            assert!(r.distance.unwrap() < 1e-6);
        }
    }

    #[test]
    fn test_best_of_samples_wins() {
        // Person 1's first sample is far, second is exact; person 2 is moderately close.
        let g = gallery(vec![
            person("1", &[[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]),
            person("2", &[[0.9, 0.3, 0.0]]),
        ]);
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &g, 1.0).unwrap();
        assert_eq!(r.person_id, Some(PersonId::new("1")));
        assert_eq!(r.name.as_deref(), Some("Person 1"));
    }

    #[test]
    fn test_distance_at_threshold_is_rejected() {
        let g = gallery(vec![person("1", &[[0.0, 1.0, 0.0]])]);
        let probe = enc([1.0, 0.0, 0.0]);
        let exact = probe.distance(&enc([0.0, 1.0, 0.0])).unwrap();

        let r = EuclideanMatcher.compare(&probe, &g, exact).unwrap();
        assert_eq!(r.outcome, MatchOutcome::Rejected);
        assert_eq!(r.person_id, None);

        let r = EuclideanMatcher.compare(&probe, &g, exact + 1e-3).unwrap();
        assert_eq!(r.outcome, MatchOutcome::Accepted);
    }

    #[test]
    fn test_distinct_persons_do_not_cross_match() {
        let g = gallery(vec![person("a", &[[1.0, 0.0, 0.0]]), person("b", &[[0.0, 1.0, 0.0]])]);
        let threshold = 0.6;
        let r = EuclideanMatcher.compare(&enc([0.0, 0.0, 1.0]), &g, threshold).unwrap();
        assert_ne!(r.outcome, MatchOutcome::Accepted);
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &g, threshold).unwrap();
        assert_eq!(r.person_id, Some(PersonId::new("a")));
    }

    #[test]
    fn test_tie_is_ambiguous_not_a_pick() {
        let g = gallery(vec![person("a", &[[1.0, 1.0, 0.0]]), person("b", &[[1.0, 0.0, 1.0]])]);
        // Equidistant from both references.
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &g, 2.0).unwrap();
        assert_eq!(r.outcome, MatchOutcome::Ambiguous);
        assert_eq!(r.person_id, None);
    }

    #[test]
    fn test_tie_with_later_better_person_is_not_ambiguous() {
        let g = gallery(vec![
            person("a", &[[0.0, 1.0, 0.0]]),
            person("b", &[[0.0, 0.0, 1.0]]),
            person("c", &[[1.0, 0.0, 0.0]]),
        ]);
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &g, 1.0).unwrap();
        assert_eq!(r.person_id, Some(PersonId::new("c")));
    }

    #[test]
    fn test_probe_of_wrong_dimension_is_error() {
        let g = gallery(vec![person("a", &[[1.0, 0.0, 0.0]])]);
        let err = EuclideanMatcher
            .compare(&Encoding::normalized(vec![1.0, 0.0]), &g, 1.0)
            .unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch(_)));
    }

    #[test]
    fn test_person_without_encodings_is_skipped() {
        let g = gallery(vec![person("empty", &[]), person("a", &[[1.0, 0.0, 0.0]])]);
        let r = EuclideanMatcher.compare(&enc([1.0, 0.0, 0.0]), &g, 1.0).unwrap();
        assert_eq!(r.person_id, Some(PersonId::new("a")));
    }
}
