//! Identity registry: persons and their reference encodings.
//!
//! Reads go through an immutable [`Gallery`] snapshot. Mutations are
//! serialized on the store mutex, written through to the [`RegistryStore`],
//! and only then published as a new snapshot, so a reader never sees a
//! half-applied change.

use crate::store::{RegistryStore, StoreError};
use crate::types::{Encoding, EncodingId, EncodingSpec, Person, PersonId, SpecMismatch, StoredEncoding};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown person: {0}")]
    UnknownPerson(PersonId),
    #[error("person not found: {0}")]
    NotFound(PersonId),
    #[error("person already enrolled: {0}")]
    DuplicatePerson(PersonId),
    #[error("encoding {encoding} not found for person {person}")]
    EncodingNotFound { person: PersonId, encoding: EncodingId },
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(#[from] SpecMismatch),
    #[error("person id and name must not be empty")]
    InvalidIdentity,
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

/// Immutable view of every enrolled person at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    spec: EncodingSpec,
    persons: Vec<Person>,
}

impl Gallery {
    pub fn new(spec: EncodingSpec, persons: Vec<Person>) -> Self {
        Self { spec, persons }
    }

    pub fn spec(&self) -> EncodingSpec {
        self.spec.clone()
    }

    pub fn persons(&self) -> &[Person] {
        &self.persons
    }

    pub fn get(&self, id: &PersonId) -> Option<&Person> {
        self.persons.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PersonId) -> bool {
        self.get(id).is_some()
    }

    /// Every (person, reference encoding) pair, in enrollment order.
    pub fn entries(&self) -> impl Iterator<Item = (&PersonId, &Encoding)> {
        self.persons
            .iter()
            .flat_map(|p| p.encodings.iter().map(move |e| (&p.id, &e.encoding)))
    }

    pub fn person_count(&self) -> usize {
        self.persons.len()
    }

    pub fn encoding_count(&self) -> usize {
        self.persons.iter().map(|p| p.encodings.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }
}

/// Durable person → encodings mapping with snapshot reads.
pub struct IdentityRegistry<S> {
    spec: EncodingSpec,
    store: Mutex<S>,
    gallery: RwLock<Arc<Gallery>>,
}

impl<S: RegistryStore> IdentityRegistry<S> {
    /// Load every person from `store`, refusing encodings of another spec.
    pub fn open(mut store: S, spec: EncodingSpec) -> Result<Self, RegistryError> {
        let persons = store.load_persons()?;
        for person in &persons {
            for stored in &person.encodings {
                spec.check(&stored.encoding)?;
            }
        }

        let gallery = Gallery::new(spec.clone(), persons);
        tracing::info!(
            persons = gallery.person_count(),
            encodings = gallery.encoding_count(),
            %spec,
            "identity registry loaded"
        );

        Ok(Self {
            spec,
            store: Mutex::new(store),
            gallery: RwLock::new(Arc::new(gallery)),
        })
    }

    pub fn spec(&self) -> EncodingSpec {
        self.spec.clone()
    }

    /// Current consistent snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.gallery.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// All (person, encoding) pairs from one snapshot.
    pub fn all_encodings(&self) -> Vec<(PersonId, Encoding)> {
        self.snapshot()
            .entries()
            .map(|(id, enc)| (id.clone(), enc.clone()))
            .collect()
    }

    pub fn lookup(&self, id: &PersonId) -> Result<Person, RegistryError> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &PersonId) -> bool {
        self.snapshot().contains(id)
    }

    /// Create a person with no encodings yet.
    pub fn add_person(&self, id: PersonId, name: &str) -> Result<Person, RegistryError> {
        self.enroll_person(id, name, Vec::new())
    }

    /// Create a person together with their encodings in one step.
    ///
    /// Either the person and every encoding are committed, or nothing is.
    pub fn enroll_person(&self, id: PersonId, name: &str, encodings: Vec<Encoding>) -> Result<Person, RegistryError> {
        let name = name.trim();
        if id.as_str().trim().is_empty() || name.is_empty() {
            return Err(RegistryError::InvalidIdentity);
        }
        self.check_all(&encodings)?;

        let mut store = self.lock_store();
        let current = self.snapshot();
        if current.contains(&id) {
            return Err(RegistryError::DuplicatePerson(id));
        }

        let created_at = Utc::now();
        let ids = store.insert_person(&id, name, created_at, &encodings)?;
        let person = Person {
            id,
            name: name.to_string(),
            encodings: pair_ids(ids, encodings),
            created_at,
        };

        let mut persons = current.persons().to_vec();
        persons.push(person.clone());
        self.publish(persons);

        tracing::info!(person = %person.id, encodings = person.encodings.len(), "person added");
        Ok(person)
    }

    pub fn add_encoding(&self, id: &PersonId, encoding: Encoding) -> Result<EncodingId, RegistryError> {
        let mut ids = self.append_encodings(id, vec![encoding])?;
        Ok(ids.remove(0))
    }

    /// Append encodings to an existing person, all or nothing. Never replaces.
    pub fn append_encodings(&self, id: &PersonId, encodings: Vec<Encoding>) -> Result<Vec<EncodingId>, RegistryError> {
        self.check_all(&encodings)?;

        let mut store = self.lock_store();
        let current = self.snapshot();
        if !current.contains(id) {
            return Err(RegistryError::UnknownPerson(id.clone()));
        }
        if encodings.is_empty() {
            return Ok(Vec::new());
        }

        let ids = store.insert_encodings(id, &encodings)?;
        let added = pair_ids(ids.clone(), encodings);

        let mut persons = current.persons().to_vec();
        if let Some(person) = persons.iter_mut().find(|p| &p.id == id) {
            person.encodings.extend(added);
        }
        self.publish(persons);

        tracing::info!(person = %id, added = ids.len(), "encodings appended");
        Ok(ids)
    }

    pub fn remove_encoding(&self, id: &PersonId, encoding: EncodingId) -> Result<(), RegistryError> {
        let mut store = self.lock_store();
        let current = self.snapshot();
        let person = current.get(id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if !person.encodings.iter().any(|e| e.id == encoding) {
            return Err(RegistryError::EncodingNotFound {
                person: id.clone(),
                encoding,
            });
        }

        if !store.delete_encoding(id, encoding)? {
            tracing::warn!(person = %id, %encoding, "encoding missing from store, dropping from registry");
        }

        let mut persons = current.persons().to_vec();
        if let Some(p) = persons.iter_mut().find(|p| &p.id == id) {
            p.encodings.retain(|e| e.id != encoding);
        }
        self.publish(persons);

        tracing::info!(person = %id, %encoding, "encoding removed");
        Ok(())
    }

    /// Delete a person and all their encodings.
    pub fn remove_person(&self, id: &PersonId) -> Result<Person, RegistryError> {
        let mut store = self.lock_store();
        let current = self.snapshot();
        let removed = current
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if !store.delete_person(id)? {
            tracing::warn!(person = %id, "person missing from store, dropping from registry");
        }

        let persons = current.persons().iter().filter(|p| &p.id != id).cloned().collect();
        self.publish(persons);

        tracing::info!(person = %id, "person removed");
        Ok(removed)
    }

    fn check_all(&self, encodings: &[Encoding]) -> Result<(), RegistryError> {
        encodings.iter().try_for_each(|e| self.spec.check(e))?;
        Ok(())
    }

    fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, persons: Vec<Person>) {
        let next = Arc::new(Gallery::new(self.spec.clone(), persons));
        *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

fn pair_ids(ids: Vec<EncodingId>, encodings: Vec<Encoding>) -> Vec<StoredEncoding> {
    ids.into_iter()
        .zip(encodings)
        .map(|(id, encoding)| StoredEncoding { id, encoding })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryStore;

    const SPEC: EncodingSpec = EncodingSpec::new(2, true);

    fn enc(x: f32, y: f32) -> Encoding {
        Encoding::normalized(vec![x, y])
    }

    fn registry() -> (IdentityRegistry<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        (IdentityRegistry::open(store.clone(), SPEC).unwrap(), store)
    }

    #[test]
    fn test_add_person_then_encoding() {
        let (reg, _) = registry();
        reg.add_person("1".into(), "Ada").unwrap();
        reg.add_encoding(&"1".into(), enc(1.0, 0.0)).unwrap();
        reg.add_encoding(&"1".into(), enc(0.9, 0.1)).unwrap();

        let person = reg.lookup(&"1".into()).unwrap();
        assert_eq!(person.name, "Ada");
        assert_eq!(person.encodings.len(), 2);
        assert_eq!(reg.all_encodings().len(), 2);
    }

    #[test]
    fn test_add_encoding_for_unknown_person() {
        let (reg, store) = registry();
        let err = reg.add_encoding(&"ghost".into(), enc(1.0, 0.0)).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPerson(_)));
        assert_eq!(store.encoding_count(), 0);
    }

    #[test]
    fn test_dimension_mismatch_leaves_registry_unchanged() {
        let (reg, store) = registry();
        reg.add_person("1".into(), "Ada").unwrap();
        let err = reg
            .add_encoding(&"1".into(), Encoding::normalized(vec![1.0, 0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DimensionMismatch(_)));
        assert!(reg.lookup(&"1".into()).unwrap().encodings.is_empty());
        assert_eq!(store.encoding_count(), 0);
    }

    #[test]
    fn test_duplicate_person_rejected() {
        let (reg, _) = registry();
        reg.enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0)]).unwrap();
        let err = reg.enroll_person("1".into(), "Other", vec![enc(0.0, 1.0)]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePerson(_)));
        let person = reg.lookup(&"1".into()).unwrap();
        assert_eq!(person.name, "Ada");
        assert_eq!(person.encodings.len(), 1);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let (reg, _) = registry();
        assert!(matches!(reg.add_person("  ".into(), "Ada"), Err(RegistryError::InvalidIdentity)));
        assert!(matches!(reg.add_person("1".into(), ""), Err(RegistryError::InvalidIdentity)));
    }

    #[test]
    fn test_lookup_missing() {
        let (reg, _) = registry();
        assert!(matches!(reg.lookup(&"9".into()), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_remove_encoding() {
        let (reg, store) = registry();
        let person = reg
            .enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0), enc(0.0, 1.0)])
            .unwrap();
        let first = person.encodings[0].id;

        reg.remove_encoding(&"1".into(), first).unwrap();
        let person = reg.lookup(&"1".into()).unwrap();
        assert_eq!(person.encodings.len(), 1);
        assert_ne!(person.encodings[0].id, first);
        assert_eq!(store.encoding_count(), 1);

        let err = reg.remove_encoding(&"1".into(), first).unwrap_err();
        assert!(matches!(err, RegistryError::EncodingNotFound { .. }));
    }

    #[test]
    fn test_remove_person_invalidates_snapshot() {
        let (reg, store) = registry();
        reg.enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0)]).unwrap();
        let before = reg.snapshot();

        reg.remove_person(&"1".into()).unwrap();

        assert!(before.contains(&"1".into()), "old snapshot stays intact");
        assert!(reg.snapshot().is_empty());
        assert!(reg.all_encodings().is_empty());
        assert_eq!(store.person_count(), 0);
        assert_eq!(store.encoding_count(), 0);
    }

    #[test]
    fn test_storage_failure_is_not_published() {
        let (reg, store) = registry();
        reg.add_person("1".into(), "Ada").unwrap();
        store.set_unavailable(true);

        let err = reg.add_encoding(&"1".into(), enc(1.0, 0.0)).unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(reg.lookup(&"1".into()).unwrap().encodings.is_empty());
    }

    #[test]
    fn test_reopen_loads_from_store() {
        let (reg, store) = registry();
        reg.enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0), enc(0.8, 0.2)]).unwrap();
        drop(reg);

        let reopened = IdentityRegistry::open(store, SPEC).unwrap();
        assert_eq!(reopened.lookup(&"1".into()).unwrap().encodings.len(), 2);
    }

    #[test]
    fn test_open_rejects_foreign_spec() {
        let (reg, store) = registry();
        reg.enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0)]).unwrap();
        drop(reg);

        let err = IdentityRegistry::open(store, EncodingSpec::new(512, true)).err();
        assert!(matches!(err, Some(RegistryError::DimensionMismatch(_))));
    }

    #[test]
    fn test_other_model_encodings_are_refused() {
        let store = MemoryStore::new();
        let spec = EncodingSpec::tagged(2, true, "w600k_r50");
        let reg = IdentityRegistry::open(store.clone(), spec.clone()).unwrap();
        reg.enroll_person("1".into(), "Ada", vec![enc(1.0, 0.0).with_model_version("w600k_r50")])
            .unwrap();

        let err = reg
            .add_encoding(&"1".into(), enc(0.0, 1.0).with_model_version("buffalo_s"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DimensionMismatch(_)));
        assert_eq!(reg.lookup(&"1".into()).unwrap().encodings.len(), 1);
        drop(reg);

        let err = IdentityRegistry::open(store, EncodingSpec::tagged(2, true, "buffalo_s")).err();
        assert!(matches!(err, Some(RegistryError::DimensionMismatch(_))));
    }

    #[test]
    fn test_snapshot_never_sees_partial_enrollment() {
        let (reg, _) = registry();
        let reg = Arc::new(reg);

        let writer = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let samples = vec![enc(1.0, i as f32), enc(i as f32, 1.0), enc(1.0, 1.0)];
                    reg.enroll_person(PersonId::new(i.to_string()), "P", samples).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let snap = reg.snapshot();
            assert!(snap.persons().iter().all(|p| p.encodings.len() == 3));
            assert_eq!(snap.encoding_count(), snap.person_count() * 3);
        }
        writer.join().unwrap();
        assert_eq!(reg.snapshot().person_count(), 50);
    }
}
