//! Session membership derived from the shared document.

use crate::identity::{IdentityKey, IdentityResolver, ParticipantRef};
use crate::metadata::SessionDocument;
use std::collections::BTreeMap;

/// Canonical member set. Never contains `unknown` or removed identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMembership {
    members: BTreeMap<IdentityKey, Option<ParticipantRef>>,
}

impl SessionMembership {
    /// Derive membership from every reference in the document.
    ///
    /// All references are registered before any is resolved so that partial
    /// references pick up aliases learned from fuller ones.
    pub fn derive(document: &SessionDocument, resolver: &mut IdentityResolver) -> Self {
        for reference in document.member_references() {
            resolver.register(reference);
        }

        let mut members = BTreeMap::new();
        for reference in document.member_references() {
            let key = resolver.resolve(reference);
            if key.is_unknown() || document.removed.contains(&key) {
                continue;
            }
            members
                .entry(key)
                .and_modify(|existing: &mut Option<ParticipantRef>| {
                    if existing.is_none() {
                        *existing = Some(reference.clone());
                    }
                })
                .or_insert_with(|| Some(reference.clone()));
        }
        for key in document.observed_addresses.values() {
            let key = resolver.canonical(key);
            if !document.removed.contains(&key) && !key.is_unknown() {
                members.entry(key).or_insert(None);
            }
        }

        Self { members }
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.members.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.members.keys()
    }

    /// Best known reference for a member.
    pub fn reference(&self, key: &IdentityKey) -> Option<&ParticipantRef> {
        self.members.get(key).and_then(Option::as_ref)
    }

    /// Members paired with their references.
    pub fn entries(&self) -> impl Iterator<Item = (&IdentityKey, Option<&ParticipantRef>)> {
        self.members
            .iter()
            .map(|(key, reference)| (key, reference.as_ref()))
    }

    /// Every member except `local`, in key order.
    pub fn others(&self, local: &IdentityKey) -> Vec<IdentityKey> {
        self.members
            .keys()
            .filter(|key| *key != local)
            .cloned()
            .collect()
    }
}
