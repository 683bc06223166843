//! Run-local admission of canonical entities against durable tracking state.

use std::collections::{BTreeSet, HashMap};

use harvest_core::{CanonicalEntity, TrackingState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    New,
    /// Key or content hash already recorded by an earlier run.
    DuplicateOfSeen,
    /// Same entity key as an entity admitted earlier in this run.
    DuplicateWithinRun,
    /// Different key, same profile URL as an entity admitted earlier in this run.
    Merge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionCounts {
    pub new: usize,
    pub duplicate_of_seen: usize,
    pub duplicate_within_run: usize,
    pub merged: usize,
}

/// Holds the entities a run is about to persist. Durable seen sets are read but never
/// written here; they change only when tracking state is committed.
///
/// Every admitted record gets a slot. Slots sharing an entity key or a profile URL are
/// joined into one cluster, so the clusters are the connected components of those links
/// and do not depend on arrival order.
#[derive(Debug, Default)]
pub struct DedupStore {
    slots: Vec<Slot>,
    by_key: HashMap<String, usize>,
    by_profile: HashMap<String, usize>,
    duplicate_of_seen: usize,
}

#[derive(Debug)]
struct Slot {
    parent: usize,
    /// Merged entity of the cluster; only roots hold one.
    entity: Option<CanonicalEntity>,
    keys: BTreeSet<String>,
    members: usize,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `entity` against what is known at arrival. Reported counts are taken
    /// from the final clusters instead, see [`DedupStore::counts`].
    pub fn admit(&mut self, entity: CanonicalEntity, tracking: &TrackingState) -> Admission {
        if tracking.has_seen(&entity) {
            self.duplicate_of_seen += 1;
            return Admission::DuplicateOfSeen;
        }

        let key_slot = self.by_key.get(&entity.entity_key).copied();
        let profile_slot = entity
            .profile_url
            .as_ref()
            .and_then(|profile| self.by_profile.get(profile))
            .copied();
        let admission = match (key_slot, profile_slot) {
            (Some(_), _) => Admission::DuplicateWithinRun,
            (None, Some(_)) => Admission::Merge,
            (None, None) => Admission::New,
        };

        let slot = self.slots.len();
        self.by_key.entry(entity.entity_key.clone()).or_insert(slot);
        if let Some(profile) = &entity.profile_url {
            self.by_profile.entry(profile.clone()).or_insert(slot);
        }
        self.slots.push(Slot {
            parent: slot,
            keys: BTreeSet::from([entity.entity_key.clone()]),
            entity: Some(entity),
            members: 1,
        });
        for linked in [key_slot, profile_slot].into_iter().flatten() {
            self.union(linked, slot);
        }
        admission
    }

    fn find(&mut self, slot: usize) -> usize {
        let mut root = slot;
        while self.slots[root].parent != root {
            root = self.slots[root].parent;
        }
        let mut cursor = slot;
        while self.slots[cursor].parent != root {
            let next = self.slots[cursor].parent;
            self.slots[cursor].parent = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (root, other) = (self.find(a), self.find(b));
        if root == other {
            return;
        }
        let absorbed = std::mem::take(&mut self.slots[other].keys);
        let members = self.slots[other].members;
        let incoming = self.slots[other].entity.take();
        self.slots[other].parent = root;

        let target = &mut self.slots[root];
        target.keys.extend(absorbed);
        target.members += members;
        if let (Some(existing), Some(incoming)) = (target.entity.as_mut(), incoming) {
            merge_entities(existing, incoming);
        }
    }

    fn roots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(index, slot)| slot.parent == *index)
            .map(|(_, slot)| slot)
    }

    /// One `new` per cluster, one `merged` per extra key folded into it, and a
    /// `duplicate_within_run` for every further record repeating a key.
    pub fn counts(&self) -> AdmissionCounts {
        let mut counts = AdmissionCounts {
            duplicate_of_seen: self.duplicate_of_seen,
            ..AdmissionCounts::default()
        };
        for root in self.roots() {
            counts.new += 1;
            counts.merged += root.keys.len() - 1;
            counts.duplicate_within_run += root.members - root.keys.len();
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.roots().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Admitted entities ordered by key, independent of arrival order.
    pub fn into_entities(self) -> Vec<CanonicalEntity> {
        let mut entities: Vec<CanonicalEntity> = self
            .slots
            .into_iter()
            .enumerate()
            .filter(|(index, slot)| slot.parent == *index)
            .filter_map(|(_, slot)| slot.entity)
            .collect();
        entities.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        entities
    }
}

fn merge_entities(existing: &mut CanonicalEntity, incoming: CanonicalEntity) {
    if outranks(&incoming, existing) {
        let displaced = std::mem::replace(existing, incoming);
        fold_loser(existing, displaced);
    } else {
        fold_loser(existing, incoming);
    }
}

/// More populated fields wins; ties go to the record seen first in task order.
fn outranks(candidate: &CanonicalEntity, current: &CanonicalEntity) -> bool {
    match candidate.completeness().cmp(&current.completeness()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate.ordinal < current.ordinal,
    }
}

fn fold_loser(winner: &mut CanonicalEntity, loser: CanonicalEntity) {
    winner.origin_urls.extend(loser.origin_urls);
    winner.first_seen_at = winner.first_seen_at.min(loser.first_seen_at);
    let mut merged: BTreeSet<String> = winner.merged_from.drain(..).collect();
    merged.extend(loser.merged_from);
    if loser.entity_key != winner.entity_key {
        merged.insert(loser.entity_key);
    }
    merged.remove(&winner.entity_key);
    winner.merged_from = merged.into_iter().collect();
}
