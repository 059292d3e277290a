//! Entity identity bookkeeping for one simulation instance
//!
//! The registry hands out ids, remembers which kind owns each live id, and
//! records what changed since the last network flush. Behavioral state lives
//! in the per-kind barns; the registry only ever sees ids and type tags.

use std::collections::VecDeque;

use bitvec::vec::BitVec;

use crate::game::constants::entity::MAX_ENTITY_ID;
use crate::game::entity::{EntityId, EntityType, GameEntity, INVALID_ENTITY_ID};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Entity id space exhausted ({0} ids in use)")]
    Exhausted(usize),
}

/// Everything that changed since the previous `take_changes`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryChanges {
    /// Ids registered this window (and still live), in registration order
    pub created: Vec<EntityId>,
    /// Live ids, not created this window, whose full state changed
    pub full_dirty: Vec<EntityId>,
    /// Live ids, neither created nor full-dirty, whose partial state changed
    pub part_dirty: Vec<EntityId>,
    /// Ids that were live before this window and have been unregistered
    pub deleted: Vec<EntityId>,
}

impl RegistryChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.full_dirty.is_empty()
            && self.part_dirty.is_empty()
            && self.deleted.is_empty()
    }
}

/// Id allocator and per-id kind table
///
/// Fresh ids are handed out in increasing order. Released ids are queued
/// and only reused once the fresh range is used up, oldest first, so a
/// stale id stays dead for as long as possible.
pub struct EntityRegistry {
    kinds: Vec<EntityType>,
    generations: Vec<u32>,
    live: BitVec,
    created_marks: BitVec,
    full_marks: BitVec,
    part_marks: BitVec,
    next_fresh: u32,
    max_id: EntityId,
    free: VecDeque<EntityId>,
    count: usize,
    counts_by_type: [usize; EntityType::COUNT],
    created: Vec<EntityId>,
    full_dirty: Vec<EntityId>,
    part_dirty: Vec<EntityId>,
    deleted: Vec<EntityId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::with_max_id(MAX_ENTITY_ID)
    }

    /// Registry whose ids range over `1..=max_id`
    pub fn with_max_id(max_id: EntityId) -> Self {
        let slots = max_id as usize + 1;
        Self {
            kinds: vec![EntityType::Invalid; slots],
            generations: vec![0; slots],
            live: BitVec::repeat(false, slots),
            created_marks: BitVec::repeat(false, slots),
            full_marks: BitVec::repeat(false, slots),
            part_marks: BitVec::repeat(false, slots),
            next_fresh: 1,
            max_id,
            free: VecDeque::new(),
            count: 0,
            counts_by_type: [0; EntityType::COUNT],
            created: Vec::new(),
            full_dirty: Vec::new(),
            part_dirty: Vec::new(),
            deleted: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<EntityId> {
        if self.next_fresh <= self.max_id as u32 {
            let id = self.next_fresh as EntityId;
            self.next_fresh += 1;
            Some(id)
        } else {
            self.free.pop_front()
        }
    }

    /// Assign the next free id to `entity`, mark it active and run its
    /// creation hook
    pub fn register<E: GameEntity>(&mut self, entity: &mut E) -> Result<EntityId, RegistryError> {
        let id = self.allocate().ok_or(RegistryError::Exhausted(self.count))?;
        let idx = id as usize;

        self.kinds[idx] = E::TYPE;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.live.set(idx, true);
        self.created_marks.set(idx, true);
        self.created.push(id);
        self.count += 1;
        self.counts_by_type[E::TYPE as usize] += 1;

        let core = entity.core_mut();
        core.id = id;
        core.kind = E::TYPE;
        core.active = true;
        core.generation = self.generations[idx];
        entity.on_register();

        Ok(id)
    }

    /// Release `id`. Returns the kind it belonged to, or `None` when the id
    /// was not live; a second unregister of the same id is a no-op.
    ///
    /// Only `destroy` calls this, so the entity's hook and active flag
    /// always move together with the id.
    fn unregister(&mut self, id: EntityId) -> Option<EntityType> {
        if !self.is_live(id) {
            return None;
        }
        let idx = id as usize;
        let kind = self.kinds[idx];

        self.kinds[idx] = EntityType::Invalid;
        self.live.set(idx, false);
        self.count -= 1;
        self.counts_by_type[kind as usize] -= 1;

        if self.created_marks[idx] {
            // Never replicated; nothing for clients to delete
            self.created_marks.set(idx, false);
            self.created.retain(|&c| c != id);
        } else {
            self.deleted.push(id);
        }
        if self.full_marks[idx] {
            self.full_marks.set(idx, false);
            self.full_dirty.retain(|&c| c != id);
        }
        if self.part_marks[idx] {
            self.part_marks.set(idx, false);
            self.part_dirty.retain(|&c| c != id);
        }

        self.free.push_back(id);
        Some(kind)
    }

    /// Unregister `entity` and run its destruction hook, both at most once.
    /// A stale copy whose id was since recycled is refused.
    pub fn destroy<E: GameEntity>(&mut self, entity: &mut E) -> bool {
        let id = entity.id();
        let core = entity.core();
        if !core.active
            || self.get(id) != Some(E::TYPE)
            || self.generations[id as usize] != core.generation
        {
            return false;
        }
        self.unregister(id);
        entity.core_mut().active = false;
        entity.on_unregister();
        true
    }

    /// Kind of the live entity with this id
    pub fn get(&self, id: EntityId) -> Option<EntityType> {
        if self.is_live(id) {
            Some(self.kinds[id as usize])
        } else {
            None
        }
    }

    pub fn is_live(&self, id: EntityId) -> bool {
        id != INVALID_ENTITY_ID && id <= self.max_id && self.live[id as usize]
    }

    /// Flag a live entity for full re-serialization on the next flush
    pub fn mark_full_dirty(&mut self, id: EntityId) {
        if !self.is_live(id) {
            return;
        }
        let idx = id as usize;
        if !self.created_marks[idx] && !self.full_marks[idx] {
            self.full_marks.set(idx, true);
            self.full_dirty.push(id);
        }
    }

    /// Flag a live entity for partial re-serialization on the next flush
    pub fn mark_part_dirty(&mut self, id: EntityId) {
        if !self.is_live(id) {
            return;
        }
        let idx = id as usize;
        if !self.created_marks[idx] && !self.part_marks[idx] {
            self.part_marks.set(idx, true);
            self.part_dirty.push(id);
        }
    }

    /// Drain the change window
    pub fn take_changes(&mut self) -> RegistryChanges {
        for &id in &self.created {
            self.created_marks.set(id as usize, false);
        }
        for &id in &self.part_dirty {
            self.part_marks.set(id as usize, false);
        }

        // Full records already carry the partial state
        let full_marks = &self.full_marks;
        let mut part_dirty = std::mem::take(&mut self.part_dirty);
        part_dirty.retain(|&id| !full_marks[id as usize]);

        let full_dirty = std::mem::take(&mut self.full_dirty);
        for &id in &full_dirty {
            self.full_marks.set(id as usize, false);
        }

        RegistryChanges {
            created: std::mem::take(&mut self.created),
            full_dirty,
            part_dirty,
            deleted: std::mem::take(&mut self.deleted),
        }
    }

    /// All live ids in ascending order
    pub fn live_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.live.iter_ones().map(|idx| idx as EntityId)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count_of(&self, kind: EntityType) -> usize {
        self.counts_by_type[kind as usize]
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityCore;
    use crate::util::vec2::Vec2;
    use std::collections::HashSet;

    struct Tracked {
        core: EntityCore,
        registered: u32,
        unregistered: u32,
    }

    impl Tracked {
        fn new() -> Self {
            Self {
                core: EntityCore::new(EntityType::Smoke, Vec2::ZERO, 0),
                registered: 0,
                unregistered: 0,
            }
        }
    }

    impl GameEntity for Tracked {
        const TYPE: EntityType = EntityType::Smoke;

        fn core(&self) -> &EntityCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut EntityCore {
            &mut self.core
        }

        fn on_register(&mut self) {
            self.registered += 1;
        }

        fn on_unregister(&mut self) {
            self.unregistered += 1;
        }
    }

    #[test]
    fn test_register_assigns_id_and_runs_hook() {
        let mut registry = EntityRegistry::new();
        let mut tracked = Tracked::new();

        let id = registry.register(&mut tracked).unwrap();

        assert_ne!(id, INVALID_ENTITY_ID);
        assert_eq!(tracked.id(), id);
        assert!(tracked.is_active());
        assert_eq!(tracked.registered, 1);
        assert_eq!(registry.get(id), Some(EntityType::Smoke));
        assert_eq!(registry.count_of(EntityType::Smoke), 1);
    }

    #[test]
    fn test_double_unregister_is_noop() {
        let mut registry = EntityRegistry::new();
        let mut tracked = Tracked::new();
        let id = registry.register(&mut tracked).unwrap();

        assert_eq!(registry.unregister(id), Some(EntityType::Smoke));
        assert_eq!(registry.unregister(id), None);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.count_of(EntityType::Smoke), 0);
    }

    #[test]
    fn test_destroy_runs_hook_once() {
        let mut registry = EntityRegistry::new();
        let mut tracked = Tracked::new();
        registry.register(&mut tracked).unwrap();

        assert!(registry.destroy(&mut tracked));
        assert!(!registry.destroy(&mut tracked));
        assert_eq!(tracked.unregistered, 1);
        assert!(!tracked.is_active());
    }

    #[test]
    fn test_stale_copy_cannot_destroy_recycled_id() {
        let mut registry = EntityRegistry::with_max_id(1);
        let mut first = Tracked::new();
        let id = registry.register(&mut first).unwrap();
        let mut stale = Tracked::new();
        stale.core = first.core.clone();

        assert!(registry.destroy(&mut first));
        let mut second = Tracked::new();
        assert_eq!(registry.register(&mut second).unwrap(), id);

        assert!(!registry.destroy(&mut stale));
        assert_eq!(stale.unregistered, 0);
        assert!(registry.is_live(id));
        assert!(registry.destroy(&mut second));
    }

    #[test]
    fn test_missing_id_lookups() {
        let registry = EntityRegistry::new();
        assert_eq!(registry.get(INVALID_ENTITY_ID), None);
        assert_eq!(registry.get(42), None);
        assert!(!registry.is_live(u16::MAX));
    }

    #[test]
    fn test_ids_recycle_after_exhaustion() {
        let mut registry = EntityRegistry::with_max_id(3);
        let mut tracked_all: Vec<Tracked> = (0..3).map(|_| Tracked::new()).collect();
        for tracked in tracked_all.iter_mut() {
            registry.register(tracked).unwrap();
        }

        let mut extra = Tracked::new();
        assert_eq!(
            registry.register(&mut extra),
            Err(RegistryError::Exhausted(3))
        );

        let released = tracked_all[1].id();
        registry.destroy(&mut tracked_all[1]);
        let reused = registry.register(&mut extra).unwrap();
        assert_eq!(reused, released);
    }

    #[test]
    fn test_live_ids_stay_unique_under_churn() {
        let mut registry = EntityRegistry::with_max_id(16);
        let mut live: Vec<Tracked> = Vec::new();

        for round in 0..200usize {
            if round % 3 == 2 && !live.is_empty() {
                let mut victim = live.remove(round % live.len());
                registry.destroy(&mut victim);
            } else {
                let mut tracked = Tracked::new();
                if registry.register(&mut tracked).is_ok() {
                    live.push(tracked);
                }
            }

            let ids: HashSet<EntityId> = live.iter().map(|p| p.id()).collect();
            assert_eq!(ids.len(), live.len());
            assert_eq!(registry.len(), live.len());
            assert_eq!(registry.live_ids().count(), live.len());
        }
    }

    #[test]
    fn test_changes_created_then_deleted_is_elided() {
        let mut registry = EntityRegistry::new();
        let mut kept = Tracked::new();
        let mut gone = Tracked::new();
        let kept_id = registry.register(&mut kept).unwrap();
        registry.register(&mut gone).unwrap();
        registry.destroy(&mut gone);

        let changes = registry.take_changes();
        assert_eq!(changes.created, vec![kept_id]);
        assert!(changes.deleted.is_empty());

        assert!(registry.take_changes().is_empty());
    }

    #[test]
    fn test_changes_dirty_tracking() {
        let mut registry = EntityRegistry::new();
        let mut a = Tracked::new();
        let mut b = Tracked::new();
        let mut c = Tracked::new();
        let a_id = registry.register(&mut a).unwrap();
        let b_id = registry.register(&mut b).unwrap();
        let c_id = registry.register(&mut c).unwrap();
        registry.take_changes();

        // Dirty marks on freshly created ids are absorbed by the creation
        registry.mark_part_dirty(a_id);
        registry.mark_part_dirty(a_id);
        registry.mark_full_dirty(b_id);
        registry.mark_part_dirty(b_id);
        registry.destroy(&mut c);

        let changes = registry.take_changes();
        assert!(changes.created.is_empty());
        assert_eq!(changes.part_dirty, vec![a_id]);
        assert_eq!(changes.full_dirty, vec![b_id]);
        assert_eq!(changes.deleted, vec![c_id]);

        let mut d = Tracked::new();
        let d_id = registry.register(&mut d).unwrap();
        registry.mark_full_dirty(d_id);
        let changes = registry.take_changes();
        assert_eq!(changes.created, vec![d_id]);
        assert!(changes.full_dirty.is_empty());
    }

    #[test]
    fn test_recycled_id_reports_delete_then_create() {
        let mut registry = EntityRegistry::with_max_id(1);
        let mut first = Tracked::new();
        let id = registry.register(&mut first).unwrap();
        registry.take_changes();

        registry.destroy(&mut first);
        let mut second = Tracked::new();
        assert_eq!(registry.register(&mut second), Ok(id));

        let changes = registry.take_changes();
        assert_eq!(changes.deleted, vec![id]);
        assert_eq!(changes.created, vec![id]);
    }
}
