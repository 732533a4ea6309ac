//! Shared in-memory working memory for engine tests
//!
//! A minimal fact store implementing the capability surface the matcher
//! requires: template and slot access at assert time, and the
//! `synchronized` / `is_deleted` liveness checks the retract pathway
//! relies on.

// Not every test binary uses every helper.
#![allow(dead_code)]

use match_model::{EntityId, EntityStore, EntityStoreMut, SlotIndex, TemplateId, Value};
use rustc_hash::FxHashMap;

#[derive(Debug)]
struct Entity {
    template: TemplateId,
    slots: Vec<Value>,
    deleted: bool,
    synchronized: bool,
}

/// Test working memory
#[derive(Default)]
pub struct TestStore {
    entities: FxHashMap<EntityId, Entity>,
    next_id: u64,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity and return its handle.
    pub fn put(&mut self, template: u32, slots: Vec<Value>) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(
            id,
            Entity {
                template: TemplateId(template),
                slots,
                deleted: false,
                synchronized: true,
            },
        );
        id
    }

    /// Mark an entity deleted, as working memory does at the start of a
    /// retraction.
    pub fn mark_deleted(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.deleted = true;
        }
    }

    /// Mark an entity out of sync with what the network saw.
    #[allow(dead_code)]
    pub fn desynchronize(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.synchronized = false;
        }
    }

    pub fn is_deleted(&self, id: EntityId) -> bool {
        self.entities.get(&id).map(|e| e.deleted).unwrap_or(true)
    }
}

impl EntityStore for TestStore {
    fn template(&self, entity: EntityId) -> Option<TemplateId> {
        self.entities.get(&entity).map(|e| e.template)
    }

    fn slot_count(&self, entity: EntityId) -> u16 {
        self.entities
            .get(&entity)
            .map(|e| e.slots.len() as u16)
            .unwrap_or(0)
    }

    fn slot(&self, entity: EntityId, slot: SlotIndex) -> Option<&Value> {
        self.entities.get(&entity)?.slots.get(slot.index())
    }

    fn synchronized(&self, entity: EntityId) -> bool {
        self.entities
            .get(&entity)
            .map(|e| e.synchronized)
            .unwrap_or(false)
    }

    fn is_deleted(&self, entity: EntityId) -> bool {
        self.entities.get(&entity).map(|e| e.deleted).unwrap_or(true)
    }
}

impl EntityStoreMut for TestStore {
    fn delete(&mut self, entity: EntityId) {
        self.mark_deleted(entity);
    }
}

/// Retract an entity the way working memory drives the network: mark it
/// deleted first so `is_deleted` answers true during propagation.
pub fn retract(engine: &mut rete::Engine, store: &mut TestStore, id: EntityId) {
    store.mark_deleted(id);
    engine.retract_entity(id, store);
}
