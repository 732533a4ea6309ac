//! Working-memory capability surface
//!
//! The matcher never stores facts or instances itself. It keeps opaque
//! entity ids and asks working memory, through this trait, for the three
//! things the network needs: slot data at assert time, and the
//! `synchronized` / `is_deleted` liveness checks the retract pathway uses
//! to recognize stale bindings during lazy re-evaluation of negated joins.

use crate::ids::{SlotIndex, TemplateId};
use crate::value::Value;

/// Opaque working-memory entity handle (fact or instance)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EntityId(pub u64);

/// Read capabilities the match network requires from working memory
pub trait EntityStore {
    /// Template (entity kind) of the entity, if it is known to the store.
    fn template(&self, entity: EntityId) -> Option<TemplateId>;

    /// Number of slots the entity carries.
    fn slot_count(&self, entity: EntityId) -> u16;

    /// Value of one slot. `None` when the slot does not exist.
    fn slot(&self, entity: EntityId, slot: SlotIndex) -> Option<&Value>;

    /// Does the entity still agree with what the network saw when it was
    /// pushed through? Entities modified in place (instances) answer false
    /// until re-propagated.
    fn synchronized(&self, entity: EntityId) -> bool;

    /// Has the entity been deleted, or is it pending deletion as part of
    /// an in-flight retraction?
    fn is_deleted(&self, entity: EntityId) -> bool;
}

/// Mutation capability used by truth maintenance
///
/// When an entity loses its last logical support the engine asks the store
/// to delete it, then retracts its pattern matches from the network itself.
pub trait EntityStoreMut: EntityStore {
    /// Mark the entity deleted in working memory.
    fn delete(&mut self, entity: EntityId);
}
