//! Shared entity facade
//!
//! Every simulated object embeds an `EntityCore` (identity, type tag, pose,
//! active flag) and implements `GameEntity` over it. Concrete kinds are a
//! closed set tagged by `EntityType`; codec dispatch matches on that tag.

use serde::{Deserialize, Serialize};

use crate::game::registry::EntityRegistry;
use crate::util::vec2::Vec2;

/// Numeric entity identity, unique among live entities of one instance
pub type EntityId = u16;

/// Reserved id that never names a live entity
pub const INVALID_ENTITY_ID: EntityId = 0;

/// Type tag for every concrete entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum EntityType {
    #[default]
    Invalid = 0,
    Decal = 1,
    Smoke = 2,
}

impl EntityType {
    /// Number of tags, including `Invalid`
    pub const COUNT: usize = 3;

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EntityType::Decal),
            2 => Some(EntityType::Smoke),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fields every entity carries
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCore {
    pub id: EntityId,
    pub kind: EntityType,
    pub pos: Vec2,
    pub layer: u8,
    pub active: bool,
    /// Registration this core belongs to; ids recycle, generations don't
    pub generation: u32,
}

impl EntityCore {
    pub fn new(kind: EntityType, pos: Vec2, layer: u8) -> Self {
        Self {
            id: INVALID_ENTITY_ID,
            kind,
            pos,
            layer,
            active: false,
            generation: 0,
        }
    }
}

/// Capability set shared by all concrete entity kinds
pub trait GameEntity {
    const TYPE: EntityType;

    fn core(&self) -> &EntityCore;
    fn core_mut(&mut self) -> &mut EntityCore;

    fn id(&self) -> EntityId {
        self.core().id
    }

    fn pos(&self) -> Vec2 {
        self.core().pos
    }

    fn is_active(&self) -> bool {
        self.core().active
    }

    /// Called once, right after the registry assigned an id
    fn on_register(&mut self) {}

    /// Called once, right after the registry released the id
    fn on_unregister(&mut self) {}
}

/// Entities with a remaining lifetime in seconds; `f32::INFINITY` never expires
pub trait Expiring: GameEntity {
    fn remaining_lifetime(&self) -> f32;
    fn set_remaining_lifetime(&mut self, lifetime: f32);
}

/// Age every entity by `dt` and destroy the ones whose lifetime reaches zero.
///
/// Order of the survivors is preserved. Each expired entity is unregistered
/// exactly once, in the same pass that drops it from `entities`. A
/// non-positive (or NaN) `dt` leaves everything untouched. Returns the
/// number of entities destroyed.
pub fn expire_entities<E: Expiring>(
    entities: &mut Vec<E>,
    dt: f32,
    registry: &mut EntityRegistry,
) -> usize {
    if dt.is_nan() || dt <= 0.0 {
        return 0;
    }

    let before = entities.len();
    entities.retain_mut(|entity| {
        let lifetime = entity.remaining_lifetime();
        if lifetime.is_infinite() {
            return true;
        }
        let next = (lifetime - dt).max(0.0);
        entity.set_remaining_lifetime(next);
        if next > 0.0 {
            return true;
        }
        registry.destroy(entity);
        false
    });
    before - entities.len()
}
