//! Smoke clouds: expanding, fixed-lifetime area markers
//!
//! Unlike decals, a smoke cloud changes every tick while it expands, so its
//! radius is replicated as partial state.

use crate::game::constants::smoke::{EXPAND_TIME, LIFETIME, MAX_RADIUS, START_RADIUS};
use crate::game::entity::{expire_entities, EntityCore, EntityId, EntityType, Expiring, GameEntity};
use crate::game::registry::EntityRegistry;
use crate::net::protocol::{SmokeFull, SmokePart};
use crate::util::vec2::Vec2;

use super::decal::SpawnError;

#[derive(Debug, Clone, PartialEq)]
pub struct Smoke {
    core: EntityCore,
    pub rad: f32,
    pub age: f32,
    pub remaining_lifetime: f32,
    pub interior: bool,
}

impl Smoke {
    pub fn new(pos: Vec2, layer: u8, interior: bool) -> Self {
        Self {
            core: EntityCore::new(EntityType::Smoke, pos, layer),
            rad: START_RADIUS,
            age: 0.0,
            remaining_lifetime: LIFETIME,
            interior,
        }
    }

    /// Radius for a cloud of the given age
    pub fn radius_at(age: f32) -> f32 {
        let t = (age / EXPAND_TIME).clamp(0.0, 1.0);
        START_RADIUS + (MAX_RADIUS - START_RADIUS) * t
    }

    pub fn part_data(&self) -> SmokePart {
        SmokePart {
            pos: self.core.pos,
            rad: self.rad,
        }
    }

    pub fn full_data(&self) -> SmokeFull {
        SmokeFull {
            layer: self.core.layer,
            interior: self.interior,
        }
    }
}

impl GameEntity for Smoke {
    const TYPE: EntityType = EntityType::Smoke;

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }
}

impl Expiring for Smoke {
    fn remaining_lifetime(&self) -> f32 {
        self.remaining_lifetime
    }

    fn set_remaining_lifetime(&mut self, lifetime: f32) {
        self.remaining_lifetime = lifetime;
    }
}

#[derive(Default)]
pub struct SmokeBarn {
    smokes: Vec<Smoke>,
}

impl SmokeBarn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_smoke(
        &mut self,
        pos: Vec2,
        layer: u8,
        interior: bool,
        registry: &mut EntityRegistry,
    ) -> Result<&Smoke, SpawnError> {
        if !pos.is_finite() {
            return Err(SpawnError::InvalidPosition);
        }
        let mut smoke = Smoke::new(pos, layer, interior);
        registry.register(&mut smoke)?;
        self.smokes.push(smoke);
        Ok(&self.smokes[self.smokes.len() - 1])
    }

    /// Grow every cloud, then expire the finished ones
    pub fn update(&mut self, dt: f32, registry: &mut EntityRegistry) -> usize {
        if dt.is_nan() || dt <= 0.0 {
            return 0;
        }
        for smoke in &mut self.smokes {
            smoke.age += dt;
            let rad = Smoke::radius_at(smoke.age);
            if rad != smoke.rad {
                smoke.rad = rad;
                registry.mark_part_dirty(smoke.id());
            }
        }
        expire_entities(&mut self.smokes, dt, registry)
    }

    /// Destroy one cloud ahead of its lifetime
    pub fn remove(&mut self, id: EntityId, registry: &mut EntityRegistry) -> bool {
        let Some(idx) = self.smokes.iter().position(|s| s.id() == id) else {
            return false;
        };
        let mut smoke = self.smokes.remove(idx);
        registry.destroy(&mut smoke)
    }

    pub fn get(&self, id: EntityId) -> Option<&Smoke> {
        self.smokes.iter().find(|s| s.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Smoke> {
        self.smokes.iter()
    }

    pub fn len(&self) -> usize {
        self.smokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.smokes.is_empty()
    }
}
