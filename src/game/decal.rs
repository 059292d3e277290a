//! Decals: transient ground markings (scorch marks, blood, tiles)
//!
//! Each decal kind has a static `DecalDef`. Spawning poses the definition's
//! collision shape and draws a lifetime from the kind's fade policy; the
//! `DecalBarn` ages its decals every tick and destroys the expired ones.

use rand::Rng;
use rustc_hash::FxHashMap;
use std::f32::consts::FRAC_PI_2;

use crate::game::collider::Collider;
use crate::game::entity::{expire_entities, EntityCore, EntityId, EntityType, Expiring, GameEntity};
use crate::game::registry::{EntityRegistry, RegistryError};
use crate::net::protocol::{DecalFull, DecalPart};
use crate::util::vec2::Vec2;

/// How long a fading decal lasts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecalLifetime {
    Fixed(f32),
    Range { min: f32, max: f32 },
}

/// Static definition of one decal kind
#[derive(Debug, Clone, PartialEq)]
pub struct DecalDef {
    /// Collision shape in local space
    pub collision: Collider,
    /// `None` means the kind never fades
    pub lifetime: Option<DecalLifetime>,
    /// Probability in [0, 1] that a spawned decal gets a finite lifetime
    pub fade_chance: f32,
}

impl DecalDef {
    pub fn permanent(collision: Collider) -> Self {
        Self {
            collision,
            lifetime: None,
            fade_chance: 0.0,
        }
    }

    pub fn fading(collision: Collider, lifetime: DecalLifetime, fade_chance: f32) -> Self {
        Self {
            collision,
            lifetime: Some(lifetime),
            fade_chance: fade_chance.clamp(0.0, 1.0),
        }
    }

    /// Draw a remaining lifetime for a new decal of this kind
    pub fn draw_lifetime<R: Rng>(&self, rng: &mut R) -> f32 {
        let Some(lifetime) = self.lifetime else {
            return f32::INFINITY;
        };
        if rng.gen::<f32>() >= self.fade_chance {
            return f32::INFINITY;
        }
        match lifetime {
            DecalLifetime::Fixed(seconds) => seconds,
            DecalLifetime::Range { min, max } if max > min => rng.gen_range(min..=max),
            DecalLifetime::Range { min, .. } => min,
        }
    }
}

/// Lookup table from kind name to definition
#[derive(Debug, Clone, Default)]
pub struct DecalDefs {
    defs: FxHashMap<String, DecalDef>,
}

impl DecalDefs {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in decal kinds
    pub fn builtin() -> Self {
        let mut defs = Self::empty();
        defs.insert(
            "decal_frag_explosion",
            DecalDef::fading(
                Collider::circle(Vec2::ZERO, 5.0),
                DecalLifetime::Range { min: 50.0, max: 70.0 },
                1.0,
            ),
        );
        defs.insert(
            "decal_barrel_explosion",
            DecalDef::fading(
                Collider::circle(Vec2::ZERO, 7.0),
                DecalLifetime::Range { min: 25.0, max: 35.0 },
                1.0,
            ),
        );
        defs.insert(
            "decal_smoke_scorch",
            DecalDef::fading(
                Collider::circle(Vec2::ZERO, 3.5),
                DecalLifetime::Fixed(20.0),
                1.0,
            ),
        );
        defs.insert(
            "decal_blood",
            DecalDef::fading(
                Collider::circle(Vec2::ZERO, 2.0),
                DecalLifetime::Fixed(60.0),
                0.5,
            ),
        );
        defs.insert(
            "decal_bathroom_tile",
            DecalDef::permanent(Collider::aabb_from_extent(Vec2::ZERO, Vec2::new(6.0, 6.0))),
        );
        defs.insert(
            "decal_light_strip",
            DecalDef::permanent(Collider::aabb_from_extent(Vec2::ZERO, Vec2::new(0.5, 8.0))),
        );
        defs
    }

    pub fn insert(&mut self, name: impl Into<String>, def: DecalDef) {
        self.defs.insert(name.into(), def);
    }

    pub fn get(&self, name: &str) -> Option<&DecalDef> {
        self.defs.get(name)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Errors from spawning an entity
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("Unknown decal kind: {0}")]
    UnknownKind(String),
    #[error("Invalid orientation code: {0} (expected 0-3)")]
    InvalidOrientation(u8),
    #[error("Invalid scale: {0}")]
    InvalidScale(f32),
    #[error("Invalid position")]
    InvalidPosition,
    #[error("Instance is not running")]
    NotRunning,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A placed decal
#[derive(Debug, Clone, PartialEq)]
pub struct Decal {
    core: EntityCore,
    pub kind_name: String,
    pub scale: f32,
    /// Discrete orientation code, quarter turns counter-clockwise
    pub ori: u8,
    /// Orientation in radians, derived from `ori`
    pub rot: f32,
    pub collider: Collider,
    pub bounds: Collider,
    pub remaining_lifetime: f32,
}

impl Decal {
    pub fn new(
        kind_name: &str,
        def: &DecalDef,
        pos: Vec2,
        layer: u8,
        ori: u8,
        scale: f32,
        lifetime: f32,
    ) -> Self {
        let rot = ori_to_rad(ori);
        let collider = def.collision.transform(pos, rot, scale);
        Self {
            core: EntityCore::new(EntityType::Decal, pos, layer),
            kind_name: kind_name.to_owned(),
            scale,
            ori,
            rot,
            bounds: collider.bounds(),
            collider,
            remaining_lifetime: lifetime,
        }
    }

    pub fn layer(&self) -> u8 {
        self.core.layer
    }

    pub fn part_data(&self) -> DecalPart {
        DecalPart { pos: self.core.pos }
    }

    pub fn full_data(&self) -> DecalFull {
        DecalFull {
            kind_name: self.kind_name.clone(),
            scale: self.scale,
            ori: self.ori,
            layer: self.core.layer,
        }
    }
}

impl GameEntity for Decal {
    const TYPE: EntityType = EntityType::Decal;

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn on_unregister(&mut self) {
        self.remaining_lifetime = self.remaining_lifetime.min(0.0);
    }
}

impl Expiring for Decal {
    fn remaining_lifetime(&self) -> f32 {
        self.remaining_lifetime
    }

    fn set_remaining_lifetime(&mut self, lifetime: f32) {
        self.remaining_lifetime = lifetime;
    }
}

/// Orientation code to radians
pub fn ori_to_rad(ori: u8) -> f32 {
    (ori % 4) as f32 * FRAC_PI_2
}

/// Owner of every live decal in one instance
pub struct DecalBarn {
    decals: Vec<Decal>,
    defs: DecalDefs,
}

impl DecalBarn {
    pub fn new(defs: DecalDefs) -> Self {
        Self {
            decals: Vec::new(),
            defs,
        }
    }

    pub fn defs(&self) -> &DecalDefs {
        &self.defs
    }

    /// Spawn a decal of `kind` and register it.
    ///
    /// `ori` defaults to 0 and `scale` to 1.
    #[allow(clippy::too_many_arguments)]
    pub fn add_decal<R: Rng>(
        &mut self,
        kind: &str,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
        scale: Option<f32>,
        registry: &mut EntityRegistry,
        rng: &mut R,
    ) -> Result<&Decal, SpawnError> {
        let def = self
            .defs
            .get(kind)
            .ok_or_else(|| SpawnError::UnknownKind(kind.to_owned()))?;

        let ori = ori.unwrap_or(0);
        if ori > 3 {
            return Err(SpawnError::InvalidOrientation(ori));
        }
        let scale = scale.unwrap_or(1.0);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SpawnError::InvalidScale(scale));
        }
        if !pos.is_finite() {
            return Err(SpawnError::InvalidPosition);
        }

        let lifetime = def.draw_lifetime(rng);
        let mut decal = Decal::new(kind, def, pos, layer, ori, scale, lifetime);
        let id = registry.register(&mut decal)?;
        tracing::debug!("Spawned decal {} ({}) at ({:.1}, {:.1})", id, kind, pos.x, pos.y);

        self.decals.push(decal);
        Ok(&self.decals[self.decals.len() - 1])
    }

    /// Age all decals by `dt`; returns how many expired
    pub fn update(&mut self, dt: f32, registry: &mut EntityRegistry) -> usize {
        expire_entities(&mut self.decals, dt, registry)
    }

    /// Destroy one decal ahead of its lifetime
    pub fn remove(&mut self, id: EntityId, registry: &mut EntityRegistry) -> bool {
        let Some(idx) = self.decals.iter().position(|d| d.id() == id) else {
            return false;
        };
        let mut decal = self.decals.remove(idx);
        registry.destroy(&mut decal)
    }

    pub fn get(&self, id: EntityId) -> Option<&Decal> {
        self.decals.iter().find(|d| d.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Decal> {
        self.decals.iter()
    }

    pub fn len(&self) -> usize {
        self.decals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decals.is_empty()
    }
}

impl Default for DecalBarn {
    fn default() -> Self {
        Self::new(DecalDefs::builtin())
    }
}
