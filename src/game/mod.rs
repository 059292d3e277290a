pub mod constants;
pub mod collider;
pub mod entity;
pub mod registry;
pub mod decal;
pub mod smoke;
pub mod instance;
