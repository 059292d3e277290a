/// Simulation and scheduling constants
pub mod tick {
    /// Simulation steps per second
    pub const TICK_RATE: u32 = 40;
    /// Tick duration in milliseconds
    pub const TICK_DURATION_MS: u64 = 1000 / TICK_RATE as u64;
    /// Network flush period in milliseconds (one flush per simulation step)
    pub const FLUSH_DURATION_MS: u64 = TICK_DURATION_MS;
    /// Worker keep-alive period while no instance is live
    pub const KEEP_ALIVE_MS: u64 = 5_000;
    /// Missed keep-alives after which an idle worker counts as stalled
    pub const STALLED_KEEP_ALIVES: u32 = 3;
    /// Host-side inbound batching period
    pub const HOST_FLUSH_MS: u64 = 10;
}

/// Wire protocol constants
pub mod net {
    /// Client protocol version accepted by `Join`
    pub const PROTOCOL_VERSION: u32 = 78;
    /// Maximum framed message size accepted from a socket (64KB)
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
    /// Maximum number of objects in any one list of an update message
    pub const MAX_OBJECTS_PER_UPDATE: usize = 4096;
    /// Objects packed into one outbound update frame before splitting
    pub const MAX_OBJECTS_PER_FRAME: usize = 256;
    /// Maximum player name length in bytes
    pub const MAX_NAME_LEN: usize = 16;
    /// Maximum join token length in bytes
    pub const MAX_TOKEN_LEN: usize = 64;
    /// Maximum length for free-form strings (reasons, map names, kind names)
    pub const MAX_STRING_LEN: usize = 128;
    /// Maximum frames in one inbound/outbound socket batch
    pub const MAX_FRAMES_PER_BATCH: usize = 1024;
}

/// Entity identity constants
pub mod entity {
    /// Largest assignable entity id; id 0 is reserved as "invalid"
    pub const MAX_ENTITY_ID: u16 = u16::MAX;
}

/// Session constants
pub mod session {
    /// Seconds of game time a provisioned join token stays valid
    pub const JOIN_TOKEN_TTL: f32 = 10.0;
    /// Default seconds an instance may sit empty after its first player before stopping
    pub const EMPTY_TIMEOUT: f32 = 30.0;
    /// Default hard cap on simulated seconds per instance
    pub const MAX_DURATION: f32 = 60.0 * 60.0;
    /// Default player capacity per instance
    pub const MAX_PLAYERS: usize = 80;
}

/// Smoke cloud behavior
pub mod smoke {
    /// Seconds a smoke cloud lives
    pub const LIFETIME: f32 = 12.0;
    /// Radius at spawn
    pub const START_RADIUS: f32 = 1.5;
    /// Radius reached at full expansion
    pub const MAX_RADIUS: f32 = 7.0;
    /// Seconds to expand from start to max radius
    pub const EXPAND_TIME: f32 = 2.5;
}
