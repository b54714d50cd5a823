//! po-core: shared types, configuration and reward shaping for the phase-ordering advisor.
//!
//! The advisor tells an external compiler which optimization pass to run next on a unit of
//! intermediate code. Everything here is plain data shared by the policy, runtime and
//! transport crates.

pub mod config;
pub mod reward;

pub use config::{
    Config, ConfigError, Encoding, Endpoint, ExportConfig, LoggingConfig, PolicyConfig,
    RewardConfig, TargetArch, TransportConfig, TransportMode,
};
pub use reward::{RewardShaper, UnitMetrics};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding length produced by the IR feature extractor.
pub const STATE_SIZE: usize = 300;

/// Default number of pass sequences the policy chooses between.
pub const ACTION_SPACE_SIZE: usize = 34;

/// Wire value meaning "no further action, the episode is over".
pub const TERMINAL_ACTION: i32 = -1;

/// Index of one compiler transformation in `[0, action_space_size)`.
pub type Action = u32;

/// Fixed-length numeric description of the current optimization context.
pub type StateVector = Vec<f32>;

/// Convert a chosen action into its wire representation.
pub fn action_to_wire(a: Action) -> i32 {
    i32::try_from(a).unwrap_or(TERMINAL_ACTION)
}
