//! po-runtime: episode state machine + session store shared by both transports.

pub mod episode;
pub mod session_store;

pub use episode::{
    Episode, EpisodeError, EpisodeParams, EpisodePhase, EpisodeSummary, StepReport, Transition,
};
pub use session_store::{lock_episode, EpisodeHandle, Lookup, SessionId, SessionStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }
}
