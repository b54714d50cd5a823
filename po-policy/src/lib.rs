//! po-policy: the trained decision policy as a black-box "state in, action out" oracle.

pub mod export;
pub mod mlp;

pub use export::{sample_state, write_export, ExportError, GRAPH_FORMAT};
pub use mlp::{write_checkpoint, Dense, LoadError, MlpPolicy, CHECKPOINT_FILE_NAME};

use po_core::Action;
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("state vector has length {got}, policy expects {expected}")]
    BadInput { got: usize, expected: usize },
    #[error("policy produced a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Greedy, read-only decision policy shared by every session.
///
/// Implementations must be deterministic: the same state always yields the same action.
pub trait PolicyOracle: Send + Sync {
    /// Expected state vector length.
    fn input_len(&self) -> usize;

    /// Number of actions the policy chooses between.
    fn action_space(&self) -> usize;

    fn choose_action(&self, state: &[f32]) -> Result<Action, PolicyError>;

    /// Serialize the policy into a self-contained graph file.
    fn export_portable(&self, _sample: &[f32]) -> Result<Vec<u8>, ExportError> {
        Err(ExportError::Unsupported)
    }
}

/// Always answers with the same action (baseline stub).
#[derive(Debug, Clone)]
pub struct FixedPolicy {
    action: Action,
    input_len: usize,
    action_space: usize,
}

impl FixedPolicy {
    pub fn new(action: Action, input_len: usize, action_space: usize) -> Self {
        Self {
            action,
            input_len,
            action_space,
        }
    }
}

impl PolicyOracle for FixedPolicy {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn action_space(&self) -> usize {
        self.action_space
    }

    fn choose_action(&self, state: &[f32]) -> Result<Action, PolicyError> {
        check_input(state, self.input_len)?;
        Ok(self.action)
    }
}

pub(crate) fn check_input(state: &[f32], expected: usize) -> Result<(), PolicyError> {
    if state.len() != expected {
        return Err(PolicyError::BadInput {
            got: state.len(),
            expected,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn fixed_policy_validates_input_len() {
        let p = FixedPolicy::new(3, 4, 34);
        assert_eq!(p.choose_action(&[0.0; 4]), Ok(3));
        assert_eq!(
            p.choose_action(&[0.0; 5]),
            Err(PolicyError::BadInput {
                got: 5,
                expected: 4
            })
        );
    }

    #[test]
    fn fixed_policy_has_no_portable_form() {
        let p = FixedPolicy::new(0, 1, 1);
        assert!(matches!(
            p.export_portable(&[0.0]),
            Err(ExportError::Unsupported)
        ));
    }
}
