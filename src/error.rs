use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::{Operation, Stage};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(String),

    #[error("Peer '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Peer '{name}' not found")]
    NotFound { name: String },

    #[error("No free address left in {subnet}")]
    PoolExhausted { subnet: String },

    #[error("Command failed: {command}: {detail}")]
    ExternalTool { command: String, detail: String },

    #[error("{command} timed out after {}s", after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("Reconciliation drift: {0}")]
    Drift(String),

    #[error("Record '{name}' was modified concurrently (expected revision {expected}, found {found})")]
    Conflict {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Session log error: {0}")]
    Sessions(String),

    #[error("Cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("{operation} failed at stage {stage}: {source}")]
    Stage {
        operation: Operation,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn stage(operation: Operation, stage: Stage, source: Error) -> Self {
        // Keep the innermost stage when an inner call already tagged the failure.
        match source {
            e @ Error::Stage { .. } => e,
            e => Error::Stage {
                operation,
                stage,
                source: Box::new(e),
            },
        }
    }

    /// Known failures whose message is meant for the operator verbatim.
    /// Everything else is unexpected and should be logged in full and surfaced generically.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        match self {
            Error::Validation(_)
            | Error::DuplicateName { .. }
            | Error::NotFound { .. }
            | Error::PoolExhausted { .. }
            | Error::Cancelled { .. } => true,
            Error::Stage { source, .. } => source.is_user_facing(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Stage { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Stage at which a lifecycle operation failed, if the error carries one.
    #[must_use]
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost cause with stage wrappers peeled off.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            e => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_keeps_innermost_stage() {
        let inner = Error::stage(
            Operation::Create,
            Stage::InterfaceReloaded,
            Error::Timeout {
                command: "systemctl restart wg-quick@wg0".into(),
                after: Duration::from_secs(10),
            },
        );
        let outer = Error::stage(Operation::Create, Stage::Committed, inner);
        assert_eq!(outer.failed_stage(), Some(Stage::InterfaceReloaded));
        assert!(outer.is_timeout());
        assert!(outer.to_string().contains("timed out after 10s"));
        assert!(outer.to_string().contains("interface-reloaded"));
    }

    #[test]
    fn pool_exhaustion_is_user_facing_but_tool_failure_is_not() {
        assert!(Error::PoolExhausted {
            subnet: "10.0.0.0/24".into()
        }
        .is_user_facing());
        assert!(!Error::ExternalTool {
            command: "wg genkey".into(),
            detail: "not found".into()
        }
        .is_user_facing());
    }
}
