//! Behaviour of each admission gate when the durable store cannot answer.
use std::fmt;

use clap::ValueEnum;

/// What a read-based gate does when its store lookup fails.
///
/// Every gate carries its own mode so that availability can be traded for
/// strictness per check. The production default is [`FailMode::Open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FailMode {
    /// Permit the action and log a warning.
    #[default]
    Open,
    /// Refuse the action.
    Closed,
}

impl FailMode {
    /// Whether the guarded action may proceed after a store failure.
    pub const fn permits(self) -> bool {
        matches!(self, Self::Open)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
