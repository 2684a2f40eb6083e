//! Binding lifecycle state machine

use std::fmt;

/// Lifecycle states of one binding.
///
/// Legal transitions:
///
/// ```text
/// Created --start--> Active
/// Active --redirect result--> Redirecting --restart--> Active
/// Active|Redirecting --terminal result--> ResultReported
/// Active|Redirecting --abort--> Aborted
/// ResultReported|Aborted --terminate--> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Created,
    Active,
    Redirecting,
    ResultReported,
    Aborted,
    Terminated,
}

impl BindState {
    pub fn can_transition(self, next: BindState) -> bool {
        use BindState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Redirecting)
                | (Redirecting, Active)
                | (Active, ResultReported)
                | (Redirecting, ResultReported)
                | (Active, Aborted)
                | (Redirecting, Aborted)
                | (ResultReported, Terminated)
                | (Aborted, Terminated)
        )
    }

    /// No further operations are valid once terminated.
    pub fn is_terminal(self) -> bool {
        self == BindState::Terminated
    }

    /// Data and progress notifications are delivered only while running.
    pub fn delivers_payload(self) -> bool {
        matches!(self, BindState::Active | BindState::Redirecting)
    }
}

impl fmt::Display for BindState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindState::Created => "created",
            BindState::Active => "active",
            BindState::Redirecting => "redirecting",
            BindState::ResultReported => "result-reported",
            BindState::Aborted => "aborted",
            BindState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
