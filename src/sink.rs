//! Caller-facing notification surface
//!
//! A [`BindSink`] is supplied by the caller at `start` and receives every
//! observable event of the fetch: the start marker, progress notifications,
//! data availability, and exactly one terminal result. For a single binding
//! the engine guarantees sink calls happen in the order the transport
//! reported them, always on the owner thread.

use bitflags::bitflags;

use crate::error::Result;
use crate::transport::ReadOutcome;

bitflags! {
    /// Position markers attached to a data notification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataFlags: u32 {
        /// First data notification of the session.
        const FIRST = 1 << 0;
        /// Neither first nor last.
        const INTERMEDIATE = 1 << 1;
        /// No further data notifications will follow.
        const LAST = 1 << 2;
    }
}

/// Progress notification kinds.
///
/// `SuggestedContentType` never reaches the sink raw: the funnel absorbs it
/// as the transport-proposed type and later reports the verified type as a
/// single `ContentTypeAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressCode {
    Connecting,
    SendingRequest,
    SuggestedContentType,
    ContentTypeAvailable,
    BeginTransfer,
    EndTransfer,
}

/// Result codes carried by the terminal notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    /// Not terminal: instructs the binding to restart against the URL in the
    /// accompanying text. Consumed by the engine, never forwarded.
    Redirect,
    Aborted,
    NotFound,
    Denied,
    Failed,
}

impl ResultCode {
    pub fn is_redirect(self) -> bool {
        matches!(self, ResultCode::Redirect)
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

/// Pull-style view of the currently available payload bytes, handed to the
/// sink inside `on_data_available`. Reading never blocks; a `Partial`
/// outcome with zero bytes means "try again after the next notification".
pub trait DataSource {
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;
}

/// Consumer of binding notifications.
///
/// Implementations must be `Send + Sync`: the engine itself only invokes the
/// sink on the owner thread, but sink handles are shared with queued tasks.
pub trait BindSink: Send + Sync {
    fn on_start_binding(&self);

    fn on_progress(&self, progress: u64, total: u64, code: ProgressCode, text: &str);

    fn on_data_available(
        &self,
        flags: DataFlags,
        progress: u64,
        max: u64,
        data: &dyn DataSource,
    );

    fn on_stop_binding(&self, code: ResultCode, text: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_flags_compose() {
        let flags = DataFlags::FIRST | DataFlags::LAST;
        assert!(flags.contains(DataFlags::FIRST));
        assert!(flags.contains(DataFlags::LAST));
        assert!(!flags.contains(DataFlags::INTERMEDIATE));
    }

    #[test]
    fn test_result_code_predicates() {
        assert!(ResultCode::Ok.is_success());
        assert!(ResultCode::Redirect.is_redirect());
        assert!(!ResultCode::Failed.is_success());
        assert!(!ResultCode::Aborted.is_redirect());
    }
}
