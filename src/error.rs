use bitflags::bitflags;
use thiserror::Error;

pub type BpResult<T> = Result<T, BpError>;

/// Error taxonomy of the agent core.
///
/// Per-bundle failures are recovered locally by the engine: the offending
/// bundle is dropped, a counter is incremented, and processing continues
/// with the next bundle. Channel-wide failures surface at open time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BpError {
    // configuration
    #[error("invalid parameter: {0}")]
    Param(&'static str),
    #[error("invalid channel handle")]
    InvalidHandle,
    #[error("channel table is full")]
    ChannelsFull,
    #[error("invalid endpoint id: {0}")]
    InvalidEid(String),

    // parse / format
    #[error("bundle parse error: {0}")]
    BundleParse(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("bundle too large ({size} > {max})")]
    BundleTooLarge { size: usize, max: usize },
    #[error("payload too large ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unknown administrative record type {0}")]
    UnknownRecord(u8),

    // semantic
    #[error("operation not allowed by the channel's origination setting")]
    WrongOrigination,
    #[error("bundle for service {dest} received on channel serving {local}")]
    WrongChannel { dest: u32, local: u32 },
    #[error("bundle lifetime expired")]
    Expired,
    #[error("bundle dropped: {0}")]
    Dropped(&'static str),
    #[error("non-administrative bundle ignored")]
    Ignore,
    #[error("payload failed integrity check")]
    FailedIntegrity,

    // resource / io
    #[error("storage operation failed: {0}")]
    FailedStore(&'static str),
    #[error("memory exhausted")]
    FailedMem,
    #[error("operating system primitive failed")]
    FailedOs,
    #[error("timed out")]
    Timeout,
    #[error("custody id wrapped onto an occupied active table slot")]
    Overflow,
    #[error("no response possible: {0}")]
    FailedResponse(&'static str),
}

bitflags! {
    /// Side-band diagnostics accumulated across an engine call.
    ///
    /// Flags are cumulative within one `store`/`load`/`process`/`accept`
    /// invocation; the caller owns the word and clears it between calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        /// A peer violated the protocol in a recoverable way.
        const NON_COMPLIANT     = 0x0001;
        /// One or more blocks were skipped without being processed.
        const INCOMPLETE        = 0x0002;
        /// The loaded bundle is not addressed to the channel default route.
        const ROUTE_NEEDED      = 0x0004;
        /// The custody id wrapped onto an occupied active table slot.
        const ACTIVE_TABLE_WRAP = 0x0008;
        /// An SDNV value exceeded its reserved width.
        const SDNV_OVERFLOW     = 0x0010;
        /// An SDNV field ran off the end of its buffer.
        const SDNV_INCOMPLETE   = 0x0020;
        /// A storage service call failed; the affected bundle was dropped.
        const STORE_FAILURE     = 0x0040;
        /// The custody id set reached its configured node limit.
        const RB_TREE_FULL      = 0x0080;
        /// A duplicate custody id or sequence number was ignored.
        const DUPLICATES        = 0x0100;
        /// A custody signal mixed delivery and forward acknowledgments.
        const MIXED_RESPONSE    = 0x0200;
        /// No room to track another custodian in the signal accumulators.
        const TOO_MANY_SOURCES  = 0x0400;
        /// An allocation failed.
        const OUT_OF_MEMORY     = 0x0800;
        /// The delivered payload carried a custody request.
        const ACTIVITY          = 0x1000;
        /// This agent holds custody of the bundle in question.
        const LOCAL_CUSTODY     = 0x2000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_accumulate_and_clear() {
        let mut flags = StatusFlags::default();
        flags |= StatusFlags::SDNV_OVERFLOW;
        flags |= StatusFlags::STORE_FAILURE;
        assert!(flags.contains(StatusFlags::SDNV_OVERFLOW | StatusFlags::STORE_FAILURE));
        assert!(!flags.contains(StatusFlags::DUPLICATES));

        flags = StatusFlags::default();
        assert!(flags.is_empty());
    }
}
