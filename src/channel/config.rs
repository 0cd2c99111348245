use crate::codec::v6::IntegritySuite;
use crate::eid::Eid;
use crate::error::{BpError, BpResult};
use std::time::Duration;

/// What `load` does when the next custody id wraps onto an active table
/// slot that is still awaiting acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapResponse {
    /// Force-retransmit the occupying bundle under a fresh custody id.
    #[default]
    Resend,
    /// Report overflow to the caller and wait for acknowledgments.
    Block,
    /// Relinquish the occupying bundle and count it lost.
    Drop,
}

/// Per-channel attributes. Scalar options can be changed after open through
/// [`super::Channel::set_option`]; fields feeding the serialized bundle
/// template trigger a template rebuild when set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub local: Eid,
    pub destination: Eid,
    pub report_to: Eid,

    /// Seconds until an originated bundle expires; 0 means never.
    pub lifetime_secs: u64,
    pub request_custody: bool,
    pub integrity_check: bool,
    pub integrity_suite: IntegritySuite,
    pub allow_fragment: bool,
    /// Upper bound for one serialized bundle, header blocks included.
    pub max_bundle_length: usize,
    /// Originating channels refuse to forward and vice versa.
    pub originate: bool,
    /// Process only administrative records (sender-only agents).
    pub proc_admin_only: bool,

    /// Seconds before an unacknowledged bundle is retransmitted; 0 disables.
    pub timeout_secs: u64,
    pub wrap_response: WrapResponse,
    /// Bound for the wait on the active table signal after a wrap.
    pub wrap_timeout: Duration,
    /// Keep the custody id (and active table slot) on retransmission.
    pub cid_reuse: bool,

    /// Seconds between custody signal flushes toward one custodian.
    pub dacs_rate_secs: u64,
    /// How many remote custodians can have an open signal accumulator.
    pub max_concurrent_dacs: usize,
    /// SDNV fills per custody signal bundle.
    pub max_fills_per_dacs: usize,
    /// Node budget of each accumulator's custody id set.
    pub max_dacs_runs: usize,

    pub active_table_size: usize,
}

impl ChannelConfig {
    pub fn new(local: Eid, destination: Eid) -> ChannelConfig {
        ChannelConfig {
            local,
            destination,
            report_to: Eid::NULL,
            lifetime_secs: 0,
            request_custody: true,
            integrity_check: true,
            integrity_suite: IntegritySuite::Crc16X25,
            allow_fragment: false,
            max_bundle_length: 4096,
            originate: true,
            proc_admin_only: false,
            timeout_secs: 10,
            wrap_response: WrapResponse::Resend,
            wrap_timeout: Duration::from_millis(1000),
            cid_reuse: false,
            dacs_rate_secs: 5,
            max_concurrent_dacs: 4,
            max_fills_per_dacs: 64,
            max_dacs_runs: 1028,
            active_table_size: 16384,
        }
    }

    pub fn validate(&self) -> BpResult<()> {
        if self.active_table_size == 0 {
            return Err(BpError::Param("active table size must be positive"));
        }
        if self.max_bundle_length == 0 {
            return Err(BpError::Param("max bundle length must be positive"));
        }
        if self.max_fills_per_dacs < 2 {
            return Err(BpError::Param("a custody signal needs at least two fills"));
        }
        if self.max_concurrent_dacs == 0 {
            return Err(BpError::Param("max concurrent custody signals must be positive"));
        }
        if self.max_dacs_runs == 0 {
            return Err(BpError::Param("custody id set budget must be positive"));
        }
        Ok(())
    }
}

/// One settable channel option. Options touching the primary block rebuild
/// the serialized outbound template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelOption {
    DestNode(u32),
    DestService(u32),
    ReportToNode(u32),
    ReportToService(u32),
    CustodianNode(u32),
    CustodianService(u32),
    SetSequence(u32),
    Lifetime(u64),
    RequestCustody(bool),
    IntegrityCheck(bool),
    AllowFragment(bool),
    PayloadCrc(IntegritySuite),
    Timeout(u64),
    MaxBundleLength(usize),
    Originate(bool),
    ProcAdminOnly(bool),
    WrapResponse(WrapResponse),
    CidReuse(bool),
    DacsRate(u64),
}

/// Snapshot of the readable option surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelOptions {
    pub destination: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub sequence: u32,
    pub lifetime_secs: u64,
    pub request_custody: bool,
    pub integrity_check: bool,
    pub allow_fragment: bool,
    pub integrity_suite: IntegritySuite,
    pub timeout_secs: u64,
    pub max_bundle_length: usize,
    pub originate: bool,
    pub proc_admin_only: bool,
    pub wrap_response: WrapResponse,
    pub cid_reuse: bool,
    pub dacs_rate_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ChannelConfig::new(Eid::new(1, 1), Eid::new(2, 1))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut cfg = ChannelConfig::new(Eid::new(1, 1), Eid::new(2, 1));
        cfg.active_table_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ChannelConfig::new(Eid::new(1, 1), Eid::new(2, 1));
        cfg.max_fills_per_dacs = 1;
        assert!(cfg.validate().is_err());
    }
}
