//! Open custody-signal accumulators.
//!
//! One accumulator is kept per remote custodian currently being
//! acknowledged. Custody ids collect in an ordered run set until the
//! accumulator is flushed: by rate from `load`, by a full set, or by a
//! mixed delivery/forward response. A flush drains the set into one or
//! more serialized admin bundles on the custody signal store.

use crate::codec::acs;
use crate::codec::v6::{IntegrityBlock, PayloadBlock, PrimaryBlock};
use crate::eid::Eid;
use crate::error::{BpError, BpResult, StatusFlags};
use crate::runset::{Insert, RunSet};
use crate::sdnv;
use crate::storage::{BundleStore, Timeout};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::ChannelConfig;
use super::template::BundleRecord;

pub(crate) struct DacsBundle {
    pub custodian: Eid,
    /// true: acknowledging local deliveries; false: forward accepts.
    pub delivered: bool,
    pub cids: RunSet,
    pub last_sent_secs: u64,
    primary: PrimaryBlock,
    integrity: IntegrityBlock,
    payload: PayloadBlock,
    record: BundleRecord,
}

impl DacsBundle {
    fn new(cfg: &ChannelConfig, custodian: Eid, delivered: bool) -> BpResult<DacsBundle> {
        let mut primary = PrimaryBlock::template();
        primary.is_admin_rec = true;
        primary.request_custody = false;
        primary.integrity_check = cfg.integrity_check;
        primary.set_dest(custodian);
        primary.set_source(cfg.local);
        primary.set_custodian(cfg.local);

        let mut integrity = IntegrityBlock::new(cfg.integrity_suite);
        let mut payload = PayloadBlock::new();

        let mut flags = StatusFlags::default();
        let mut header = vec![0u8; crate::codec::v6::BUNDLE_HDR_BUF_SIZE];
        let mut offset = primary.write(&mut header, &mut flags)?;
        let bib_offset = if primary.integrity_check {
            let bib_offset = offset;
            offset += integrity.write(&mut header[offset..], &mut flags)?;
            Some(bib_offset)
        } else {
            None
        };
        let pay_offset = offset;
        offset += payload.write(&mut header[offset..], 0, &mut flags)?;
        header.truncate(offset);

        Ok(DacsBundle {
            custodian,
            delivered,
            cids: RunSet::new(cfg.max_dacs_runs),
            last_sent_secs: 0,
            primary,
            integrity,
            payload,
            record: BundleRecord {
                expiry_secs: 0,
                cid_field: None,
                bib_offset,
                pay_offset,
                header,
            },
        })
    }

    /// Drain the custody id set into as many signal bundles as it takes.
    async fn flush(
        &mut self,
        store: &Arc<dyn BundleStore>,
        now_secs: u64,
        max_fills: usize,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        let mut first_failure = None;
        while !self.cids.is_empty() {
            let record_payload = acs::write(&mut self.cids, max_fills)?;

            self.primary.createsec.value = now_secs;
            sdnv::write_fixed(&mut self.record.header, self.primary.createsec, flags);
            sdnv::write_fixed(&mut self.record.header, self.primary.createseq, flags);
            self.primary.createseq.value += 1;

            if let Some(bib_offset) = self.record.bib_offset {
                self.integrity
                    .update(&mut self.record.header[bib_offset..], &record_payload);
            }
            let pay_offset = self.record.pay_offset;
            self.payload
                .write(&mut self.record.header[pay_offset..], record_payload.len(), flags)?;

            match store
                .enqueue(&self.record.encode(), &record_payload, Timeout::Poll)
                .await
            {
                Ok(()) => {
                    debug!(
                        custodian = %self.custodian,
                        bytes = record_payload.len(),
                        "flushed custody signal"
                    );
                    self.last_sent_secs = now_secs;
                }
                Err(e) => {
                    warn!(custodian = %self.custodian, error = %e, "failed to store custody signal, signal dropped");
                    *flags |= StatusFlags::STORE_FAILURE;
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub(crate) struct DacsSet {
    bundles: Vec<DacsBundle>,
    cfg: ChannelConfig,
}

impl DacsSet {
    pub fn new(cfg: ChannelConfig) -> DacsSet {
        DacsSet {
            bundles: Vec::new(),
            cfg,
        }
    }

    pub fn set_rate_secs(&mut self, rate: u64) {
        self.cfg.dacs_rate_secs = rate;
    }

    /// Whether `cid` is already pending acknowledgment toward `custodian`
    /// for the same delivery kind. Used to spot re-received bundles before
    /// they are delivered a second time.
    pub fn is_duplicate(&self, custodian: Eid, cid: u32, delivered: bool) -> bool {
        self.bundles
            .iter()
            .find(|d| d.custodian == custodian)
            .is_some_and(|d| d.delivered == delivered && d.cids.contains(cid))
    }

    /// Record one custody acceptance toward `custodian`. Flushes the
    /// accumulator first when the delivery kind flips or the set is full.
    pub async fn update(
        &mut self,
        store: &Arc<dyn BundleStore>,
        custodian: Eid,
        cid: u32,
        delivered: bool,
        now_secs: u64,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        let index = match self.bundles.iter().position(|d| d.custodian == custodian) {
            Some(index) => index,
            None => {
                if self.bundles.len() >= self.cfg.max_concurrent_dacs {
                    *flags |= StatusFlags::TOO_MANY_SOURCES;
                    warn!(%custodian, "no room to track another custodian");
                    return Err(BpError::FailedResponse("custody signal accumulators exhausted"));
                }
                debug!(%custodian, "opening custody signal accumulator");
                self.bundles
                    .push(DacsBundle::new(&self.cfg, custodian, delivered)?);
                self.bundles.len() - 1
            }
        };
        let max_fills = self.cfg.max_fills_per_dacs;
        let dacs = &mut self.bundles[index];

        if dacs.delivered != delivered {
            *flags |= StatusFlags::MIXED_RESPONSE;
            dacs.flush(store, now_secs, max_fills, flags).await?;
            dacs.delivered = delivered;
            dacs.cids.insert(cid);
            return Ok(());
        }

        match dacs.cids.insert(cid) {
            Insert::Done => Ok(()),
            Insert::Duplicate => {
                *flags |= StatusFlags::DUPLICATES;
                Ok(())
            }
            Insert::Full => {
                *flags |= StatusFlags::RB_TREE_FULL;
                dacs.flush(store, now_secs, max_fills, flags).await?;
                dacs.cids.insert(cid);
                Ok(())
            }
        }
    }

    /// Flush every accumulator whose rate interval has elapsed.
    pub async fn flush_stale(
        &mut self,
        store: &Arc<dyn BundleStore>,
        now_secs: u64,
        flags: &mut StatusFlags,
    ) {
        let rate = self.cfg.dacs_rate_secs;
        let max_fills = self.cfg.max_fills_per_dacs;
        for dacs in &mut self.bundles {
            if rate > 0 && now_secs >= dacs.last_sent_secs + rate && !dacs.cids.is_empty() {
                // enqueue failures were flagged; the signal itself is lost
                let _ = dacs.flush(store, now_secs, max_fills, flags).await;
                dacs.last_sent_secs = now_secs;
            }
        }
    }
}
