use crate::active_table::ActiveTable;
use crate::codec::acs;
use crate::codec::v6::{
    BlockType, CustodyBlock, IntegrityBlock, PrimaryBlock, PayloadBlock, BLK_DELETE_NO_PROC,
    BLK_DROP_NO_PROC, BLK_FORWARD_NO_PROC, BLK_NOTIFY_NO_PROC,
};
use crate::eid::Eid;
use crate::error::{BpError, BpResult, StatusFlags};
use crate::sdnv::{self, Field};
use crate::storage::{BundleStore, Sid, StorageService, Timeout};
use crate::time::Clock;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use super::config::{ChannelConfig, ChannelOption, ChannelOptions, WrapResponse};
use super::dacs::DacsSet;
use super::stats::{add, bump, set, ChannelStats, Counters};
use super::template::{BundleRecord, DataBundle, PayloadRecord};

/// A payload handed to the application by [`Channel::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    /// The originator asked for custody transfer; acceptance has already
    /// been recorded toward the previous custodian.
    pub request_custody: bool,
}

/// Extract the destination of a serialized bundle without processing it.
pub fn route_info(bundle: &[u8]) -> BpResult<Eid> {
    let mut flags = StatusFlags::default();
    let (pri, _) = PrimaryBlock::read(bundle, &mut flags)?;
    Ok(pri.dest())
}

/// A bundle chosen by `load`, not yet counted or patched.
struct Selected {
    record: BundleRecord,
    body: Bytes,
    sid: Sid,
    from_dacs: bool,
    /// Occupied active table slot and custody id to reuse.
    reuse: Option<(usize, u32)>,
}

/// Per-endpoint engine state.
///
/// Lock order is strict: the data bundle lock, then the custody signal
/// lock, then the active table; no two of them are held across a storage
/// call, and the signal [`Notify`] wakes `load` callers blocked on an
/// active table wrap.
pub struct Channel {
    config: StdMutex<ChannelConfig>,
    clock: Arc<dyn Clock>,
    counters: Counters,

    data_store: Arc<dyn BundleStore>,
    payload_store: Arc<dyn BundleStore>,
    dacs_store: Arc<dyn BundleStore>,

    data: Mutex<DataBundle>,
    dacs: Mutex<DacsSet>,
    active: Mutex<ActiveTable>,
    active_signal: Notify,
}

impl Channel {
    pub(crate) fn open(
        storage: &dyn StorageService,
        config: ChannelConfig,
        clock: Arc<dyn Clock>,
    ) -> BpResult<Channel> {
        config.validate()?;
        let data_store = storage.create()?;
        let payload_store = storage.create()?;
        let dacs_store = storage.create()?;
        let data = DataBundle::new(&config)?;
        let active = ActiveTable::new(config.active_table_size);
        let dacs = DacsSet::new(config.clone());

        Ok(Channel {
            config: StdMutex::new(config),
            clock,
            counters: Counters::default(),
            data_store,
            payload_store,
            dacs_store,
            data: Mutex::new(data),
            dacs: Mutex::new(dacs),
            active: Mutex::new(active),
            active_signal: Notify::new(),
        })
    }

    fn config(&self) -> ChannelConfig {
        self.config.lock().expect("channel config poisoned").clone()
    }

    pub fn local_eid(&self) -> Eid {
        self.config().local
    }

    /// Originate a bundle from the channel template and enqueue it (as one
    /// or more fragments) to the data store.
    pub async fn store(
        &self,
        payload: &[u8],
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        let now = self.clock.now_secs();
        let mut data = self.data.lock().await;
        if !data.originate {
            return Err(BpError::WrongOrigination);
        }
        data.primary.is_frag = data.primary.allow_frag && payload.len() > data.max_length;
        if data.primary.is_frag {
            // fragment fields start from zero on an originated bundle
            data.primary.fragoffset.value = 0;
        }
        data.store_payload(payload, now, &self.data_store, timeout, flags)
            .await?;
        bump(&self.counters.generated);
        trace!(bytes = payload.len(), "originated bundle");
        Ok(())
    }

    /// Emit the next outbound bundle. Selection priority: pending custody
    /// signals, timed-out retransmits, then a fresh dequeue from the data
    /// store (honoring `timeout`). Returns `None` when nothing is due.
    pub async fn load(&self, timeout: Timeout, flags: &mut StatusFlags) -> BpResult<Option<Bytes>> {
        let cfg = self.config();
        let now = self.clock.now_secs();

        {
            let mut dacs = self.dacs.lock().await;
            dacs.flush_stale(&self.dacs_store, now, flags).await;
        }

        let mut selected = match self.dacs_store.dequeue(Timeout::Poll).await {
            Ok(Some((buf, sid))) => {
                let (record, body_start) = BundleRecord::decode(&buf)?;
                *flags |= StatusFlags::ROUTE_NEEDED;
                Some(Selected {
                    record,
                    body: buf.slice(body_start..),
                    sid,
                    from_dacs: true,
                    reuse: None,
                })
            }
            Ok(None) => None,
            Err(e) => {
                *flags |= StatusFlags::STORE_FAILURE;
                return Err(e);
            }
        };

        if selected.is_none() {
            selected = self.scan_active_table(&cfg, now, flags).await?;
        }

        if selected.is_none() {
            loop {
                match self.data_store.dequeue(timeout).await {
                    Ok(None) => return Ok(None),
                    Ok(Some((buf, sid))) => {
                        let (record, body_start) = BundleRecord::decode(&buf)?;
                        if record.is_expired(now) {
                            self.data_store.relinquish(sid);
                            bump(&self.counters.expired);
                            continue;
                        }
                        selected = Some(Selected {
                            record,
                            body: buf.slice(body_start..),
                            sid,
                            from_dacs: false,
                            reuse: None,
                        });
                        break;
                    }
                    Err(e) => {
                        *flags |= StatusFlags::STORE_FAILURE;
                        return Err(e);
                    }
                }
            }
        }

        let sel = selected.expect("selection settled above");
        self.emit(sel, now, flags).await.map(Some)
    }

    /// Walk the active table from the oldest custody id: relinquish expired
    /// entries, pick up timed-out ones, and make sure the slot at
    /// `current_cid` is free before a fresh dequeue - applying the wrap
    /// response when it is not.
    async fn scan_active_table(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        flags: &mut StatusFlags,
    ) -> BpResult<Option<Selected>> {
        let mut wrap_wait = false;
        let mut result = None;

        let mut at = self.active.lock().await;
        while at.oldest_cid < at.current_cid {
            let ati = at.index_of(at.oldest_cid);
            let Some(sid) = at.sid_at(ati) else {
                at.oldest_cid += 1;
                continue;
            };

            let buf = match self.data_store.retrieve(sid).await {
                Ok(buf) => buf,
                Err(_) => {
                    self.data_store.relinquish(sid);
                    at.vacate(ati);
                    at.oldest_cid += 1;
                    *flags |= StatusFlags::STORE_FAILURE;
                    bump(&self.counters.lost);
                    continue;
                }
            };
            let (record, body_start) = BundleRecord::decode(&buf)?;

            if record.is_expired(now) {
                debug!(cid = at.oldest_cid, "expired in active table");
                self.data_store.relinquish(sid);
                at.vacate(ati);
                at.oldest_cid += 1;
                bump(&self.counters.expired);
                continue;
            }

            if cfg.timeout_secs != 0 && now >= at.last_retx_at(ati) + cfg.timeout_secs {
                debug!(cid = at.oldest_cid, reuse = cfg.cid_reuse, "retransmit on timeout");
                bump(&self.counters.retransmitted);
                let reuse = if cfg.cid_reuse {
                    Some((ati, at.oldest_cid))
                } else {
                    at.vacate(ati);
                    at.oldest_cid += 1;
                    None
                };
                result = Some(Selected {
                    record,
                    body: buf.slice(body_start..),
                    sid,
                    from_dacs: false,
                    reuse,
                });
                break;
            }

            // The oldest entry is not due yet. Before handing control to a
            // fresh dequeue, the slot the next custody id maps to must be
            // free; at least one open slot is required at all times.
            let head = at.index_of(at.current_cid);
            if let Some(occupant) = at.sid_at(head) {
                *flags |= StatusFlags::ACTIVE_TABLE_WRAP;
                match cfg.wrap_response {
                    WrapResponse::Resend => {
                        at.oldest_cid += 1;
                        match self.data_store.retrieve(occupant).await {
                            Ok(buf) => {
                                let (record, body_start) = BundleRecord::decode(&buf)?;
                                bump(&self.counters.retransmitted);
                                result = Some(Selected {
                                    record,
                                    body: buf.slice(body_start..),
                                    sid: occupant,
                                    from_dacs: false,
                                    reuse: None,
                                });
                                wrap_wait = true;
                            }
                            Err(_) => {
                                self.data_store.relinquish(occupant);
                                at.vacate(head);
                                *flags |= StatusFlags::STORE_FAILURE;
                                bump(&self.counters.lost);
                                continue;
                            }
                        }
                    }
                    WrapResponse::Block => {
                        drop(at);
                        let _ = tokio::time::timeout(
                            cfg.wrap_timeout,
                            self.active_signal.notified(),
                        )
                        .await;
                        return Err(BpError::Overflow);
                    }
                    WrapResponse::Drop => {
                        warn!(cid = at.current_cid, "wrap onto occupied slot, dropping occupant");
                        at.oldest_cid += 1;
                        self.data_store.relinquish(occupant);
                        at.vacate(head);
                        bump(&self.counters.lost);
                    }
                }
            }
            break;
        }
        drop(at);

        if wrap_wait {
            // give acknowledgments a bounded chance to drain the table
            let _ = tokio::time::timeout(cfg.wrap_timeout, self.active_signal.notified()).await;
        }
        Ok(result)
    }

    /// Finish a selection: assign (or keep) the custody id, patch it into
    /// the serialized header, and hand the bytes out.
    async fn emit(&self, mut sel: Selected, now: u64, flags: &mut StatusFlags) -> BpResult<Bytes> {
        let mut at = self.active.lock().await;

        if !sel.from_dacs && sel.record.cid_field.is_some() {
            let mut cid = sel.record.cid_field.expect("checked above");
            let ati = match sel.reuse {
                Some((ati, kept_cid)) => {
                    // the stored header may predate the slot's id; re-patch
                    cid.value = u64::from(kept_cid);
                    ati
                }
                None => {
                    let ati = at.index_of(at.current_cid);
                    at.occupy(ati, sel.sid);
                    cid.value = u64::from(at.current_cid);
                    at.current_cid = at.current_cid.wrapping_add(1);
                    ati
                }
            };
            sdnv::write_fixed(&mut sel.record.header, cid, flags);
            sel.record.cid_field = Some(cid);
            at.touch(ati, now);
        }

        let mut out = BytesMut::with_capacity(sel.record.header.len() + sel.body.len());
        out.put_slice(&sel.record.header);
        out.put_slice(&sel.body);
        bump(&self.counters.transmitted);

        if sel.from_dacs {
            self.dacs_store.relinquish(sel.sid);
        } else if sel.record.cid_field.is_none() {
            // no custody transfer: nothing will acknowledge it, let it go
            self.data_store.relinquish(sel.sid);
        }
        set(&self.counters.active, u64::from(at.active()));
        Ok(out.freeze())
    }

    /// Parse an inbound serialized bundle and dispatch it: forward it,
    /// deliver its payload, or consume the custody signal it carries.
    pub async fn process(
        &self,
        bundle: &[u8],
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        bump(&self.counters.received);
        let cfg = self.config();
        let now = self.clock.now_secs();

        // local copy: unknown-block flags are patched into the forwarded image
        let mut buffer = bundle.to_vec();

        let mut excludes: Vec<usize> = vec![0];
        let (pri, pri_len) = PrimaryBlock::read(&buffer, flags)?;
        let mut index = pri_len;
        excludes.push(index);

        if pri.dictlen.value != 0 {
            *flags |= StatusFlags::NON_COMPLIANT;
            return Err(BpError::Unsupported("dictionary-based eids"));
        }
        if pri.is_expired(now) {
            bump(&self.counters.expired);
            return Err(BpError::Expired);
        }

        let mut cteb: Option<CustodyBlock> = None;
        let mut bib: Option<IntegrityBlock> = None;

        while index < buffer.len() {
            let blk_type = buffer[index];
            if blk_type == u8::from(BlockType::Custody) {
                if pri.request_custody {
                    excludes.push(index);
                }
                let (blk, len) = CustodyBlock::read(&buffer[index..], flags)?;
                index += len;
                if pri.request_custody {
                    excludes.push(index);
                }
                cteb = Some(blk);
            } else if blk_type == u8::from(BlockType::Integrity) {
                excludes.push(index);
                let (blk, len) = IntegrityBlock::read(&buffer[index..], flags)?;
                index += len;
                excludes.push(index);
                bib = Some(blk);
            } else if blk_type != u8::from(BlockType::Payload) {
                index = self.skip_unknown_block(&mut buffer, index, &mut excludes, flags)?;
            } else {
                return self
                    .dispatch_payload(&cfg, now, &buffer, index, &excludes, &pri, cteb, bib, timeout, flags)
                    .await;
            }
        }
        Err(BpError::BundleParse("no payload block"))
    }

    /// Handle a block this agent does not implement, honoring its
    /// block processing flags.
    fn skip_unknown_block(
        &self,
        buffer: &mut [u8],
        start: usize,
        excludes: &mut Vec<usize>,
        flags: &mut StatusFlags,
    ) -> BpResult<usize> {
        let blk_type = buffer[start];
        let mut local = StatusFlags::default();
        let (bf_value, bf_next) = sdnv::read(buffer, start + 1, &mut local);
        let (blk_len, data_start) = sdnv::read(buffer, bf_next, &mut local);
        *flags |= local;
        if local.intersects(StatusFlags::SDNV_OVERFLOW | StatusFlags::SDNV_INCOMPLETE) {
            return Err(BpError::BundleParse("unrecognized block header"));
        }
        let end = data_start + blk_len as usize;
        if end > buffer.len() {
            return Err(BpError::BundleParse("unrecognized block length"));
        }

        *flags |= StatusFlags::INCOMPLETE;
        debug!(blk_type, size = blk_len, "skipping unrecognized block");

        if bf_value & BLK_NOTIFY_NO_PROC != 0 {
            *flags |= StatusFlags::NON_COMPLIANT;
        }
        if bf_value & BLK_DELETE_NO_PROC != 0 {
            return Err(BpError::Dropped("unrecognized block demands deletion"));
        }
        if bf_value & BLK_DROP_NO_PROC != 0 {
            excludes.push(start);
            excludes.push(end);
        }
        // mark the forwarded image as forwarded-without-processing
        let patched = Field::new(
            bf_value | BLK_FORWARD_NO_PROC,
            start + 1,
            bf_next - (start + 1),
        );
        sdnv::write_fixed(buffer, patched, flags);
        Ok(end)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_payload(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        buffer: &[u8],
        pay_index: usize,
        excludes: &[usize],
        pri: &PrimaryBlock,
        cteb: Option<CustodyBlock>,
        bib: Option<IntegrityBlock>,
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        let mut excludes = excludes.to_vec();
        excludes.push(pay_index);
        let (pay, pay_header_len) = PayloadBlock::read(&buffer[pay_index..], flags)?;
        let body_start = pay_index + pay_header_len;
        let pay_size = pay.payload_len();
        excludes.push(body_start + pay_size);
        let payload = &buffer[body_start..body_start + pay_size];

        if let Some(bib) = &bib {
            bib.verify(payload)?;
        }
        if pri.is_admin_rec && pay_size < 2 {
            return Err(BpError::BundleParse("administrative record too short"));
        }

        let cteb_present = cteb.is_some();

        if pri.dest().node != cfg.local.node {
            self.forward(cfg, now, buffer, &excludes, pri, &cteb, pay_size, payload, timeout, flags)
                .await
        } else if cfg.local.service != 0 && pri.dest().service != cfg.local.service {
            Err(BpError::WrongChannel {
                dest: pri.dest().service,
                local: cfg.local.service,
            })
        } else if pri.is_admin_rec {
            self.consume_record(payload, flags).await
        } else if cfg.proc_admin_only {
            Err(BpError::Ignore)
        } else {
            // deliver to the application
            let mut request_custody = false;
            if pri.request_custody {
                if cteb_present {
                    request_custody = true;
                } else {
                    *flags |= StatusFlags::NON_COMPLIANT;
                    warn!("custody requested without custody block, only aggregate custody supported");
                }
            }
            if request_custody {
                // a custody id already pending acknowledgment marks a
                // re-received bundle; deliver it once only
                let cteb = cteb.as_ref().expect("custody implies a custody block");
                let dacs = self.dacs.lock().await;
                if dacs.is_duplicate(cteb.custodian, cteb.cid.value as u32, true) {
                    *flags |= StatusFlags::DUPLICATES;
                    debug!(cid = cteb.cid.value, "duplicate bundle, payload not re-delivered");
                    return Ok(());
                }
            }
            let header = PayloadRecord {
                request_custody,
                size: pay_size as u32,
            }
            .encode();
            if let Err(e) = self.payload_store.enqueue(&header, payload, timeout).await {
                *flags |= StatusFlags::STORE_FAILURE;
                warn!(error = %e, "failed to store delivered payload");
                return Err(BpError::FailedStore("payload delivery"));
            }
            if request_custody {
                let cteb = cteb.expect("custody implies a custody block");
                let mut dacs = self.dacs.lock().await;
                // accumulator diagnostics ride on the flags word
                let _ = dacs
                    .update(
                        &self.dacs_store,
                        cteb.custodian,
                        cteb.cid.value as u32,
                        true,
                        now,
                        flags,
                    )
                    .await;
            }
            trace!(bytes = pay_size, "delivered payload");
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        cfg: &ChannelConfig,
        now: u64,
        buffer: &[u8],
        excludes: &[usize],
        pri: &PrimaryBlock,
        cteb: &Option<CustodyBlock>,
        pay_size: usize,
        payload: &[u8],
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        if cfg.originate {
            return Err(BpError::WrongOrigination);
        }
        let mut pri = *pri;
        if pay_size > cfg.max_bundle_length {
            if !pri.allow_frag {
                return Err(BpError::BundleTooLarge {
                    size: pay_size,
                    max: cfg.max_bundle_length,
                });
            }
            pri.is_frag = true;
        }

        {
            let mut data = self.data.lock().await;
            data.build_forward(&pri, cteb.is_some(), cfg.local, buffer, excludes, flags)?;
            data.store_payload(payload, now, &self.data_store, timeout, flags)
                .await?;
        }
        debug!(dest = %pri.dest(), bytes = pay_size, "forwarded bundle");

        if pri.request_custody {
            let cteb = cteb.as_ref().expect("custody implies a custody block");
            let mut dacs = self.dacs.lock().await;
            dacs.update(
                &self.dacs_store,
                cteb.custodian,
                cteb.cid.value as u32,
                false,
                now,
                flags,
            )
            .await?;
        }
        Ok(())
    }

    /// Administrative record ingress. Only aggregate custody signals are
    /// implemented; each acknowledged custody id releases its active table
    /// slot and the storage record behind it.
    async fn consume_record(&self, record: &[u8], flags: &mut StatusFlags) -> BpResult<()> {
        match record[0] {
            acs::REC_TYPE_ACS => {
                let mut at = self.active.lock().await;
                let mut count = 0u64;
                acs::read(record, flags, |cid| {
                    if at.in_window(cid) {
                        let ati = at.index_of(cid);
                        if let Some(sid) = at.vacate(ati) {
                            self.data_store.relinquish(sid);
                            count += 1;
                        }
                    }
                })?;
                if count > 0 {
                    add(&self.counters.acknowledged, count);
                    set(&self.counters.active, u64::from(at.active()));
                    self.active_signal.notify_waiters();
                    debug!(count, "custody ids acknowledged");
                }
                Ok(())
            }
            acs::REC_TYPE_CUSTODY_SIGNAL => Err(BpError::Unsupported("custody signal records")),
            acs::REC_TYPE_STATUS => Err(BpError::Unsupported("status report records")),
            other => Err(BpError::UnknownRecord(other)),
        }
    }

    /// Dequeue the next delivered payload for the application.
    pub async fn accept(
        &self,
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<Option<Payload>> {
        match self.payload_store.dequeue(timeout).await? {
            None => Ok(None),
            Some((buf, sid)) => {
                let (header, body_start) = PayloadRecord::decode(&buf)?;
                let data = buf.slice(body_start..body_start + header.size as usize);
                self.payload_store.relinquish(sid);
                bump(&self.counters.delivered);
                if header.request_custody {
                    *flags |= StatusFlags::ACTIVITY;
                }
                Ok(Some(Payload {
                    data,
                    request_custody: header.request_custody,
                }))
            }
        }
    }

    /// Snapshot the statistics counters, including live store counts.
    pub fn latch_stats(&self) -> ChannelStats {
        self.counters.latch(
            self.data_store.count(),
            self.payload_store.count(),
            self.dacs_store.count(),
        )
    }

    /// Change one channel option. Options feeding the primary block rebuild
    /// the serialized outbound template.
    pub async fn set_option(&self, option: ChannelOption, flags: &mut StatusFlags) -> BpResult<()> {
        if let ChannelOption::DacsRate(rate) = option {
            self.config.lock().expect("channel config poisoned").dacs_rate_secs = rate;
            self.dacs.lock().await.set_rate_secs(rate);
            return Ok(());
        }

        let mut data = self.data.lock().await;
        {
            let mut cfg = self.config.lock().expect("channel config poisoned");
            match option {
                ChannelOption::DestNode(node) => {
                    cfg.destination.node = node;
                    data.primary.dstnode.value = node.into();
                }
                ChannelOption::DestService(service) => {
                    cfg.destination.service = service;
                    data.primary.dstserv.value = service.into();
                }
                ChannelOption::ReportToNode(node) => {
                    cfg.report_to.node = node;
                    data.primary.rptnode.value = node.into();
                }
                ChannelOption::ReportToService(service) => {
                    cfg.report_to.service = service;
                    data.primary.rptserv.value = service.into();
                }
                ChannelOption::CustodianNode(node) => {
                    data.primary.cstnode.value = node.into();
                    data.custody.custodian.node = node;
                }
                ChannelOption::CustodianService(service) => {
                    data.primary.cstserv.value = service.into();
                    data.custody.custodian.service = service;
                }
                ChannelOption::SetSequence(seq) => data.primary.createseq.value = seq.into(),
                ChannelOption::Lifetime(secs) => {
                    cfg.lifetime_secs = secs;
                    data.primary.lifetime.value = secs;
                }
                ChannelOption::RequestCustody(enable) => {
                    cfg.request_custody = enable;
                    data.primary.request_custody = enable;
                }
                ChannelOption::IntegrityCheck(enable) => {
                    cfg.integrity_check = enable;
                    data.primary.integrity_check = enable;
                }
                ChannelOption::AllowFragment(enable) => {
                    cfg.allow_fragment = enable;
                    data.primary.allow_frag = enable;
                }
                ChannelOption::PayloadCrc(suite) => {
                    cfg.integrity_suite = suite;
                    data.integrity = IntegrityBlock::new(suite);
                }
                ChannelOption::Timeout(secs) => cfg.timeout_secs = secs,
                ChannelOption::MaxBundleLength(len) => {
                    if len == 0 {
                        return Err(BpError::Param("max bundle length must be positive"));
                    }
                    cfg.max_bundle_length = len;
                    data.max_length = len;
                }
                ChannelOption::Originate(enable) => {
                    cfg.originate = enable;
                    data.originate = enable;
                }
                ChannelOption::ProcAdminOnly(enable) => cfg.proc_admin_only = enable,
                ChannelOption::WrapResponse(response) => cfg.wrap_response = response,
                ChannelOption::CidReuse(enable) => cfg.cid_reuse = enable,
                ChannelOption::DacsRate(_) => unreachable!("handled above"),
            }
        }
        data.rebuild(flags)
    }

    /// Snapshot of the readable option surface.
    pub async fn options(&self) -> ChannelOptions {
        let data = self.data.lock().await;
        let cfg = self.config();
        ChannelOptions {
            destination: data.primary.dest(),
            report_to: Eid::new(
                data.primary.rptnode.value as u32,
                data.primary.rptserv.value as u32,
            ),
            custodian: data.primary.custodian(),
            sequence: data.primary.createseq.value as u32,
            lifetime_secs: data.primary.lifetime.value,
            request_custody: data.primary.request_custody,
            integrity_check: data.primary.integrity_check,
            allow_fragment: data.primary.allow_frag,
            integrity_suite: cfg.integrity_suite,
            timeout_secs: cfg.timeout_secs,
            max_bundle_length: cfg.max_bundle_length,
            originate: cfg.originate,
            proc_admin_only: cfg.proc_admin_only,
            wrap_response: cfg.wrap_response,
            cid_reuse: cfg.cid_reuse,
            dacs_rate_secs: cfg.dacs_rate_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageService;
    use crate::time::ManualClock;

    fn channel(cfg: ChannelConfig) -> (Channel, ManualClock) {
        let clock = ManualClock::at_secs(1000);
        let channel = Channel::open(
            &MemoryStorageService::default(),
            cfg,
            Arc::new(clock.clone()),
        )
        .unwrap();
        (channel, clock)
    }

    fn originator() -> ChannelConfig {
        ChannelConfig::new(Eid::new(1, 10), Eid::new(2, 10))
    }

    #[tokio::test]
    async fn test_store_refused_on_forwarding_channel() {
        let mut cfg = originator();
        cfg.originate = false;
        let (channel, _) = channel(cfg);
        let mut flags = StatusFlags::default();
        assert_eq!(
            channel.store(b"x", Timeout::Poll, &mut flags).await,
            Err(BpError::WrongOrigination)
        );
    }

    #[tokio::test]
    async fn test_load_empty_returns_none() {
        let (channel, _) = channel(originator());
        let mut flags = StatusFlags::default();
        assert_eq!(channel.load(Timeout::Poll, &mut flags).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_load_assigns_custody_ids_in_order() {
        let (channel, _) = channel(originator());
        let mut flags = StatusFlags::default();

        for _ in 0..3 {
            channel.store(b"data", Timeout::Poll, &mut flags).await.unwrap();
        }
        for expected_cid in 0..3u64 {
            let bytes = channel
                .load(Timeout::Poll, &mut flags)
                .await
                .unwrap()
                .unwrap();
            let mut parse_flags = StatusFlags::default();
            let (_, pri_len) = PrimaryBlock::read(&bytes, &mut parse_flags).unwrap();
            let (cteb_blk, _) = CustodyBlock::read(&bytes[pri_len..], &mut parse_flags).unwrap();
            assert_eq!(cteb_blk.cid.value, expected_cid);
            assert_eq!(cteb_blk.custodian, Eid::new(1, 10));
        }

        let stats = channel.latch_stats();
        assert_eq!(stats.generated, 3);
        assert_eq!(stats.transmitted, 3);
        assert_eq!(stats.active, 3);
    }

    #[tokio::test]
    async fn test_process_rejects_garbage() {
        let (channel, _) = channel(originator());
        let mut flags = StatusFlags::default();
        assert!(channel
            .process(&[0xDE, 0xAD, 0xBE, 0xEF], Timeout::Poll, &mut flags)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_set_option_rebuilds_template() {
        let (channel, _) = channel(originator());
        let mut flags = StatusFlags::default();

        channel
            .set_option(ChannelOption::DestNode(77), &mut flags)
            .await
            .unwrap();
        channel
            .set_option(ChannelOption::SetSequence(500), &mut flags)
            .await
            .unwrap();
        let options = channel.options().await;
        assert_eq!(options.destination, Eid::new(77, 10));
        assert_eq!(options.sequence, 500);

        channel.store(b"x", Timeout::Poll, &mut flags).await.unwrap();
        let bytes = channel
            .load(Timeout::Poll, &mut flags)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route_info(&bytes).unwrap(), Eid::new(77, 10));

        let mut parse_flags = StatusFlags::default();
        let (pri, _) = PrimaryBlock::read(&bytes, &mut parse_flags).unwrap();
        assert_eq!(pri.createseq.value, 500);
    }

    #[tokio::test]
    async fn test_store_failure_is_flagged() {
        use crate::storage::MockBundleStore;

        // a data store whose enqueue always fails; payload/signal stores
        // are never touched by `store`
        struct BrokenDataStorage;
        impl StorageService for BrokenDataStorage {
            fn create(&self) -> BpResult<Arc<dyn BundleStore>> {
                let mut mock = MockBundleStore::new();
                mock.expect_enqueue()
                    .returning(|_, _, _| Err(BpError::FailedStore("disk full")));
                Ok(Arc::new(mock))
            }
        }

        let channel = Channel::open(
            &BrokenDataStorage,
            originator(),
            Arc::new(crate::time::ManualClock::at_secs(1000)),
        )
        .unwrap();

        let mut flags = StatusFlags::default();
        assert_eq!(
            channel.store(b"x", Timeout::Poll, &mut flags).await,
            Err(BpError::FailedStore("disk full"))
        );
        assert!(flags.contains(StatusFlags::STORE_FAILURE));
    }

    #[tokio::test]
    async fn test_expired_bundle_not_loaded() {
        let mut cfg = originator();
        cfg.lifetime_secs = 10;
        let (channel, clock) = channel(cfg);
        let mut flags = StatusFlags::default();

        channel.store(b"x", Timeout::Poll, &mut flags).await.unwrap();
        clock.advance_secs(11);
        assert_eq!(channel.load(Timeout::Poll, &mut flags).await.unwrap(), None);
        assert_eq!(channel.latch_stats().expired, 1);
    }
}
