//! Outbound bundle template and the storage record layout.
//!
//! The serialized header of an outbound bundle is built once from the
//! channel attributes and then patched field by field per transmission:
//! creation time, sequence, fragment offset, and custody id all have
//! reserved-width SDNV slots. A stored record is the header plus enough
//! metadata to patch and expire it after the fact; the payload fragment
//! rides behind it in the same storage record.

use crate::codec::v6::{
    CustodyBlock, IntegrityBlock, PayloadBlock, PrimaryBlock, BUNDLE_HDR_BUF_SIZE,
};
use crate::eid::Eid;
use crate::error::{BpError, BpResult, StatusFlags};
use crate::sdnv::{self, Field};
use crate::storage::{BundleStore, Timeout};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

use super::config::ChannelConfig;

/// Storage-plane view of one serialized bundle: the header bytes and the
/// metadata needed to patch, expire and account for it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BundleRecord {
    /// Absolute expiration in seconds, 0 for an infinite lifetime.
    pub expiry_secs: u64,
    /// Location of the custody id SDNV inside `header`, if the bundle
    /// carries a custody block.
    pub cid_field: Option<Field>,
    /// Offset of the integrity block inside `header`, if present.
    pub bib_offset: Option<usize>,
    /// Offset of the payload block header inside `header`.
    pub pay_offset: usize,
    pub header: Vec<u8>,
}

impl BundleRecord {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.expiry_secs != 0 && now_secs >= self.expiry_secs
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(24 + self.header.len());
        buf.put_u64(self.expiry_secs);
        match self.cid_field {
            Some(field) => {
                buf.put_u8(1);
                buf.put_u32(field.value as u32);
                buf.put_u16(field.offset as u16);
                buf.put_u8(field.width as u8);
            }
            None => buf.put_u8(0),
        }
        match self.bib_offset {
            Some(offset) => {
                buf.put_u8(1);
                buf.put_u16(offset as u16);
            }
            None => buf.put_u8(0),
        }
        buf.put_u16(self.pay_offset as u16);
        buf.put_u16(self.header.len() as u16);
        buf.put_slice(&self.header);
        buf.to_vec()
    }

    /// Decode a record from the front of a stored buffer. Returns the
    /// record and the offset where the payload body starts.
    pub fn decode(buf: &[u8]) -> BpResult<(BundleRecord, usize)> {
        let mut cursor = buf;
        let err = BpError::FailedStore("corrupt bundle record");
        if cursor.remaining() < 9 {
            return Err(err);
        }
        let expiry_secs = cursor.get_u64();
        let cid_field = match cursor.get_u8() {
            0 => None,
            _ => {
                if cursor.remaining() < 7 {
                    return Err(err);
                }
                let value = u64::from(cursor.get_u32());
                let offset = usize::from(cursor.get_u16());
                let width = usize::from(cursor.get_u8());
                Some(Field::new(value, offset, width))
            }
        };
        if !cursor.has_remaining() {
            return Err(err);
        }
        let bib_offset = match cursor.get_u8() {
            0 => None,
            _ => {
                if cursor.remaining() < 2 {
                    return Err(err);
                }
                Some(usize::from(cursor.get_u16()))
            }
        };
        if cursor.remaining() < 4 {
            return Err(err);
        }
        let pay_offset = usize::from(cursor.get_u16());
        let header_len = usize::from(cursor.get_u16());
        if cursor.remaining() < header_len {
            return Err(err);
        }
        let header = cursor.chunk()[..header_len].to_vec();

        let consumed = buf.len() - cursor.remaining() + header_len;
        Ok((
            BundleRecord {
                expiry_secs,
                cid_field,
                bib_offset,
                pay_offset,
                header,
            },
            consumed,
        ))
    }
}

/// Header stored ahead of a delivered payload in the payload store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PayloadRecord {
    pub request_custody: bool,
    pub size: u32,
}

impl PayloadRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.request_custody.into());
        buf.put_u32(self.size);
        buf.to_vec()
    }

    pub fn decode(buf: &[u8]) -> BpResult<(PayloadRecord, usize)> {
        if buf.len() < 5 {
            return Err(BpError::FailedStore("corrupt payload record"));
        }
        let mut cursor = buf;
        let request_custody = cursor.get_u8() != 0;
        let size = cursor.get_u32();
        Ok((
            PayloadRecord {
                request_custody,
                size,
            },
            5,
        ))
    }
}

/// The channel's outbound data bundle: logical blocks plus the serialized
/// header they are patched into.
#[derive(Debug)]
pub(crate) struct DataBundle {
    pub primary: PrimaryBlock,
    pub custody: CustodyBlock,
    pub integrity: IntegrityBlock,
    pub payload: PayloadBlock,
    pub max_length: usize,
    pub originate: bool,
    pub record: BundleRecord,
}

impl DataBundle {
    pub fn new(cfg: &ChannelConfig) -> BpResult<DataBundle> {
        let mut primary = PrimaryBlock::template();
        primary.set_dest(cfg.destination);
        primary.set_source(cfg.local);
        primary.set_report_to(cfg.report_to);
        primary.set_custodian(cfg.local);
        primary.lifetime.value = cfg.lifetime_secs;
        primary.request_custody = cfg.request_custody;
        primary.integrity_check = cfg.integrity_check;
        primary.allow_frag = cfg.allow_fragment;

        let mut bundle = DataBundle {
            primary,
            custody: CustodyBlock::new(cfg.local),
            integrity: IntegrityBlock::new(cfg.integrity_suite),
            payload: PayloadBlock::new(),
            max_length: cfg.max_bundle_length,
            originate: cfg.originate,
            record: BundleRecord {
                expiry_secs: 0,
                cid_field: None,
                bib_offset: None,
                pay_offset: 0,
                header: Vec::new(),
            },
        };
        let mut flags = StatusFlags::default();
        bundle.rebuild(&mut flags)?;
        Ok(bundle)
    }

    /// Re-serialize the header from the logical blocks. Called at open and
    /// whenever a primary block option changes.
    pub fn rebuild(&mut self, flags: &mut StatusFlags) -> BpResult<()> {
        let mut header = vec![0u8; BUNDLE_HDR_BUF_SIZE];
        let mut offset = self.primary.write(&mut header, flags)?;

        self.record.cid_field = if self.primary.request_custody {
            let len = self.custody.write(&mut header[offset..], flags)?;
            let cid = Field::new(
                self.custody.cid.value,
                offset + self.custody.cid.offset,
                self.custody.cid.width,
            );
            offset += len;
            Some(cid)
        } else {
            None
        };

        self.record.bib_offset = if self.primary.integrity_check {
            let bib_offset = offset;
            offset += self.integrity.write(&mut header[offset..], flags)?;
            Some(bib_offset)
        } else {
            None
        };

        self.record.pay_offset = offset;
        offset += self.payload.write(&mut header[offset..], 0, flags)?;
        header.truncate(offset);
        self.record.header = header;
        self.record.expiry_secs = 0;
        Ok(())
    }

    /// Rebuild the template from a received bundle about to be forwarded:
    /// this node becomes report-to and custodian, known blocks are
    /// re-serialized, and the regions of `buffer` between the excluded
    /// spans are carried verbatim.
    pub fn build_forward(
        &mut self,
        parsed: &PrimaryBlock,
        cteb_present: bool,
        local: Eid,
        buffer: &[u8],
        excludes: &[usize],
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        let mut primary = PrimaryBlock::template_from(parsed);
        if primary.request_custody {
            if !cteb_present {
                *flags |= StatusFlags::NON_COMPLIANT;
                return Err(BpError::Unsupported("only aggregate custody supported"));
            }
            primary.set_report_to(local);
            primary.set_custodian(local);
        }
        self.primary = primary;

        let mut header = vec![0u8; BUNDLE_HDR_BUF_SIZE];
        let mut offset = self.primary.write(&mut header, flags)?;

        self.record.cid_field = if self.primary.request_custody {
            self.custody.custodian = local;
            let len = self.custody.write(&mut header[offset..], flags)?;
            let cid = Field::new(
                self.custody.cid.value,
                offset + self.custody.cid.offset,
                self.custody.cid.width,
            );
            offset += len;
            Some(cid)
        } else {
            None
        };

        self.record.bib_offset = if self.primary.integrity_check {
            let bib_offset = offset;
            offset += self.integrity.write(&mut header[offset..], flags)?;
            Some(bib_offset)
        } else {
            None
        };

        // carry unrecognized blocks: the regions between excluded spans
        let mut i = 1;
        while i + 1 < excludes.len() {
            let (start, stop) = (excludes[i], excludes[i + 1]);
            let len = stop - start;
            if offset + len >= BUNDLE_HDR_BUF_SIZE {
                return Err(BpError::BundleTooLarge {
                    size: offset + len,
                    max: BUNDLE_HDR_BUF_SIZE,
                });
            }
            header[offset..offset + len].copy_from_slice(&buffer[start..stop]);
            offset += len;
            i += 2;
        }

        self.record.pay_offset = offset;
        offset += self.payload.write(&mut header[offset..], 0, flags)?;
        header.truncate(offset);
        self.record.header = header;
        self.record.expiry_secs = 0;
        Ok(())
    }

    /// Serialize `payload` into one or more stored bundles, fragmenting at
    /// `max_length`. On success the creation sequence advances (originating
    /// channels only).
    pub async fn store_payload(
        &mut self,
        payload: &[u8],
        now_secs: u64,
        store: &Arc<dyn BundleStore>,
        timeout: Timeout,
        flags: &mut StatusFlags,
    ) -> BpResult<()> {
        if !self.primary.is_frag && payload.len() > self.max_length {
            return Err(BpError::BundleTooLarge {
                size: payload.len(),
                max: self.max_length,
            });
        }

        if self.originate {
            self.primary.createsec.value = now_secs;
            sdnv::write_fixed(&mut self.record.header, self.primary.createsec, flags);
            sdnv::write_fixed(&mut self.record.header, self.primary.createseq, flags);
        }

        self.record.expiry_secs = self.primary.expiry_secs().unwrap_or(0);

        let frag_base = self.primary.fragoffset.value;
        let mut offset = 0;
        loop {
            let fragment_len = (payload.len() - offset).min(self.max_length);
            let fragment = &payload[offset..offset + fragment_len];

            if self.primary.is_frag {
                self.primary.fragoffset.value = frag_base + offset as u64;
                self.primary.paylen.value = payload.len() as u64;
                sdnv::write_fixed(&mut self.record.header, self.primary.fragoffset, flags);
                sdnv::write_fixed(&mut self.record.header, self.primary.paylen, flags);
            }

            if let Some(bib_offset) = self.record.bib_offset {
                self.integrity
                    .update(&mut self.record.header[bib_offset..], fragment);
            }

            let pay_offset = self.record.pay_offset;
            self.payload
                .write(&mut self.record.header[pay_offset..], fragment_len, flags)?;

            if let Err(e) = store.enqueue(&self.record.encode(), fragment, timeout).await {
                if e != BpError::Timeout {
                    *flags |= StatusFlags::STORE_FAILURE;
                }
                return Err(e);
            }

            offset += fragment_len;
            if offset >= payload.len() {
                break;
            }
        }

        if self.originate {
            self.primary.createseq.value += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::v6;
    use crate::storage::{MemoryStorageService, StorageService};

    fn config() -> ChannelConfig {
        let mut cfg = ChannelConfig::new(Eid::new(1, 10), Eid::new(2, 10));
        cfg.lifetime_secs = 60;
        cfg
    }

    #[test]
    fn test_record_round_trip() {
        let record = BundleRecord {
            expiry_secs: 777,
            cid_field: Some(Field::new(5, 55, 4)),
            bib_offset: Some(62),
            pay_offset: 80,
            header: vec![1, 2, 3, 4, 5],
        };
        let mut encoded = record.encode();
        encoded.extend_from_slice(b"payload body");

        let (decoded, body_start) = BundleRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(&encoded[body_start..], b"payload body");
    }

    #[test]
    fn test_payload_record_round_trip() {
        let record = PayloadRecord {
            request_custody: true,
            size: 12,
        };
        let mut encoded = record.encode();
        encoded.extend_from_slice(b"hello");
        let (decoded, consumed) = PayloadRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_template_header_parses_back() {
        let bundle = DataBundle::new(&config()).unwrap();
        let mut flags = StatusFlags::default();
        let (pri, _) = v6::PrimaryBlock::read(&bundle.record.header, &mut flags).unwrap();
        assert_eq!(pri.dest(), Eid::new(2, 10));
        assert_eq!(pri.source(), Eid::new(1, 10));
        assert_eq!(pri.custodian(), Eid::new(1, 10));
        assert!(pri.request_custody);
        assert!(bundle.record.cid_field.is_some());
        assert!(bundle.record.bib_offset.is_some());
    }

    #[tokio::test]
    async fn test_store_payload_sets_times_and_sequence() {
        let store = MemoryStorageService::default().create().unwrap();
        let mut bundle = DataBundle::new(&config()).unwrap();
        let mut flags = StatusFlags::default();

        bundle
            .store_payload(b"abc", 500, &store, Timeout::Poll, &mut flags)
            .await
            .unwrap();
        assert!(flags.is_empty());
        assert_eq!(bundle.primary.createseq.value, 1);

        let (buf, _) = store.dequeue(Timeout::Poll).await.unwrap().unwrap();
        let (record, body_start) = BundleRecord::decode(&buf).unwrap();
        assert_eq!(&buf[body_start..], b"abc");
        assert_eq!(record.expiry_secs, 560);

        let (pri, _) = v6::PrimaryBlock::read(&record.header, &mut flags).unwrap();
        assert_eq!(pri.createsec.value, 500);
        assert_eq!(pri.createseq.value, 0);
    }

    #[tokio::test]
    async fn test_store_payload_fragments() {
        let store = MemoryStorageService::default().create().unwrap();
        let mut cfg = config();
        cfg.allow_fragment = true;
        cfg.max_bundle_length = 4;
        let mut bundle = DataBundle::new(&cfg).unwrap();
        bundle.primary.is_frag = true;
        let mut flags = StatusFlags::default();

        bundle
            .store_payload(b"0123456789", 500, &store, Timeout::Poll, &mut flags)
            .await
            .unwrap();

        let mut offsets = Vec::new();
        while let Some((buf, _)) = store.dequeue(Timeout::Poll).await.unwrap() {
            let (record, body_start) = BundleRecord::decode(&buf).unwrap();
            let (pri, _) = v6::PrimaryBlock::read(&record.header, &mut flags).unwrap();
            offsets.push((pri.fragoffset.value, (buf.len() - body_start) as u64));
            assert_eq!(pri.paylen.value, 10);
        }
        assert_eq!(offsets, vec![(0, 4), (4, 4), (8, 2)]);
    }

    #[tokio::test]
    async fn test_oversized_payload_without_fragmentation() {
        let store = MemoryStorageService::default().create().unwrap();
        let mut cfg = config();
        cfg.max_bundle_length = 4;
        let mut bundle = DataBundle::new(&cfg).unwrap();
        let mut flags = StatusFlags::default();

        let result = bundle
            .store_payload(b"0123456789", 500, &store, Timeout::Poll, &mut flags)
            .await;
        assert_eq!(result, Err(BpError::BundleTooLarge { size: 10, max: 4 }));
        // sequence must not advance on failure
        assert_eq!(bundle.primary.createseq.value, 0);
    }
}
