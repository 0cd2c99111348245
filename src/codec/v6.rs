//! SDNV-encoded bundle blocks.
//!
//! Serialized headers keep every numeric field at a known offset with a
//! reserved width (see [`crate::sdnv`]), so the engine can patch custody
//! ids, creation times and fragment offsets into an already-serialized
//! header without re-encoding it. Readers are offset-tolerant: they decode
//! fields sequentially and record where each one actually sits.

use crate::eid::Eid;
use crate::error::{BpError, BpResult, StatusFlags};
use crate::sdnv::{self, Field};
use crc::{Crc, CRC_16_IBM_SDLC, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Scratch size for a serialized header (all blocks up to the payload).
pub const BUNDLE_HDR_BUF_SIZE: usize = 128;

pub const VERSION: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BlockType {
    Payload = 0x01,
    Custody = 0x0A,
    Integrity = 0x0B,
}

// primary block processing control flags
pub const PCF_IS_FRAGMENT: u64 = 0x01;
pub const PCF_ADMIN_RECORD: u64 = 0x02;
pub const PCF_MUST_NOT_FRAGMENT: u64 = 0x04;
pub const PCF_REQUEST_CUSTODY: u64 = 0x08;

// canonical block processing flags
pub const BLK_NOTIFY_NO_PROC: u64 = 0x02;
pub const BLK_DELETE_NO_PROC: u64 = 0x04;
pub const BLK_DROP_NO_PROC: u64 = 0x10;
pub const BLK_FORWARD_NO_PROC: u64 = 0x20;

/// Primary block: addressing, lifetime and control flags.
///
/// Field offsets/widths are part of the value so that a header serialized
/// from a template can be patched in place later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryBlock {
    pub version: u8,
    pub pcf: Field,
    pub blklen: Field,
    pub dstnode: Field,
    pub dstserv: Field,
    pub srcnode: Field,
    pub srcserv: Field,
    pub rptnode: Field,
    pub rptserv: Field,
    pub cstnode: Field,
    pub cstserv: Field,
    pub createsec: Field,
    pub createseq: Field,
    pub lifetime: Field,
    pub dictlen: Field,
    pub fragoffset: Field,
    pub paylen: Field,

    pub is_admin_rec: bool,
    pub request_custody: bool,
    pub allow_frag: bool,
    pub is_frag: bool,
    pub integrity_check: bool,
}

impl PrimaryBlock {
    /// Serialized length of a template-layout primary block.
    pub const TEMPLATE_LEN: usize = 52;

    /// A primary block with the reserved template layout and zeroed values.
    pub fn template() -> PrimaryBlock {
        PrimaryBlock {
            version: VERSION,
            // reserved field offsets and widths of the template layout
            pcf: Field::new(0, 1, 3),
            blklen: Field::new(0, 4, 1),
            dstnode: Field::new(0, 5, 4),
            dstserv: Field::new(0, 9, 2),
            srcnode: Field::new(0, 11, 4),
            srcserv: Field::new(0, 15, 2),
            rptnode: Field::new(0, 17, 4),
            rptserv: Field::new(0, 21, 2),
            cstnode: Field::new(0, 23, 4),
            cstserv: Field::new(0, 27, 2),
            createsec: Field::new(0, 29, 6),
            createseq: Field::new(0, 35, 4),
            lifetime: Field::new(0, 39, 4),
            dictlen: Field::new(0, 43, 1),
            fragoffset: Field::new(0, 44, 4),
            paylen: Field::new(0, 48, 4),
            is_admin_rec: false,
            request_custody: false,
            allow_frag: false,
            is_frag: false,
            integrity_check: false,
        }
    }

    /// Rebuild `parsed` onto the reserved template layout, keeping its
    /// values and flags. Used when a received bundle is re-serialized for
    /// forwarding.
    pub fn template_from(parsed: &PrimaryBlock) -> PrimaryBlock {
        let mut out = PrimaryBlock::template();
        out.dstnode.value = parsed.dstnode.value;
        out.dstserv.value = parsed.dstserv.value;
        out.srcnode.value = parsed.srcnode.value;
        out.srcserv.value = parsed.srcserv.value;
        out.rptnode.value = parsed.rptnode.value;
        out.rptserv.value = parsed.rptserv.value;
        out.cstnode.value = parsed.cstnode.value;
        out.cstserv.value = parsed.cstserv.value;
        out.createsec.value = parsed.createsec.value;
        out.createseq.value = parsed.createseq.value;
        out.lifetime.value = parsed.lifetime.value;
        out.fragoffset.value = parsed.fragoffset.value;
        out.paylen.value = parsed.paylen.value;
        out.is_admin_rec = parsed.is_admin_rec;
        out.request_custody = parsed.request_custody;
        out.allow_frag = parsed.allow_frag;
        out.is_frag = parsed.is_frag;
        out.integrity_check = parsed.integrity_check;
        out
    }

    pub fn dest(&self) -> Eid {
        Eid::new(self.dstnode.value as u32, self.dstserv.value as u32)
    }

    pub fn source(&self) -> Eid {
        Eid::new(self.srcnode.value as u32, self.srcserv.value as u32)
    }

    pub fn custodian(&self) -> Eid {
        Eid::new(self.cstnode.value as u32, self.cstserv.value as u32)
    }

    pub fn set_dest(&mut self, eid: Eid) {
        self.dstnode.value = eid.node.into();
        self.dstserv.value = eid.service.into();
    }

    pub fn set_source(&mut self, eid: Eid) {
        self.srcnode.value = eid.node.into();
        self.srcserv.value = eid.service.into();
    }

    pub fn set_report_to(&mut self, eid: Eid) {
        self.rptnode.value = eid.node.into();
        self.rptserv.value = eid.service.into();
    }

    pub fn set_custodian(&mut self, eid: Eid) {
        self.cstnode.value = eid.node.into();
        self.cstserv.value = eid.service.into();
    }

    /// Absolute expiration time in seconds, `None` for an infinite lifetime.
    pub fn expiry_secs(&self) -> Option<u64> {
        (self.lifetime.value != 0).then(|| self.createsec.value + self.lifetime.value)
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        matches!(self.expiry_secs(), Some(expiry) if now_secs >= expiry)
    }

    fn pcf_value(&self) -> u64 {
        let mut pcf = 0;
        if self.is_frag {
            pcf |= PCF_IS_FRAGMENT;
        }
        if self.is_admin_rec {
            pcf |= PCF_ADMIN_RECORD;
        }
        if !self.allow_frag {
            pcf |= PCF_MUST_NOT_FRAGMENT;
        }
        if self.request_custody {
            pcf |= PCF_REQUEST_CUSTODY;
        }
        pcf
    }

    /// Serialize at this block's field offsets. Returns the total length.
    pub fn write(&mut self, buf: &mut [u8], flags: &mut StatusFlags) -> BpResult<usize> {
        let total = self.paylen.offset + self.paylen.width;
        if buf.len() < total {
            return Err(BpError::BundleParse("primary block exceeds header scratch"));
        }
        self.pcf.value = self.pcf_value();
        self.blklen.value = (total - (self.blklen.offset + self.blklen.width)) as u64;

        let mut local = StatusFlags::default();
        buf[0] = self.version;
        for field in [
            self.pcf,
            self.blklen,
            self.dstnode,
            self.dstserv,
            self.srcnode,
            self.srcserv,
            self.rptnode,
            self.rptserv,
            self.cstnode,
            self.cstserv,
            self.createsec,
            self.createseq,
            self.lifetime,
            self.dictlen,
            self.fragoffset,
            self.paylen,
        ] {
            sdnv::write_fixed(buf, field, &mut local);
        }
        *flags |= local;
        if !local.is_empty() {
            return Err(BpError::BundleParse("primary block field overflow"));
        }
        Ok(total)
    }

    /// Parse a primary block from the front of `buf`, recording the actual
    /// offset and width of every field. Returns the block and the number of
    /// bytes consumed.
    pub fn read(buf: &[u8], flags: &mut StatusFlags) -> BpResult<(PrimaryBlock, usize)> {
        if buf.is_empty() {
            return Err(BpError::BundleParse("empty buffer"));
        }
        if buf[0] != VERSION {
            return Err(BpError::Unsupported("bundle protocol version"));
        }

        let mut block = PrimaryBlock::template();
        block.version = buf[0];

        let mut local = StatusFlags::default();
        let mut offset = 1;
        for field in [
            &mut block.pcf,
            &mut block.blklen,
            &mut block.dstnode,
            &mut block.dstserv,
            &mut block.srcnode,
            &mut block.srcserv,
            &mut block.rptnode,
            &mut block.rptserv,
            &mut block.cstnode,
            &mut block.cstserv,
            &mut block.createsec,
            &mut block.createseq,
            &mut block.lifetime,
            &mut block.dictlen,
            &mut block.fragoffset,
            &mut block.paylen,
        ] {
            let (value, next) = sdnv::read(buf, offset, &mut local);
            field.value = value;
            field.offset = offset;
            field.width = next - offset;
            offset = next;
        }
        *flags |= local;
        if local.intersects(StatusFlags::SDNV_INCOMPLETE | StatusFlags::SDNV_OVERFLOW) {
            return Err(BpError::BundleParse("primary block truncated"));
        }

        block.is_frag = block.pcf.value & PCF_IS_FRAGMENT != 0;
        block.is_admin_rec = block.pcf.value & PCF_ADMIN_RECORD != 0;
        block.allow_frag = block.pcf.value & PCF_MUST_NOT_FRAGMENT == 0;
        block.request_custody = block.pcf.value & PCF_REQUEST_CUSTODY != 0;
        Ok((block, offset))
    }
}

/// Custody transfer extension block: the custody id under which the current
/// custodian tracks the bundle, plus that custodian's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyBlock {
    pub block_flags: Field,
    pub blklen: Field,
    pub cid: Field,
    pub custodian: Eid,
}

impl CustodyBlock {
    pub fn new(custodian: Eid) -> CustodyBlock {
        CustodyBlock {
            block_flags: Field::new(0, 1, 1),
            blklen: Field::new(0, 2, 1),
            cid: Field::new(0, 3, 4),
            custodian,
        }
    }

    /// Serialize at the front of `buf`. Returns the total length.
    pub fn write(&mut self, buf: &mut [u8], flags: &mut StatusFlags) -> BpResult<usize> {
        let eid_text = self.custodian.to_string();
        let body_start = self.cid.offset + self.cid.width;
        let total = body_start + eid_text.len();
        if buf.len() < total {
            return Err(BpError::BundleParse("custody block exceeds header scratch"));
        }
        self.blklen.value = (total - (self.blklen.offset + self.blklen.width)) as u64;

        let mut local = StatusFlags::default();
        buf[0] = BlockType::Custody.into();
        sdnv::write_fixed(buf, self.block_flags, &mut local);
        sdnv::write_fixed(buf, self.blklen, &mut local);
        sdnv::write_fixed(buf, self.cid, &mut local);
        buf[body_start..total].copy_from_slice(eid_text.as_bytes());
        *flags |= local;
        if !local.is_empty() {
            return Err(BpError::BundleParse("custody block field overflow"));
        }
        Ok(total)
    }

    /// Parse from the front of `buf` (which starts at the block type byte).
    pub fn read(buf: &[u8], flags: &mut StatusFlags) -> BpResult<(CustodyBlock, usize)> {
        if buf.first() != Some(&BlockType::Custody.into()) {
            return Err(BpError::BundleParse("not a custody block"));
        }
        let (bf_value, bf_next) = sdnv::try_read(buf, 1, flags)?;
        let (blklen_value, cid_start) = sdnv::try_read(buf, bf_next, flags)?;
        let (cid_value, eid_start) = sdnv::try_read(buf, cid_start, flags)?;

        let body_len = blklen_value as usize;
        let cid_width = eid_start - cid_start;
        let eid_len = body_len
            .checked_sub(cid_width)
            .ok_or(BpError::BundleParse("custody block length underrun"))?;
        let total = eid_start + eid_len;
        if buf.len() < total {
            return Err(BpError::BundleParse("custody block truncated"));
        }
        let eid_text = std::str::from_utf8(&buf[eid_start..total])
            .map_err(|_| BpError::BundleParse("custodian eid is not utf-8"))?;
        let custodian: Eid = eid_text
            .parse()
            .map_err(|_| BpError::BundleParse("custodian eid malformed"))?;

        Ok((
            CustodyBlock {
                block_flags: Field::new(bf_value, 1, bf_next - 1),
                blklen: Field::new(blklen_value, bf_next, cid_start - bf_next),
                cid: Field::new(cid_value, cid_start, cid_width),
                custodian,
            },
            total,
        ))
    }
}

/// Integrity cipher suites: a CRC over the payload fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum IntegritySuite {
    Crc16X25 = 1,
    Crc32Castagnoli = 2,
}

impl IntegritySuite {
    pub fn result_width(&self) -> usize {
        match self {
            IntegritySuite::Crc16X25 => 2,
            IntegritySuite::Crc32Castagnoli => 4,
        }
    }

    pub fn compute(&self, payload: &[u8]) -> u32 {
        match self {
            IntegritySuite::Crc16X25 => {
                u32::from(Crc::<u16>::new(&CRC_16_IBM_SDLC).checksum(payload))
            }
            IntegritySuite::Crc32Castagnoli => Crc::<u32>::new(&CRC_32_ISCSI).checksum(payload),
        }
    }
}

/// Bundle integrity block covering the payload fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityBlock {
    pub suite: IntegritySuite,
    pub result: u32,
    /// Offset of the raw result bytes, relative to the block type byte.
    pub result_offset: usize,
}

impl IntegrityBlock {
    pub fn new(suite: IntegritySuite) -> IntegrityBlock {
        IntegrityBlock {
            suite,
            result: 0,
            result_offset: 0,
        }
    }

    pub fn serialized_len(&self) -> usize {
        11 + self.suite.result_width()
    }

    /// Serialize at the front of `buf`. Returns the total length.
    pub fn write(&mut self, buf: &mut [u8], flags: &mut StatusFlags) -> BpResult<usize> {
        let result_width = self.suite.result_width();
        let total = self.serialized_len();
        if buf.len() < total {
            return Err(BpError::BundleParse("integrity block exceeds header scratch"));
        }

        let mut local = StatusFlags::default();
        buf[0] = BlockType::Integrity.into();
        sdnv::write_fixed(buf, Field::new(0, 1, 1), &mut local); // block flags
        sdnv::write_fixed(buf, Field::new((8 + result_width) as u64, 2, 1), &mut local);
        sdnv::write_fixed(buf, Field::new(1, 3, 1), &mut local); // target count
        sdnv::write_fixed(buf, Field::new(1, 4, 1), &mut local); // target type: payload
        sdnv::write_fixed(buf, Field::new(0, 5, 1), &mut local); // target sequence
        sdnv::write_fixed(buf, Field::new(u8::from(self.suite).into(), 6, 1), &mut local);
        sdnv::write_fixed(buf, Field::new(0, 7, 1), &mut local); // cipher suite flags
        sdnv::write_fixed(buf, Field::new(1, 8, 1), &mut local); // result count
        buf[9] = 0; // result type
        sdnv::write_fixed(buf, Field::new(result_width as u64, 10, 1), &mut local);

        self.result_offset = 11;
        write_result(buf, self.result_offset, self.suite, self.result);
        *flags |= local;
        if !local.is_empty() {
            return Err(BpError::BundleParse("integrity block field overflow"));
        }
        Ok(total)
    }

    /// Parse from the front of `buf` (which starts at the block type byte).
    pub fn read(buf: &[u8], flags: &mut StatusFlags) -> BpResult<(IntegrityBlock, usize)> {
        if buf.first() != Some(&BlockType::Integrity.into()) {
            return Err(BpError::BundleParse("not an integrity block"));
        }
        let (_, next) = sdnv::try_read(buf, 1, flags)?; // block flags
        let (_, next) = sdnv::try_read(buf, next, flags)?; // block length
        let (_, next) = sdnv::try_read(buf, next, flags)?; // target count
        let (target_type, next) = sdnv::try_read(buf, next, flags)?;
        let (_, next) = sdnv::try_read(buf, next, flags)?; // target sequence
        let (suite_id, next) = sdnv::try_read(buf, next, flags)?;
        let (_, next) = sdnv::try_read(buf, next, flags)?; // cipher suite flags
        let (_, next) = sdnv::try_read(buf, next, flags)?; // result count
        if target_type != 1 {
            return Err(BpError::Unsupported("integrity target other than payload"));
        }
        let suite = IntegritySuite::try_from(suite_id as u8)
            .map_err(|_| BpError::Unsupported("integrity cipher suite"))?;

        if next >= buf.len() {
            return Err(BpError::BundleParse("integrity block truncated"));
        }
        let next = next + 1; // result type byte
        let (result_len, result_offset) = sdnv::try_read(buf, next, flags)?;
        if result_len as usize != suite.result_width() {
            return Err(BpError::BundleParse("integrity result width mismatch"));
        }
        let total = result_offset + suite.result_width();
        if buf.len() < total {
            return Err(BpError::BundleParse("integrity block truncated"));
        }
        let result = read_result(buf, result_offset, suite);
        Ok((
            IntegrityBlock {
                suite,
                result,
                result_offset,
            },
            total,
        ))
    }

    /// Recompute the result over `payload` and patch it into a serialized
    /// block sitting at the front of `buf`.
    pub fn update(&mut self, buf: &mut [u8], payload: &[u8]) {
        self.result = self.suite.compute(payload);
        write_result(buf, self.result_offset, self.suite, self.result);
    }

    pub fn verify(&self, payload: &[u8]) -> BpResult<()> {
        if self.suite.compute(payload) == self.result {
            Ok(())
        } else {
            Err(BpError::FailedIntegrity)
        }
    }
}

fn write_result(buf: &mut [u8], offset: usize, suite: IntegritySuite, result: u32) {
    match suite {
        IntegritySuite::Crc16X25 => {
            buf[offset..offset + 2].copy_from_slice(&(result as u16).to_be_bytes())
        }
        IntegritySuite::Crc32Castagnoli => {
            buf[offset..offset + 4].copy_from_slice(&result.to_be_bytes())
        }
    }
}

fn read_result(buf: &[u8], offset: usize, suite: IntegritySuite) -> u32 {
    match suite {
        IntegritySuite::Crc16X25 => {
            u32::from(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
        }
        IntegritySuite::Crc32Castagnoli => u32::from_be_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]),
    }
}

/// Payload block header; the payload bytes follow it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadBlock {
    pub block_flags: Field,
    pub blklen: Field,
}

impl PayloadBlock {
    /// Serialized length of the header portion.
    pub const HEADER_LEN: usize = 6;

    pub fn new() -> PayloadBlock {
        PayloadBlock {
            block_flags: Field::new(0, 1, 1),
            blklen: Field::new(0, 2, 4),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.blklen.value as usize
    }

    /// Serialize the header portion at the front of `buf`.
    pub fn write(&mut self, buf: &mut [u8], payload_len: usize, flags: &mut StatusFlags) -> BpResult<usize> {
        if buf.len() < Self::HEADER_LEN {
            return Err(BpError::BundleParse("payload block exceeds header scratch"));
        }
        self.blklen.value = payload_len as u64;

        let mut local = StatusFlags::default();
        buf[0] = BlockType::Payload.into();
        sdnv::write_fixed(buf, self.block_flags, &mut local);
        sdnv::write_fixed(buf, self.blklen, &mut local);
        *flags |= local;
        if !local.is_empty() {
            return Err(BpError::BundleParse("payload block field overflow"));
        }
        Ok(Self::HEADER_LEN)
    }

    /// Parse the header portion from the front of `buf`.
    pub fn read(buf: &[u8], flags: &mut StatusFlags) -> BpResult<(PayloadBlock, usize)> {
        if buf.first() != Some(&BlockType::Payload.into()) {
            return Err(BpError::BundleParse("not a payload block"));
        }
        let (bf_value, bf_next) = sdnv::try_read(buf, 1, flags)?;
        let (blklen_value, consumed) = sdnv::try_read(buf, bf_next, flags)?;
        if buf.len() < consumed + blklen_value as usize {
            return Err(BpError::BundleParse("payload truncated"));
        }
        Ok((
            PayloadBlock {
                block_flags: Field::new(bf_value, 1, bf_next - 1),
                blklen: Field::new(blklen_value, bf_next, consumed - bf_next),
            },
            consumed,
        ))
    }
}

impl Default for PayloadBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_primary() -> PrimaryBlock {
        let mut pri = PrimaryBlock::template();
        pri.set_dest(Eid::new(43, 7));
        pri.set_source(Eid::new(42, 7));
        pri.set_report_to(Eid::new(42, 7));
        pri.set_custodian(Eid::new(42, 7));
        pri.createsec.value = 1_234_567;
        pri.createseq.value = 99;
        pri.lifetime.value = 86_400;
        pri.request_custody = true;
        pri
    }

    #[test]
    fn test_primary_round_trip() {
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; BUNDLE_HDR_BUF_SIZE];
        let mut pri = sample_primary();
        let written = pri.write(&mut buf, &mut flags).unwrap();
        assert_eq!(written, PrimaryBlock::TEMPLATE_LEN);

        let (parsed, consumed) = PrimaryBlock::read(&buf, &mut flags).unwrap();
        assert!(flags.is_empty());
        assert_eq!(consumed, written);
        assert_eq!(parsed.dest(), Eid::new(43, 7));
        assert_eq!(parsed.source(), Eid::new(42, 7));
        assert_eq!(parsed.custodian(), Eid::new(42, 7));
        assert_eq!(parsed.createsec.value, 1_234_567);
        assert_eq!(parsed.createseq.value, 99);
        assert_eq!(parsed.lifetime.value, 86_400);
        assert!(parsed.request_custody);
        assert!(!parsed.is_admin_rec);
        assert!(!parsed.allow_frag);
    }

    #[test]
    fn test_primary_patch_in_place() {
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; BUNDLE_HDR_BUF_SIZE];
        let mut pri = sample_primary();
        pri.write(&mut buf, &mut flags).unwrap();

        pri.createseq.value = 100;
        sdnv::write_fixed(&mut buf, pri.createseq, &mut flags);
        assert!(flags.is_empty());

        let (parsed, _) = PrimaryBlock::read(&buf, &mut flags).unwrap();
        assert_eq!(parsed.createseq.value, 100);
    }

    #[rstest]
    #[case(0, 100, None)]
    #[case(50, 100, Some(150))]
    fn test_expiry(#[case] lifetime: u64, #[case] created: u64, #[case] expected: Option<u64>) {
        let mut pri = PrimaryBlock::template();
        pri.lifetime.value = lifetime;
        pri.createsec.value = created;
        assert_eq!(pri.expiry_secs(), expected);
        if let Some(expiry) = expected {
            assert!(!pri.is_expired(expiry - 1));
            assert!(pri.is_expired(expiry));
        } else {
            assert!(!pri.is_expired(u64::MAX));
        }
    }

    #[test]
    fn test_custody_block_round_trip() {
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; 64];
        let mut cteb = CustodyBlock::new(Eid::new(42, 7));
        cteb.cid.value = 12345;
        let written = cteb.write(&mut buf, &mut flags).unwrap();

        let (parsed, consumed) = CustodyBlock::read(&buf[..written], &mut flags).unwrap();
        assert!(flags.is_empty());
        assert_eq!(consumed, written);
        assert_eq!(parsed.cid.value, 12345);
        assert_eq!(parsed.custodian, Eid::new(42, 7));
        // the cid field location is preserved so the engine can patch it
        assert_eq!(parsed.cid.offset, cteb.cid.offset);
    }

    #[rstest]
    #[case(IntegritySuite::Crc16X25)]
    #[case(IntegritySuite::Crc32Castagnoli)]
    fn test_integrity_round_trip(#[case] suite: IntegritySuite) {
        let payload = b"the payload under test";
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; 64];

        let mut bib = IntegrityBlock::new(suite);
        let written = bib.write(&mut buf, &mut flags).unwrap();
        bib.update(&mut buf, payload);

        let (parsed, consumed) = IntegrityBlock::read(&buf[..written], &mut flags).unwrap();
        assert!(flags.is_empty());
        assert_eq!(consumed, written);
        assert_eq!(parsed.suite, suite);
        assert!(parsed.verify(payload).is_ok());
        assert_eq!(
            parsed.verify(b"tampered payload"),
            Err(BpError::FailedIntegrity)
        );
    }

    #[test]
    fn test_payload_block_round_trip() {
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; 64];
        let mut pay = PayloadBlock::new();
        let written = pay.write(&mut buf, 17, &mut flags).unwrap();
        assert_eq!(written, PayloadBlock::HEADER_LEN);

        let mut wire = buf[..written].to_vec();
        wire.extend_from_slice(&[0u8; 17]);
        let (parsed, consumed) = PayloadBlock::read(&wire, &mut flags).unwrap();
        assert!(flags.is_empty());
        assert_eq!(consumed, written);
        assert_eq!(parsed.payload_len(), 17);
    }

    #[test]
    fn test_payload_block_truncated() {
        let mut flags = StatusFlags::default();
        let mut buf = [0u8; 64];
        let mut pay = PayloadBlock::new();
        let written = pay.write(&mut buf, 100, &mut flags).unwrap();
        assert_eq!(
            PayloadBlock::read(&buf[..written + 10], &mut flags),
            Err(BpError::BundleParse("payload truncated"))
        );
    }
}
