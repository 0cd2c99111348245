//! CBOR-encoded, CRC-protected v7 bundle blocks.
//!
//! A serialized bundle is an indefinite-length CBOR array of blocks: the
//! primary block, an optional custody tracking block, and the payload block.
//! Administrative bundles carry an admin record in the payload block data;
//! the only record type this agent understands is the custody acceptance
//! signal aggregating sequence numbers per source flow.

use crate::codec::cbor;
use crate::eid::Eid;
use crate::error::{BpError, BpResult};
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_IBM_SDLC, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const VERSION: u64 = 7;

/// IPN uri scheme number.
const EID_SCHEME_IPN: u64 = 2;

pub const BLOCK_TYPE_PAYLOAD: u64 = 1;
pub const BLOCK_TYPE_CUSTODY_TRACKING: u64 = 10;

/// Admin record type: aggregate custody acceptance.
pub const ADMIN_RECORD_CUSTODY_ACCEPT: u64 = 4;

bitflags! {
    /// Bundle processing control flags of the primary block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u64 {
        const IS_FRAGMENT       = 0x01;
        const ADMIN_RECORD      = 0x02;
        const MUST_NOT_FRAGMENT = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CrcType {
    NoCrc = 0,
    #[default]
    Crc16 = 1,
    Crc32Castagnoli = 2,
}

impl CrcType {
    fn width(&self) -> usize {
        match self {
            CrcType::NoCrc => 0,
            CrcType::Crc16 => 2,
            CrcType::Crc32Castagnoli => 4,
        }
    }

    fn compute(&self, data: &[u8]) -> u64 {
        match self {
            CrcType::NoCrc => 0,
            CrcType::Crc16 => u64::from(Crc::<u16>::new(&CRC_16_IBM_SDLC).checksum(data)),
            CrcType::Crc32Castagnoli => u64::from(Crc::<u32>::new(&CRC_32_ISCSI).checksum(data)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreationTimestamp {
    pub time_ms: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryBlock {
    pub flags: ControlFlags,
    pub crc_type: CrcType,
    pub dest: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub creation: CreationTimestamp,
    pub lifetime_ms: u64,
}

impl PrimaryBlock {
    pub fn is_admin_record(&self) -> bool {
        self.flags.contains(ControlFlags::ADMIN_RECORD)
    }

    pub fn expiry_ms(&self) -> Option<u64> {
        (self.lifetime_ms != 0).then(|| self.creation.time_ms + self.lifetime_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expiry_ms(), Some(expiry) if now_ms >= expiry)
    }
}

/// Names the agent currently responsible for the bundle's onward delivery.
/// The recipient of the bundle acknowledges toward this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustodyTrackingBlock {
    pub current_custodian: Eid,
}

/// Aggregated custody acceptance: sequence numbers of one source flow that
/// this agent has taken custody of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyAcceptRecord {
    pub flow_source: Eid,
    pub sequences: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    CustodyAccept(CustodyAcceptRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub primary: PrimaryBlock,
    pub custody: Option<CustodyTrackingBlock>,
    pub payload: Payload,
}

impl Bundle {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.primary.is_expired(now_ms)
    }

    pub fn custody_accept(&self) -> Option<&CustodyAcceptRecord> {
        match (&self.payload, self.primary.is_admin_record()) {
            (Payload::CustodyAccept(rec), true) => Some(rec),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(cbor::INDEFINITE_ARRAY);
        ser_primary(&self.primary, buf);
        if let Some(custody) = &self.custody {
            let mut data = BytesMut::new();
            put_eid(&mut data, custody.current_custodian);
            ser_canonical(
                BLOCK_TYPE_CUSTODY_TRACKING,
                self.primary.crc_type,
                &data,
                buf,
            );
        }
        let mut data = BytesMut::new();
        match &self.payload {
            Payload::Data(bytes) => data.put_slice(bytes),
            Payload::CustodyAccept(rec) => {
                cbor::put_array_head(&mut data, 2);
                cbor::put_uint(&mut data, ADMIN_RECORD_CUSTODY_ACCEPT);
                cbor::put_array_head(&mut data, 2);
                put_eid(&mut data, rec.flow_source);
                cbor::put_array_head(&mut data, rec.sequences.len());
                for &seq in &rec.sequences {
                    cbor::put_uint(&mut data, seq);
                }
            }
        }
        ser_canonical(BLOCK_TYPE_PAYLOAD, self.primary.crc_type, &data, buf);
        buf.put_u8(cbor::BREAK);
    }

    pub fn deser(input: &[u8]) -> BpResult<Bundle> {
        let mut cursor = input;
        if !cursor.has_remaining() || cursor.get_u8() != cbor::INDEFINITE_ARRAY {
            return Err(BpError::BundleParse("bundle is not a cbor block sequence"));
        }

        let consumed = input.len() - cursor.remaining();
        let (primary, primary_len) = deser_primary(&input[consumed..])?;
        cursor.advance(primary_len);

        let mut custody = None;
        let mut payload = None;
        loop {
            if !cursor.has_remaining() {
                return Err(BpError::BundleParse("unterminated block sequence"));
            }
            if cursor.chunk()[0] == cbor::BREAK {
                cursor.advance(1);
                break;
            }
            let consumed = input.len() - cursor.remaining();
            let (block_type, data, block_len) = deser_canonical(&input[consumed..])?;
            cursor.advance(block_len);

            match block_type {
                BLOCK_TYPE_CUSTODY_TRACKING => {
                    let mut data = &data[..];
                    custody = Some(CustodyTrackingBlock {
                        current_custodian: get_eid(&mut data)?,
                    });
                }
                BLOCK_TYPE_PAYLOAD => {
                    if primary.is_admin_record() {
                        payload = Some(Payload::CustodyAccept(deser_admin_record(&data)?));
                    } else {
                        payload = Some(Payload::Data(data));
                    }
                }
                _ => return Err(BpError::Unsupported("unknown v7 block type")),
            }
        }

        Ok(Bundle {
            primary,
            custody,
            payload: payload.ok_or(BpError::BundleParse("bundle has no payload block"))?,
        })
    }
}

fn put_eid(buf: &mut BytesMut, eid: Eid) {
    cbor::put_array_head(buf, 2);
    cbor::put_uint(buf, EID_SCHEME_IPN);
    cbor::put_array_head(buf, 2);
    cbor::put_uint(buf, eid.node.into());
    cbor::put_uint(buf, eid.service.into());
}

fn get_eid(buf: &mut impl Buf) -> BpResult<Eid> {
    if cbor::get_array_head(buf)? != 2 {
        return Err(BpError::BundleParse("malformed eid"));
    }
    if cbor::get_uint(buf)? != EID_SCHEME_IPN {
        return Err(BpError::Unsupported("non-ipn eid scheme"));
    }
    if cbor::get_array_head(buf)? != 2 {
        return Err(BpError::BundleParse("malformed ipn ssp"));
    }
    let node = cbor::get_uint(buf)?;
    let service = cbor::get_uint(buf)?;
    if node > u64::from(u32::MAX) || service > u64::from(u32::MAX) {
        return Err(BpError::InvalidEid(format!("ipn:{node}.{service}")));
    }
    Ok(Eid::new(node as u32, service as u32))
}

/// Append a zeroed crc byte string, then patch in the crc computed over the
/// whole block encoding. The crc covers its own field as zeros.
fn finish_block_crc(buf: &mut BytesMut, block_start: usize, crc_type: CrcType) {
    let width = crc_type.width();
    if width == 0 {
        return;
    }
    cbor::put_bytes(buf, &vec![0u8; width]);
    let crc_value = crc_type.compute(&buf[block_start..]);
    let crc_start = buf.len() - width;
    match crc_type {
        CrcType::NoCrc => {}
        CrcType::Crc16 => {
            buf[crc_start..].copy_from_slice(&(crc_value as u16).to_be_bytes());
        }
        CrcType::Crc32Castagnoli => {
            buf[crc_start..].copy_from_slice(&(crc_value as u32).to_be_bytes());
        }
    }
}

/// Verify and strip the trailing crc of a block whose raw encoding spans
/// `raw`. Returns the length of the crc tail.
fn check_block_crc(raw: &[u8], crc_type: CrcType, tail: &mut impl Buf) -> BpResult<usize> {
    let width = crc_type.width();
    if width == 0 {
        return Ok(0);
    }
    let stored = cbor::get_bytes(tail)?;
    if stored.len() != width {
        return Err(BpError::BundleParse("crc width mismatch"));
    }
    let mut zeroed = raw.to_vec();
    let crc_start = zeroed.len() - width;
    zeroed[crc_start..].fill(0);
    let expected = crc_type.compute(&zeroed);
    let mut stored_value = 0u64;
    for byte in stored {
        stored_value = stored_value << 8 | u64::from(byte);
    }
    if stored_value != expected {
        return Err(BpError::BundleParse("block crc mismatch"));
    }
    Ok(width)
}

fn ser_primary(pri: &PrimaryBlock, buf: &mut BytesMut) {
    let block_start = buf.len();
    let items = if pri.crc_type == CrcType::NoCrc { 8 } else { 9 };
    cbor::put_array_head(buf, items);
    cbor::put_uint(buf, VERSION);
    cbor::put_uint(buf, pri.flags.bits());
    cbor::put_uint(buf, u8::from(pri.crc_type).into());
    put_eid(buf, pri.dest);
    put_eid(buf, pri.source);
    put_eid(buf, pri.report_to);
    cbor::put_array_head(buf, 2);
    cbor::put_uint(buf, pri.creation.time_ms);
    cbor::put_uint(buf, pri.creation.sequence);
    cbor::put_uint(buf, pri.lifetime_ms);
    finish_block_crc(buf, block_start, pri.crc_type);
}

fn deser_primary(raw: &[u8]) -> BpResult<(PrimaryBlock, usize)> {
    let mut cursor = raw;
    let items = cbor::get_array_head(&mut cursor)?;
    if !(8..=9).contains(&items) {
        return Err(BpError::BundleParse("unexpected primary block item count"));
    }
    if cbor::get_uint(&mut cursor)? != VERSION {
        return Err(BpError::Unsupported("bundle protocol version"));
    }
    let flags = ControlFlags::from_bits_truncate(cbor::get_uint(&mut cursor)?);
    let crc_type = CrcType::try_from(cbor::get_uint(&mut cursor)? as u8)
        .map_err(|_| BpError::Unsupported("crc type"))?;
    let dest = get_eid(&mut cursor)?;
    let source = get_eid(&mut cursor)?;
    let report_to = get_eid(&mut cursor)?;
    if cbor::get_array_head(&mut cursor)? != 2 {
        return Err(BpError::BundleParse("malformed creation timestamp"));
    }
    let creation = CreationTimestamp {
        time_ms: cbor::get_uint(&mut cursor)?,
        sequence: cbor::get_uint(&mut cursor)?,
    };
    let lifetime_ms = cbor::get_uint(&mut cursor)?;

    if (crc_type == CrcType::NoCrc) != (items == 8) {
        return Err(BpError::BundleParse("crc presence mismatch"));
    }
    let body_len = raw.len() - cursor.remaining();
    let crc_len = crc_type.width() + if crc_type.width() == 0 { 0 } else { 1 };
    let total = body_len + crc_len;
    if raw.len() < total {
        return Err(BpError::BundleParse("primary block truncated"));
    }
    check_block_crc(&raw[..total], crc_type, &mut cursor)?;

    Ok((
        PrimaryBlock {
            flags,
            crc_type,
            dest,
            source,
            report_to,
            creation,
            lifetime_ms,
        },
        total,
    ))
}

fn ser_canonical(block_type: u64, crc_type: CrcType, data: &[u8], buf: &mut BytesMut) {
    let block_start = buf.len();
    let items = if crc_type == CrcType::NoCrc { 5 } else { 6 };
    cbor::put_array_head(buf, items);
    cbor::put_uint(buf, block_type);
    cbor::put_uint(buf, block_type); // block number mirrors the type
    cbor::put_uint(buf, 0); // block processing flags
    cbor::put_uint(buf, u8::from(crc_type).into());
    cbor::put_bytes(buf, data);
    finish_block_crc(buf, block_start, crc_type);
}

fn deser_canonical(raw: &[u8]) -> BpResult<(u64, Vec<u8>, usize)> {
    let mut cursor = raw;
    let items = cbor::get_array_head(&mut cursor)?;
    if !(5..=6).contains(&items) {
        return Err(BpError::BundleParse("unexpected canonical block item count"));
    }
    let block_type = cbor::get_uint(&mut cursor)?;
    let _block_num = cbor::get_uint(&mut cursor)?;
    let _flags = cbor::get_uint(&mut cursor)?;
    let crc_type = CrcType::try_from(cbor::get_uint(&mut cursor)? as u8)
        .map_err(|_| BpError::Unsupported("crc type"))?;
    let data = cbor::get_bytes(&mut cursor)?;

    if (crc_type == CrcType::NoCrc) != (items == 5) {
        return Err(BpError::BundleParse("crc presence mismatch"));
    }
    let body_len = raw.len() - cursor.remaining();
    let crc_len = crc_type.width() + if crc_type.width() == 0 { 0 } else { 1 };
    let total = body_len + crc_len;
    if raw.len() < total {
        return Err(BpError::BundleParse("canonical block truncated"));
    }
    check_block_crc(&raw[..total], crc_type, &mut cursor)?;

    Ok((block_type, data, total))
}

fn deser_admin_record(data: &[u8]) -> BpResult<CustodyAcceptRecord> {
    let mut cursor = data;
    if cbor::get_array_head(&mut cursor)? != 2 {
        return Err(BpError::BundleParse("malformed admin record"));
    }
    let record_type = cbor::get_uint(&mut cursor)?;
    if record_type != ADMIN_RECORD_CUSTODY_ACCEPT {
        return Err(BpError::UnknownRecord(record_type as u8));
    }
    if cbor::get_array_head(&mut cursor)? != 2 {
        return Err(BpError::BundleParse("malformed custody accept record"));
    }
    let flow_source = get_eid(&mut cursor)?;
    let count = cbor::get_array_head(&mut cursor)?;
    let mut sequences = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        sequences.push(cbor::get_uint(&mut cursor)?);
    }
    Ok(CustodyAcceptRecord {
        flow_source,
        sequences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn data_bundle(crc_type: CrcType) -> Bundle {
        Bundle {
            primary: PrimaryBlock {
                flags: ControlFlags::MUST_NOT_FRAGMENT,
                crc_type,
                dest: Eid::new(3, 1),
                source: Eid::new(1, 1),
                report_to: Eid::new(1, 1),
                creation: CreationTimestamp {
                    time_ms: 1_000_000,
                    sequence: 42,
                },
                lifetime_ms: 3_600_000,
            },
            custody: Some(CustodyTrackingBlock {
                current_custodian: Eid::new(2, 1),
            }),
            payload: Payload::Data(b"v7 payload".to_vec()),
        }
    }

    #[rstest]
    #[case(CrcType::NoCrc)]
    #[case(CrcType::Crc16)]
    #[case(CrcType::Crc32Castagnoli)]
    fn test_round_trip(#[case] crc_type: CrcType) {
        let bundle = data_bundle(crc_type);
        let mut buf = BytesMut::new();
        bundle.ser(&mut buf);
        assert_eq!(Bundle::deser(&buf).unwrap(), bundle);
    }

    #[test]
    fn test_custody_accept_round_trip() {
        let bundle = Bundle {
            primary: PrimaryBlock {
                flags: ControlFlags::ADMIN_RECORD | ControlFlags::MUST_NOT_FRAGMENT,
                crc_type: CrcType::Crc16,
                dest: Eid::new(1, 1),
                source: Eid::new(2, 1),
                report_to: Eid::new(2, 1),
                creation: CreationTimestamp {
                    time_ms: 500,
                    sequence: 0,
                },
                lifetime_ms: 0,
            },
            custody: None,
            payload: Payload::CustodyAccept(CustodyAcceptRecord {
                flow_source: Eid::new(1, 1),
                sequences: vec![4, 5, 6, 9],
            }),
        };
        let mut buf = BytesMut::new();
        bundle.ser(&mut buf);

        let parsed = Bundle::deser(&buf).unwrap();
        assert_eq!(parsed, bundle);
        assert_eq!(
            parsed.custody_accept().unwrap().sequences,
            vec![4, 5, 6, 9]
        );
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let bundle = data_bundle(CrcType::Crc32Castagnoli);
        let mut buf = BytesMut::new();
        bundle.ser(&mut buf);
        let last = buf.len() - 2;
        buf[last] ^= 0xFF;
        assert_eq!(
            Bundle::deser(&buf),
            Err(BpError::BundleParse("block crc mismatch"))
        );
    }

    #[test]
    fn test_data_payload_of_admin_bundle_must_be_record() {
        let mut bundle = data_bundle(CrcType::Crc16);
        bundle.primary.flags |= ControlFlags::ADMIN_RECORD;
        let mut buf = BytesMut::new();
        bundle.ser(&mut buf);
        assert!(Bundle::deser(&buf).is_err());
    }

    #[test]
    fn test_expiry() {
        let bundle = data_bundle(CrcType::Crc16);
        assert!(!bundle.is_expired(1_000_000));
        assert!(!bundle.is_expired(4_599_999));
        assert!(bundle.is_expired(4_600_000));
    }
}
