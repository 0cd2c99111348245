//! Endpoint identifiers in the `ipn:` scheme.

use crate::error::{BpError, BpResult};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Longest textual form this library accepts, `ipn:<u32>.<u32>` plus slack.
pub const MAX_EID_STRING: usize = 32;

/// A bundle protocol endpoint: a `(node, service)` pair.
///
/// Node number `0` addresses "no endpoint" and is used for unset report-to
/// and custodian fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eid {
    pub node: u32,
    pub service: u32,
}

impl Eid {
    pub const NULL: Eid = Eid { node: 0, service: 0 };

    pub fn new(node: u32, service: u32) -> Eid {
        Eid { node, service }
    }

    pub fn is_null(&self) -> bool {
        *self == Eid::NULL
    }
}

impl Display for Eid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

impl FromStr for Eid {
    type Err = BpError;

    fn from_str(s: &str) -> BpResult<Eid> {
        if s.len() < 7 {
            return Err(BpError::InvalidEid(format!(
                "too short ({} chars): {s:?}",
                s.len()
            )));
        }
        if s.len() > MAX_EID_STRING {
            return Err(BpError::InvalidEid(format!(
                "too long ({} chars)",
                s.len()
            )));
        }
        let rest = s
            .strip_prefix("ipn:")
            .ok_or_else(|| BpError::InvalidEid(format!("scheme is not 'ipn:': {s:?}")))?;

        let (node_str, service_str) = rest
            .split_once('.')
            .ok_or_else(|| BpError::InvalidEid(format!("no dotted notation: {s:?}")))?;

        let node = parse_segment(node_str, s)?;
        let service = parse_segment(service_str, s)?;
        Ok(Eid { node, service })
    }
}

fn parse_segment(segment: &str, whole: &str) -> BpResult<u32> {
    if segment.is_empty() {
        return Err(BpError::InvalidEid(format!("empty segment in {whole:?}")));
    }
    segment
        .parse::<u32>()
        .map_err(|_| BpError::InvalidEid(format!("bad number {segment:?} in {whole:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple("ipn:1.2", 1, 2)]
    #[case::zero_service("ipn:10.0", 10, 0)]
    #[case::max("ipn:4294967295.4294967295", u32::MAX, u32::MAX)]
    fn test_parse(#[case] text: &str, #[case] node: u32, #[case] service: u32) {
        assert_eq!(text.parse::<Eid>().unwrap(), Eid::new(node, service));
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_short("ipn:1.")]
    #[case::wrong_scheme("dtn:1.235")]
    #[case::no_dot("ipn:123456")]
    #[case::empty_node("ipn:.123456")]
    #[case::empty_service("ipn:123456.")]
    #[case::out_of_range("ipn:4294967296.1")]
    #[case::negative("ipn:-17.1234")]
    #[case::trailing_junk("ipn:1.2.3")]
    fn test_parse_rejects(#[case] text: &str) {
        assert!(matches!(text.parse::<Eid>(), Err(BpError::InvalidEid(_))));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(1, u32::MAX)]
    #[case(u32::MAX, 1)]
    #[case(77, 4096)]
    fn test_round_trip(#[case] node: u32, #[case] service: u32) {
        let eid = Eid::new(node, service);
        assert_eq!(eid.to_string().parse::<Eid>().unwrap(), eid);
    }
}
