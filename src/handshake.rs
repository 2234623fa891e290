//! Handshake & Protocol Negotiation (§4.10 addition): negotiates the
//! shared protocol version before any other command is accepted on a
//! freshly-accepted socket pair.

use std::ops::RangeInclusive;

use crate::error::WireError;

pub type ProtocolVersion = u32;

/// The single wire protocol version this crate speaks. A real deployment
/// migrating formats would widen this range; kept a single point for now.
pub const PROTOCOL_MIN: ProtocolVersion = 1;
pub const PROTOCOL_MAX: ProtocolVersion = 1;

/// Picks the newest version both sides support. Aborts the connection with
/// `WireError::NoProtocolOverlap` when the ranges don't intersect, matching
/// `original_source`'s negotiate-and-abort-on-mismatch policy.
pub fn negotiate(
    local_range: RangeInclusive<ProtocolVersion>,
    peer_range: RangeInclusive<ProtocolVersion>,
) -> Result<ProtocolVersion, WireError> {
    let lo = *local_range.start().max(peer_range.start());
    let hi = *local_range.end().min(peer_range.end());
    if lo > hi {
        return Err(WireError::NoProtocolOverlap {
            local_min: *local_range.start(),
            local_max: *local_range.end(),
            peer_min: *peer_range.start(),
            peer_max: *peer_range.end(),
        });
    }
    Ok(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_the_highest_common_version() {
        let version = negotiate(1..=5, 3..=8).unwrap();
        assert_eq!(version, 5);
    }

    #[test]
    fn aborts_on_no_overlap() {
        let err = negotiate(1..=2, 3..=4).unwrap_err();
        assert!(matches!(err, WireError::NoProtocolOverlap { .. }));
    }

    #[test]
    fn exact_single_version_match() {
        let version = negotiate(3..=3, 3..=3).unwrap();
        assert_eq!(version, 3);
    }
}
