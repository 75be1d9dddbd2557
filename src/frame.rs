//! Wire format: the `(count, tag)` header prefixing every p2p frame, the
//! reserved control tags, and the one-byte tree-edge statuses.
//!
//! Integers are native-endian; all workers share a host.

use byteorder::{ByteOrder, NativeEndian};

/// Receive-side wildcard: matches any tag. Legal as a transmitted value.
pub const TAG_ANY: i32 = 0;

/// Control tag: the sender is blocked waiting on us. A second header with
/// the wanted `(count, tag)` follows instead of a payload.
pub(crate) const TAG_HINT: i32 = -1;

/// Control tag: the pending wait we announced can never be satisfied.
pub(crate) const TAG_ABORT: i32 = -2;

/// Tree-edge status bytes.
pub(crate) const ST_READY: u8 = 1;
pub(crate) const ST_FINALIZE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub count: i32,
    pub tag: i32,
}

impl Header {
    pub const LEN: usize = 8;

    pub fn encode(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        NativeEndian::write_i32(&mut buf[..4], self.count);
        NativeEndian::write_i32(&mut buf[4..], self.tag);
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Header {
        Header {
            count: NativeEndian::read_i32(&buf[..4]),
            tag: NativeEndian::read_i32(&buf[4..]),
        }
    }

    /// Does this message satisfy a receive for `count` bytes with `tag`?
    pub fn matches(self, count: i32, tag: i32) -> bool {
        self.count == count && (self.tag == tag || tag == TAG_ANY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        for header in [
            Header { count: 0, tag: 0 },
            Header { count: 4096, tag: 17 },
            Header { count: 8, tag: TAG_HINT },
            Header { count: i32::MAX, tag: i32::MIN },
        ] {
            assert_eq!(Header::decode(&header.encode()), header);
        }
    }

    #[test]
    fn wildcard_is_receive_side_only() {
        let msg = Header { count: 3, tag: 9 };
        assert!(msg.matches(3, 9));
        assert!(msg.matches(3, TAG_ANY));
        assert!(!msg.matches(3, 8));
        assert!(!msg.matches(4, 9));

        // A transmitted tag of 0 is an ordinary value and still matches the
        // wildcard.
        let zero = Header { count: 1, tag: 0 };
        assert!(zero.matches(1, TAG_ANY));
    }

    #[test]
    fn control_tags_are_reserved() {
        assert!(TAG_HINT < 0);
        assert!(TAG_ABORT < 0);
        assert_ne!(TAG_HINT, TAG_ABORT);
    }
}
