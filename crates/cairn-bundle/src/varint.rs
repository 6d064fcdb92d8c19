//! Unsigned LEB128 integers for the bundle header.
//!
//! Only the shortest encoding of a value is accepted, so a header that
//! parses also re-encodes to the same bytes.

use crate::error::{BundleError, BundleResult};

/// Longest encoding of a `u64`: nine full groups plus one carrying bit 63.
const MAX_VARINT_LEN: usize = 10;

/// Bytes [`put_varint`] emits for `value`.
pub(crate) fn varint_len(value: u64) -> usize {
    let bits = (u64::BITS - value.leading_zeros()) as usize;
    bits.div_ceil(7).max(1)
}

pub(crate) fn put_varint(buf: &mut Vec<u8>, value: u64) {
    let len = varint_len(value);
    buf.reserve(len);
    for group in 0..len {
        let low = ((value >> (7 * group)) & 0x7F) as u8;
        let more = if group + 1 < len { 0x80 } else { 0 };
        buf.push(low | more);
    }
}

/// Parse a varint from the front of `data`, returning the value and the
/// number of bytes it occupied.
pub(crate) fn get_varint(data: &[u8]) -> BundleResult<(u64, usize)> {
    let mut value = 0u64;
    for (group, &byte) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        if group == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(BundleError::InvalidHeader("varint exceeds 64 bits".into()));
        }
        value |= u64::from(byte & 0x7F) << (7 * group);
        if byte & 0x80 != 0 {
            continue;
        }
        if byte == 0 && group > 0 {
            return Err(BundleError::InvalidHeader(format!(
                "overlong varint of {} bytes",
                group + 1
            )));
        }
        return Ok((value, group + 1));
    }
    // Every byte inspected carried a continuation bit.
    Err(BundleError::Truncated {
        needed: data.len() + 1,
        available: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        buf
    }

    #[test]
    fn group_boundaries() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(0x7F), [0x7F]);
        assert_eq!(encoded(0x80), [0x80, 0x01]);
        assert_eq!(encoded(300), [0xAC, 0x02]);
        assert_eq!(encoded(1 << 14), [0x80, 0x80, 0x01]);
    }

    #[test]
    fn largest_value_uses_ten_bytes() {
        let buf = encoded(u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(buf[9], 0x01);
        assert_eq!(get_varint(&buf).unwrap(), (u64::MAX, MAX_VARINT_LEN));
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        assert_eq!(get_varint(&[0xAC, 0x02, 0xFF, 0xFF]).unwrap(), (300, 2));
    }

    #[test]
    fn padded_encodings_are_rejected() {
        // 0 and 1 spelled with redundant zero groups.
        for bytes in [&[0x80, 0x00][..], &[0x81, 0x80, 0x00], &[0xFF, 0x80, 0x80, 0x00]] {
            let err = get_varint(bytes).unwrap_err();
            assert!(matches!(err, BundleError::InvalidHeader(_)), "{bytes:02x?}");
        }
    }

    #[test]
    fn tenth_byte_may_only_carry_bit_63() {
        let mut bytes = [0xFFu8; MAX_VARINT_LEN];
        bytes[9] = 0x02;
        assert!(matches!(
            get_varint(&bytes).unwrap_err(),
            BundleError::InvalidHeader(_)
        ));

        bytes[9] = 0x81;
        assert!(matches!(
            get_varint(&bytes).unwrap_err(),
            BundleError::InvalidHeader(_)
        ));

        let err = get_varint(&[0xFF; 11]).unwrap_err();
        assert!(matches!(err, BundleError::InvalidHeader(_)));
    }

    #[test]
    fn unterminated_input_is_truncated() {
        assert!(matches!(
            get_varint(&[]).unwrap_err(),
            BundleError::Truncated { needed: 1, available: 0 }
        ));
        assert!(matches!(
            get_varint(&[0x80, 0x80]).unwrap_err(),
            BundleError::Truncated { needed: 3, available: 2 }
        ));
    }

    proptest! {
        #[test]
        fn parse_consumes_exactly_the_encoding(value in any::<u64>()) {
            let buf = encoded(value);
            prop_assert_eq!(buf.len(), varint_len(value));
            prop_assert_eq!(get_varint(&buf).unwrap(), (value, buf.len()));
        }
    }
}
