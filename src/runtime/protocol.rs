//! Request transforms.
//!
//! The wire protocol has no framing: whatever a single read returns is one
//! request, and the transform's output is the whole response.

use bytes::BytesMut;

/// Maps one request payload to its response payload.
pub trait Transform {
    /// Append the response for `input` to `output`.
    fn apply(&self, input: &[u8], output: &mut BytesMut);
}

/// ASCII `a`..=`z` become `A`..=`Z`; every other byte passes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpperCase;

impl Transform for UpperCase {
    fn apply(&self, input: &[u8], output: &mut BytesMut) {
        output.reserve(input.len());
        output.extend(input.iter().map(u8::to_ascii_uppercase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upcase(input: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        UpperCase.apply(input, &mut out);
        out
    }

    #[test]
    fn test_mixed_text() {
        assert_eq!(&upcase(b"Hello, World! 123")[..], b"HELLO, WORLD! 123");
    }

    #[test]
    fn test_every_byte_value() {
        let input: Vec<u8> = (0..=255u8).collect();
        let out = upcase(&input);
        assert_eq!(out.len(), input.len());
        for (i, &b) in out.iter().enumerate() {
            let original = i as u8;
            if original.is_ascii_lowercase() {
                assert_eq!(b, original - b'a' + b'A');
            } else {
                assert_eq!(b, original, "byte {original:#04x} must pass through");
            }
        }
    }

    #[test]
    fn test_non_ascii_untouched() {
        // UTF-8 for "é" and "ß" must not be altered.
        let input = "caf\u{e9} stra\u{df}e".as_bytes();
        assert_eq!(&upcase(input)[..], "CAF\u{e9} STRA\u{df}E".as_bytes());
    }

    #[test]
    fn test_appends_to_existing_output() {
        let mut out = BytesMut::from(&b"> "[..]);
        UpperCase.apply(b"ok", &mut out);
        assert_eq!(&out[..], b"> OK");
    }

    #[test]
    fn test_empty_input() {
        assert!(upcase(b"").is_empty());
    }
}
