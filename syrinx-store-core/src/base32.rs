//! The base32 variant used for store path hashes.
//!
//! Lowercase, no padding, least-significant-bit first, and the encoded
//! string is reversed relative to ordinary base32.

use std::sync::LazyLock;

use data_encoding::{BitOrder, DecodeError, Encoding, Specification};

/// The 32-character alphabet. Note the absence of `e`, `o`, `t` and `u`.
pub const ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

static CODEC: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(ALPHABET);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().expect("alphabet is a valid base32 spec")
});

/// Length of the encoding of `len` input bytes.
pub const fn encode_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Length of the decoding of `len` encoded characters.
pub const fn decode_len(len: usize) -> usize {
    len * 5 / 8
}

pub fn encode_string(input: &[u8]) -> String {
    let mut out = CODEC.encode(input).into_bytes();
    out.reverse();
    // The alphabet is pure ASCII, so the reversal cannot break UTF-8.
    String::from_utf8(out).expect("base32 output is ASCII")
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut reversed = input.to_vec();
    reversed.reverse();
    CODEC.decode(&reversed).map_err(|err| DecodeError {
        position: input.len().saturating_sub(err.position + 1),
        kind: err.kind,
    })
}

/// Whether `input` consists only of alphabet characters.
pub fn is_valid(input: &[u8]) -> bool {
    input.iter().all(|b| ALPHABET.as_bytes().contains(b))
}
