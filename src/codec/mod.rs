//! Wire framing shared by the transaction model, the batch format, and the
//! witness container.
//!
//! All structural encoding is canonical RLP. Typed transactions use the
//! `(type_byte || rlp(body))` outer form; anything with a first byte of
//! `0xc0` or above is a legacy RLP list.

use alloy_primitives::{Address, Bytes, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable, EMPTY_STRING_CODE};

use crate::errors::ValidationError;

/// The ExecuteTx envelope type byte.
pub const EXECUTE_TX_TYPE: u8 = 0x05;

/// Version byte prefixed to batch calldata.
pub const BATCH_VERSION: u8 = 0x00;

/// The outer wire form of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// An untyped RLP list (first byte >= 0xc0).
    Legacy,
    /// A type 0x05 stateless-execution envelope.
    Execute,
}

/// Classifies raw transaction bytes by their envelope without decoding the
/// body.
pub fn classify(raw: &[u8]) -> Result<WireKind, ValidationError> {
    match raw.first() {
        None => Err(ValidationError::InvalidRlp("empty input".to_string())),
        Some(b) if *b >= 0xc0 => Ok(WireKind::Legacy),
        Some(&EXECUTE_TX_TYPE) => Ok(WireKind::Execute),
        Some(b) => Err(ValidationError::InvalidRlp(format!(
            "unknown transaction type byte {b:#04x}"
        ))),
    }
}

/// Decodes a value and rejects trailing bytes past the declared length.
pub fn decode_exact<T: Decodable>(mut buf: &[u8]) -> Result<T, ValidationError> {
    let value = T::decode(&mut buf).map_err(|e| ValidationError::InvalidRlp(e.to_string()))?;
    if !buf.is_empty() {
        return Err(ValidationError::InvalidRlp(format!(
            "{} trailing bytes",
            buf.len()
        )));
    }
    Ok(value)
}

/// Encodes an optional recipient. An absent recipient (contract creation or
/// an inbox-less ExecuteTx) is the empty string.
pub fn encode_opt_address(to: &Option<Address>, out: &mut dyn alloy_rlp::BufMut) {
    match to {
        Some(addr) => addr.encode(out),
        None => out.put_u8(EMPTY_STRING_CODE),
    }
}

/// RLP length of an optional recipient.
pub fn opt_address_length(to: &Option<Address>) -> usize {
    match to {
        Some(addr) => addr.length(),
        None => 1,
    }
}

/// Decodes an optional recipient encoded by [`encode_opt_address`].
pub fn decode_opt_address(buf: &mut &[u8]) -> Result<Option<Address>, alloy_rlp::Error> {
    match buf.first() {
        Some(&EMPTY_STRING_CODE) => {
            *buf = &buf[1..];
            Ok(None)
        }
        Some(_) => Ok(Some(Address::decode(buf)?)),
        None => Err(alloy_rlp::Error::InputTooShort),
    }
}

/// Serde helpers for JSON-RPC hex quantities (`"0x1b4"` style).
pub mod hexnum {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a `u64` as a minimal hex quantity.
    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    /// Deserializes a `"0x"`-prefixed hex quantity into a `u64`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(&s);
        u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

/// One keyed entry of the witness: a hash and the bytes it commits to.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct WitnessEntry {
    /// keccak of `bytes`
    pub hash: B256,
    /// bytecode or trie-node bytes
    pub bytes: Bytes,
}

/// The state a batch needs for stateless re-execution: historical headers
/// for block-hash lookups, contract code by hash, and trie nodes by hash.
///
/// Serialized as an RLP triple of (list, list-of-pairs, list-of-pairs). The
/// empty witness is a valid degenerate case.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Witness {
    /// Ordered block-header records, most recent last.
    pub headers: Vec<Bytes>,
    /// code-hash -> bytecode
    pub codes: Vec<WitnessEntry>,
    /// node-hash -> trie-node bytes
    pub state: Vec<WitnessEntry>,
}

impl Witness {
    /// True when the witness carries no data at all.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.codes.is_empty() && self.state.is_empty()
    }

    /// The serialized container bytes.
    pub fn encoded(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    /// Decodes a serialized container, rejecting trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ValidationError> {
        decode_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn classify_by_first_byte() {
        assert_eq!(classify(&[0xc0]).unwrap(), WireKind::Legacy);
        assert_eq!(classify(&[0xf8, 0x6b]).unwrap(), WireKind::Legacy);
        assert_eq!(classify(&[0x05, 0xc0]).unwrap(), WireKind::Execute);
        assert!(classify(&[0x02, 0xc0]).is_err());
        assert!(classify(&[]).is_err());
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut encoded = alloy_rlp::encode(&42u64);
        assert_eq!(decode_exact::<u64>(&encoded).unwrap(), 42);
        encoded.push(0x00);
        assert!(decode_exact::<u64>(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_non_canonical_integers() {
        // 42 encoded with a leading zero byte
        let non_canonical = [0x82, 0x00, 0x2a];
        assert!(decode_exact::<u64>(&non_canonical).is_err());
        // zero must be the empty string, not 0x00
        let zero_as_byte = [0x00];
        assert!(decode_exact::<u64>(&zero_as_byte).is_err());
    }

    #[test]
    fn opt_address_roundtrip() {
        for to in [None, Some(Address::repeat_byte(0x11))] {
            let mut out = Vec::new();
            encode_opt_address(&to, &mut out);
            assert_eq!(out.len(), opt_address_length(&to));
            let mut slice = out.as_slice();
            assert_eq!(decode_opt_address(&mut slice).unwrap(), to);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn witness_roundtrip() {
        let code = Bytes::from(vec![0x60, 0x00, 0x60, 0x00]);
        let witness = Witness {
            headers: vec![Bytes::from(vec![0x01; 8])],
            codes: vec![WitnessEntry {
                hash: keccak256(&code),
                bytes: code,
            }],
            state: vec![],
        };
        let decoded = Witness::decode(&witness.encoded()).unwrap();
        assert_eq!(witness, decoded);
    }

    #[test]
    fn empty_witness_is_valid() {
        let witness = Witness::default();
        assert!(witness.is_empty());
        let decoded = Witness::decode(&witness.encoded()).unwrap();
        assert!(decoded.is_empty());
    }
}
