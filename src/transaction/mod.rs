//! Transaction model: parsed wire variants, signing digests, and one-time
//! sender recovery.
//!
//! Two wire forms are recognized: the untyped legacy list and the type
//! `0x05` stateless-execution envelope. A transaction's identity is the
//! keccak-256 digest it was signed over, so identity is stable across the
//! admission pipeline, the mempool, and payload pruning.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, SecretKey, SECP256K1,
};

use crate::{
    codec::{
        classify, decode_opt_address, encode_opt_address, opt_address_length, WireKind,
        EXECUTE_TX_TYPE,
    },
    common::RawTransaction,
    errors::ValidationError,
};

/// An ECDSA signature. For legacy transactions `v` carries the EIP-155
/// chain id when >= 35; for typed transactions it is the y-parity bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    /// Recovery/parity value
    pub v: u64,
    /// First half of the signature
    pub r: U256,
    /// Second half of the signature
    pub s: U256,
}

impl Signature {
    fn recovery_id(&self, legacy: bool) -> Result<i32, ValidationError> {
        let rec = if legacy {
            match self.v {
                27 | 28 => self.v - 27,
                v if v >= 35 => (v - 35) % 2,
                _ => return Err(ValidationError::InvalidSignature),
            }
        } else {
            match self.v {
                0 | 1 => self.v,
                _ => return Err(ValidationError::InvalidSignature),
            }
        };
        Ok(rec as i32)
    }
}

/// The untyped pre-envelope transaction form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LegacyTransaction {
    /// Sender account nonce
    pub nonce: u64,
    /// Price per unit of gas
    pub gas_price: U256,
    /// Gas ceiling for execution
    pub gas_limit: u64,
    /// Recipient; None creates a contract
    pub to: Option<Address>,
    /// Transferred value
    pub value: U256,
    /// Call data
    pub data: Bytes,
    /// Transaction signature
    pub signature: Signature,
}

impl LegacyTransaction {
    /// The EIP-155 chain id encoded in `v`, if any.
    pub fn chain_id(&self) -> Option<u64> {
        if self.signature.v >= 35 {
            Some((self.signature.v - 35) / 2)
        } else {
            None
        }
    }

    fn unsigned_payload_length(&self) -> usize {
        let mut len = self.nonce.length()
            + self.gas_price.length()
            + self.gas_limit.length()
            + opt_address_length(&self.to)
            + self.value.length()
            + self.data.length();
        if let Some(chain_id) = self.chain_id() {
            len += chain_id.length() + 2;
        }
        len
    }

    /// The digest this transaction signs: the RLP list of its unsigned
    /// fields, with the EIP-155 `(chain_id, 0, 0)` suffix when `v` encodes
    /// a chain id.
    pub fn signing_digest(&self) -> B256 {
        let mut out = Vec::new();
        Header {
            list: true,
            payload_length: self.unsigned_payload_length(),
        }
        .encode(&mut out);
        self.nonce.encode(&mut out);
        self.gas_price.encode(&mut out);
        self.gas_limit.encode(&mut out);
        encode_opt_address(&self.to, &mut out);
        self.value.encode(&mut out);
        self.data.encode(&mut out);
        if let Some(chain_id) = self.chain_id() {
            chain_id.encode(&mut out);
            0u8.encode(&mut out);
            0u8.encode(&mut out);
        }
        keccak256(&out)
    }

    fn signed_payload_length(&self) -> usize {
        self.nonce.length()
            + self.gas_price.length()
            + self.gas_limit.length()
            + opt_address_length(&self.to)
            + self.value.length()
            + self.data.length()
            + self.signature.v.length()
            + self.signature.r.length()
            + self.signature.s.length()
    }
}

impl Encodable for LegacyTransaction {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        Header {
            list: true,
            payload_length: self.signed_payload_length(),
        }
        .encode(out);
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        encode_opt_address(&self.to, out);
        self.value.encode(out);
        self.data.encode(out);
        self.signature.v.encode(out);
        self.signature.r.encode(out);
        self.signature.s.encode(out);
    }

    fn length(&self) -> usize {
        let payload = self.signed_payload_length();
        payload + alloy_rlp::length_of_length(payload)
    }
}

impl Decodable for LegacyTransaction {
    fn decode(buf: &mut &[u8]) -> Result<Self, alloy_rlp::Error> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < header.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let (mut payload, rest) = buf.split_at(header.payload_length);
        let tx = LegacyTransaction {
            nonce: u64::decode(&mut payload)?,
            gas_price: U256::decode(&mut payload)?,
            gas_limit: u64::decode(&mut payload)?,
            to: decode_opt_address(&mut payload)?,
            value: U256::decode(&mut payload)?,
            data: Bytes::decode(&mut payload)?,
            signature: Signature {
                v: u64::decode(&mut payload)?,
                r: U256::decode(&mut payload)?,
                s: U256::decode(&mut payload)?,
            },
        };
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::Custom("legacy list has extra items"));
        }
        *buf = rest;
        Ok(tx)
    }
}

/// The type `0x05` stateless-execution envelope: a batch plus everything L1
/// needs to re-execute it without state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteTransaction {
    /// L1 chain id the envelope targets
    pub chain_id: u64,
    /// Sequencer account nonce
    pub nonce: u64,
    /// Priority fee cap
    pub max_priority_fee_per_gas: U256,
    /// Total fee cap
    pub max_fee_per_gas: U256,
    /// Gas ceiling
    pub gas_limit: u64,
    /// Stateless-execution precompile, or None
    pub to: Option<Address>,
    /// Transferred value; zero for batch submissions
    pub value: U256,
    /// Serialized batch calldata
    pub data: Bytes,
    /// Commitment to the pre-state the witness opens against
    pub pre_state_root: B256,
    /// Serialized witness container
    pub witness: Bytes,
    /// Declared witness byte length
    pub witness_size: u64,
    /// Declared withdrawals byte length
    pub withdrawals_size: u64,
    /// Coinbase of the first batched block
    pub coinbase: Address,
    /// Number of the first batched block
    pub block_number: u64,
    /// Timestamp of the first batched block
    pub timestamp: u64,
    /// Versioned blob hashes, if the batch data rides in blobs
    pub blob_hashes: Vec<B256>,
    /// Envelope signature (`v` is the y-parity bit)
    pub signature: Signature,
}

impl ExecuteTransaction {
    fn unsigned_payload_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + opt_address_length(&self.to)
            + self.value.length()
            + self.data.length()
            + self.pre_state_root.length()
            + self.witness.length()
            + self.witness_size.length()
            + self.withdrawals_size.length()
            + self.coinbase.length()
            + self.block_number.length()
            + self.timestamp.length()
            + self.blob_hashes.length()
    }

    fn encode_unsigned_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        encode_opt_address(&self.to, out);
        self.value.encode(out);
        self.data.encode(out);
        self.pre_state_root.encode(out);
        self.witness.encode(out);
        self.witness_size.encode(out);
        self.withdrawals_size.encode(out);
        self.coinbase.encode(out);
        self.block_number.encode(out);
        self.timestamp.encode(out);
        self.blob_hashes.encode(out);
    }

    /// keccak256(type_byte || rlp(unsigned_body))
    pub fn signing_digest(&self) -> B256 {
        let mut out = vec![EXECUTE_TX_TYPE];
        Header {
            list: true,
            payload_length: self.unsigned_payload_length(),
        }
        .encode(&mut out);
        self.encode_unsigned_fields(&mut out);
        keccak256(&out)
    }

    /// Full signed wire bytes: `0x05 || rlp(body)`.
    pub fn encoded(&self) -> Vec<u8> {
        let payload_length = self.unsigned_payload_length()
            + self.signature.v.length()
            + self.signature.r.length()
            + self.signature.s.length();
        let mut out = vec![EXECUTE_TX_TYPE];
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_unsigned_fields(&mut out);
        self.signature.v.encode(&mut out);
        self.signature.r.encode(&mut out);
        self.signature.s.encode(&mut out);
        out
    }

    /// Decodes the RLP body following the type byte.
    pub fn decode_body(buf: &mut &[u8]) -> Result<Self, alloy_rlp::Error> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < header.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let (mut payload, rest) = buf.split_at(header.payload_length);
        let tx = ExecuteTransaction {
            chain_id: u64::decode(&mut payload)?,
            nonce: u64::decode(&mut payload)?,
            max_priority_fee_per_gas: U256::decode(&mut payload)?,
            max_fee_per_gas: U256::decode(&mut payload)?,
            gas_limit: u64::decode(&mut payload)?,
            to: decode_opt_address(&mut payload)?,
            value: U256::decode(&mut payload)?,
            data: Bytes::decode(&mut payload)?,
            pre_state_root: B256::decode(&mut payload)?,
            witness: Bytes::decode(&mut payload)?,
            witness_size: u64::decode(&mut payload)?,
            withdrawals_size: u64::decode(&mut payload)?,
            coinbase: Address::decode(&mut payload)?,
            block_number: u64::decode(&mut payload)?,
            timestamp: u64::decode(&mut payload)?,
            blob_hashes: Vec::<B256>::decode(&mut payload)?,
            signature: Signature {
                v: u64::decode(&mut payload)?,
                r: U256::decode(&mut payload)?,
                s: U256::decode(&mut payload)?,
            },
        };
        if !payload.is_empty() {
            return Err(alloy_rlp::Error::Custom("execute tx list has extra items"));
        }
        *buf = rest;
        Ok(tx)
    }

    /// Signs the unsigned fields with the given key, filling the signature.
    pub fn sign(mut self, key: &SecretKey) -> Self {
        let (v, r, s) = sign_digest(self.signing_digest(), key);
        self.signature = Signature { v: v as u64, r, s };
        self
    }
}

/// A parsed transaction variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedTransaction {
    /// Untyped legacy form
    Legacy(LegacyTransaction),
    /// Type 0x05 stateless-execution envelope
    Execute(ExecuteTransaction),
}

impl TypedTransaction {
    /// Sender account nonce.
    pub fn nonce(&self) -> u64 {
        match self {
            TypedTransaction::Legacy(tx) => tx.nonce,
            TypedTransaction::Execute(tx) => tx.nonce,
        }
    }

    /// The fee-related ordering key: gas price for legacy, fee cap for
    /// ExecuteTx.
    pub fn gas_price(&self) -> U256 {
        match self {
            TypedTransaction::Legacy(tx) => tx.gas_price,
            TypedTransaction::Execute(tx) => tx.max_fee_per_gas,
        }
    }

    /// Gas ceiling.
    pub fn gas_limit(&self) -> u64 {
        match self {
            TypedTransaction::Legacy(tx) => tx.gas_limit,
            TypedTransaction::Execute(tx) => tx.gas_limit,
        }
    }

    /// Transferred value.
    pub fn value(&self) -> U256 {
        match self {
            TypedTransaction::Legacy(tx) => tx.value,
            TypedTransaction::Execute(tx) => tx.value,
        }
    }

    /// The digest this transaction was signed over.
    pub fn signing_digest(&self) -> B256 {
        match self {
            TypedTransaction::Legacy(tx) => tx.signing_digest(),
            TypedTransaction::Execute(tx) => tx.signing_digest(),
        }
    }

    fn signature(&self) -> &Signature {
        match self {
            TypedTransaction::Legacy(tx) => &tx.signature,
            TypedTransaction::Execute(tx) => &tx.signature,
        }
    }
}

/// A transaction admitted through the wire: the raw bytes, the parsed
/// variant, its identity, and the sender recovered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    /// The original wire bytes
    pub raw: RawTransaction,
    /// The decoded variant
    pub tx: TypedTransaction,
    /// Identity: the keccak-256 signing digest
    pub hash: B256,
    /// The recovered sender
    pub sender: Address,
}

impl ParsedTransaction {
    /// Decodes raw wire bytes into a variant and recovers the sender.
    pub fn parse(raw: RawTransaction) -> Result<Self, ValidationError> {
        let tx = match classify(&raw.0)? {
            WireKind::Legacy => {
                let mut buf = raw.0.as_slice();
                let tx = LegacyTransaction::decode(&mut buf)
                    .map_err(|e| ValidationError::InvalidRlp(e.to_string()))?;
                if !buf.is_empty() {
                    return Err(ValidationError::InvalidRlp(format!(
                        "{} trailing bytes",
                        buf.len()
                    )));
                }
                TypedTransaction::Legacy(tx)
            }
            WireKind::Execute => {
                let mut buf = &raw.0[1..];
                let tx = ExecuteTransaction::decode_body(&mut buf)
                    .map_err(|e| ValidationError::InvalidRlp(e.to_string()))?;
                if !buf.is_empty() {
                    return Err(ValidationError::InvalidRlp(format!(
                        "{} trailing bytes",
                        buf.len()
                    )));
                }
                TypedTransaction::Execute(tx)
            }
        };

        let hash = tx.signing_digest();
        let legacy = matches!(tx, TypedTransaction::Legacy(_));
        let sender = recover_signer(hash, tx.signature(), legacy)?;

        Ok(ParsedTransaction {
            raw,
            tx,
            hash,
            sender,
        })
    }
}

/// Recovers the signing address from a digest and signature. The address is
/// the low 20 bytes of keccak256 of the uncompressed public key x||y.
pub fn recover_signer(
    digest: B256,
    signature: &Signature,
    legacy: bool,
) -> Result<Address, ValidationError> {
    let rec_id = RecoveryId::from_i32(signature.recovery_id(legacy)?)
        .map_err(|_| ValidationError::InvalidSignature)?;

    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&signature.r.to_be_bytes::<32>());
    compact[32..].copy_from_slice(&signature.s.to_be_bytes::<32>());
    let sig = RecoverableSignature::from_compact(&compact, rec_id)
        .map_err(|_| ValidationError::InvalidSignature)?;

    let message = Message::from_digest(digest.0);
    let pubkey = SECP256K1
        .recover_ecdsa(&message, &sig)
        .map_err(|_| ValidationError::InvalidSignature)?;

    let uncompressed = pubkey.serialize_uncompressed();
    Ok(Address::from_slice(&keccak256(&uncompressed[1..])[12..]))
}

/// Signs a digest, returning `(recovery_id, r, s)`.
pub fn sign_digest(digest: B256, key: &SecretKey) -> (i32, U256, U256) {
    let message = Message::from_digest(digest.0);
    let sig = SECP256K1.sign_ecdsa_recoverable(&message, key);
    let (rec_id, compact) = sig.serialize_compact();
    (
        rec_id.to_i32(),
        U256::from_be_slice(&compact[..32]),
        U256::from_be_slice(&compact[32..]),
    )
}

/// The address controlled by a secret key.
pub fn address_of(key: &SecretKey) -> Address {
    let pubkey = key.public_key(SECP256K1);
    let uncompressed = pubkey.serialize_uncompressed();
    Address::from_slice(&keccak256(&uncompressed[1..])[12..])
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Builds a signed legacy transaction for tests, EIP-155 with chain id 1.
    pub fn signed_legacy(key: &SecretKey, nonce: u64, gas_price: u64) -> ParsedTransaction {
        let mut tx = LegacyTransaction {
            nonce,
            gas_price: U256::from(gas_price),
            gas_limit: 21000,
            to: Some(Address::repeat_byte(0x22)),
            value: U256::ZERO,
            data: Bytes::new(),
            signature: Signature {
                v: 37,
                ..Default::default()
            },
        };
        let (rec, r, s) = sign_digest(tx.signing_digest(), key);
        tx.signature = Signature {
            v: 35 + 2 + rec as u64,
            r,
            s,
        };
        ParsedTransaction::parse(RawTransaction(alloy_rlp::encode(&tx))).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn test_key() -> SecretKey {
        SecretKey::new(&mut OsRng)
    }

    #[test]
    fn legacy_roundtrip() {
        let key = test_key();
        let parsed = test_utils::signed_legacy(&key, 3, 100);
        let reparsed = ParsedTransaction::parse(parsed.raw.clone()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn legacy_sender_recovery() {
        let key = test_key();
        let parsed = test_utils::signed_legacy(&key, 0, 1);
        assert_eq!(parsed.sender, address_of(&key));
    }

    #[test]
    fn sign_recover_inverse() {
        let key = test_key();
        let digest = keccak256(b"an arbitrary digest preimage");
        let (rec, r, s) = sign_digest(digest, &key);
        let sig = Signature {
            v: rec as u64,
            r,
            s,
        };
        assert_eq!(recover_signer(digest, &sig, false).unwrap(), address_of(&key));
    }

    #[test]
    fn execute_tx_roundtrip() {
        let key = test_key();
        let tx = ExecuteTransaction {
            chain_id: 1,
            nonce: 9,
            max_priority_fee_per_gas: U256::from(2u64),
            max_fee_per_gas: U256::from(50u64),
            gas_limit: 1_000_000,
            to: None,
            value: U256::ZERO,
            data: Bytes::from(vec![0x00, 0x01, 0x02]),
            pre_state_root: B256::repeat_byte(0x33),
            witness: Bytes::new(),
            witness_size: 0,
            withdrawals_size: 0,
            coinbase: Address::repeat_byte(0x44),
            block_number: 12,
            timestamp: 1700000000,
            blob_hashes: vec![],
            signature: Signature::default(),
        }
        .sign(&key);

        let raw = RawTransaction(tx.encoded());
        let parsed = ParsedTransaction::parse(raw).unwrap();
        assert_eq!(parsed.sender, address_of(&key));
        match parsed.tx {
            TypedTransaction::Execute(decoded) => assert_eq!(decoded, tx),
            _ => panic!("expected execute variant"),
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let key = test_key();
        let parsed = test_utils::signed_legacy(&key, 0, 1);
        let mut raw = parsed.raw.0.clone();
        raw.push(0x00);
        assert!(matches!(
            ParsedTransaction::parse(RawTransaction(raw)),
            Err(ValidationError::InvalidRlp(_))
        ));
    }

    #[test]
    fn rejects_unknown_type_byte() {
        assert!(matches!(
            ParsedTransaction::parse(RawTransaction(vec![0x03, 0xc0])),
            Err(ValidationError::InvalidRlp(_))
        ));
    }

    #[test]
    fn rejects_mangled_signature() {
        let key = test_key();
        let parsed = test_utils::signed_legacy(&key, 0, 1);
        match parsed.tx {
            TypedTransaction::Legacy(mut tx) => {
                // 29 is neither a pre-155 value nor an EIP-155 encoding
                tx.signature.v = 29;
                let raw = RawTransaction(alloy_rlp::encode(&tx));
                assert!(matches!(
                    ParsedTransaction::parse(raw),
                    Err(ValidationError::InvalidSignature)
                ));
            }
            _ => unreachable!(),
        }
    }
}
