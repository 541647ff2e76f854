//! Pre-admission checks against the external state oracle.
//!
//! Signature validity is established at parse time; this module checks the
//! economic constraints. A transaction with a nonce above the account's
//! current nonce is admitted but held back by selection until the gap
//! closes.

use std::sync::Arc;

use alloy_primitives::U256;

use crate::{
    errors::ValidationError,
    oracle::StateSource,
    transaction::ParsedTransaction,
};

/// The admission validator.
#[derive(Debug)]
pub struct Validator<S> {
    source: Arc<S>,
}

impl<S: StateSource> Validator<S> {
    /// A validator reading account state from `source`.
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Checks one parsed transaction. Returns without touching any state on
    /// failure.
    pub async fn validate(&self, tx: &ParsedTransaction) -> Result<(), ValidationError> {
        if tx.tx.gas_price().is_zero() {
            return Err(ValidationError::InvalidGasPrice);
        }

        let account = self.source.account(tx.sender).await?;

        if tx.tx.nonce() < account.nonce {
            return Err(ValidationError::InvalidNonce {
                tx_nonce: tx.tx.nonce(),
                account_nonce: account.nonce,
            });
        }

        if tx.tx.value() > U256::ZERO {
            let gas_cost = tx
                .tx
                .gas_price()
                .checked_mul(U256::from(tx.tx.gas_limit()))
                .ok_or(ValidationError::InsufficientBalance)?;
            let required = tx
                .tx
                .value()
                .checked_add(gas_cost)
                .ok_or(ValidationError::InsufficientBalance)?;
            if account.balance < required {
                return Err(ValidationError::InsufficientBalance);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};
    use async_trait::async_trait;
    use secp256k1::SecretKey;

    use crate::{
        oracle::AccountState,
        transaction::{
            sign_digest, LegacyTransaction, ParsedTransaction, Signature,
        },
    };

    struct FixedSource {
        state: AccountState,
    }

    #[async_trait]
    impl StateSource for FixedSource {
        async fn account(&self, _address: Address) -> Result<AccountState, ValidationError> {
            Ok(self.state)
        }
    }

    struct UnavailableSource;

    #[async_trait]
    impl StateSource for UnavailableSource {
        async fn account(&self, _address: Address) -> Result<AccountState, ValidationError> {
            Err(ValidationError::StateUnavailable)
        }
    }

    fn tx(nonce: u64, gas_price: u64, value: u64) -> ParsedTransaction {
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let mut tx = LegacyTransaction {
            nonce,
            gas_price: U256::from(gas_price),
            gas_limit: 21000,
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(value),
            data: Bytes::new(),
            signature: Signature {
                v: 37,
                ..Default::default()
            },
        };
        let (rec, r, s) = sign_digest(tx.signing_digest(), &key);
        tx.signature = Signature {
            v: 35 + 2 + rec as u64,
            r,
            s,
        };
        ParsedTransaction::parse(crate::common::RawTransaction(alloy_rlp::encode(&tx))).unwrap()
    }

    fn validator(nonce: u64, balance: u64) -> Validator<FixedSource> {
        Validator::new(Arc::new(FixedSource {
            state: AccountState {
                nonce,
                balance: U256::from(balance),
            },
        }))
    }

    #[tokio::test]
    async fn accepts_well_funded_transaction() {
        assert!(validator(0, u64::MAX).validate(&tx(0, 1, 100)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_zero_gas_price() {
        assert_eq!(
            validator(0, u64::MAX).validate(&tx(0, 0, 0)).await,
            Err(ValidationError::InvalidGasPrice)
        );
    }

    #[tokio::test]
    async fn rejects_stale_nonce() {
        assert_eq!(
            validator(5, u64::MAX).validate(&tx(3, 1, 0)).await,
            Err(ValidationError::InvalidNonce {
                tx_nonce: 3,
                account_nonce: 5
            })
        );
    }

    #[tokio::test]
    async fn admits_future_nonce() {
        // queued, not rejected; selection enforces contiguity
        assert!(validator(0, u64::MAX).validate(&tx(4, 1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_underfunded_value_transfer() {
        // needs value + gas_price * gas_limit = 100 + 21000
        assert_eq!(
            validator(0, 20000).validate(&tx(0, 1, 100)).await,
            Err(ValidationError::InsufficientBalance)
        );
    }

    #[tokio::test]
    async fn zero_value_skips_balance_check() {
        assert!(validator(0, 0).validate(&tx(0, 1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn surfaces_missing_state_source() {
        let validator = Validator::new(Arc::new(UnavailableSource));
        assert_eq!(
            validator.validate(&tx(0, 1, 0)).await,
            Err(ValidationError::StateUnavailable)
        );
    }
}
