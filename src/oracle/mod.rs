//! Read-through client for the execution client's standard read protocol,
//! with the small account cache admission falls back to when the oracle is
//! unreachable.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde_json::json;

use crate::{
    errors::{RpcCallError, TransportError, ValidationError},
    l1::client::{JsonRpcClient, L1Block},
};

/// The nonce and balance of one account as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountState {
    /// Current account nonce
    pub nonce: u64,
    /// Current balance in wei
    pub balance: U256,
}

/// Read-only state queries against the execution client.
#[async_trait]
pub trait StateOracle: Send + Sync + 'static {
    /// `eth_getTransactionCount` at latest
    async fn nonce_at(&self, address: Address) -> Result<u64, RpcCallError>;
    /// `eth_getBalance` at latest
    async fn balance_at(&self, address: Address) -> Result<U256, RpcCallError>;
    /// `eth_getCode` at latest
    async fn code_at(&self, address: Address) -> Result<Bytes, RpcCallError>;
    /// `eth_getStorageAt` at latest
    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, RpcCallError>;
    /// `eth_getBlockByNumber`, headers only
    async fn block_by_number(&self, number: u64) -> Result<Option<L1Block>, RpcCallError>;
}

/// The HTTP state oracle.
#[derive(Debug, Clone)]
pub struct HttpStateOracle {
    rpc: JsonRpcClient,
}

impl HttpStateOracle {
    /// Creates an oracle against the execution client's read endpoint.
    pub fn new(url: &str) -> Self {
        Self {
            rpc: JsonRpcClient::new(url, Duration::from_secs(5)),
        }
    }
}

fn parse_u256(value: &serde_json::Value) -> Result<U256, RpcCallError> {
    value
        .as_str()
        .and_then(|s| U256::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok())
        .ok_or_else(|| TransportError::EmptyResponse.into())
}

#[async_trait]
impl StateOracle for HttpStateOracle {
    async fn nonce_at(&self, address: Address) -> Result<u64, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        result
            .as_str()
            .and_then(|s| u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok())
            .ok_or_else(|| TransportError::EmptyResponse.into())
    }

    async fn balance_at(&self, address: Address) -> Result<U256, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_u256(&result)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getCode", json!([address, "latest"]))
            .await?;
        result
            .as_str()
            .and_then(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok())
            .map(Bytes::from)
            .ok_or_else(|| TransportError::EmptyResponse.into())
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getStorageAt", json!([address, slot, "latest"]))
            .await?;
        result
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::EmptyResponse.into())
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<L1Block>, RpcCallError> {
        let result = self
            .rpc
            .call(
                "eth_getBlockByNumber",
                json!([format!("{number:#x}"), false]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|_| TransportError::EmptyResponse.into())
    }
}

/// The account cache shared between admission and selection. Values are
/// refreshed on every successful oracle read and bumped as blocks include
/// transactions.
#[derive(Debug, Default)]
pub struct AccountCache {
    inner: RwLock<HashMap<Address, AccountState>>,
}

impl AccountCache {
    /// The last observed state for an account, if any.
    pub fn get(&self, address: &Address) -> Option<AccountState> {
        self.inner
            .read()
            .expect("account cache lock poisoned")
            .get(address)
            .copied()
    }

    /// Replaces the cached state for an account.
    pub fn update(&self, address: Address, state: AccountState) {
        self.inner
            .write()
            .expect("account cache lock poisoned")
            .insert(address, state);
    }

    /// Raises the cached nonce to at least `nonce`; used when a block
    /// includes a transaction from the account.
    pub fn bump_nonce(&self, address: Address, nonce: u64) {
        let mut inner = self.inner.write().expect("account cache lock poisoned");
        let entry = inner.entry(address).or_default();
        if entry.nonce < nonce {
            entry.nonce = nonce;
        }
    }

    /// The cached nonces for the given accounts; accounts never observed
    /// are omitted.
    pub fn nonce_snapshot<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a Address>,
    ) -> HashMap<Address, u64> {
        let inner = self.inner.read().expect("account cache lock poisoned");
        addresses
            .into_iter()
            .filter_map(|addr| inner.get(addr).map(|state| (*addr, state.nonce)))
            .collect()
    }
}

/// Where the validator reads account state from: the oracle when it
/// answers, the cache when it does not, and a distinct error when neither
/// can.
#[async_trait]
pub trait StateSource: Send + Sync + 'static {
    /// The sender's current nonce and balance.
    async fn account(&self, address: Address) -> Result<AccountState, ValidationError>;
}

/// A [`StateOracle`] wrapped with the fallback cache.
#[derive(Debug)]
pub struct CachingOracle<O> {
    oracle: O,
    cache: Arc<AccountCache>,
}

impl<O: StateOracle> CachingOracle<O> {
    /// Wraps `oracle`, sharing `cache` with the rest of the node.
    pub fn new(oracle: O, cache: Arc<AccountCache>) -> Self {
        Self { oracle, cache }
    }

    /// The shared cache handle.
    pub fn cache(&self) -> &Arc<AccountCache> {
        &self.cache
    }
}

#[async_trait]
impl<O: StateOracle> StateSource for CachingOracle<O> {
    async fn account(&self, address: Address) -> Result<AccountState, ValidationError> {
        let nonce = self.oracle.nonce_at(address).await;
        let balance = self.oracle.balance_at(address).await;
        match (nonce, balance) {
            (Ok(nonce), Ok(balance)) => {
                let state = AccountState { nonce, balance };
                self.cache.update(address, state);
                Ok(state)
            }
            (nonce, balance) => {
                let err = nonce.err().or(balance.err()).expect("one side failed");
                if !err.is_transient() {
                    tracing::warn!(%address, %err, "oracle protocol error during account read");
                }
                self.cache
                    .get(&address)
                    .ok_or(ValidationError::StateUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyOracle {
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl StateOracle for FlakyOracle {
        async fn nonce_at(&self, _address: Address) -> Result<u64, RpcCallError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                Err(TransportError::ConnectionRefused.into())
            } else {
                Ok(7)
            }
        }
        async fn balance_at(&self, _address: Address) -> Result<U256, RpcCallError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                Err(TransportError::ConnectionRefused.into())
            } else {
                Ok(U256::from(1000u64))
            }
        }
        async fn code_at(&self, _address: Address) -> Result<Bytes, RpcCallError> {
            Ok(Bytes::new())
        }
        async fn storage_at(&self, _address: Address, _slot: B256) -> Result<B256, RpcCallError> {
            Ok(B256::ZERO)
        }
        async fn block_by_number(&self, _number: u64) -> Result<Option<L1Block>, RpcCallError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn falls_back_to_cache_when_oracle_unreachable() {
        let oracle = CachingOracle::new(
            FlakyOracle {
                fail: std::sync::atomic::AtomicBool::new(false),
            },
            Arc::new(AccountCache::default()),
        );
        let address = Address::repeat_byte(0x01);

        // first read primes the cache
        let state = oracle.account(address).await.unwrap();
        assert_eq!(state.nonce, 7);

        oracle
            .oracle
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let cached = oracle.account(address).await.unwrap();
        assert_eq!(cached, state);
    }

    #[tokio::test]
    async fn no_state_source_is_a_distinct_error() {
        let oracle = CachingOracle::new(
            FlakyOracle {
                fail: std::sync::atomic::AtomicBool::new(true),
            },
            Arc::new(AccountCache::default()),
        );
        let err = oracle.account(Address::repeat_byte(0x02)).await.unwrap_err();
        assert_eq!(err, ValidationError::StateUnavailable);
    }

    #[test]
    fn bump_nonce_never_lowers() {
        let cache = AccountCache::default();
        let addr = Address::repeat_byte(0x03);
        cache.update(
            addr,
            AccountState {
                nonce: 5,
                balance: U256::ZERO,
            },
        );
        cache.bump_nonce(addr, 3);
        assert_eq!(cache.get(&addr).unwrap().nonce, 5);
        cache.bump_nonce(addr, 9);
        assert_eq!(cache.get(&addr).unwrap().nonce, 9);
    }
}
