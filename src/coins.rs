//! Receiver-owned coins: the chain-client seam, deterministic ordering, and a
//! caching fetch with explicit cancellation semantics
//!
//! Coin selection must be reproducible across retries and across instances
//! observing the same coin set, so candidates are ordered by a total order
//! over their outpoints alone, independent of amount, arrival time, and
//! insertion order.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

/// Boxed future returned by [`CoinSource`] implementations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from coin lookup. All variants are transient: the caller may retry,
/// and no reservation is ever left held on this path.
#[derive(thiserror::Error, Debug)]
pub enum CoinSourceError {
    /// The chain client is unreachable or misbehaving
    #[error("chain client error: {0}")]
    Client(String),

    /// The lookup timed out
    #[error("coin lookup timed out")]
    Timeout,

    /// The caller cancelled an in-flight lookup
    #[error("coin lookup cancelled")]
    Cancelled,
}

/// One unspent receiver-owned coin with enough metadata to sign it later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverCoin {
    /// The coin's identifier
    pub outpoint: OutPoint,
    /// Value of the output
    pub value: Amount,
    /// Script the output pays to
    pub script_pubkey: ScriptBuf,
    /// Confirmation count; unconfirmed coins are not payjoin-eligible
    pub confirmations: u32,
    /// Wallet derivation index for signing
    pub derivation_index: u32,
}

impl ReceiverCoin {
    /// Whether the coin may be contributed to a payjoin: it must be
    /// confirmed-safe on-chain. Lock state is checked separately at selection
    /// time.
    pub fn is_eligible(&self) -> bool {
        self.confirmations > 0
    }
}

/// Strict weak ordering over coins: lexicographic over the big-endian byte
/// serialization of `(txid, vout)`. Stable under re-sorting and unaffected by
/// removal of unrelated elements.
pub fn deterministic_cmp(a: &OutPoint, b: &OutPoint) -> Ordering {
    // Txids are stored little-endian internally; compare display (big-endian)
    // order so the sort matches what operators see in explorers.
    let a_bytes = a.txid.to_byte_array();
    let b_bytes = b.txid.to_byte_array();
    a_bytes
        .iter()
        .rev()
        .cmp(b_bytes.iter().rev())
        .then(a.vout.cmp(&b.vout))
}

/// Sort coins into the deterministic selection order
pub fn sort_deterministic(coins: &mut [ReceiverCoin]) {
    coins.sort_by(|a, b| deterministic_cmp(&a.outpoint, &b.outpoint));
}

/// Supplier of the receiver's unspent coins. The chain client behind this
/// trait is the only place coin selection may block on I/O.
pub trait CoinSource: Send + Sync {
    /// List currently-unspent receiver coins
    fn list_unspent(&self) -> BoxFuture<'_, Result<Vec<ReceiverCoin>, CoinSourceError>>;
}

/// Caching wrapper over a [`CoinSource`] with a fixed TTL.
///
/// Cancellation contract: when a fresh cached value exists the cancellation
/// signal is ignored and the cached value is returned; otherwise cancellation
/// aborts the underlying lookup with no side effects.
pub struct CachedCoinSource {
    source: Arc<dyn CoinSource>,
    ttl: Duration,
    cache: tokio::sync::Mutex<Option<CacheEntry>>,
}

struct CacheEntry {
    fetched_at: Instant,
    coins: Arc<Vec<ReceiverCoin>>,
}

impl CachedCoinSource {
    /// Wrap a source with the given cache TTL
    pub fn new(source: Arc<dyn CoinSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Fetch the coin set, serving from cache while fresh. `cancel` aborts a
    /// cache miss; a cache hit is returned even if `cancel` has already fired.
    pub async fn coins(
        &self,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<Arc<Vec<ReceiverCoin>>, CoinSourceError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!(coins = entry.coins.len(), "serving coin set from cache");
                return Ok(entry.coins.clone());
            }
        }

        let coins = tokio::select! {
            biased;
            _ = &mut cancel => return Err(CoinSourceError::Cancelled),
            res = self.source.list_unspent() => res?,
        };

        let coins = Arc::new(coins);
        *cache = Some(CacheEntry {
            fetched_at: Instant::now(),
            coins: coins.clone(),
        });
        Ok(coins)
    }

    /// Drop the cached coin set so the next fetch goes to the source. Called
    /// after a coin is spent or a proposal is issued.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

/// In-memory coin source backed by a mutable list. Serves tests and regtest
/// deployments where the wallet pushes its coin set in.
#[derive(Debug, Default)]
pub struct StaticCoinSource {
    coins: std::sync::Mutex<Vec<ReceiverCoin>>,
}

impl StaticCoinSource {
    /// Source with an initial coin set
    pub fn new(coins: Vec<ReceiverCoin>) -> Self {
        Self {
            coins: std::sync::Mutex::new(coins),
        }
    }

    /// Replace the coin set
    pub fn set_coins(&self, coins: Vec<ReceiverCoin>) {
        *self.coins.lock().expect("coin source poisoned") = coins;
    }

    /// Remove one coin, e.g. once its spend confirms
    pub fn remove(&self, outpoint: &OutPoint) {
        self.coins
            .lock()
            .expect("coin source poisoned")
            .retain(|c| c.outpoint != *outpoint);
    }
}

impl CoinSource for StaticCoinSource {
    fn list_unspent(&self) -> BoxFuture<'_, Result<Vec<ReceiverCoin>, CoinSourceError>> {
        let coins = self.coins.lock().expect("coin source poisoned").clone();
        Box::pin(async move { Ok(coins) })
    }
}
