//! Payjoin Gateway: on-chain invoice accounting with payjoin coordination
//!
//! The gateway tracks what each invoice is owed as payments arrive on-chain,
//! and offers payjoin negotiation on top: a payer submits their signed
//! candidate transaction, the gateway contributes exactly one receiver-owned
//! coin into the payment output, and returns the unsigned collaborative
//! transaction for the payer to re-sign.
//!
//! # Architecture
//!
//! 1. An invoice registry holds terms and an append-only payment ledger per
//!    invoice; accounting is a pure calculation over a ledger snapshot
//! 2. The payjoin negotiator validates candidates, reserves a coin through the
//!    lock table, and builds proposals
//! 3. A chain reactor consumes watcher events, recording payments and
//!    resolving negotiations as their transactions confirm or get evicted
//! 4. An HTTP API exposes the payjoin endpoint and accounting snapshots
//!
#![warn(missing_docs)]

pub mod accounting;
pub mod api;
pub mod coins;
pub mod config;
pub mod events;
pub mod fee;
pub mod invoice;
pub mod ledger;
pub mod money;
pub mod negotiator;
pub mod reservation;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use coins::{CachedCoinSource, CoinSource, StaticCoinSource};
pub use config::Config;
use events::{ChainEvent, ChainReactor};
use fee::FeeOracle;
use invoice::InvoiceRegistry;
use negotiator::PayjoinNegotiator;
use reservation::UtxoLocks;

/// The main gateway application state
#[derive(Clone)]
pub struct GatewayApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Invoice store
    pub invoices: Arc<InvoiceRegistry>,
    /// Receiver coin reservations
    pub locks: Arc<UtxoLocks>,
    /// Cached receiver coin lookup
    pub coins: Arc<CachedCoinSource>,
    /// Relay fee-rate oracle
    pub fee_oracle: Arc<FeeOracle>,
    /// Payjoin negotiator
    pub negotiator: Arc<PayjoinNegotiator>,
    /// Chain event reactor
    pub reactor: Arc<ChainReactor>,
    /// Intake for chain watcher events
    events_tx: mpsc::Sender<ChainEvent>,
    /// Consumed once by `run`
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<ChainEvent>>>>,
}

impl GatewayApp {
    /// Create a gateway backed by an in-memory coin source. Production
    /// deployments pass their wallet through [`Self::with_coin_source`].
    pub fn new(config: Config) -> Result<Self> {
        Self::with_coin_source(config, Arc::new(StaticCoinSource::default()))
    }

    /// Create a gateway over the given wallet coin source
    pub fn with_coin_source(config: Config, source: Arc<dyn CoinSource>) -> Result<Self> {
        info!("Initializing payjoin gateway...");
        let config = Arc::new(config);

        let invoices = Arc::new(InvoiceRegistry::new());
        let locks = Arc::new(UtxoLocks::new());
        let coins = Arc::new(CachedCoinSource::new(
            source,
            Duration::from_secs(config.payjoin.coin_cache_ttl_seconds),
        ));
        let fee_oracle = Arc::new(FeeOracle::with_url(
            config.payjoin.fee_api_url.clone(),
            config.payjoin.fee_floor_sat_per_vb,
        ));
        let negotiator = Arc::new(PayjoinNegotiator::new(
            invoices.clone(),
            coins.clone(),
            locks.clone(),
            bitcoin::Amount::from_sat(config.payjoin.dust_threshold_sats),
        ));
        let (reactor, _updates) =
            ChainReactor::new(invoices.clone(), negotiator.clone(), coins.clone());
        let (events_tx, events_rx) = mpsc::channel(256);

        info!("Payjoin gateway initialized");

        Ok(Self {
            config,
            invoices,
            locks,
            coins,
            fee_oracle,
            negotiator,
            reactor: Arc::new(reactor),
            events_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(Some(events_rx))),
        })
    }

    /// Sender half of the chain event intake, handed to the chain watcher
    pub fn event_sender(&self) -> mpsc::Sender<ChainEvent> {
        self.events_tx.clone()
    }

    /// Start the gateway
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(tokio::sync::oneshot::channel().1)
            .await
    }

    /// Start the gateway with a shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting payjoin gateway...");

        let events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("gateway is already running"))?;

        // Chain reactor task.
        let (reactor_stop_tx, reactor_stop_rx) = tokio::sync::oneshot::channel();
        let reactor_handle = tokio::spawn(self.reactor.clone().run(events_rx, reactor_stop_rx));

        // Periodic sweep of negotiations whose payer never broadcast.
        let sweeper_handle = tokio::spawn({
            let negotiator = self.negotiator.clone();
            let timeout = chrono::Duration::minutes(
                self.config.payjoin.proposal_timeout_minutes as i64,
            );
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    let released = negotiator.release_stale(timeout);
                    if !released.is_empty() {
                        info!(count = released.len(), "released stale negotiations");
                    }
                }
            }
        });

        info!(
            "Payjoin gateway running. API available at http://{}",
            self.config.api_bind_address()
        );

        // Serve until shutdown fires, then stop the background tasks.
        let result = api::serve_with_shutdown(self.clone(), shutdown_rx).await;
        if let Err(e) = &result {
            warn!("API server error: {}", e);
        }

        let _ = reactor_stop_tx.send(());
        sweeper_handle.abort();
        let _ = reactor_handle.await;

        info!("Payjoin gateway stopped");
        result
    }
}

/// Error types for the gateway application
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown or malformed invoice reference
    #[error("Invoice error: {0}")]
    Invoice(String),

    /// Payjoin negotiation failure
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] negotiator::NegotiationError),

    /// Chain client failure
    #[error("Chain error: {0}")]
    Chain(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
