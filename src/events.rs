//! Chain event intake and the ledger reactor
//!
//! Chain observation arrives as a stream of [`ChainEvent`]s from whatever
//! watcher feeds the daemon. The reactor applies each event to the invoice
//! ledgers and the payjoin pending table, then fans a [`LedgerUpdate`] out on
//! a broadcast channel for API subscribers. Event re-delivery is harmless:
//! ledger appends are idempotent by outpoint and accounted-flag flips report
//! whether they changed anything.

use std::sync::Arc;

use bitcoin::{OutPoint, Transaction, Txid};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::coins::CachedCoinSource;
use crate::invoice::{InvoiceId, InvoiceRegistry, PaymentMethod};
use crate::ledger::{Payment, PayjoinInformation, PayjoinKind};
use crate::money::Amount;
use crate::negotiator::PayjoinNegotiator;

/// One observation from the chain watcher
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A transaction relevant to us appeared in the mempool or a block
    TransactionSeen {
        /// The full transaction
        tx: Transaction,
        /// 0 while unconfirmed
        confirmations: u32,
    },
    /// A previously seen transaction gained confirmations
    TransactionConfirmed {
        /// The transaction
        txid: Txid,
        /// New confirmation count
        confirmations: u32,
    },
    /// A previously seen transaction was evicted: replaced, double-spent, or
    /// dropped in a reorg
    TransactionReplaced {
        /// The transaction
        txid: Txid,
    },
}

/// Notification fanned out after the reactor applies an event
#[derive(Debug, Clone)]
pub enum LedgerUpdate {
    /// A payment was recorded against an invoice
    PaymentRecorded {
        invoice_id: InvoiceId,
        outpoint: OutPoint,
    },
    /// A payjoin proposal was observed broadcast and its coinjoin payment
    /// superseded the original
    PayjoinCompleted {
        invoice_id: InvoiceId,
        proposal_txid: Txid,
    },
    /// Payments of a transaction were un-accounted after eviction
    PaymentsEvicted { invoice_id: InvoiceId, txid: Txid },
    /// Confirmation counts changed
    ConfirmationsUpdated { txid: Txid, confirmations: u32 },
}

/// Applies chain events to ledgers, the negotiation table, and the coin cache
pub struct ChainReactor {
    invoices: Arc<InvoiceRegistry>,
    negotiator: Arc<PayjoinNegotiator>,
    coins: Arc<CachedCoinSource>,
    updates: broadcast::Sender<LedgerUpdate>,
}

impl ChainReactor {
    /// Build a reactor over the shared state. The returned receiver observes
    /// every applied update; further subscribers come from
    /// [`Self::subscribe`].
    pub fn new(
        invoices: Arc<InvoiceRegistry>,
        negotiator: Arc<PayjoinNegotiator>,
        coins: Arc<CachedCoinSource>,
    ) -> (Self, broadcast::Receiver<LedgerUpdate>) {
        let (updates, rx) = broadcast::channel(256);
        (
            Self {
                invoices,
                negotiator,
                coins,
                updates,
            },
            rx,
        )
    }

    /// A new subscription to applied updates
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerUpdate> {
        self.updates.subscribe()
    }

    /// Consume events until the intake closes or shutdown fires
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChainEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!("chain reactor started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("chain reactor shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        warn!("chain event intake closed");
                        break;
                    }
                },
            }
        }
    }

    /// Apply one event
    pub async fn apply(&self, event: ChainEvent) {
        match event {
            ChainEvent::TransactionSeen { tx, confirmations } => {
                self.on_seen(tx, confirmations).await
            }
            ChainEvent::TransactionConfirmed {
                txid,
                confirmations,
            } => self.on_confirmed(txid, confirmations).await,
            ChainEvent::TransactionReplaced { txid } => self.on_replaced(txid),
        }
    }

    async fn on_seen(&self, tx: Transaction, confirmations: u32) {
        let txid = tx.compute_txid();
        debug!(%txid, confirmations, "transaction seen");

        // A broadcast payjoin proposal supersedes the original it was built
        // from. The coinjoin payment carries the original's recorded value,
        // not the merged output value, so the contributed coin never inflates
        // what the payer is credited with.
        if let Some(negotiation) = self.negotiator.pending_for_proposal(&txid) {
            self.negotiator.mark_accepted(&txid);
            if let Some(invoice) = self.invoices.get(&negotiation.invoice_id) {
                let merged = invoice.terms.methods.iter().find_map(|m| match m {
                    PaymentMethod::OnChain(oc) if oc.payjoin_enabled => tx
                        .output
                        .iter()
                        .position(|o| o.script_pubkey == oc.script_pubkey)
                        .map(|vout| (vout, m.id())),
                    _ => None,
                });
                if let Some((vout, method)) = merged {
                    let coinjoin = Payment {
                        outpoint: OutPoint {
                            txid,
                            vout: vout as u32,
                        },
                        method,
                        value: negotiation.payment_value,
                        network_fee_contribution: negotiation.fee_contribution,
                        accounted: true,
                        confirmations,
                        received_at: Utc::now(),
                        payjoin: Some(PayjoinInformation {
                            kind: PayjoinKind::Coinjoin,
                            our_outpoints: vec![negotiation.contributed_coin],
                        }),
                    };
                    if invoice.ledger.append(coinjoin) {
                        invoice
                            .ledger
                            .set_accounted(&negotiation.payment_outpoint, false);
                        info!(invoice = %invoice.id, proposal = %txid,
                            "coinjoin payment superseded original");
                        let _ = self.updates.send(LedgerUpdate::PayjoinCompleted {
                            invoice_id: invoice.id.clone(),
                            proposal_txid: txid,
                        });
                    }
                }
            }
            // Our coin is spent now; the next negotiation must refetch.
            self.coins.invalidate().await;
        } else if let Some(negotiation) = self.negotiator.pending_for_original(&txid) {
            // The payer broadcast the original instead of the proposal. The
            // payment is already recorded and stays accounted. Marking the
            // negotiation accepted shields it from the timeout sweep; the
            // reservation is released once this transaction confirms or gets
            // evicted.
            info!(%txid, "original broadcast instead of proposal");
            self.negotiator.mark_accepted(&negotiation.proposal_txid);
        }

        // Ordinary output recording. Idempotent appends make this safe to run
        // for proposal and original transactions too.
        for (vout, output) in tx.output.iter().enumerate() {
            for invoice in self.invoices.find_by_script(&output.script_pubkey) {
                let Some(method) = invoice.on_chain_method_for_script(&output.script_pubkey)
                else {
                    continue;
                };
                let value = Amount::from_units(output.value.to_sat() as i128, method.asset);
                let fee_contribution = Amount::from_units(
                    method.next_network_fee.units().min(value.units()).max(0),
                    method.asset,
                );
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                let payment = Payment {
                    outpoint,
                    method: PaymentMethod::OnChain(method.clone()).id(),
                    value,
                    network_fee_contribution: fee_contribution,
                    accounted: true,
                    confirmations,
                    received_at: Utc::now(),
                    payjoin: None,
                };
                let recorded = if invoice.ledger.append(payment) {
                    info!(invoice = %invoice.id, %txid, vout, "payment recorded");
                    true
                } else if invoice.ledger.reinstate(&outpoint) {
                    // The outpoint was recorded by an earlier negotiation or
                    // observation and reverted since (timeout sweep or
                    // eviction). The transaction is demonstrably live, so the
                    // payment counts again.
                    info!(invoice = %invoice.id, %txid, vout, "reverted payment reinstated");
                    true
                } else {
                    false
                };
                if recorded {
                    let _ = self.updates.send(LedgerUpdate::PaymentRecorded {
                        invoice_id: invoice.id.clone(),
                        outpoint,
                    });
                }
            }
        }
    }

    async fn on_confirmed(&self, txid: Txid, confirmations: u32) {
        debug!(%txid, confirmations, "transaction confirmed");
        let mut touched = false;
        for invoice in self.invoices.all() {
            if invoice.ledger.set_confirmations(&txid, confirmations) > 0 {
                touched = true;
            }
        }
        if touched {
            let _ = self.updates.send(LedgerUpdate::ConfirmationsUpdated {
                txid,
                confirmations,
            });
        }

        // A confirmed spend resolves its negotiation: the reservation served
        // its purpose and the coin set changed underneath the cache.
        let proposal_confirmed = self.negotiator.pending_for_proposal(&txid).is_some();
        if self.negotiator.release_for_tx(&txid).is_some() && proposal_confirmed {
            self.coins.invalidate().await;
        }
    }

    fn on_replaced(&self, txid: Txid) {
        warn!(%txid, "transaction evicted, reverting its payments");
        for invoice in self.invoices.all() {
            let flipped = invoice.ledger.evict_transaction(&txid);
            if !flipped.is_empty() {
                let _ = self.updates.send(LedgerUpdate::PaymentsEvicted {
                    invoice_id: invoice.id.clone(),
                    txid,
                });
            }
        }
        // Any negotiation tied to the evicted transaction is dead; its coin
        // returns to the pool and its inputs are free again.
        self.negotiator.release_for_tx(&txid);
    }
}
