//! PayJoin negotiation
//!
//! One negotiation evaluates one candidate original transaction against one
//! invoice. The request walks
//! `Received -> Validated -> CoinSelected -> Proposed` and ends `Accepted`
//! (when the proposal is later seen on-chain) or `Rejected`. Rejections carry
//! a stable reason string and happen before any state is mutated; losing a
//! coin-lock race to a concurrent negotiation is ordinary contention and moves
//! selection to the next coin.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bitcoin::{FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, Txid, Witness};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::accounting::{calculate, AccountingError, Snapshot};
use crate::coins::{sort_deterministic, CachedCoinSource, CoinSourceError, ReceiverCoin};
use crate::invoice::{Invoice, InvoiceId, InvoiceRegistry, OnChainMethod, PaymentMethod};
use crate::ledger::{Payment, PayjoinInformation, PayjoinKind};
use crate::money::Amount;
use crate::reservation::UtxoLocks;

/// Virtual size a P2WPKH keyspend input adds to a transaction. The receiver
/// wallet is segwit-v0 single-sig.
pub const ADDED_INPUT_VBYTES: u64 = 68;

/// Terminal rejection reasons, reported to the payer as stable strings and
/// never retried automatically.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    /// The invoice is already settled by previously accounted payments
    #[error("already-paid")]
    AlreadyPaid,
    /// A candidate input is committed to another still-pending negotiation,
    /// or spends a receiver-owned coin
    #[error("inputs-already-used")]
    InputsAlreadyUsed,
    /// The payer's spare value cannot cover the relay fee for the heavier
    /// transaction
    #[error("not-enough-money")]
    NotEnoughMoney,
    /// The candidate's own payment output is below the amount due
    #[error("invoice-not-fully-paid")]
    InvoiceNotFullyPaid,
}

impl Rejection {
    /// The stable wire string for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::AlreadyPaid => "already-paid",
            Rejection::InputsAlreadyUsed => "inputs-already-used",
            Rejection::NotEnoughMoney => "not-enough-money",
            Rejection::InvoiceNotFullyPaid => "invoice-not-fully-paid",
        }
    }
}

/// Errors crossing the negotiation boundary
#[derive(thiserror::Error, Debug)]
pub enum NegotiationError {
    /// Terminal rejection with a stable reason
    #[error("{0}")]
    Rejected(#[from] Rejection),

    /// No such invoice
    #[error("unknown invoice: {0}")]
    UnknownInvoice(InvoiceId),

    /// The invoice has no payjoin-enabled on-chain method
    #[error("invoice has no payjoin-enabled payment method")]
    PayjoinNotEnabled,

    /// The candidate transaction is structurally unusable
    #[error("invalid candidate transaction: {0}")]
    InvalidCandidate(&'static str),

    /// Transient infrastructure failure during coin lookup; retryable, no
    /// reservation held
    #[error(transparent)]
    Coins(#[from] CoinSourceError),

    /// Accounting invariant violation
    #[error(transparent)]
    Accounting(#[from] AccountingError),
}

/// Successful negotiation outcome
#[derive(Debug, Clone)]
pub enum Outcome {
    /// An unsigned collaborative transaction for the payer to sign
    Payjoin(Transaction),
    /// No eligible receiver coin was available ("out-of-utxos"): the payment
    /// degrades gracefully and the payer broadcasts the untouched original
    Original(Transaction),
}

impl Outcome {
    /// The reason string accompanying the degraded outcome
    pub const OUT_OF_UTXOS: &'static str = "out-of-utxos";
}

/// Lifecycle of one pending negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationState {
    /// Candidate received, not yet validated
    Received,
    /// All validations passed
    Validated,
    /// A receiver coin is locked for this negotiation
    CoinSelected,
    /// The proposal was returned to the payer
    Proposed,
    /// The proposal was observed broadcast
    Accepted,
}

/// Snapshot of one pending negotiation
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationSummary {
    /// Invoice the candidate pays
    pub invoice_id: InvoiceId,
    /// Txid of the payer's original transaction
    pub original_txid: Txid,
    /// Txid of the unsigned proposal
    pub proposal_txid: Txid,
    /// Receiver coin contributed and locked
    pub contributed_coin: OutPoint,
    /// Ledger key of the payment recorded for the original
    pub payment_outpoint: OutPoint,
    /// Value recorded for the payment, in method units
    pub payment_value: Amount,
    /// Fee credit recorded for the payment
    pub fee_contribution: Amount,
    /// Current state
    pub state: NegotiationState,
    /// When the proposal was issued
    pub created_at: DateTime<Utc>,
}

struct PendingState {
    /// Proposal txid -> negotiation
    negotiations: HashMap<Txid, NegotiationSummary>,
    /// Original txid -> proposal txid
    by_original: HashMap<Txid, Txid>,
    /// Inputs of accepted originals, blocked from reuse until their
    /// negotiation resolves
    committed_inputs: HashMap<OutPoint, Txid>,
}

/// The PayJoin negotiator. Safe to call concurrently from unrelated request
/// handlers; all shared state lives behind its own locks.
pub struct PayjoinNegotiator {
    invoices: Arc<InvoiceRegistry>,
    coins: Arc<CachedCoinSource>,
    locks: Arc<UtxoLocks>,
    dust_threshold: bitcoin::Amount,
    pending: Mutex<PendingState>,
}

/// How the extra-input fee is covered and what happens to the change output.
/// Computed before any coin is locked.
struct ContributionPlan {
    payment_vout: usize,
    /// Satoshis taken from the payer's overpayment above due
    overpay_to_fee: u64,
    change_vout: Option<usize>,
    /// Satoshis shaved off the change output
    change_to_fee: u64,
    /// Change fell below the dust threshold and is removed whole
    drop_change: bool,
}

impl PayjoinNegotiator {
    /// Build a negotiator over the shared invoice registry, coin source, and
    /// lock table
    pub fn new(
        invoices: Arc<InvoiceRegistry>,
        coins: Arc<CachedCoinSource>,
        locks: Arc<UtxoLocks>,
        dust_threshold: bitcoin::Amount,
    ) -> Self {
        Self {
            invoices,
            coins,
            locks,
            dust_threshold,
            pending: Mutex::new(PendingState {
                negotiations: HashMap::new(),
                by_original: HashMap::new(),
                committed_inputs: HashMap::new(),
            }),
        }
    }

    /// Evaluate a candidate original transaction against an invoice.
    pub async fn negotiate(
        &self,
        invoice_id: &InvoiceId,
        candidate: Transaction,
        min_fee_rate: FeeRate,
    ) -> Result<Outcome, NegotiationError> {
        // A fetch with no caller cancellation: keep the sender alive so the
        // receive side never observes a close.
        let (_keep_alive, cancel) = oneshot::channel();
        self.negotiate_with_cancel(invoice_id, candidate, min_fee_rate, cancel)
            .await
    }

    /// [`Self::negotiate`] with an explicit cancellation signal for the coin
    /// lookup. Cancellation aborts a cache-missing lookup with no side
    /// effects; a cache hit still answers.
    pub async fn negotiate_with_cancel(
        &self,
        invoice_id: &InvoiceId,
        candidate: Transaction,
        min_fee_rate: FeeRate,
        cancel: oneshot::Receiver<()>,
    ) -> Result<Outcome, NegotiationError> {
        let original_txid = candidate.compute_txid();
        debug!(%invoice_id, %original_txid, state = ?NegotiationState::Received, "payjoin candidate received");

        if candidate.input.is_empty() {
            return Err(NegotiationError::InvalidCandidate("no inputs"));
        }
        if candidate.output.is_empty() {
            return Err(NegotiationError::InvalidCandidate("no outputs"));
        }
        // The candidate must be broadcastable as-is: it is the fallback if
        // negotiation fails past this point.
        if candidate
            .input
            .iter()
            .any(|i| i.script_sig.is_empty() && i.witness.is_empty())
        {
            return Err(NegotiationError::InvalidCandidate("unsigned input"));
        }

        let invoice = self
            .invoices
            .get(invoice_id)
            .ok_or_else(|| NegotiationError::UnknownInvoice(invoice_id.clone()))?;
        let method = payjoin_method(&invoice).ok_or(NegotiationError::PayjoinNotEnabled)?;

        // Settlement is judged on previously accounted payments alone,
        // independent of this submission. A resubmitted candidate whose
        // payment is already in the ledger lands here.
        let snapshot = self.snapshot(&invoice, &method)?;
        if snapshot.settled {
            return Err(Rejection::AlreadyPaid.into());
        }
        let due_sats = u64::try_from(snapshot.due.units().max(0)).unwrap_or(u64::MAX);

        // Inputs committed to any still-pending negotiation are blocked from
        // reuse across receivers before broadcast.
        {
            let pending = self.pending.lock().expect("pending state poisoned");
            for txin in &candidate.input {
                if pending.committed_inputs.contains_key(&txin.previous_output) {
                    return Err(Rejection::InputsAlreadyUsed.into());
                }
            }
        }

        let Some(payment_vout) = payment_output(&candidate, &method) else {
            return Err(Rejection::InvoiceNotFullyPaid.into());
        };
        let payment_value = candidate.output[payment_vout].value;
        if payment_value.to_sat() < due_sats {
            return Err(Rejection::InvoiceNotFullyPaid.into());
        }

        // Fee feasibility is settled before touching the lock table so a
        // doomed request never reserves a coin.
        let plan = plan_contribution(
            &candidate,
            payment_vout,
            due_sats,
            min_fee_rate,
            self.dust_threshold,
        )?;
        debug!(%invoice_id, %original_txid, state = ?NegotiationState::Validated, "payjoin candidate validated");

        // The only blocking step: fetch the receiver's spendable coins.
        let coins = self.coins.coins(cancel).await?;

        // A candidate spending one of our own coins is an attack on the
        // receiver's wallet, refused the same way as cross-negotiation reuse.
        let ours: HashSet<OutPoint> = coins.iter().map(|c| c.outpoint).collect();
        if candidate.input.iter().any(|i| ours.contains(&i.previous_output)) {
            return Err(Rejection::InputsAlreadyUsed.into());
        }

        let Some(coin) = self.select_coin(&coins) else {
            info!(%invoice_id, %original_txid, reason = Outcome::OUT_OF_UTXOS,
                "no eligible receiver coin; returning original transaction");
            return Ok(Outcome::Original(candidate));
        };
        debug!(%invoice_id, %original_txid, coin = %coin.outpoint,
            state = ?NegotiationState::CoinSelected, "receiver coin locked");

        match self.propose(&invoice, &method, candidate, original_txid, plan, &coin) {
            Ok(proposal) => Ok(Outcome::Payjoin(proposal)),
            Err(e) => {
                // Nothing was recorded; hand the coin back.
                self.locks.try_unlock(&coin.outpoint);
                Err(e)
            }
        }
    }

    /// Walk the deterministic coin order, locking the first free eligible
    /// coin. Lost races move on to the next candidate.
    fn select_coin(&self, coins: &[ReceiverCoin]) -> Option<ReceiverCoin> {
        let mut eligible: Vec<ReceiverCoin> =
            coins.iter().filter(|c| c.is_eligible()).cloned().collect();
        sort_deterministic(&mut eligible);

        for coin in eligible {
            if self.locks.try_lock(coin.outpoint) {
                return Some(coin);
            }
            debug!(coin = %coin.outpoint, "coin lock lost to concurrent negotiation, trying next");
        }
        None
    }

    /// Build the unsigned proposal and record the negotiation. The selected
    /// coin is already locked; on error the caller releases it.
    fn propose(
        &self,
        invoice: &Invoice,
        method: &OnChainMethod,
        mut tx: Transaction,
        original_txid: Txid,
        plan: ContributionPlan,
        coin: &ReceiverCoin,
    ) -> Result<Transaction, NegotiationError> {
        let asset = method.asset;
        let original_value = tx.output[plan.payment_vout].value;

        // Merge the receiver's contribution into the existing payment output,
        // minus the overpayment absorbed into fee. Same destination, no new
        // output: the contribution reads like payer change to an observer.
        let merged = original_value.to_sat() - plan.overpay_to_fee + coin.value.to_sat();
        tx.output[plan.payment_vout].value = bitcoin::Amount::from_sat(merged);

        if let Some(change_vout) = plan.change_vout {
            if plan.drop_change {
                tx.output.remove(change_vout);
            } else if plan.change_to_fee > 0 {
                let v = tx.output[change_vout].value.to_sat() - plan.change_to_fee;
                tx.output[change_vout].value = bitcoin::Amount::from_sat(v);
            }
        }

        let sequence = tx
            .input
            .first()
            .map(|i| i.sequence)
            .unwrap_or(Sequence::ENABLE_RBF_NO_LOCKTIME);
        tx.input.push(TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        });

        let proposal_txid = tx.compute_txid();
        let payment_outpoint = OutPoint {
            txid: original_txid,
            vout: plan.payment_vout as u32,
        };
        let payment_value = Amount::from_units(original_value.to_sat() as i128, asset);
        let fee_contribution = Amount::from_units(
            method
                .next_network_fee
                .units()
                .min(payment_value.units())
                .max(0),
            asset,
        );

        let payment = Payment {
            outpoint: payment_outpoint,
            method: PaymentMethod::OnChain(method.clone()).id(),
            value: payment_value,
            network_fee_contribution: fee_contribution,
            accounted: true,
            confirmations: 0,
            received_at: Utc::now(),
            payjoin: Some(PayjoinInformation {
                kind: PayjoinKind::Original,
                our_outpoints: vec![coin.outpoint],
            }),
        };

        {
            let mut pending = self.pending.lock().expect("pending state poisoned");

            // Re-validate under the lock: a racing negotiation may have
            // committed these inputs while we were fetching coins.
            for txin in &tx.input[..tx.input.len() - 1] {
                if pending.committed_inputs.contains_key(&txin.previous_output) {
                    return Err(Rejection::InputsAlreadyUsed.into());
                }
            }
            // A racing identical submission already holds this outpoint with
            // an accounted record. A record reverted by the timeout sweep or
            // an eviction is different: the payer is legitimately retrying,
            // so the record comes back into accounting and the negotiation
            // proceeds.
            if !invoice.ledger.append(payment) {
                match invoice.ledger.get(&payment_outpoint) {
                    Some(existing) if !existing.accounted => {
                        if !invoice.ledger.reinstate(&payment_outpoint) {
                            return Err(Rejection::AlreadyPaid.into());
                        }
                        debug!(invoice = %invoice.id, outpoint = %payment_outpoint,
                            "reverted payment reinstated for retried negotiation");
                    }
                    _ => return Err(Rejection::AlreadyPaid.into()),
                }
            }

            for txin in &tx.input[..tx.input.len() - 1] {
                pending
                    .committed_inputs
                    .insert(txin.previous_output, original_txid);
            }
            pending.by_original.insert(original_txid, proposal_txid);
            pending.negotiations.insert(
                proposal_txid,
                NegotiationSummary {
                    invoice_id: invoice.id.clone(),
                    original_txid,
                    proposal_txid,
                    contributed_coin: coin.outpoint,
                    payment_outpoint,
                    payment_value,
                    fee_contribution,
                    state: NegotiationState::Proposed,
                    created_at: Utc::now(),
                },
            );
        }

        info!(invoice = %invoice.id, %original_txid, %proposal_txid,
            coin = %coin.outpoint, state = ?NegotiationState::Proposed,
            "payjoin proposal issued");
        Ok(tx)
    }

    fn snapshot(
        &self,
        invoice: &Invoice,
        method: &OnChainMethod,
    ) -> Result<Snapshot, AccountingError> {
        let payments = invoice.ledger.snapshot();
        calculate(
            &payments,
            &invoice.terms,
            &PaymentMethod::OnChain(method.clone()),
        )
    }

    /// The pending negotiation whose proposal has the given txid
    pub fn pending_for_proposal(&self, txid: &Txid) -> Option<NegotiationSummary> {
        let pending = self.pending.lock().expect("pending state poisoned");
        pending.negotiations.get(txid).cloned()
    }

    /// The pending negotiation based on the given original txid
    pub fn pending_for_original(&self, txid: &Txid) -> Option<NegotiationSummary> {
        let pending = self.pending.lock().expect("pending state poisoned");
        let proposal = pending.by_original.get(txid)?;
        pending.negotiations.get(proposal).cloned()
    }

    /// Mark a proposal as observed broadcast. The reservation stays held
    /// until the spend confirms or is replaced.
    pub fn mark_accepted(&self, proposal_txid: &Txid) -> Option<NegotiationSummary> {
        let mut pending = self.pending.lock().expect("pending state poisoned");
        let negotiation = pending.negotiations.get_mut(proposal_txid)?;
        negotiation.state = NegotiationState::Accepted;
        info!(%proposal_txid, state = ?NegotiationState::Accepted, "payjoin proposal broadcast");
        Some(negotiation.clone())
    }

    /// Resolve the negotiation tied to this txid (proposal or original side):
    /// drop it from the pending table, free its committed inputs, and release
    /// its coin. Called when the transaction confirms or is evicted.
    pub fn release_for_tx(&self, txid: &Txid) -> Option<NegotiationSummary> {
        let mut pending = self.pending.lock().expect("pending state poisoned");
        let proposal_txid = if pending.negotiations.contains_key(txid) {
            *txid
        } else {
            *pending.by_original.get(txid)?
        };
        let negotiation = pending.negotiations.remove(&proposal_txid)?;
        pending.by_original.remove(&negotiation.original_txid);
        pending
            .committed_inputs
            .retain(|_, orig| *orig != negotiation.original_txid);
        drop(pending);

        self.locks.try_unlock(&negotiation.contributed_coin);
        debug!(%proposal_txid, coin = %negotiation.contributed_coin, "negotiation resolved, coin released");
        Some(negotiation)
    }

    /// Release negotiations that never saw a broadcast within `max_age`:
    /// unlock their coins, free their inputs, and un-account the payments
    /// recorded for their originals. The recovery path that keeps a stalled
    /// payer from stranding a coin.
    pub fn release_stale(&self, max_age: Duration) -> Vec<NegotiationSummary> {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<NegotiationSummary> = {
            let pending = self.pending.lock().expect("pending state poisoned");
            pending
                .negotiations
                .values()
                .filter(|n| n.state == NegotiationState::Proposed && n.created_at < cutoff)
                .cloned()
                .collect()
        };

        for negotiation in &stale {
            warn!(proposal = %negotiation.proposal_txid, invoice = %negotiation.invoice_id,
                "negotiation timed out without broadcast, releasing");
            self.release_for_tx(&negotiation.proposal_txid);
            if let Some(invoice) = self.invoices.get(&negotiation.invoice_id) {
                invoice
                    .ledger
                    .set_accounted(&negotiation.payment_outpoint, false);
            }
        }
        stale
    }

    /// Number of negotiations currently pending
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending state poisoned").negotiations.len()
    }
}

/// The invoice's payjoin-enabled on-chain method, if any
fn payjoin_method(invoice: &Invoice) -> Option<OnChainMethod> {
    invoice.terms.methods.iter().find_map(|m| match m {
        PaymentMethod::OnChain(oc) if oc.payjoin_enabled => Some(oc.clone()),
        _ => None,
    })
}

/// Index of the output paying the invoice destination
fn payment_output(tx: &Transaction, method: &OnChainMethod) -> Option<usize> {
    tx.output
        .iter()
        .position(|o| o.script_pubkey == method.script_pubkey)
}

/// Decide how the extra-input fee is covered. Tie-break order: overpayment
/// above due first, then the change output; change below the dust threshold
/// is removed whole and burned to fee.
fn plan_contribution(
    tx: &Transaction,
    payment_vout: usize,
    due_sats: u64,
    min_fee_rate: FeeRate,
    dust_threshold: bitcoin::Amount,
) -> Result<ContributionPlan, Rejection> {
    let extra_fee = min_fee_rate
        .fee_vb(ADDED_INPUT_VBYTES)
        .unwrap_or(bitcoin::Amount::MAX_MONEY)
        .to_sat();

    let payment_value = tx.output[payment_vout].value.to_sat();
    let overpay = payment_value.saturating_sub(due_sats);
    let overpay_to_fee = extra_fee.min(overpay);
    let shortfall = extra_fee - overpay_to_fee;

    if shortfall == 0 {
        return Ok(ContributionPlan {
            payment_vout,
            overpay_to_fee,
            change_vout: None,
            change_to_fee: 0,
            drop_change: false,
        });
    }

    // Largest non-payment output is treated as the payer's change.
    let change_vout = tx
        .output
        .iter()
        .enumerate()
        .filter(|(vout, _)| *vout != payment_vout)
        .max_by_key(|(_, o)| o.value)
        .map(|(vout, _)| vout);

    let Some(change_vout) = change_vout else {
        return Err(Rejection::NotEnoughMoney);
    };
    let change_value = tx.output[change_vout].value.to_sat();
    if change_value < shortfall {
        return Err(Rejection::NotEnoughMoney);
    }

    if change_value - shortfall < dust_threshold.to_sat() {
        // Sub-dust remainder: the whole change output goes to fee rather
        // than leaving a dust output on-chain.
        Ok(ContributionPlan {
            payment_vout,
            overpay_to_fee,
            change_vout: Some(change_vout),
            change_to_fee: 0,
            drop_change: true,
        })
    } else {
        Ok(ContributionPlan {
            payment_vout,
            overpay_to_fee,
            change_vout: Some(change_vout),
            change_to_fee: shortfall,
            drop_change: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::StaticCoinSource;
    use crate::invoice::InvoiceTerms;
    use crate::money::{Asset, Rate};
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{TxOut, WPubkeyHash};
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    const COIN: u64 = 100_000_000;

    fn script(n: u8) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]))
    }

    fn outpoint(n: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout,
        }
    }

    fn candidate(inputs: Vec<OutPoint>, outputs: Vec<(u64, ScriptBuf)>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|op| TxIn {
                    previous_output: op,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    // stand-in signature + pubkey
                    witness: Witness::from_slice(&[vec![0u8; 72], vec![0u8; 33]]),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|(value, script_pubkey)| TxOut {
                    value: bitcoin::Amount::from_sat(value),
                    script_pubkey,
                })
                .collect(),
        }
    }

    fn receiver_coin(n: u8, sats: u64) -> ReceiverCoin {
        ReceiverCoin {
            outpoint: outpoint(n, 0),
            value: bitcoin::Amount::from_sat(sats),
            script_pubkey: script(200),
            confirmations: 6,
            derivation_index: n as u32,
        }
    }

    /// Invoice priced so that exactly one coin (1 BTC) plus a 0.001 fee
    /// credit is due. The invoice destination is `script(100)`.
    fn test_invoice(id: &str) -> Invoice {
        Invoice::new(
            InvoiceId(id.to_string()),
            InvoiceTerms {
                price: dec!(5000),
                currency: "USD".to_string(),
                payment_tolerance: dec!(0),
                methods: vec![PaymentMethod::OnChain(OnChainMethod {
                    asset: Asset::Bitcoin,
                    rate: Rate::new(dec!(5000)).unwrap(),
                    next_network_fee: crate::money::Amount::from_units(100_000, Asset::Bitcoin),
                    script_pubkey: script(100),
                    payjoin_enabled: true,
                })],
            },
        )
    }

    struct Harness {
        registry: Arc<InvoiceRegistry>,
        source: Arc<StaticCoinSource>,
        locks: Arc<UtxoLocks>,
        negotiator: Arc<PayjoinNegotiator>,
    }

    fn harness(coins: Vec<ReceiverCoin>) -> Harness {
        let registry = Arc::new(InvoiceRegistry::new());
        let source = Arc::new(StaticCoinSource::new(coins));
        let cached = Arc::new(CachedCoinSource::new(
            source.clone(),
            StdDuration::from_millis(0),
        ));
        let locks = Arc::new(UtxoLocks::new());
        let negotiator = Arc::new(PayjoinNegotiator::new(
            registry.clone(),
            cached,
            locks.clone(),
            bitcoin::Amount::from_sat(546),
        ));
        Harness {
            registry,
            source,
            locks,
            negotiator,
        }
    }

    /// Total due is 1 coin + 0.001 fee credit.
    const DUE: u64 = COIN + 100_000;

    fn fee_rate(sat_per_vb: u64) -> FeeRate {
        FeeRate::from_sat_per_vb(sat_per_vb).unwrap()
    }

    #[tokio::test]
    async fn successful_negotiation_merges_coin_into_payment_output() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        // Pays due plus plenty of overpay; change output present.
        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let original_txid = tx.compute_txid();
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();

        let proposal = match outcome {
            Outcome::Payjoin(tx) => tx,
            Outcome::Original(_) => panic!("expected a payjoin proposal"),
        };

        // The receiver input was appended and the coin locked.
        assert_eq!(proposal.input.len(), 2);
        assert_eq!(proposal.input[1].previous_output, outpoint(50, 0));
        assert!(h.locks.is_locked(&outpoint(50, 0)));

        // Extra fee (2 sat/vb * 68 vb = 136) came out of the overpayment;
        // the coin value was merged into the same payment output.
        let pay_out = proposal
            .output
            .iter()
            .find(|o| o.script_pubkey == script(100))
            .unwrap();
        assert_eq!(pay_out.value.to_sat(), DUE + 10_000 - 136 + 30_000_000);

        // Change untouched.
        let change = proposal
            .output
            .iter()
            .find(|o| o.script_pubkey == script(101))
            .unwrap();
        assert_eq!(change.value.to_sat(), 5_000_000);

        // The original payment is in the ledger, tagged and accounted.
        let invoice = h.registry.get(&InvoiceId("inv-1".to_string())).unwrap();
        let payment = invoice.ledger.get(&OutPoint {
            txid: original_txid,
            vout: 0,
        });
        let payment = payment.expect("original payment recorded");
        assert!(payment.accounted);
        assert_eq!(
            payment.payjoin.as_ref().unwrap().kind,
            PayjoinKind::Original
        );
        assert_eq!(
            payment.payjoin.as_ref().unwrap().our_outpoints,
            vec![outpoint(50, 0)]
        );
    }

    #[tokio::test]
    async fn scenario_b_exact_due_and_no_spare_rejects_without_lock() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        // Payment output exactly equals due, no change output: the extra
        // input's fee has nowhere to come from.
        let tx = candidate(vec![outpoint(1, 0)], vec![(DUE, script(100))]);
        let err = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            NegotiationError::Rejected(Rejection::NotEnoughMoney)
        ));
        assert!(h.locks.is_empty(), "no coin may be locked on rejection");
        assert_eq!(h.negotiator.pending_count(), 0);
    }

    #[tokio::test]
    async fn scenario_c_resubmission_yields_already_paid() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );

        let first = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx.clone(), fee_rate(2))
            .await
            .unwrap();
        assert!(matches!(first, Outcome::Payjoin(_)));

        let second = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(
            second,
            NegotiationError::Rejected(Rejection::AlreadyPaid)
        ));
        assert_eq!(h.negotiator.pending_count(), 1, "no second negotiation");
    }

    #[tokio::test]
    async fn committed_inputs_block_other_invoices() {
        let h = harness(vec![receiver_coin(50, 30_000_000), receiver_coin(51, 40_000_000)]);
        h.registry.insert(test_invoice("inv-1"));
        h.registry.insert(test_invoice("inv-2"));

        let tx1 = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        h.negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx1, fee_rate(2))
            .await
            .unwrap();

        // A different candidate reusing the same input against another invoice.
        let tx2 = candidate(
            vec![outpoint(1, 0), outpoint(2, 0)],
            vec![(DUE + 10_000, script(100)), (7_000_000, script(102))],
        );
        let err = h
            .negotiator
            .negotiate(&InvoiceId("inv-2".to_string()), tx2, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Rejected(Rejection::InputsAlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn unsigned_candidate_is_rejected() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        let mut tx = candidate(vec![outpoint(1, 0)], vec![(DUE + 10_000, script(100))]);
        tx.input[0].witness = Witness::new();
        let err = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidCandidate(_)));
        assert!(h.locks.is_empty());
    }

    #[tokio::test]
    async fn underpaying_candidate_is_rejected() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(vec![outpoint(1, 0)], vec![(DUE - 1, script(100))]);
        let err = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Rejected(Rejection::InvoiceNotFullyPaid)
        ));
    }

    #[tokio::test]
    async fn out_of_utxos_returns_original_unmodified() {
        let h = harness(vec![]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx.clone(), fee_rate(2))
            .await
            .unwrap();
        match outcome {
            Outcome::Original(returned) => assert_eq!(returned, tx),
            Outcome::Payjoin(_) => panic!("no coin was available"),
        }
        assert_eq!(h.negotiator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unconfirmed_coins_are_not_eligible() {
        let mut coin = receiver_coin(50, 30_000_000);
        coin.confirmations = 0;
        let h = harness(vec![coin]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Original(_)));
    }

    #[tokio::test]
    async fn candidate_spending_receiver_coin_is_rejected() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(
            vec![outpoint(50, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let err = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Rejected(Rejection::InputsAlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn fee_taken_from_overpay_first() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        // Overpay of 200 covers the 136-sat extra fee; change stays whole.
        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 200, script(100)), (1_000_000, script(101))],
        );
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();
        let proposal = match outcome {
            Outcome::Payjoin(tx) => tx,
            _ => panic!("expected proposal"),
        };
        let change = proposal
            .output
            .iter()
            .find(|o| o.script_pubkey == script(101))
            .unwrap();
        assert_eq!(change.value.to_sat(), 1_000_000);
        let pay = proposal
            .output
            .iter()
            .find(|o| o.script_pubkey == script(100))
            .unwrap();
        assert_eq!(pay.value.to_sat(), DUE + 200 - 136 + 30_000_000);
    }

    #[tokio::test]
    async fn shortfall_comes_from_change_after_overpay() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        // Overpay of 100 covers part of the 136-sat fee; remaining 36 is
        // shaved off the change output.
        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 100, script(100)), (1_000_000, script(101))],
        );
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();
        let proposal = match outcome {
            Outcome::Payjoin(tx) => tx,
            _ => panic!("expected proposal"),
        };
        let change = proposal
            .output
            .iter()
            .find(|o| o.script_pubkey == script(101))
            .unwrap();
        assert_eq!(change.value.to_sat(), 1_000_000 - 36);
    }

    #[tokio::test]
    async fn dust_change_is_dropped() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        // No overpay; fee of 136 leaves the 600-sat change below the 546
        // dust threshold, so the change output disappears entirely.
        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE, script(100)), (600, script(101))],
        );
        let outcome = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();
        let proposal = match outcome {
            Outcome::Payjoin(tx) => tx,
            _ => panic!("expected proposal"),
        };
        assert_eq!(proposal.output.len(), 1);
        assert_eq!(proposal.output[0].script_pubkey, script(100));
    }

    #[tokio::test]
    async fn concurrent_negotiations_never_share_a_coin() {
        let h = harness(vec![receiver_coin(50, 30_000_000), receiver_coin(51, 40_000_000)]);
        h.registry.insert(test_invoice("inv-1"));
        h.registry.insert(test_invoice("inv-2"));

        let tx1 = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let tx2 = candidate(
            vec![outpoint(2, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(102))],
        );

        let n1 = h.negotiator.clone();
        let n2 = h.negotiator.clone();
        let id1 = InvoiceId("inv-1".to_string());
        let id2 = InvoiceId("inv-2".to_string());
        let (r1, r2) = tokio::join!(
            n1.negotiate(&id1, tx1, fee_rate(2)),
            n2.negotiate(&id2, tx2, fee_rate(2)),
        );

        let coin_of = |outcome: &Outcome| match outcome {
            Outcome::Payjoin(tx) => tx.input.last().unwrap().previous_output,
            Outcome::Original(_) => panic!("two coins were available"),
        };
        let c1 = coin_of(&r1.unwrap());
        let c2 = coin_of(&r2.unwrap());
        assert_ne!(c1, c2, "negotiations must not share a coin");
        assert!(h.locks.is_locked(&c1));
        assert!(h.locks.is_locked(&c2));
    }

    #[tokio::test]
    async fn stale_negotiation_release_frees_coin_and_reverts_ledger() {
        let h = harness(vec![receiver_coin(50, 30_000_000)]);
        h.registry.insert(test_invoice("inv-1"));

        let tx = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        h.negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx, fee_rate(2))
            .await
            .unwrap();
        assert!(h.locks.is_locked(&outpoint(50, 0)));

        // Zero max age: everything pending is stale.
        let released = h.negotiator.release_stale(Duration::zero());
        assert_eq!(released.len(), 1);
        assert!(!h.locks.is_locked(&outpoint(50, 0)));
        assert_eq!(h.negotiator.pending_count(), 0);

        let invoice = h.registry.get(&InvoiceId("inv-1".to_string())).unwrap();
        let payment = invoice.ledger.get(&released[0].payment_outpoint).unwrap();
        assert!(!payment.accounted, "timed-out payment reverts");

        // A retried identical candidate negotiates again: the reverted record
        // comes back into accounting instead of masquerading as already-paid.
        let tx2 = candidate(
            vec![outpoint(1, 0)],
            vec![(DUE + 10_000, script(100)), (5_000_000, script(101))],
        );
        let second = h
            .negotiator
            .negotiate(&InvoiceId("inv-1".to_string()), tx2, fee_rate(2))
            .await
            .unwrap();
        assert!(matches!(second, Outcome::Payjoin(_)));
        assert!(h.locks.is_locked(&outpoint(50, 0)));
        assert_eq!(h.negotiator.pending_count(), 1);

        let payment = invoice.ledger.get(&released[0].payment_outpoint).unwrap();
        assert!(payment.accounted, "retried negotiation reinstates the record");
        let _ = h.source;
    }

    #[tokio::test]
    async fn unknown_invoice_is_an_error_not_a_rejection() {
        let h = harness(vec![]);
        let tx = candidate(vec![outpoint(1, 0)], vec![(DUE, script(100))]);
        let err = h
            .negotiator
            .negotiate(&InvoiceId("nope".to_string()), tx, fee_rate(2))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::UnknownInvoice(_)));
    }

    #[test]
    fn rejection_strings_are_stable() {
        assert_eq!(Rejection::AlreadyPaid.as_str(), "already-paid");
        assert_eq!(Rejection::InputsAlreadyUsed.as_str(), "inputs-already-used");
        assert_eq!(Rejection::NotEnoughMoney.as_str(), "not-enough-money");
        assert_eq!(
            Rejection::InvoiceNotFullyPaid.as_str(),
            "invoice-not-fully-paid"
        );
        assert_eq!(Outcome::OUT_OF_UTXOS, "out-of-utxos");
    }
}
