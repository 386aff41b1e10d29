//! Append-only per-invoice payment ledger
//!
//! One record per on-chain output (or equivalent contribution). Records are
//! never deleted: a payment superseded by a conflicting transaction stays in
//! the ledger with `accounted = false` for audit. The only in-place mutations
//! are the accounted flag and the confirmation counter, and both happen under
//! the same lock every accounting read takes, so a calculation always sees a
//! fully applied flip.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invoice::MethodId;
use crate::money::Amount;

/// How a payment relates to a payjoin negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayjoinKind {
    /// The payer's original transaction, recorded when a proposal is issued
    Original,
    /// The collaborative transaction that superseded an original
    Coinjoin,
}

/// Payjoin provenance attached to a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayjoinInformation {
    /// Original or coinjoin side of the negotiation
    pub kind: PayjoinKind,
    /// Receiver-owned coins contributed to the transaction
    pub our_outpoints: Vec<OutPoint>,
}

/// One settled or tentative contribution toward an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Stable identifier: the output that pays us. Idempotency key for
    /// re-processing chain events.
    pub outpoint: OutPoint,
    /// Which payment method this arrived under
    pub method: MethodId,
    /// Full value of the contribution, in the method's base asset
    pub value: Amount,
    /// Portion of `value` the payer effectively covered toward the receiver's
    /// future redemption fee
    pub network_fee_contribution: Amount,
    /// False once superseded by a conflicting or replaced transaction
    pub accounted: bool,
    /// Confirmation count of the containing transaction
    pub confirmations: u32,
    /// When the contribution was first observed
    pub received_at: DateTime<Utc>,
    /// Payjoin provenance, if this payment was part of a negotiation
    pub payjoin: Option<PayjoinInformation>,
}

struct LedgerInner {
    /// Chronological arena; never shrinks
    payments: Vec<Payment>,
    /// Outpoint -> arena index
    index: HashMap<OutPoint, usize>,
}

/// Append-only collection of payments recorded against one invoice
pub struct PaymentLedger {
    inner: Mutex<LedgerInner>,
}

impl std::fmt::Debug for PaymentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("ledger poisoned");
        f.debug_struct("PaymentLedger")
            .field("payments", &inner.payments.len())
            .finish()
    }
}

impl Default for PaymentLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                payments: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Append a payment. Returns `false` without touching the ledger when the
    /// outpoint is already recorded, making chain-event re-delivery harmless.
    pub fn append(&self, payment: Payment) -> bool {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        if inner.index.contains_key(&payment.outpoint) {
            return false;
        }
        let idx = inner.payments.len();
        inner.index.insert(payment.outpoint, idx);
        inner.payments.push(payment);
        true
    }

    /// Atomically flip the accounted flag of one payment. Returns `false` when
    /// the outpoint is unknown or the flag already holds the requested value.
    pub fn set_accounted(&self, outpoint: &OutPoint, accounted: bool) -> bool {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let Some(&idx) = inner.index.get(outpoint) else {
            return false;
        };
        let payment = &mut inner.payments[idx];
        if payment.accounted == accounted {
            return false;
        }
        payment.accounted = accounted;
        true
    }

    /// Bring an un-accounted record back into accounting. Used when the
    /// transaction behind a previously reverted payment turns out to be live
    /// on-chain after all. Refused when the record was superseded by a
    /// coinjoin that is itself still accounted (the two spend the same
    /// receiver coin and must never count together). Returns `true` when the
    /// flag flipped.
    pub fn reinstate(&self, outpoint: &OutPoint) -> bool {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let Some(&idx) = inner.index.get(outpoint) else {
            return false;
        };
        if inner.payments[idx].accounted {
            return false;
        }
        if let Some(info) = inner.payments[idx].payjoin.clone() {
            let superseded = inner.payments.iter().any(|p| {
                p.accounted
                    && p.payjoin.as_ref().is_some_and(|pj| {
                        pj.kind == PayjoinKind::Coinjoin
                            && pj.our_outpoints.iter().any(|op| info.our_outpoints.contains(op))
                    })
            });
            if superseded {
                return false;
            }
        }
        inner.payments[idx].accounted = true;
        true
    }

    /// Un-account every payment made by the given transaction. Returns the
    /// outpoints that were flipped.
    pub fn evict_transaction(&self, txid: &Txid) -> Vec<OutPoint> {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let mut flipped = Vec::new();
        for payment in inner.payments.iter_mut() {
            if payment.outpoint.txid == *txid && payment.accounted {
                payment.accounted = false;
                flipped.push(payment.outpoint);
            }
        }
        flipped
    }

    /// Record a confirmation count for every payment of the given transaction
    pub fn set_confirmations(&self, txid: &Txid, confirmations: u32) -> usize {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let mut updated = 0;
        for payment in inner.payments.iter_mut() {
            if payment.outpoint.txid == *txid {
                payment.confirmations = confirmations;
                updated += 1;
            }
        }
        updated
    }

    /// Chronological snapshot of every payment, superseded ones included.
    ///
    /// Taken under the same lock the flag flips take; the accounting
    /// calculation runs on this snapshot and is therefore pure.
    pub fn snapshot(&self) -> Vec<Payment> {
        let inner = self.inner.lock().expect("ledger poisoned");
        inner.payments.clone()
    }

    /// Look up one payment by its outpoint
    pub fn get(&self, outpoint: &OutPoint) -> Option<Payment> {
        let inner = self.inner.lock().expect("ledger poisoned");
        inner
            .index
            .get(outpoint)
            .map(|&idx| inner.payments[idx].clone())
    }

    /// Number of recorded payments, superseded ones included
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ledger poisoned").payments.len()
    }

    /// Whether the ledger holds no payments at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::MethodKind;
    use crate::money::Asset;
    use bitcoin::hashes::Hash;

    fn outpoint(n: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout,
        }
    }

    fn payment(op: OutPoint, units: i128) -> Payment {
        Payment {
            outpoint: op,
            method: MethodId {
                asset: Asset::Bitcoin,
                kind: MethodKind::OnChain,
            },
            value: Amount::from_units(units, Asset::Bitcoin),
            network_fee_contribution: Amount::zero(Asset::Bitcoin),
            accounted: true,
            confirmations: 0,
            received_at: Utc::now(),
            payjoin: None,
        }
    }

    #[test]
    fn append_is_idempotent_by_outpoint() {
        let ledger = PaymentLedger::new();
        let op = outpoint(1, 0);
        assert!(ledger.append(payment(op, 100)));
        assert!(!ledger.append(payment(op, 999)));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(&op).unwrap().value.units(), 100);
    }

    #[test]
    fn accounted_flip_reports_change() {
        let ledger = PaymentLedger::new();
        let op = outpoint(1, 0);
        ledger.append(payment(op, 100));

        assert!(!ledger.set_accounted(&op, true), "already accounted");
        assert!(ledger.set_accounted(&op, false));
        assert!(!ledger.get(&op).unwrap().accounted);
        assert!(!ledger.set_accounted(&outpoint(9, 0), false), "unknown");
    }

    #[test]
    fn evict_flips_all_outputs_of_tx() {
        let ledger = PaymentLedger::new();
        ledger.append(payment(outpoint(1, 0), 100));
        ledger.append(payment(outpoint(1, 1), 200));
        ledger.append(payment(outpoint(2, 0), 300));

        let flipped = ledger.evict_transaction(&Txid::from_byte_array([1; 32]));
        assert_eq!(flipped.len(), 2);
        assert!(!ledger.get(&outpoint(1, 0)).unwrap().accounted);
        assert!(!ledger.get(&outpoint(1, 1)).unwrap().accounted);
        assert!(ledger.get(&outpoint(2, 0)).unwrap().accounted);

        // already flipped: second eviction is a no-op
        assert!(ledger
            .evict_transaction(&Txid::from_byte_array([1; 32]))
            .is_empty());
    }

    #[test]
    fn reinstate_revives_evicted_payment() {
        let ledger = PaymentLedger::new();
        let op = outpoint(1, 0);
        ledger.append(payment(op, 100));
        ledger.evict_transaction(&Txid::from_byte_array([1; 32]));
        assert!(!ledger.get(&op).unwrap().accounted);

        assert!(ledger.reinstate(&op));
        assert!(ledger.get(&op).unwrap().accounted);
        assert!(!ledger.reinstate(&op), "already accounted");
        assert!(!ledger.reinstate(&outpoint(9, 0)), "unknown");
    }

    #[test]
    fn reinstate_refuses_original_superseded_by_live_coinjoin() {
        let ledger = PaymentLedger::new();
        let coin = outpoint(200, 0);

        let mut original = payment(outpoint(1, 0), 100);
        original.payjoin = Some(PayjoinInformation {
            kind: PayjoinKind::Original,
            our_outpoints: vec![coin],
        });
        ledger.append(original);

        let mut coinjoin = payment(outpoint(2, 0), 100);
        coinjoin.payjoin = Some(PayjoinInformation {
            kind: PayjoinKind::Coinjoin,
            our_outpoints: vec![coin],
        });
        ledger.append(coinjoin);
        ledger.set_accounted(&outpoint(1, 0), false);

        assert!(
            !ledger.reinstate(&outpoint(1, 0)),
            "superseding coinjoin is still accounted"
        );

        // Once the coinjoin itself is evicted the original may come back.
        ledger.evict_transaction(&Txid::from_byte_array([2; 32]));
        assert!(ledger.reinstate(&outpoint(1, 0)));
        assert!(ledger.get(&outpoint(1, 0)).unwrap().accounted);
    }

    #[test]
    fn snapshot_preserves_chronological_order() {
        let ledger = PaymentLedger::new();
        for n in 0..5u8 {
            ledger.append(payment(outpoint(n, 0), n as i128));
        }
        let snap = ledger.snapshot();
        let values: Vec<i128> = snap.iter().map(|p| p.value.units()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
