//! Payment accounting calculator
//!
//! Pure and deterministic: a ledger snapshot plus invoice terms in, a due/paid
//! snapshot out. No I/O, no clock, no shared state. The same inputs always
//! produce the same snapshot.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::invoice::{InvoiceTerms, PaymentMethod};
use crate::ledger::Payment;
use crate::money::{Amount, MoneyError};

/// Accounting invariant violations. These abort the calculation rather than
/// returning a misleading snapshot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountingError {
    /// Money arithmetic failed, typically an asset mismatch
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// The seeded total due came out negative
    #[error("negative total due: {0} units")]
    NegativeTotalDue(i128),

    /// A payment's fee contribution exceeds its value
    #[error("fee contribution exceeds payment value at {outpoint}")]
    FeeExceedsValue {
        /// Offending payment
        outpoint: bitcoin::OutPoint,
    },
}

/// Derived per-method accounting state. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Remaining amount required at face value
    pub due: Amount,
    /// `due` reduced by the payment tolerance; paying this much settles
    pub minimum_total_due: Amount,
    /// Everything the payer must eventually have sent, fee credits included
    pub total_due: Amount,
    /// Sum of accounted payment values
    pub paid: Amount,
    /// Paid amount excluding fee credits
    pub crypto_paid: Amount,
    /// Minimum number of distinct transactions still expected to clear
    /// `total_due`
    pub tx_required: u32,
    /// Number of accounted contributions so far
    pub tx_count: u32,
    /// Whether `paid` has reached `minimum_total_due`
    pub settled: bool,
}

/// Compute the accounting snapshot for one payment method.
///
/// Only payments recorded under this method participate; fee credits never
/// cross methods. `payments` must be in chronological order, which is what
/// [`crate::ledger::PaymentLedger::snapshot`] yields.
pub fn calculate(
    payments: &[Payment],
    terms: &InvoiceTerms,
    method: &PaymentMethod,
) -> Result<Snapshot, AccountingError> {
    let asset = method.asset();
    let method_id = method.id();

    // TotalDue seeds at the converted face price, plus one network fee for the
    // first expected transaction where the method charges per transaction.
    let face = method.rate().convert(terms.price, asset)?;
    let per_tx_fee = match method {
        PaymentMethod::OnChain(m) => m.next_network_fee,
        PaymentMethod::OffChain(_) => Amount::zero(asset),
    };
    let mut total_due = face.checked_add(per_tx_fee)?;
    if total_due.units() < 0 {
        return Err(AccountingError::NegativeTotalDue(total_due.units()));
    }

    let mut paid = Amount::zero(asset);
    let mut crypto_paid = Amount::zero(asset);
    let mut tx_required: u32 = 1;
    let mut tx_count: u32 = 0;

    for payment in payments {
        if payment.method != method_id || !payment.accounted {
            continue;
        }
        if payment.network_fee_contribution.units() > payment.value.units() {
            return Err(AccountingError::FeeExceedsValue {
                outpoint: payment.outpoint,
            });
        }
        paid = paid.checked_add(payment.value)?;
        crypto_paid =
            crypto_paid.checked_add(payment.value.checked_sub(payment.network_fee_contribution)?)?;
        tx_count += 1;

        // A contribution that leaves the invoice short means the rest arrives
        // in a separate output, which the receiver will have to redeem with
        // one more network fee. Exact zeroing adds nothing.
        if paid.checked_cmp(&total_due)? == std::cmp::Ordering::Less {
            total_due = total_due.checked_add(per_tx_fee)?;
            tx_required += 1;
        }
    }

    let due = total_due.checked_sub(paid)?.max_zero();
    let minimum_total_due = apply_tolerance(total_due, terms.clamped_tolerance());
    let settled = paid.checked_cmp(&minimum_total_due)? != std::cmp::Ordering::Less;

    Ok(Snapshot {
        due,
        minimum_total_due,
        total_due,
        paid,
        crypto_paid,
        tx_required,
        tx_count,
        settled,
    })
}

/// `total_due` reduced by the tolerance percentage, floored to the unit, never
/// below one unit while anything is owed. A tolerance of 100 still requires a
/// single unit so an invoice can never be born settled.
fn apply_tolerance(total_due: Amount, tolerance: Decimal) -> Amount {
    if total_due.units() <= 0 {
        return total_due.max_zero();
    }
    let factor = (Decimal::from(100) - tolerance) / Decimal::from(100);
    let reduced = Decimal::from_i128_with_scale(total_due.units(), 0) * factor;
    let units = reduced.floor().to_i128().unwrap_or(0).max(1);
    Amount::from_units(units, total_due.asset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{MethodId, MethodKind, OffChainMethod, OnChainMethod};
    use crate::ledger::Payment;
    use crate::money::{Asset, Rate};
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, ScriptBuf, Txid};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    const COIN: i128 = 100_000_000;

    fn on_chain_method(next_fee_units: i128) -> PaymentMethod {
        PaymentMethod::OnChain(OnChainMethod {
            asset: Asset::Bitcoin,
            rate: Rate::new(dec!(5000)).unwrap(),
            next_network_fee: Amount::from_units(next_fee_units, Asset::Bitcoin),
            script_pubkey: ScriptBuf::new(),
            payjoin_enabled: true,
        })
    }

    fn terms(method: PaymentMethod, tolerance: Decimal) -> InvoiceTerms {
        InvoiceTerms {
            price: dec!(5000),
            currency: "USD".to_string(),
            payment_tolerance: tolerance,
            methods: vec![method],
        }
    }

    fn payment(n: u8, value: i128, fee: i128, accounted: bool) -> Payment {
        Payment {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([n; 32]),
                vout: 0,
            },
            method: MethodId {
                asset: Asset::Bitcoin,
                kind: MethodKind::OnChain,
            },
            value: Amount::from_units(value, Asset::Bitcoin),
            network_fee_contribution: Amount::from_units(fee, Asset::Bitcoin),
            accounted,
            confirmations: 0,
            received_at: Utc::now(),
            payjoin: None,
        }
    }

    #[test]
    fn scenario_a_partial_payment_accrues_second_fee() {
        // Price 5000 at rate 5000 = 1 coin, next fee 0.1.
        // One payment of 0.5 carrying 0.1 fee contribution.
        let method = on_chain_method(COIN / 10);
        let t = terms(method.clone(), dec!(0));
        let payments = vec![payment(1, COIN / 2, COIN / 10, true)];

        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.total_due.units(), 120_000_000, "1.2 coins");
        assert_eq!(snap.due.units(), 70_000_000, "0.7 coins");
        assert_eq!(snap.paid.units(), 50_000_000);
        assert_eq!(snap.crypto_paid.units(), 40_000_000);
        assert_eq!(snap.tx_required, 2);
        assert!(!snap.settled);
    }

    #[test]
    fn exact_payment_adds_no_extra_fee() {
        let method = on_chain_method(COIN / 10);
        let t = terms(method.clone(), dec!(0));
        // Exactly the seeded total due of 1.1 coins in one contribution.
        let payments = vec![payment(1, COIN + COIN / 10, COIN / 10, true)];

        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.total_due.units(), 110_000_000);
        assert_eq!(snap.due.units(), 0);
        assert_eq!(snap.tx_required, 1);
        assert!(snap.settled);
    }

    #[test]
    fn overpayment_clamps_due_and_keeps_excess_visible() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        let payments = vec![payment(1, 3 * COIN, 0, true)];

        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.due.units(), 0);
        assert_eq!(snap.paid.units(), 3 * COIN);
        assert_eq!(snap.crypto_paid.units(), 3 * COIN);
        assert!(snap.settled);
    }

    #[test]
    fn unaccounted_payments_do_not_count() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        let payments = vec![
            payment(1, COIN / 2, 0, true),
            payment(2, COIN / 2, 0, false),
        ];

        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.paid.units(), COIN / 2);
        assert_eq!(snap.tx_count, 1);
        assert!(!snap.settled);
    }

    #[test]
    fn paid_equals_sum_of_accounted_and_due_is_clamped_difference() {
        let method = on_chain_method(COIN / 100);
        let t = terms(method.clone(), dec!(0));
        let payments = vec![
            payment(1, 30_000_000, 0, true),
            payment(2, 20_000_000, 0, false),
            payment(3, 25_000_000, 1_000_000, true),
        ];

        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.paid.units(), 55_000_000);
        assert_eq!(
            snap.due.units(),
            (snap.total_due.units() - snap.paid.units()).max(0)
        );
    }

    #[test]
    fn calculate_is_idempotent() {
        let method = on_chain_method(COIN / 10);
        let t = terms(method.clone(), dec!(7.5));
        let payments = vec![
            payment(1, COIN / 4, 0, true),
            payment(2, COIN / 4, COIN / 20, true),
        ];

        let first = calculate(&payments, &t, &method).unwrap();
        let second = calculate(&payments, &t, &method).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tolerance_zero_requires_full_total_due() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        let snap = calculate(&[], &t, &method).unwrap();
        assert_eq!(snap.minimum_total_due, snap.total_due);
    }

    #[test]
    fn tolerance_hundred_still_requires_one_unit() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(100));
        let snap = calculate(&[], &t, &method).unwrap();
        assert_eq!(snap.minimum_total_due.units(), 1);
        assert!(!snap.settled, "an unpaid invoice is never born settled");
    }

    #[test]
    fn tolerance_allows_underpayment_to_settle() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(10));
        // total due 1 coin; 10% tolerance accepts 0.9
        let payments = vec![payment(1, 90_000_000, 0, true)];
        let snap = calculate(&payments, &t, &method).unwrap();
        assert_eq!(snap.minimum_total_due.units(), 90_000_000);
        assert!(snap.settled);
        assert_eq!(snap.due.units(), 10_000_000, "face due remains visible");
    }

    #[test]
    fn off_chain_method_accrues_no_network_fee() {
        let method = PaymentMethod::OffChain(OffChainMethod {
            asset: Asset::Bitcoin,
            rate: Rate::new(dec!(5000)).unwrap(),
        });
        let mut t = terms(method.clone(), dec!(0));
        t.methods = vec![method.clone()];
        let mut p = payment(1, COIN / 2, 0, true);
        p.method = method.id();

        let snap = calculate(&[p], &t, &method).unwrap();
        assert_eq!(snap.total_due.units(), COIN, "no fee seeded or accrued");
        assert_eq!(snap.due.units(), COIN / 2);
        assert_eq!(snap.tx_required, 2, "a further contribution is expected");
    }

    #[test]
    fn payments_under_other_methods_are_ignored() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        let mut foreign = payment(1, COIN, 0, true);
        foreign.method = MethodId {
            asset: Asset::LiquidBitcoin,
            kind: MethodKind::OnChain,
        };

        let snap = calculate(&[foreign], &t, &method).unwrap();
        assert_eq!(snap.paid.units(), 0);
    }

    #[test]
    fn wrong_asset_payment_aborts() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        // Same method id as far as the record claims, wrong asset inside.
        let mut p = payment(1, COIN, 0, true);
        p.value = Amount::from_units(COIN, Asset::LiquidBitcoin);

        assert!(matches!(
            calculate(&[p], &t, &method),
            Err(AccountingError::Money(MoneyError::AssetMismatch { .. }))
        ));
    }

    #[test]
    fn fee_contribution_above_value_aborts() {
        let method = on_chain_method(0);
        let t = terms(method.clone(), dec!(0));
        let p = payment(1, 100, 200, true);
        assert!(matches!(
            calculate(&[p], &t, &method),
            Err(AccountingError::FeeExceedsValue { .. })
        ));
    }
}
