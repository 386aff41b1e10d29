//! Invoice terms and the in-memory invoice registry
//!
//! An invoice carries a fiat price, a payment tolerance, and one set of terms
//! per enabled payment method. Method terms are a closed tagged variant: each
//! variant has its own accounting rule, selected by `match`, never by runtime
//! type inspection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bitcoin::ScriptBuf;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::PaymentLedger;
use crate::money::{Amount, Asset, Rate};

/// Stable invoice identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub String);

impl std::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which accounting rule a method follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Direct on-chain output to the invoice address
    OnChain,
    /// Off-chain transport (Lightning); no per-transaction network fee accrual
    OffChain,
}

/// Stable key identifying which method a payment arrived under.
///
/// Fee credits never cross methods: each method accounts only over its own
/// payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    /// Base asset of the method
    pub asset: Asset,
    /// Transport kind
    pub kind: MethodKind,
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            MethodKind::OnChain => write!(f, "{}", self.asset),
            MethodKind::OffChain => write!(f, "{}-offchain", self.asset),
        }
    }
}

/// Terms for a direct on-chain payment method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainMethod {
    /// Base asset paid in
    pub asset: Asset,
    /// Fiat rate fixed at invoice creation
    pub rate: Rate,
    /// Fee the receiver will pay to redeem one more output of this invoice
    /// later (e.g. when batching), charged once per expected transaction
    pub next_network_fee: Amount,
    /// Destination script of the invoice address
    pub script_pubkey: ScriptBuf,
    /// Whether payjoin negotiation is offered for this method
    pub payjoin_enabled: bool,
}

/// Terms for an off-chain payment method. The transport itself is an external
/// collaborator; only its accounting lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffChainMethod {
    /// Base asset paid in
    pub asset: Asset,
    /// Fiat rate fixed at invoice creation
    pub rate: Rate,
}

/// Per-method terms, one accounting rule per variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// On-chain output payments
    OnChain(OnChainMethod),
    /// Off-chain payments
    OffChain(OffChainMethod),
}

impl PaymentMethod {
    /// The stable method key
    pub fn id(&self) -> MethodId {
        match self {
            PaymentMethod::OnChain(m) => MethodId {
                asset: m.asset,
                kind: MethodKind::OnChain,
            },
            PaymentMethod::OffChain(m) => MethodId {
                asset: m.asset,
                kind: MethodKind::OffChain,
            },
        }
    }

    /// The method's base asset
    pub fn asset(&self) -> Asset {
        match self {
            PaymentMethod::OnChain(m) => m.asset,
            PaymentMethod::OffChain(m) => m.asset,
        }
    }

    /// The method's fiat rate
    pub fn rate(&self) -> Rate {
        match self {
            PaymentMethod::OnChain(m) => m.rate,
            PaymentMethod::OffChain(m) => m.rate,
        }
    }
}

/// Invoice terms fixed at creation.
///
/// `payment_tolerance` is the only field mutable after creation; it is copied
/// from the store default when the invoice is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceTerms {
    /// Fiat price
    pub price: Decimal,
    /// Quote currency code, e.g. "USD"
    pub currency: String,
    /// Percent (0-100) the effective due may be underpaid and still settle
    pub payment_tolerance: Decimal,
    /// Enabled payment methods
    pub methods: Vec<PaymentMethod>,
}

impl InvoiceTerms {
    /// Look up a method by its stable key
    pub fn method(&self, id: MethodId) -> Option<&PaymentMethod> {
        self.methods.iter().find(|m| m.id() == id)
    }

    /// Clamp tolerance into the valid 0-100 range
    pub fn clamped_tolerance(&self) -> Decimal {
        self.payment_tolerance
            .clamp(Decimal::ZERO, Decimal::from(100))
    }
}

/// One invoice: its terms plus the ledger of payments recorded against it
#[derive(Debug, Clone)]
pub struct Invoice {
    /// Stable identifier
    pub id: InvoiceId,
    /// Terms fixed at creation
    pub terms: InvoiceTerms,
    /// Append-only payment ledger
    pub ledger: Arc<PaymentLedger>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// Create an invoice with an empty ledger
    pub fn new(id: InvoiceId, terms: InvoiceTerms) -> Self {
        Self {
            id,
            terms,
            ledger: Arc::new(PaymentLedger::new()),
            created_at: Utc::now(),
        }
    }

    /// The on-chain method whose destination script matches, if any
    pub fn on_chain_method_for_script(&self, script: &bitcoin::Script) -> Option<&OnChainMethod> {
        self.terms.methods.iter().find_map(|m| match m {
            PaymentMethod::OnChain(oc) if oc.script_pubkey.as_script() == script => Some(oc),
            _ => None,
        })
    }
}

/// Concurrent in-memory invoice store.
///
/// Persistence technology is out of scope for this core; the registry is the
/// seam where a durable store plugs in.
#[derive(Debug, Default)]
pub struct InvoiceRegistry {
    invoices: RwLock<HashMap<InvoiceId, Invoice>>,
}

impl InvoiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoice, replacing any previous entry with the same id
    pub fn insert(&self, invoice: Invoice) {
        let mut map = self.invoices.write().expect("invoice registry poisoned");
        map.insert(invoice.id.clone(), invoice);
    }

    /// Fetch an invoice by id
    pub fn get(&self, id: &InvoiceId) -> Option<Invoice> {
        let map = self.invoices.read().expect("invoice registry poisoned");
        map.get(id).cloned()
    }

    /// Update the payment tolerance of an existing invoice. Tolerance is the
    /// only term mutable after creation.
    pub fn set_payment_tolerance(&self, id: &InvoiceId, tolerance: Decimal) -> bool {
        let mut map = self.invoices.write().expect("invoice registry poisoned");
        match map.get_mut(id) {
            Some(invoice) => {
                invoice.terms.payment_tolerance = tolerance;
                true
            }
            None => false,
        }
    }

    /// Every registered invoice
    pub fn all(&self) -> Vec<Invoice> {
        let map = self.invoices.read().expect("invoice registry poisoned");
        map.values().cloned().collect()
    }

    /// All invoices carrying an on-chain method that pays the given script
    pub fn find_by_script(&self, script: &bitcoin::Script) -> Vec<Invoice> {
        let map = self.invoices.read().expect("invoice registry poisoned");
        map.values()
            .filter(|inv| inv.on_chain_method_for_script(script).is_some())
            .cloned()
            .collect()
    }
}
