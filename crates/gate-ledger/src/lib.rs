//! gate-ledger: ledger append-only de moneda interna, cuotas mensuales y
//! acreditación por webhooks de pago.
pub mod billing;
pub mod entry;
pub mod error;
pub mod ledger;
pub mod store;
pub mod webhook;

pub use billing::{month_start, BillingManager, DebitOutcome, QuotaLimits, QuotaStatus, UsageReport};
pub use entry::{LedgerEntry, PeriodTotals};
pub use error::LedgerError;
pub use ledger::{Ledger, NowFn};
pub use store::{InMemoryLedgerStore, LedgerStore};
pub use webhook::{apply_payment_webhook, sign, verify_signature, PaymentEvent, WebhookOutcome};
