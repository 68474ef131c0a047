//! Cuotas mensuales sobre el ledger.
//!
//! El uso de un ref es la suma de sus deltas negativos desde el inicio del
//! mes en curso (UTC). Los créditos nunca se bloquean.

use std::sync::Mutex;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::LedgerEntry;
use crate::error::LedgerError;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub soft_limit: i64,
    pub hard_limit: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self { soft_limit: 10_000,
               hard_limit: 12_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Healthy,
    ApproachingLimit,
    SoftLimitExceeded,
    HardLimitExceeded,
}

impl QuotaStatus {
    /// Función pura del uso mensual frente a los límites.
    pub fn derive(usage: i64, limits: &QuotaLimits) -> Self {
        if usage >= limits.hard_limit {
            QuotaStatus::HardLimitExceeded
        } else if usage >= limits.soft_limit {
            QuotaStatus::SoftLimitExceeded
        } else if usage.saturating_mul(10) >= limits.soft_limit.saturating_mul(8) {
            QuotaStatus::ApproachingLimit
        } else {
            QuotaStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitOutcome {
    pub entry: LedgerEntry,
    pub balance: i64,
    pub usage: i64,
    pub status: QuotaStatus,
    /// Uso en o sobre el límite blando tras el débito.
    pub warning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(rename = "ref")]
    pub reference: String,
    pub period_start: DateTime<Utc>,
    pub usage: i64,
    pub credits: i64,
    pub balance: i64,
    pub limits: QuotaLimits,
    pub status: QuotaStatus,
    pub soft_pct: f64,
}

#[derive(Debug)]
pub struct BillingManager {
    ledger: Ledger,
    default_limits: QuotaLimits,
    overrides: DashMap<String, QuotaLimits>,
    // serializa check+append de escrituras dentro del proceso
    write_lock: Mutex<()>,
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
       .single()
       .unwrap_or(now)
}

impl BillingManager {
    pub fn new(ledger: Ledger, default_limits: QuotaLimits) -> Self {
        Self { ledger,
               default_limits,
               overrides: DashMap::new(),
               write_lock: Mutex::new(()) }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn set_limits(&self, reference: &str, limits: QuotaLimits) {
        self.overrides.insert(reference.to_string(), limits);
    }

    pub fn limits_for(&self, reference: &str) -> QuotaLimits {
        self.overrides.get(reference).map(|l| *l).unwrap_or(self.default_limits)
    }

    pub fn get_balance(&self, reference: &str) -> Result<i64, LedgerError> {
        self.ledger.get_balance(reference)
    }

    pub fn monthly_usage(&self, reference: &str) -> Result<i64, LedgerError> {
        let since = month_start(self.ledger.now());
        Ok(self.ledger.store().totals_since(reference, since)?.usage)
    }

    /// Débito con control de cuota. Se rechaza si el uso ya alcanzó el límite
    /// duro o si este débito lo superaría; en ese caso el ledger no cambia.
    pub fn debit(&self,
                 reference: &str,
                 amount: i64,
                 reason: &str,
                 metadata: Value,
                 idempotency_key: Option<String>)
                 -> Result<DebitOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let limits = self.limits_for(reference);
        let usage = self.monthly_usage(reference)?;
        let usage = match usage.checked_add(amount) {
            Some(after) if usage < limits.hard_limit && after <= limits.hard_limit => after,
            _ => {
                warn!("billing:debit rejected ref={reference} usage={usage} amount={amount} hard={}",
                      limits.hard_limit);
                return Err(LedgerError::QuotaExceeded { reference: reference.to_string(),
                                                        usage,
                                                        amount,
                                                        hard_limit: limits.hard_limit });
            }
        };
        let entry = self.ledger.record(reference, -amount, reason, metadata, idempotency_key)?;
        let status = QuotaStatus::derive(usage, &limits);
        let warning = usage >= limits.soft_limit;
        if warning {
            warn!("billing:soft limit reached ref={reference} usage={usage} soft={}", limits.soft_limit);
        }
        let balance = self.ledger.get_balance(reference)?;
        Ok(DebitOutcome { entry,
                          balance,
                          usage,
                          status,
                          warning })
    }

    pub fn credit(&self,
                  reference: &str,
                  amount: i64,
                  reason: &str,
                  metadata: Value,
                  idempotency_key: Option<String>)
                  -> Result<LedgerEntry, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let entry = self.ledger.record(reference, amount, reason, metadata, idempotency_key)?;
        info!("billing:credit ref={reference} amount={amount} reason={reason}");
        Ok(entry)
    }

    pub fn quota_status(&self, reference: &str) -> Result<QuotaStatus, LedgerError> {
        Ok(QuotaStatus::derive(self.monthly_usage(reference)?, &self.limits_for(reference)))
    }

    pub fn usage_report(&self, reference: &str) -> Result<UsageReport, LedgerError> {
        let period_start = month_start(self.ledger.now());
        let totals = self.ledger.store().totals_since(reference, period_start)?;
        let limits = self.limits_for(reference);
        let soft_pct = if limits.soft_limit > 0 {
            totals.usage as f64 / limits.soft_limit as f64
        } else {
            0.0
        };
        Ok(UsageReport { reference: reference.to_string(),
                         period_start,
                         usage: totals.usage,
                         credits: totals.credits,
                         balance: self.ledger.get_balance(reference)?,
                         limits,
                         status: QuotaStatus::derive(totals.usage, &limits),
                         soft_pct })
    }
}
