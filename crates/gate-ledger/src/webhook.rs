//! Webhooks de pago firmados con HMAC-SHA256 sobre el cuerpo crudo.

use hmac::{Hmac, Mac};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::billing::BillingManager;
use crate::entry::LedgerEntry;
use crate::error::LedgerError;

type HmacSha256 = Hmac<Sha256>;

/// Firma hex de `body` (formato de la cabecera `x-signature`).
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC acepta claves de cualquier longitud
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verificación en tiempo constante. Acepta el prefijo opcional `sha256=`.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), LedgerError> {
    let sig = signature.trim();
    let sig = sig.strip_prefix("sha256=").unwrap_or(sig);
    let raw = hex::decode(sig).map_err(|_| LedgerError::InvalidSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| LedgerError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&raw).map_err(|_| LedgerError::InvalidSignature)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Id único del proveedor: se usa como clave de idempotencia.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub org_id: String,
    pub amount: i64,
}

pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Credited(LedgerEntry),
    /// Evento ya aplicado antes (reentrega del proveedor).
    Duplicate,
    /// Tipo de evento sin efecto en el ledger.
    Ignored,
}

/// Verifica la firma, parsea el evento y acredita la org una sola vez por id.
pub fn apply_payment_webhook(billing: &BillingManager,
                             secret: &[u8],
                             body: &[u8],
                             signature: &str)
                             -> Result<WebhookOutcome, LedgerError> {
    if let Err(e) = verify_signature(secret, body, signature) {
        warn!("billing:webhook signature rejected");
        return Err(e);
    }
    let event: PaymentEvent = serde_json::from_slice(body).map_err(|e| LedgerError::InvalidPayload(e.to_string()))?;
    if event.kind != PAYMENT_SUCCEEDED {
        info!("billing:webhook ignored id={} type={}", event.id, event.kind);
        return Ok(WebhookOutcome::Ignored);
    }
    match billing.credit(&event.org_id,
                         event.amount,
                         "payment_webhook",
                         json!({ "event_id": event.id }),
                         Some(event.id.clone()))
    {
        Ok(entry) => Ok(WebhookOutcome::Credited(entry)),
        Err(LedgerError::DuplicateIdempotencyKey { .. }) => {
            info!("billing:webhook duplicate id={}", event.id);
            Ok(WebhookOutcome::Duplicate)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip_and_tamper_detection() {
        let body = br#"{"id":"evt_1"}"#;
        let sig = sign(b"whsec", body);
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(b"whsec", body, &sig).is_ok());
        assert!(verify_signature(b"whsec", body, &format!("sha256={sig}")).is_ok());
        assert!(verify_signature(b"other", body, &sig).is_err());
        assert!(verify_signature(b"whsec", br#"{"id":"evt_2"}"#, &sig).is_err());
        assert!(verify_signature(b"whsec", body, "not-hex").is_err());
    }
}
