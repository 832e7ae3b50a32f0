//! Webhook ingress boundary.
//!
//! The HTTP server (out of scope here) calls into this module with the raw
//! body and the `X-Hub-Signature-256` header. Signature verification is
//! constant-time HMAC-SHA256; parsing yields the closed event set with its
//! enqueue priority.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{WebhookEvent, WebhookEventKind};

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature header against the raw body.
///
/// The comparison happens inside the MAC verification, which is
/// constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> OrchestratorResult<()> {
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(OrchestratorError::SignatureInvalid)?;
    let expected = hex::decode(hex_digest).map_err(|_| OrchestratorError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| OrchestratorError::InternalError(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| OrchestratorError::SignatureInvalid)
}

/// Compute the signature header value for a body (used by tests and the
/// outbound delivery path).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Parse a verified `(event, payload)` pair into a webhook event.
pub fn parse_event(
    event: &str,
    payload: serde_json::Value,
    delivery_id: Option<String>,
) -> OrchestratorResult<WebhookEvent> {
    let kind = WebhookEventKind::from_str(event).ok_or_else(|| {
        OrchestratorError::ValidationError(format!("unsupported webhook event: {event}"))
    })?;

    let repository = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|n| n.as_str())
        .ok_or_else(|| {
            OrchestratorError::ValidationError("payload missing repository.full_name".to_string())
        })?
        .to_string();

    let workflow = payload
        .get("workflow_job")
        .and_then(|j| j.get("workflow_name"))
        .or_else(|| payload.get("workflow_run").and_then(|r| r.get("name")))
        .and_then(|n| n.as_str())
        .map(str::to_string);

    let labels = payload
        .get("workflow_job")
        .and_then(|j| j.get("labels"))
        .and_then(|l| l.as_array())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    debug!(event, repository = %repository, "webhook event parsed");
    Ok(WebhookEvent {
        kind,
        repository,
        workflow,
        labels,
        delivery_id,
        payload,
    })
}

/// Verify and parse in one step, the shape the HTTP handler calls before
/// replying 202.
pub fn ingest(
    secret: &str,
    event: &str,
    body: &[u8],
    signature_header: &str,
    delivery_id: Option<String>,
) -> OrchestratorResult<WebhookEvent> {
    if !secret.is_empty() {
        verify_signature(secret, body, signature_header)?;
    }
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::ValidationError(format!("invalid payload: {e}")))?;
    parse_event(event, payload, delivery_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::JobPriority;
    use serde_json::json;

    const SECRET: &str = "webhook-secret";

    fn workflow_job_body() -> Vec<u8> {
        json!({
            "action": "queued",
            "repository": { "full_name": "acme/web" },
            "workflow_job": {
                "workflow_name": "build",
                "labels": ["self-hosted", "linux"],
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let body = workflow_job_body();
        let header = sign(SECRET, &body);
        assert!(verify_signature(SECRET, &body, &header).is_ok());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let body = workflow_job_body();
        let header = sign("other-secret", &body);
        let err = verify_signature(SECRET, &body, &header).unwrap_err();
        assert!(matches!(err, OrchestratorError::SignatureInvalid));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = workflow_job_body();
        let header = sign(SECRET, &body);
        let mut tampered = body.clone();
        tampered[0] ^= 1;
        assert!(verify_signature(SECRET, &tampered, &header).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let body = workflow_job_body();
        assert!(verify_signature(SECRET, &body, "md5=abc").is_err());
        assert!(verify_signature(SECRET, &body, "sha256=nothex").is_err());
        assert!(verify_signature(SECRET, &body, "").is_err());
    }

    #[test]
    fn test_ingest_parses_workflow_job() {
        let body = workflow_job_body();
        let header = sign(SECRET, &body);
        let event = ingest(
            SECRET,
            "workflow_job",
            &body,
            &header,
            Some("delivery-1".to_string()),
        )
        .unwrap();

        assert_eq!(event.kind, WebhookEventKind::WorkflowJob);
        assert_eq!(event.repository, "acme/web");
        assert_eq!(event.workflow.as_deref(), Some("build"));
        assert_eq!(event.labels, vec!["self-hosted", "linux"]);
        assert_eq!(event.priority(), JobPriority::Critical);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let body = workflow_job_body();
        let header = sign(SECRET, &body);
        let err = ingest(SECRET, "deployment", &body, &header, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError(_)));
    }

    #[test]
    fn test_missing_repository_rejected() {
        let body = json!({"action": "queued"}).to_string().into_bytes();
        let header = sign(SECRET, &body);
        let err = ingest(SECRET, "push", &body, &header, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError(_)));
    }

    #[test]
    fn test_empty_secret_skips_verification() {
        let body = workflow_job_body();
        let event = ingest("", "workflow_job", &body, "sha256=junk", None);
        assert!(event.is_ok());
    }
}
