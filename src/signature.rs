//! Webhook signature verification.
//!
//! Each monitoring platform signs its webhook payloads with a shared secret;
//! requests failing verification are rejected with 401 before parsing.
//! `SKIP_SIGNATURE_VERIFICATION=true` bypasses all checks for development.

use crate::config::AppConfig;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Verify the signature header for a webhook source against the raw body.
pub fn verify_webhook_signature(
    config: &AppConfig,
    source: &str,
    body: &[u8],
    signature: Option<&str>,
) -> bool {
    if config.skip_signature_verification {
        return true;
    }

    match source {
        "datadog" => verify_hex_hmac(config.webhook_secret(source), source, body, signature),
        "sentry" => {
            // Sentry header format: <timestamp>,<signature>
            let Some(header) = signature else {
                warn!(source = source, "Missing webhook signature");
                return false;
            };
            let mut parts = header.splitn(2, ',');
            let (Some(_timestamp), Some(sig)) = (parts.next(), parts.next()) else {
                warn!(source = source, "Invalid signature format");
                return false;
            };
            verify_hex_hmac(config.webhook_secret(source), source, body, Some(sig))
        }
        // PagerDuty's scheme is not implemented upstream; webhooks are
        // accepted as-is.
        "pagerduty" => {
            warn!("PagerDuty signature verification not implemented, accepting");
            true
        }
        _ => false,
    }
}

/// HMAC-SHA256 over the body, hex-encoded, compared in constant time.
fn verify_hex_hmac(
    secret: Option<&str>,
    source: &str,
    body: &[u8],
    signature: Option<&str>,
) -> bool {
    let Some(signature) = signature else {
        warn!(source = source, "Missing webhook signature");
        return false;
    };

    let Some(secret) = secret else {
        warn!(source = source, "Webhook secret not configured");
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex_encode(&mac.finalize().into_bytes());

    let valid = constant_time_eq(expected.as_bytes(), signature.as_bytes());
    if !valid {
        warn!(source = source, "Invalid webhook signature");
    }
    valid
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex_encode(&mac.finalize().into_bytes())
    }

    fn config_with_secrets() -> AppConfig {
        AppConfig {
            datadog_webhook_secret: Some("dd-secret".to_string()),
            sentry_webhook_secret: Some("sentry-secret".to_string()),
            ..AppConfig::default()
        }
    }

    #[test]
    fn valid_datadog_signature_is_accepted() {
        let config = config_with_secrets();
        let body = br#"{"id": "A1"}"#;
        let sig = sign("dd-secret", body);
        assert!(verify_webhook_signature(&config, "datadog", body, Some(&sig)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let config = config_with_secrets();
        let sig = sign("dd-secret", br#"{"id": "A1"}"#);
        assert!(!verify_webhook_signature(
            &config,
            "datadog",
            br#"{"id": "A2"}"#,
            Some(&sig)
        ));
    }

    #[test]
    fn missing_signature_or_secret_is_rejected() {
        let config = config_with_secrets();
        assert!(!verify_webhook_signature(&config, "datadog", b"{}", None));

        let bare = AppConfig::default();
        let sig = sign("dd-secret", b"{}");
        assert!(!verify_webhook_signature(&bare, "datadog", b"{}", Some(&sig)));
    }

    #[test]
    fn sentry_header_carries_timestamp_prefix() {
        let config = config_with_secrets();
        let body = br#"{"id": "s1"}"#;
        let sig = sign("sentry-secret", body);
        let header = format!("1704067200,{}", sig);
        assert!(verify_webhook_signature(&config, "sentry", body, Some(&header)));
        assert!(!verify_webhook_signature(&config, "sentry", body, Some(&sig)));
    }

    #[test]
    fn skip_flag_bypasses_all_checks() {
        let config = AppConfig {
            skip_signature_verification: true,
            ..AppConfig::default()
        };
        assert!(verify_webhook_signature(&config, "datadog", b"{}", None));
        assert!(verify_webhook_signature(&config, "sentry", b"{}", None));
    }

    #[test]
    fn unknown_sources_are_rejected() {
        let config = config_with_secrets();
        assert!(!verify_webhook_signature(&config, "grafana", b"{}", Some("abc")));
    }
}
