use serde::Deserialize;
use std::time::Duration;

/// Tunables for the settlement engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long funds may sit in escrow before the SLA is considered breached.
    pub escrow_sla_hours: i64,
    /// Platform fee charged on each receipt subtotal, in basis points.
    pub platform_fee_bps: u32,
    pub currency: String,
    pub gateway_timeout_ms: u64,
    pub notifier_timeout_ms: u64,
    /// Attempts for an optimistic read-modify-write before giving up.
    pub max_write_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            escrow_sla_hours: 24,
            platform_fee_bps: 200,
            currency: "RWF".to_string(),
            gateway_timeout_ms: 10_000,
            notifier_timeout_ms: 5_000,
            max_write_retries: 8,
        }
    }
}

impl EngineConfig {
    pub fn escrow_sla(&self) -> chrono::Duration {
        chrono::Duration::hours(self.escrow_sla_hours)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Age past which an uncaptured payment attempt can no longer capture:
    /// twice the gateway timeout, leaving slack for a reply already in transit.
    pub fn payment_attempt_expiry(&self) -> chrono::Duration {
        let millis = i64::try_from(self.gateway_timeout_ms).unwrap_or(i64::MAX);
        chrono::Duration::milliseconds(millis.saturating_mul(2))
    }

    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_millis(self.notifier_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"platform_fee_bps": 0, "currency": "KES"}"#).unwrap();
        assert_eq!(config.platform_fee_bps, 0);
        assert_eq!(config.currency, "KES");
        assert_eq!(config.escrow_sla_hours, 24);
        assert_eq!(config.escrow_sla(), chrono::Duration::hours(24));
        assert_eq!(config.gateway_timeout(), Duration::from_secs(10));
        assert_eq!(config.payment_attempt_expiry(), chrono::Duration::seconds(20));
    }
}
