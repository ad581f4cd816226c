use crate::domain::ports::{ChargeOutcome, ChargeRequest, Notifier, PaymentGateway, SendOutcome};
use crate::domain::receipt::Channel;
use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Stand-in for a real payment provider: approves every charge, or declines
/// every charge with a fixed message.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    decline_message: Option<String>,
}

impl SimulatedGateway {
    pub fn approving() -> Self {
        Self::default()
    }

    pub fn declining(message: impl Into<String>) -> Self {
        Self {
            decline_message: Some(message.into()),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        if let Some(message) = &self.decline_message {
            return Ok(ChargeOutcome {
                success: false,
                payment_id: None,
                message: message.clone(),
            });
        }
        Ok(ChargeOutcome {
            success: true,
            payment_id: Some(format!("sim_pay_{}", Uuid::new_v4().simple())),
            message: format!("charged {} {} for {}", request.amount, request.currency, request.reference),
        })
    }
}

/// Notifier that only writes the message to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: Channel, recipient: &str, content: &str) -> Result<SendOutcome> {
        tracing::info!(?channel, recipient, bytes = content.len(), "notification sent");
        Ok(SendOutcome {
            success: true,
            error: None,
        })
    }
}
