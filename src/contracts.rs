use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published by the order service when an order is placed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: Uuid,
    pub customer_name: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

/// Serialized as `"Processed"` or `"Failed"`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Processed,
    Failed,
}

/// Published by the payment worker once an order's payment was attempted.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProcessedEvent {
    pub order_id: Uuid,
    pub status: PaymentStatus,
}
