use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticket_stream::{Acked, Delivery, HandlerError, OrderKey, Record, RecordHandler};
use tracing::info;
use uuid::Uuid;

/// A support ticket. Tickets of the same order are processed in the order
/// they were created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub order_id: i64,
    pub data: String,
}

impl Ticket {
    pub fn new(order_id: i64, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            order_id,
            data: data.into(),
        }
    }

    /// Stream record keyed by order id, carrying the ticket as JSON.
    pub fn to_record(&self) -> serde_json::Result<Record> {
        let payload = serde_json::to_vec(self)?;
        Ok(Record::new(self.order_id, payload)
            .with_id(self.id.to_string())
            .with_created_at(self.timestamp))
    }

    pub fn from_record(record: &Record) -> Result<Self, HandlerError> {
        let ticket: Ticket = serde_json::from_slice(&record.payload)
            .map_err(|e| HandlerError::Malformed(format!("ticket payload: {}", e)))?;

        if record.order_key != OrderKey::Int(ticket.order_id) {
            return Err(HandlerError::Malformed(format!(
                "ticket {} has order id {} but was keyed {}",
                ticket.id, ticket.order_id, record.order_key
            )));
        }
        Ok(ticket)
    }
}

/// Consumer-side processing of tickets: decode and log.
#[derive(Debug, Default)]
pub struct TicketHandler;

#[async_trait]
impl RecordHandler for TicketHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<Acked, HandlerError> {
        let ticket = Ticket::from_record(&delivery.record)?;

        info!(
            ticket_id = %ticket.id,
            order_id = ticket.order_id,
            partition = delivery.partition,
            offset = delivery.offset,
            data = %ticket.data,
            "Processed ticket"
        );
        Ok(delivery.ack())
    }
}
