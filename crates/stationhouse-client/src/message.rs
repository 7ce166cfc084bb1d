//! Inbound messages.
//!
//! A [`StationMessage`] wraps a broker delivery together with the station,
//! consumer group and partition it was read from. Messages read off the
//! dead-letter subscription carry partition [`DLS_PARTITION`] (-1).

use crate::error::{ClientError, Result};
use crate::protocol::{headers, subjects, NackedDlsMessage, PmAck, DLS_PARTITION};
use bytes::Bytes;
use stationhouse_broker::{Broker, Delivery, Headers};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct StationMessage {
    delivery: Delivery,
    broker: Arc<dyn Broker>,
    station: String,
    consumer_group: String,
    max_ack_time: Duration,
    partition: i32,
}

impl StationMessage {
    pub(crate) fn new(
        delivery: Delivery,
        broker: Arc<dyn Broker>,
        station: &str,
        consumer_group: &str,
        max_ack_time: Duration,
        partition: i32,
    ) -> Self {
        Self {
            delivery,
            broker,
            station: station.to_string(),
            consumer_group: consumer_group.to_string(),
            max_ack_time,
            partition,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.delivery.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.delivery.headers
    }

    pub fn subject(&self) -> &str {
        &self.delivery.subject
    }

    /// Stream sequence, 0 for messages without one.
    pub fn sequence(&self) -> u64 {
        self.delivery.sequence
    }

    pub fn delivery_count(&self) -> u64 {
        self.delivery.num_delivered
    }

    /// Internal name of the station the message was read from.
    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn max_ack_time(&self) -> Duration {
        self.max_ack_time
    }

    /// Partition number, or -1 for dead-letter messages.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn is_from_dls(&self) -> bool {
        self.partition == DLS_PARTITION
    }

    /// Acknowledge the message.
    ///
    /// Messages carrying a `$memphis_pm_id` header were resent from the
    /// poison-message store; their ack is also reported on `$memphis_pm_acks`.
    pub async fn ack(&self) -> Result<()> {
        if let Some(token) = &self.delivery.ack_token {
            self.broker.ack(token).await.map_err(ClientError::Ack)?;
        }

        if let Some(pm_id) = self.delivery.headers.get(headers::PM_ID) {
            let body = serde_json::to_vec(&PmAck {
                id: pm_id.to_string(),
                cg_name: self.consumer_group.clone(),
            })?;
            self.broker
                .publish(subjects::PM_ACKS, Bytes::from(body))
                .await
                .map_err(ClientError::Ack)?;
        }
        Ok(())
    }

    /// Ask for immediate redelivery.
    pub async fn nack(&self) -> Result<()> {
        match &self.delivery.ack_token {
            Some(token) => self.broker.nak(token, None).await.map_err(ClientError::Nack),
            None => Ok(()),
        }
    }

    /// Stop redelivery and report the message to the station's dead-letter
    /// list with `reason`.
    pub async fn dead_letter(&self, reason: &str) -> Result<()> {
        if let Some(token) = &self.delivery.ack_token {
            self.broker
                .term(token)
                .await
                .map_err(ClientError::DeadLetter)?;
        }

        let body = serde_json::to_vec(&NackedDlsMessage {
            id: self.delivery.sequence.to_string(),
            station_name: self.station.clone(),
            cg_name: self.consumer_group.clone(),
            partition: self.partition,
            error: reason.to_string(),
        })?;
        self.broker
            .publish(subjects::NACKED_DLS, Bytes::from(body))
            .await
            .map_err(ClientError::DeadLetter)?;

        debug!(
            station = %self.station,
            sequence = self.delivery.sequence,
            "Message dead-lettered"
        );
        Ok(())
    }

    /// Redeliver after `delay`. Not available for dead-letter messages.
    pub async fn delay(&self, delay: Duration) -> Result<()> {
        if self.is_from_dls() {
            return Err(ClientError::CannotDelayDlsMessage);
        }
        match &self.delivery.ack_token {
            Some(token) => self
                .broker
                .nak(token, Some(delay))
                .await
                .map_err(ClientError::Nack),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StationMessage")
            .field("station", &self.station)
            .field("consumer_group", &self.consumer_group)
            .field("partition", &self.partition)
            .field("sequence", &self.delivery.sequence)
            .field("len", &self.delivery.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stationhouse_broker::{InMemoryBroker, OutboundMessage};

    async fn pulled(memory: &InMemoryBroker, headers: Headers) -> StationMessage {
        memory.add_stream("orders");
        memory.add_consumer("orders", "billing").unwrap();
        memory
            .publish_to_stream(
                OutboundMessage {
                    subject: "orders.final".into(),
                    payload: Bytes::from_static(b"hi"),
                    headers,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let delivery = memory
            .fetch("orders", "billing", 1, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);
        StationMessage::new(
            delivery,
            Arc::new(memory.clone()),
            "orders",
            "billing",
            Duration::from_secs(30),
            1,
        )
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let memory = InMemoryBroker::new();
        let message = pulled(&memory, Headers::new()).await;

        message.ack().await.unwrap();
        let info = memory.consumer_info("orders", "billing").await.unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert!(memory.core_published(subjects::PM_ACKS).is_empty());
    }

    #[tokio::test]
    async fn test_ack_reports_poison_message_id() {
        let memory = InMemoryBroker::new();
        let headers: Headers = [(headers::PM_ID, "pm-9")].into_iter().collect();
        let message = pulled(&memory, headers).await;

        message.ack().await.unwrap();
        let acks = memory.core_published(subjects::PM_ACKS);
        assert_eq!(acks.len(), 1);
        let ack: PmAck = serde_json::from_slice(&acks[0]).unwrap();
        assert_eq!(ack.id, "pm-9");
        assert_eq!(ack.cg_name, "billing");
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let memory = InMemoryBroker::new();
        let message = pulled(&memory, Headers::new()).await;

        message.nack().await.unwrap();
        let again = memory
            .fetch("orders", "billing", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].num_delivered, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_publishes_reason() {
        let memory = InMemoryBroker::new();
        let message = pulled(&memory, Headers::new()).await;

        message.dead_letter("bad payload").await.unwrap();
        let published = memory.core_published(subjects::NACKED_DLS);
        let body: NackedDlsMessage = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(body.error, "bad payload");
        assert_eq!(body.station_name, "orders");
        assert_eq!(body.partition, 1);

        let info = memory.consumer_info("orders", "billing").await.unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert_eq!(info.num_pending, 0);
    }

    #[tokio::test]
    async fn test_delay_rejected_for_dls_messages() {
        let memory = InMemoryBroker::new();
        let message = StationMessage::new(
            Delivery::core("$memphis_dls_orders.billing", Bytes::new(), Headers::new()),
            Arc::new(memory),
            "orders",
            "billing",
            Duration::from_secs(30),
            DLS_PARTITION,
        );

        assert!(message.is_from_dls());
        assert!(matches!(
            message.delay(Duration::from_secs(1)).await,
            Err(ClientError::CannotDelayDlsMessage)
        ));
    }
}
