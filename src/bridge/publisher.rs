// ABOUTME: Publishes session events to the exchange under the receive routing key
// ABOUTME: Events that fail to publish are kept in order and flushed first on the next run

use super::error::BridgeError;
use super::topology::Topology;
use crate::broker::BrokerChannel;
use crate::message::InboundEvent;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Drains the session's inbound events onto the broker.
///
/// Created before the session so nothing the gateway reports during login
/// is lost, but only hands out events once activated.
#[derive(Debug)]
pub struct InboundPublisher {
    exchange: String,
    routing_key: String,
    events: mpsc::UnboundedReceiver<InboundEvent>,
    backlog: VecDeque<InboundEvent>,
    active: bool,
}

impl InboundPublisher {
    pub fn new(topology: &Topology, events: mpsc::UnboundedReceiver<InboundEvent>) -> Self {
        InboundPublisher {
            exchange: topology.exchange.clone(),
            routing_key: topology.receive_routing_key.clone(),
            events,
            backlog: VecDeque::new(),
            active: false,
        }
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Events from an earlier run that still need publishing.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Put events left over from a previous run ahead of anything queued now.
    pub fn restore(&mut self, mut older: VecDeque<InboundEvent>) {
        older.append(&mut self.backlog);
        self.backlog = older;
    }

    /// Wait for the next event from the session.
    ///
    /// Pending forever until the publisher is active. Returns `None` once the
    /// session has dropped its sink. Cancel safe.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        if !self.active {
            return std::future::pending().await;
        }
        self.events.recv().await
    }

    /// Publish one event to the exchange with the receive routing key.
    ///
    /// On failure the event goes back to the front of the backlog.
    pub async fn publish<C: BrokerChannel>(
        &mut self,
        channel: &C,
        event: InboundEvent,
    ) -> Result<(), BridgeError> {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    error = %e,
                    msisdn = %event.msisdn(),
                    "Cannot encode inbound event, dropping it"
                );
                return Ok(());
            }
        };

        debug!(
            "publishing {} to exchange {} with routing key {}",
            String::from_utf8_lossy(&payload),
            self.exchange,
            self.routing_key
        );

        if let Err(e) = channel
            .publish(&self.exchange, &self.routing_key, &payload)
            .await
        {
            self.backlog.push_front(event);
            return Err(BridgeError::Publish(e));
        }
        Ok(())
    }

    /// Publish everything in the backlog, oldest first.
    pub async fn flush_backlog<C: BrokerChannel>(
        &mut self,
        channel: &C,
    ) -> Result<usize, BridgeError> {
        let mut flushed = 0;
        while let Some(event) = self.backlog.pop_front() {
            self.publish(channel, event).await?;
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "Published inbound events held from the previous run");
        }
        Ok(flushed)
    }

    /// Take every unpublished event, backlog first, leaving the publisher empty.
    pub fn drain(&mut self) -> VecDeque<InboundEvent> {
        let mut pending = std::mem::take(&mut self.backlog);
        while let Ok(event) = self.events.try_recv() {
            pending.push_back(event);
        }
        pending
    }
}
