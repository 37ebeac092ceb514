// ABOUTME: Handles one delivery from the send queue: decode, forward to the session, then ack or reject
// ABOUTME: Each delivery is settled exactly once; failures that mean the session is gone end the run

use super::error::BridgeError;
use crate::broker::{BrokerChannel, Delivery};
use crate::message::SendCommand;
use crate::session::ProtocolSession;
use tracing::{debug, warn};

/// How a delivery was settled when the run can carry on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Handed to the session and acknowledged
    Forwarded,
    /// Rejected without requeue; it can never be sent
    Discarded,
}

/// Forward one delivery to the session.
///
/// The delivery is acknowledged only after the session has taken it. Bodies
/// that do not decode, and commands the gateway cannot express, are
/// rejected without requeue so the broker can dead-letter them. When the
/// session is down the delivery is requeued and an error is returned so the
/// caller can reconnect.
pub async fn handle_delivery<C, S>(
    channel: &C,
    session: &mut S,
    delivery: Delivery,
) -> Result<Handled, BridgeError>
where
    C: BrokerChannel,
    S: ProtocolSession,
{
    let tag = delivery.delivery_tag;

    let command = match SendCommand::decode(&delivery.data) {
        Ok(command) => command,
        Err(e) => {
            warn!(
                delivery_tag = tag,
                error = %e,
                body = %String::from_utf8_lossy(&delivery.data),
                "Discarding malformed send command"
            );
            channel
                .reject(tag, false)
                .await
                .map_err(BridgeError::Broker)?;
            return Ok(Handled::Discarded);
        }
    };

    debug!(
        delivery_tag = tag,
        msisdn = %command.destination,
        kind = ?command.kind,
        redelivered = delivery.redelivered,
        "Received send command"
    );

    if !session.is_ready() {
        warn!(delivery_tag = tag, "SSMI session not ready, requeueing");
        requeue(channel, tag).await;
        return Err(BridgeError::SessionUnavailable);
    }

    match session.send(&command).await {
        Ok(()) => {
            channel.ack(tag).await.map_err(BridgeError::Broker)?;
            Ok(Handled::Forwarded)
        }
        Err(e) if !e.is_session_failure() => {
            warn!(delivery_tag = tag, error = %e, "SSMI gateway cannot take command, discarding");
            channel
                .reject(tag, false)
                .await
                .map_err(BridgeError::Broker)?;
            Ok(Handled::Discarded)
        }
        Err(e) => {
            warn!(delivery_tag = tag, error = %e, "Send failed, requeueing");
            requeue(channel, tag).await;
            Err(BridgeError::Send(e))
        }
    }
}

// The run is ending anyway; a dead channel returns the delivery on its own.
async fn requeue<C: BrokerChannel>(channel: &C, tag: u64) {
    if let Err(e) = channel.reject(tag, true).await {
        warn!(delivery_tag = tag, error = %e, "Failed to requeue delivery");
    }
}
