//! Channel broker (component D): for each broadcast channel, the set of live
//! connections, and fan-out of mutation events excluding the originator.
//!
//! Each per-recipient send runs on its own spawned task (§5's backpressure
//! recommendation): the channel map itself is only ever touched to look up outbound
//! sinks and clone them, so one slow peer's socket can never stall delivery to the
//! others in the same fan-out.

use std::collections::HashMap;

use fabric_common::logging::{o, warn};
use fabric_common::protocol::EventFrame;
use slog::Logger;
use tokio::sync::{mpsc, RwLock};

pub type ConnectionId = u64;

/// The broker fans out the plaintext event -- each recipient still holds its own
/// session key and is the one that encrypts the frame just before writing it to its
/// socket, since every connection's AEAD key is different.
pub type OutboundFrame = EventFrame;

struct Member {
    connection_id: ConnectionId,
    sink: mpsc::UnboundedSender<OutboundFrame>,
}

pub struct ChannelBroker {
    channels: RwLock<HashMap<String, Vec<Member>>>,
    log: Logger,
}

impl ChannelBroker {
    pub fn new(log: Logger) -> Self {
        Self { channels: RwLock::new(HashMap::new()), log: log.new(o!("component" => "channel_broker")) }
    }

    pub async fn join(&self, channel_id: &str, connection_id: ConnectionId, sink: mpsc::UnboundedSender<OutboundFrame>) {
        let mut channels = self.channels.write().await;
        channels.entry(channel_id.to_string()).or_default().push(Member { connection_id, sink });
    }

    /// Removes `connection_id` from every channel it was a member of (in practice
    /// exactly one, or none if the connection never authenticated), dropping any
    /// channel whose membership becomes empty.
    pub async fn leave(&self, channel_id: &str, connection_id: ConnectionId) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get_mut(channel_id) {
            members.retain(|m| m.connection_id != connection_id);
            if members.is_empty() {
                channels.remove(channel_id);
            }
        }
    }

    /// Sends `event` to every member of `channel_id` except `except`. Send failures
    /// (a closed socket) are logged and never abort the rest of the fan-out.
    pub async fn broadcast(&self, channel_id: &str, event: OutboundFrame, except: Option<ConnectionId>) {
        let recipients: Vec<_> = {
            let channels = self.channels.read().await;
            match channels.get(channel_id) {
                Some(members) => members
                    .iter()
                    .filter(|m| Some(m.connection_id) != except)
                    .map(|m| (m.connection_id, m.sink.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let log = self.log.clone();
        for (connection_id, sink) in recipients {
            let event = event.clone();
            let log = log.clone();
            tokio::spawn(async move {
                if sink.send(event).is_err() {
                    warn!(log, "dropping broadcast to a closed connection"; "connection_id" => connection_id);
                }
            });
        }
    }

    #[cfg(test)]
    pub async fn member_count(&self, channel_id: &str) -> usize {
        self.channels.read().await.get(channel_id).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_excludes_the_sender_and_reaches_everyone_else() {
        let broker = ChannelBroker::new(fabric_common::logging::init("test"));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();

        broker.join("channel_x", 1, tx_a).await;
        broker.join("channel_x", 2, tx_b).await;
        broker.join("channel_x", 3, tx_c).await;

        let event = EventFrame::new(fabric_common::protocol::EventKind::Set, "test".to_string());
        broker.broadcast("channel_x", event.clone(), Some(1)).await;

        assert_eq!(rx_b.recv().await, Some(event.clone()));
        assert_eq!(rx_c.recv().await, Some(event));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_the_last_member_drops_the_channel() {
        let broker = ChannelBroker::new(fabric_common::logging::init("test"));
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.join("channel_y", 1, tx).await;
        assert_eq!(broker.member_count("channel_y").await, 1);

        broker.leave("channel_y", 1).await;
        assert_eq!(broker.member_count("channel_y").await, 0);
    }
}
