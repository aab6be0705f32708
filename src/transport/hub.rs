//! Owns the orchestrator's open channels.
//!
//! Each attached channel gets a reader task that forwards decoded frames as
//! `TransportEvent::Frame` and reports `TransportEvent::Disconnected` once the
//! connection ends or fails. This event stream is the delivery/failure
//! callback the orchestrator consumes.

use super::channel::SecureChannel;
use super::frame::Frame;
use super::traits::{TransportError, TransportResult};
use crate::model::ParticipantId;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Something happened on a participant's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame {
        participant: ParticipantId,
        frame: Frame,
    },
    Disconnected {
        participant: ParticipantId,
        reason: Option<String>,
    },
}

struct Attached {
    channel: Arc<SecureChannel>,
    reader: JoinHandle<()>,
    generation: u64,
}

/// Channel table plus reader tasks.
pub struct TransportHub {
    channels: RwLock<HashMap<ParticipantId, Attached>>,
    next_generation: std::sync::atomic::AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportHub {
    /// Create a hub and the receiving end of its event stream.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                channels: RwLock::new(HashMap::new()),
                next_generation: std::sync::atomic::AtomicU64::new(0),
                events: tx,
            }),
            rx,
        )
    }

    /// Take ownership of a channel and start forwarding its frames.
    ///
    /// A channel already attached for the same participant is replaced.
    pub fn attach(self: &Arc<Self>, channel: SecureChannel) -> ParticipantId {
        let participant = channel.participant().clone();
        let channel = Arc::new(channel);
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // The table lock is held across the spawn so a reader that ends
        // immediately still finds its own entry to remove.
        let previous = {
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            let hub = Arc::clone(self);
            let reader_channel = Arc::clone(&channel);
            let reader = tokio::spawn(async move {
                hub.read_loop(reader_channel, generation).await;
            });
            channels.insert(
                participant.clone(),
                Attached {
                    channel,
                    reader,
                    generation,
                },
            )
        };
        if let Some(old) = previous {
            debug!(participant = %participant, "replacing existing channel");
            old.reader.abort();
            let old_channel = old.channel;
            tokio::spawn(async move {
                let _ = old_channel.close().await;
            });
        }
        participant
    }

    async fn read_loop(self: Arc<Self>, channel: Arc<SecureChannel>, generation: u64) {
        let participant = channel.participant().clone();
        let reason = loop {
            match channel.recv().await {
                Ok(Some(frame)) => {
                    let event = TransportEvent::Frame {
                        participant: participant.clone(),
                        frame,
                    };
                    if self.events.send(event).is_err() {
                        break Some("event consumer dropped".to_string());
                    }
                }
                Ok(None) => break None,
                Err(e) if !e.is_fatal() => {
                    warn!(participant = %participant, error = %e, "dropping undecodable frame");
                }
                Err(e) => break Some(e.to_string()),
            }
        };

        // Only the current channel for this participant may unregister it
        let removed = {
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            match channels.get(&participant) {
                Some(attached) if attached.generation == generation => channels.remove(&participant),
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = channel.close().await;
            let _ = self.events.send(TransportEvent::Disconnected {
                participant,
                reason,
            });
        }
    }

    fn channel(&self, participant: &ParticipantId) -> Option<Arc<SecureChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(participant)
            .map(|a| Arc::clone(&a.channel))
    }

    pub fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.channel(participant).map(|c| c.is_open()).unwrap_or(false)
    }

    pub fn connected(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Send one frame to one participant.
    pub async fn send(&self, participant: &ParticipantId, frame: &Frame) -> TransportResult<()> {
        let channel = self
            .channel(participant)
            .ok_or_else(|| TransportError::NotConnected(participant.to_string()))?;
        channel.send(frame).await
    }

    /// Send a frame to each listed participant concurrently.
    ///
    /// Returns the participants the frame could not be delivered to.
    pub async fn broadcast(
        &self,
        participants: &[ParticipantId],
        frame: &Frame,
    ) -> Vec<(ParticipantId, TransportError)> {
        let sends = participants.iter().map(|p| async move { (p, self.send(p, frame).await) });
        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(p, result)| result.err().map(|e| (p.clone(), e)))
            .collect()
    }

    /// Close and forget a participant's channel.
    pub async fn detach(&self, participant: &ParticipantId) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(participant);
        if let Some(attached) = removed {
            attached.reader.abort();
            let _ = attached.channel.close().await;
        }
    }

    /// Close every channel.
    pub async fn shutdown(&self) {
        let drained: Vec<Attached> = self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, a)| a)
            .collect();
        for attached in drained {
            attached.reader.abort();
            let _ = attached.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [5u8; 32];

    #[tokio::test]
    async fn test_frames_are_forwarded_as_events() {
        let (hub, mut events) = TransportHub::new();
        let id = ParticipantId::new("edge-1");
        let (local, remote) = SecureChannel::memory_pair(id.clone(), &KEY, false).unwrap();
        hub.attach(local);
        assert!(hub.is_connected(&id));

        remote.heartbeat().await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Frame { participant, frame } => {
                assert_eq!(participant, id);
                assert_eq!(frame.kind(), "heartbeat");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (hub, mut events) = TransportHub::new();
        let id = ParticipantId::new("edge-2");
        let (local, remote) = SecureChannel::memory_pair(id.clone(), &KEY, false).unwrap();
        hub.attach(local);

        remote.close().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected {
                participant: id.clone(),
                reason: None
            }
        );
        assert!(!hub.is_connected(&id));
        assert!(hub.connected().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reports_unreachable() {
        let (hub, _events) = TransportHub::new();
        let id = ParticipantId::new("edge-3");
        let (local, remote) = SecureChannel::memory_pair(id.clone(), &KEY, false).unwrap();
        hub.attach(local);

        let ghost = ParticipantId::new("ghost");
        let failed = hub
            .broadcast(&[id.clone(), ghost.clone()], &Frame::Heartbeat { sent_at: 1 })
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, ghost);
        assert!(matches!(remote.recv().await.unwrap(), Some(Frame::Heartbeat { sent_at: 1 })));
    }

    #[tokio::test]
    async fn test_detach_closes_channel() {
        let (hub, _events) = TransportHub::new();
        let id = ParticipantId::new("edge-4");
        let (local, remote) = SecureChannel::memory_pair(id.clone(), &KEY, false).unwrap();
        hub.attach(local);
        hub.detach(&id).await;
        assert!(!hub.is_connected(&id));
        assert_eq!(remote.recv().await.unwrap(), None);
    }
}
