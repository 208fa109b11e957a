//! Adapts the transport expectation of a WireGuard device — a UDP-socket-like
//! object with `open`/`close`/`send`/`receive`/`parse_endpoint` — to a set of
//! reliable, ordered WebRTC data channels, one per peer.

use connlib_model::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;

/// Bounded FIFO capacity for inbound packets awaiting a `receive` call. Sized well
/// above a single handshake burst; WireGuard tolerates loss past this point.
const RECV_QUEUE_CAPACITY: usize = 256;

/// The tagged identity the bridge hands to the WireGuard device in place of a real
/// socket address. Every IP-shaped accessor returns a zero value — nothing routes on
/// it, it only exists so `send` can look the right channel back up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    peer_id: PeerId,
}

impl Endpoint {
    pub fn dst_string(&self) -> &str {
        self.peer_id.as_str()
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn dst_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn dst_port(&self) -> u16 {
        0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is closed")]
    Closed,
    #[error("no data channel registered for peer {0}")]
    UnknownPeer(PeerId),
    #[error("endpoint did not originate from this bridge")]
    ForeignEndpoint,
    #[error(transparent)]
    DataChannel(#[from] webrtc::Error),
}

struct ChannelEntry {
    data_channel: Arc<RTCDataChannel>,
    endpoint: Endpoint,
}

/// Shared (co-owned) by the agent, which registers and removes channels as peers
/// come and go, and by the WireGuard device, which retains it across its own
/// lifecycle as its packet transport.
pub struct PacketBridge {
    channels: RwLock<HashMap<PeerId, ChannelEntry>>,
    recv_tx: mpsc::Sender<(Vec<u8>, Endpoint)>,
    recv_rx: AsyncMutex<mpsc::Receiver<(Vec<u8>, Endpoint)>>,
    close_signal: Notify,
    closed: AtomicBool,
}

impl PacketBridge {
    pub fn new() -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_CAPACITY);

        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            recv_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            close_signal: Notify::new(),
            closed: AtomicBool::new(true),
        })
    }

    /// Reports port `0` — there is no real UDP port. Re-arms `close_signal` so that a
    /// WireGuard device that calls `close` then `open` again (as happens on a bind
    /// update) gets a working `receive` again.
    pub fn open(&self, _port: u16) -> std::io::Result<u16> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(0)
    }

    /// Blocks until a packet is available or the bridge is closed. Processes one
    /// packet at a time.
    pub async fn receive(
        &self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        endpoints: &mut [Option<Endpoint>],
    ) -> Result<usize, BridgeError> {
        if bufs.is_empty() {
            return Ok(0);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }

        let mut rx = self.recv_rx.lock().await;

        tokio::select! {
            biased;
            () = self.close_signal.notified() => Err(BridgeError::Closed),
            item = rx.recv() => match item {
                Some((payload, endpoint)) => {
                    let n = payload.len().min(bufs[0].len());
                    bufs[0][..n].copy_from_slice(&payload[..n]);
                    sizes[0] = n;
                    endpoints[0] = Some(endpoint);
                    Ok(1)
                }
                None => Err(BridgeError::Closed),
            },
        }
    }

    /// Sends each buffer as one binary frame on `endpoint`'s channel, preserving
    /// order (the data channel is itself ordered, so no further sequencing is
    /// needed here).
    pub async fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> Result<usize, BridgeError> {
        let data_channel = {
            let channels = self.channels.read();
            channels
                .get(&endpoint.peer_id)
                .map(|entry| entry.data_channel.clone())
                .ok_or_else(|| BridgeError::UnknownPeer(endpoint.peer_id.clone()))?
        };

        for buf in bufs {
            data_channel.send(&bytes::Bytes::copy_from_slice(buf)).await?;
        }

        Ok(bufs.len())
    }

    pub fn parse_endpoint(&self, s: &str) -> Endpoint {
        Endpoint {
            peer_id: PeerId::new(s),
        }
    }

    pub fn set_mark(&self, _mark: u32) {}

    pub fn batch_size(&self) -> usize {
        1
    }

    /// Records `data_channel` as the transport for `peer_id` and installs an
    /// `on_message` handler that copies each inbound payload into the shared receive
    /// queue. Drops (and logs) the packet if the queue is full — WireGuard tolerates
    /// loss.
    pub fn set_data_channel(self: &Arc<Self>, peer_id: PeerId, data_channel: Arc<RTCDataChannel>) {
        let endpoint = Endpoint {
            peer_id: peer_id.clone(),
        };

        self.channels.write().insert(
            peer_id.clone(),
            ChannelEntry {
                data_channel: data_channel.clone(),
                endpoint: endpoint.clone(),
            },
        );

        let recv_tx = self.recv_tx.clone();
        let log_peer_id = peer_id;

        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let recv_tx = recv_tx.clone();
            let endpoint = endpoint.clone();
            let log_peer_id = log_peer_id.clone();
            let payload = msg.data.to_vec();

            Box::pin(async move {
                if recv_tx.try_send((payload, endpoint)).is_err() {
                    tracing::debug!(peer_id = %log_peer_id, "Receive queue full, dropping packet");
                }
            })
        }));
    }

    /// Further sends to this peer fail with [`BridgeError::UnknownPeer`].
    pub fn remove_data_channel(&self, peer_id: &PeerId) {
        self.channels.write().remove(peer_id);
    }

    /// Idempotent: fires `close_signal` exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.close_signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_peer_errors() {
        let bridge = PacketBridge::new();
        bridge.open(0).unwrap();

        let endpoint = bridge.parse_endpoint("nobody");
        let err = bridge.send(&[b"hi"], &endpoint).await.unwrap_err();

        assert!(matches!(err, BridgeError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn receive_errors_after_close() {
        let bridge = PacketBridge::new();
        bridge.open(0).unwrap();
        bridge.close();

        let mut buf = vec![0u8; 1500];
        let mut bufs: Vec<&mut [u8]> = vec![&mut buf];
        let mut sizes = [0usize];
        let mut endpoints = [None];

        let err = bridge
            .receive(&mut bufs, &mut sizes, &mut endpoints)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Closed));
    }

    #[test]
    fn parse_endpoint_roundtrips_peer_id() {
        let bridge = PacketBridge::new();
        let endpoint = bridge.parse_endpoint("alpha");

        assert_eq!(endpoint.dst_string(), "alpha");
        assert_eq!(endpoint.dst_port(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let bridge = PacketBridge::new();
        bridge.open(0).unwrap();

        bridge.close();
        bridge.close(); // must not panic
    }
}
