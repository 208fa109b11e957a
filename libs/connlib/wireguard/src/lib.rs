//! Drives a [`boringtun::noise::Tunn`] per remote peer over a pluggable transport
//! instead of a UDP socket.
//!
//! The agent is the only thing that knows this device exists; everything downstream
//! of [`WireGuardDevice::add_peer`]/[`remove_peer`](WireGuardDevice::remove_peer) is
//! plain WireGuard: handshakes, session rekeying and keepalives are all handled by
//! `boringtun`'s noise state machine the same way they would be over a real socket.
//! The only thing replaced is *what* carries the ciphertext, via [`Transport`].

use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use connlib_model::PeerId;
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tun::TunDevice;

/// Largest packet `boringtun` will ever ask us to read from or write to the tunnel
/// interface. WireGuard's own overhead is ~60 bytes; this comfortably covers any MTU
/// a host is likely to configure.
const MAX_PACKET: usize = 2048;

/// How often each peer's `Tunn::update_timers` is polled for retransmits, rekeys and
/// keepalives. `boringtun` itself decides whether anything actually needs sending on
/// a given tick.
const TIMERS_TICK: Duration = Duration::from_millis(250);

/// The transport a [`WireGuardDevice`] sends and receives ciphertext over, in place
/// of a UDP socket. Mirrors the `open`/`close`/`send`/`receive`/`parse_endpoint`
/// contract WireGuard implementations traditionally expect from their socket.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Endpoint: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static;

    fn open(&self, port: u16) -> std::io::Result<u16>;

    /// Blocks until exactly one packet is available or the transport closes.
    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint), TransportClosed>;

    async fn send(&self, buf: &[u8], endpoint: &Self::Endpoint) -> std::io::Result<()>;

    fn parse_endpoint(&self, s: &str) -> Self::Endpoint;

    fn close(&self);
}

#[derive(Debug, thiserror::Error)]
#[error("transport is closed")]
pub struct TransportClosed;

#[derive(Debug, thiserror::Error)]
pub enum WireGuardError {
    #[error("a peer with public key {0:?} is already installed")]
    PeerAlreadyExists(PublicKeyHex),
    #[error("no peer with public key {0:?} is installed")]
    UnknownPeer(PublicKeyHex),
    #[error(transparent)]
    Tun(#[from] std::io::Error),
}

/// `x25519::PublicKey` is not `Hash`/`Eq`-friendly for map keys; this is the raw byte
/// form we actually key the peer table on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeyHex(pub [u8; 32]);

impl From<&PublicKey> for PublicKeyHex {
    fn from(key: &PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// Everything needed to install a remote peer, mirroring the fields `Agent` derives
/// from `PeerSession` once a data channel opens (spec §4.1).
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// Parsed by [`Transport::parse_endpoint`]; for the WebRTC bridge this is the
    /// remote's `peer_id`.
    pub endpoint: String,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
}

struct PeerState<E> {
    tunn: Mutex<Tunn>,
    endpoint: E,
    allowed_ips: Vec<IpNet>,
}

/// A WireGuard device whose transport is generic over anything implementing
/// [`Transport`]. The agent constructs one bound to a [`bridge::PacketBridge`] (via
/// the adapter in the `agent` crate); tests can bind it to an in-memory transport.
pub struct WireGuardDevice<T: Transport> {
    private_key: StaticSecret,
    tun: Arc<dyn TunDevice>,
    transport: Arc<T>,
    peers: RwLock<HashMap<PublicKeyHex, Arc<PeerState<T::Endpoint>>>>,
    /// Maps a transport endpoint back to the owning peer, for inbound dispatch.
    by_endpoint: RwLock<HashMap<T::Endpoint, PublicKeyHex>>,
    next_index: AtomicU32,
    closed: AtomicBool,
    tun_reader: Mutex<Option<std::thread::JoinHandle<()>>>,
    receiver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    timers: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Transport> WireGuardDevice<T> {
    /// Opens the transport and spawns the three workers described in spec §5: a
    /// dedicated OS thread pumping the (blocking) tun reads, and two Tokio tasks for
    /// inbound transport packets and per-peer timers.
    pub fn new(private_key: StaticSecret, tun: Arc<dyn TunDevice>, transport: Arc<T>) -> Result<Arc<Self>, WireGuardError> {
        transport.open(0)?;

        let device = Arc::new(Self {
            private_key,
            tun,
            transport,
            peers: RwLock::new(HashMap::new()),
            by_endpoint: RwLock::new(HashMap::new()),
            next_index: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            tun_reader: Mutex::new(None),
            receiver: Mutex::new(None),
            timers: Mutex::new(None),
        });

        *device.tun_reader.lock() = Some(spawn_tun_reader(device.clone()));
        *device.receiver.lock() = Some(tokio::spawn(run_receiver(device.clone())));
        *device.timers.lock() = Some(tokio::spawn(run_timers(device.clone())));

        Ok(device)
    }

    pub fn add_peer(&self, config: PeerConfig) -> Result<(), WireGuardError> {
        let key = PublicKeyHex::from(&config.public_key);

        let mut peers = self.peers.write();
        if peers.contains_key(&key) {
            return Err(WireGuardError::PeerAlreadyExists(key));
        }

        let endpoint = self.transport.parse_endpoint(&config.endpoint);
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        let tunn = Tunn::new(
            self.private_key.clone(),
            config.public_key,
            None,
            config.persistent_keepalive.map(|d| d.as_secs() as u16),
            index,
            None,
        );

        let state = Arc::new(PeerState {
            tunn: Mutex::new(tunn),
            endpoint: endpoint.clone(),
            allowed_ips: config.allowed_ips,
        });

        self.by_endpoint.write().insert(endpoint, key);
        peers.insert(key, state);

        Ok(())
    }

    pub fn remove_peer(&self, public_key: &PublicKey) -> Result<(), WireGuardError> {
        let key = PublicKeyHex::from(public_key);

        let state = self
            .peers
            .write()
            .remove(&key)
            .ok_or(WireGuardError::UnknownPeer(key))?;

        self.by_endpoint.write().remove(&state.endpoint);

        Ok(())
    }

    /// Longest-prefix match over every installed peer's `allowed_ips`.
    fn peer_for_dst(&self, dst: IpAddr) -> Option<(PublicKeyHex, Arc<PeerState<T::Endpoint>>)> {
        let peers = self.peers.read();

        peers
            .iter()
            .filter(|(_, state)| state.allowed_ips.iter().any(|net| net.contains(&dst)))
            .max_by_key(|(_, state)| {
                state
                    .allowed_ips
                    .iter()
                    .filter(|net| net.contains(&dst))
                    .map(IpNet::prefix_len)
                    .max()
                    .unwrap_or(0)
            })
            .map(|(key, state)| (*key, state.clone()))
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transport.close();
        let _ = self.tun.close();

        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.timers.lock().take() {
            handle.abort();
        }
    }
}

/// What to do with the result of an `encapsulate`/`decapsulate`/`update_timers`
/// call, with any borrowed output buffer already copied into owned storage. Turning
/// the borrowed [`TunnResult`] into this immediately, before crossing an `.await`
/// point or another lock acquisition, avoids holding a borrow of the scratch buffer
/// across either.
enum TunnAction {
    Done,
    WriteToNetwork(Vec<u8>),
    WriteToTunnel(Vec<u8>),
}

fn into_action(result: TunnResult<'_>) -> TunnAction {
    match result {
        TunnResult::Done => TunnAction::Done,
        TunnResult::Err(e) => {
            tracing::debug!(error = ?e, "WireGuard session error");
            TunnAction::Done
        }
        TunnResult::WriteToNetwork(packet) => TunnAction::WriteToNetwork(packet.to_vec()),
        TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
            TunnAction::WriteToTunnel(packet.to_vec())
        }
    }
}

/// Reads the tun device on a dedicated blocking thread (its `read` is a blocking
/// syscall, per the `TunDevice` contract) and hands packets to `boringtun` for
/// encapsulation before routing them over the transport.
fn spawn_tun_reader<T: Transport>(device: Arc<WireGuardDevice<T>>) -> std::thread::JoinHandle<()> {
    let rt = tokio::runtime::Handle::current();

    std::thread::spawn(move || {
        let mut buf = vec![0u8; MAX_PACKET];

        loop {
            if device.closed.load(Ordering::SeqCst) {
                return;
            }

            let mut bufs: [&mut [u8]; 1] = [&mut buf];
            let mut sizes = [0usize];

            match device.tun.read(&mut bufs, &mut sizes, 0) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    if device.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::warn!(error = %e, "Failed to read from tun device");
                    continue;
                }
            }

            let packet = buf[..sizes[0]].to_vec();
            let Some(dst) = packet_dst(&packet) else {
                continue;
            };

            let Some((_, peer)) = device.peer_for_dst(dst) else {
                tracing::debug!(%dst, "No WireGuard peer for destination, dropping packet");
                continue;
            };

            let mut out = vec![0u8; MAX_PACKET];
            let action = into_action(peer.tunn.lock().encapsulate(&packet, &mut out));

            let device = device.clone();
            rt.spawn(async move {
                handle_tunn_action(&device, &peer.endpoint, action).await;
            });
        }
    })
}

/// Pulls ciphertext off the transport and feeds it through the owning peer's `Tunn`.
async fn run_receiver<T: Transport>(device: Arc<WireGuardDevice<T>>) {
    let mut buf = vec![0u8; MAX_PACKET];

    loop {
        let (n, endpoint) = match device.transport.receive(&mut buf).await {
            Ok(v) => v,
            Err(TransportClosed) => return,
        };

        let Some(key) = device.by_endpoint.read().get(&endpoint).copied() else {
            tracing::debug!("Dropping packet from endpoint with no installed peer");
            continue;
        };

        let Some(peer) = device.peers.read().get(&key).cloned() else {
            continue;
        };

        let mut out = vec![0u8; MAX_PACKET];
        let action = into_action(peer.tunn.lock().decapsulate(None, &buf[..n], &mut out));

        handle_tunn_action(&device, &endpoint, action).await;
    }
}

/// Acts on whatever `boringtun` told us to do with the result of an
/// `encapsulate`/`decapsulate`/`update_timers` call: write to the tunnel, write to
/// the transport, or nothing. A `WriteToNetwork` action drains any further
/// handshake/cookie-reply round-trips with empty reads, as `boringtun`'s own
/// documentation requires.
async fn handle_tunn_action<T: Transport>(device: &Arc<WireGuardDevice<T>>, endpoint: &T::Endpoint, action: TunnAction) {
    match action {
        TunnAction::Done => {}
        TunnAction::WriteToNetwork(packet) => {
            if device.transport.send(&packet, endpoint).await.is_err() {
                tracing::debug!("Failed to send WireGuard packet over transport");
                return;
            }

            let Some(key) = device.by_endpoint.read().get(endpoint).copied() else {
                return;
            };
            let Some(peer) = device.peers.read().get(&key).cloned() else {
                return;
            };

            loop {
                let mut scratch = vec![0u8; MAX_PACKET];
                let action = into_action(peer.tunn.lock().decapsulate(None, &[], &mut scratch));

                match action {
                    TunnAction::WriteToNetwork(packet) => {
                        if device.transport.send(&packet, endpoint).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
        TunnAction::WriteToTunnel(packet) => {
            write_to_tun(device, packet).await;
        }
    }
}

async fn write_to_tun<T: Transport>(device: &Arc<WireGuardDevice<T>>, packet: &[u8]) {
    let device = device.clone();
    let packet = packet.to_vec();

    let result = tokio::task::spawn_blocking(move || {
        let bufs: [&[u8]; 1] = [&packet];
        device.tun.write(&bufs, 0)
    })
    .await;

    if let Ok(Err(e)) = result {
        tracing::warn!(error = %e, "Failed to write decrypted packet to tun device");
    }
}

/// Per-peer timer tick: rekeys, handshake retransmits and keepalives are all driven
/// from here rather than from packet arrival, per `boringtun`'s own design.
async fn run_timers<T: Transport>(device: Arc<WireGuardDevice<T>>) {
    let mut interval = tokio::time::interval(TIMERS_TICK);

    loop {
        interval.tick().await;

        let snapshot: Vec<_> = device
            .peers
            .read()
            .iter()
            .map(|(_, state)| state.clone())
            .collect();

        for peer in snapshot {
            let mut buf = vec![0u8; MAX_PACKET];
            let action = into_action(peer.tunn.lock().update_timers(&mut buf));

            handle_tunn_action(&device, &peer.endpoint, action).await;
        }
    }
}

/// Reads the destination address out of a raw IPv4 packet's header. IPv6 tunnel
/// interior traffic is out of scope (see spec Non-goals); any non-IPv4 packet is
/// simply dropped here rather than routed.
fn packet_dst(packet: &[u8]) -> Option<IpAddr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }

    Some(IpAddr::from([packet[16], packet[17], packet[18], packet[19]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_dst_reads_ipv4_header() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45; // version 4, IHL 5
        packet[16..20].copy_from_slice(&[10, 0, 0, 2]);

        assert_eq!(packet_dst(&packet), Some(IpAddr::from([10, 0, 0, 2])));
    }

    #[test]
    fn packet_dst_rejects_short_or_non_ipv4() {
        assert_eq!(packet_dst(&[0x45]), None);

        let mut v6 = vec![0u8; 20];
        v6[0] = 0x60;
        assert_eq!(packet_dst(&v6), None);
    }

    #[test]
    fn public_key_hex_is_stable_for_same_key() {
        let secret = StaticSecret::from([3u8; 32]);
        let public = PublicKey::from(&secret);

        assert_eq!(PublicKeyHex::from(&public), PublicKeyHex::from(&public));
    }
}
