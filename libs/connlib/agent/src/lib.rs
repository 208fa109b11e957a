//! Fuses a signaling session, a per-peer WebRTC/ICE lifecycle, and a WireGuard
//! device with a custom packet transport into one controller.
//!
//! [`Agent`] owns every peer's state centrally in [`Agent::peers`]. WebRTC
//! callbacks never hold a strong reference to a [`session::PeerSession`] or to
//! each other — they capture a [`std::sync::Weak<Agent>`] plus a `peer_id`
//! string and re-acquire the session under the lock on every firing. This is
//! the only thing that keeps ICE-callback/agent/bridge references acyclic.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;
mod peer_connection;
mod session;
mod transport;

pub use config::{AgentConfig, ConfigError};
pub use error::AgentError;
pub use session::{MAX_ICE_RESTARTS, PeerSession};
pub use transport::BridgeTransport;

use bridge::PacketBridge;
use connlib_model::PeerId;
use ipnet::IpNet;
use logging::err_with_src;
use parking_lot::Mutex;
use protocol::{Answer, IceCandidate, Join, Message as WireMessage, Offer, PeerInfo, Peers};
use signaling::{Config as SignalingConfig, JoinInfo, SignalingClient};
use socket_factory::SocketProtector;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr as _;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tun::TunDevice;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use wireguard::{PeerConfig, Transport as _, WireGuardDevice, WireGuardError};

/// WireGuard keepalive installed for every peer (spec §4.1).
const PERSISTENT_KEEPALIVE: Duration = Duration::from_secs(25);
/// ICE disconnect grace window before a restart is attempted (spec §4.2).
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);
/// Minimum spacing between effective `notify_network_change` calls (spec §5).
const NETWORK_CHANGE_DEBOUNCE: Duration = Duration::from_secs(3);
/// Label for the data channel the offering side creates; the answering side
/// learns it via `on_data_channel` regardless of what it's called.
const DATA_CHANNEL_LABEL: &str = "wg";

/// Host-level notifications the agent emits but never acts on itself (Open
/// Question 2): currently just a change in the set of kernel-installed routes,
/// which a host embedding the agent (e.g. an Android wrapper) may need to
/// redo its OS VPN interface for.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    RoutesUpdated(Vec<IpNet>),
}

/// Top-level controller. Constructed once per run; `Arc`-shared with every
/// spawned task and WebRTC callback closure.
pub struct Agent {
    config: AgentConfig,
    peers: Mutex<HashMap<PeerId, PeerSession>>,
    bridge: Arc<PacketBridge>,
    wg_device: Arc<WireGuardDevice<BridgeTransport>>,
    tun_device: Arc<dyn TunDevice>,
    network_manager: Arc<dyn net::NetworkManager>,
    webrtc_api: API,
    ice_servers: Vec<RTCIceServer>,
    socket_protector: Arc<dyn SocketProtector>,
    signaling: tokio::sync::OnceCell<Arc<SignalingClient>>,
    last_network_change: Mutex<Option<Instant>>,
    events: broadcast::Sender<AgentEvent>,
}

impl Agent {
    /// Creates the TUN device, the WireGuard device bound to a fresh
    /// [`PacketBridge`], and the shared WebRTC `API`. Does not touch the
    /// network or dial signaling yet; that happens in [`Agent::run`].
    pub fn new(
        config: AgentConfig,
        tun_device: Arc<dyn TunDevice>,
        network_manager: Arc<dyn net::NetworkManager>,
        socket_protector: Arc<dyn SocketProtector>,
    ) -> Result<Arc<Self>, AgentError> {
        let bridge = PacketBridge::new();
        let transport = Arc::new(BridgeTransport::new(bridge.clone()));
        let wg_device = WireGuardDevice::new(config.private_key.clone(), tun_device.clone(), transport)?;

        let webrtc_api = peer_connection::build_api().map_err(|e| AgentError::Network(e.into()))?;
        let ice_servers = peer_connection::ice_servers(&config.stun_servers);

        let (events, _rx) = broadcast::channel(16);

        Ok(Arc::new(Self {
            config,
            peers: Mutex::new(HashMap::new()),
            bridge,
            wg_device,
            tun_device,
            network_manager,
            webrtc_api,
            ice_servers,
            socket_protector,
            signaling: tokio::sync::OnceCell::new(),
            last_network_change: Mutex::new(None),
            events,
        }))
    }

    /// Subscribes to host-level notifications (Open Question 2). May be called
    /// any number of times; every subscriber gets every event from this point.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Brings the tunnel interface up, connects signaling, and runs the
    /// message loop until `cancel` fires or a fatal error occurs.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), AgentError> {
        self.network_manager
            .add_address(self.tun_device.name(), self.config.tunnel_address)
            .await
            .map_err(AgentError::Network)?;
        self.network_manager
            .set_link_up(self.tun_device.name())
            .await
            .map_err(AgentError::Network)?;

        let join = JoinInfo {
            peer_id: self.config.local_name.clone(),
            public_key: connlib_model::encode_public_key(&boringtun::x25519::PublicKey::from(&self.config.private_key)),
            address: Some(self.config.tunnel_address.to_string()),
            routes: Vec::new(),
            metadata: HashMap::new(),
        };

        let signaling_config = SignalingConfig {
            dial_timeout: self.config.dial_timeout,
            ..SignalingConfig::new(self.config.signaling_url.clone(), self.config.signaling_token.clone(), join)
        };

        let signaling = SignalingClient::connect(signaling_config, None, cancel.clone()).await?;
        let mut inbound = signaling.messages().await;

        self.signaling
            .set(signaling.clone())
            .unwrap_or_else(|_| panic!("Agent::run must only be called once"));

        let result = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(AgentError::Cancelled),
                message = inbound.recv() => match message {
                    Some(message) => self.dispatch(message).await,
                    None => break Err(AgentError::Cancelled),
                },
            }
        };

        self.shutdown().await;
        result
    }

    async fn dispatch(self: &Arc<Self>, message: WireMessage) {
        match message {
            WireMessage::Peers(peers) => self.handle_peers(peers).await,
            WireMessage::Offer(offer) => self.handle_offer(offer).await,
            WireMessage::Answer(answer) => self.handle_answer(answer).await,
            WireMessage::IceCandidate(candidate) => self.handle_ice_candidate(candidate).await,
            WireMessage::PeerLeft(left) => self.remove_peer(&left.peer_id).await,
            WireMessage::Join(_) => {
                tracing::debug!("Ignoring unexpected join message from signaling relay");
            }
        }
    }

    fn signaling(&self) -> Arc<SignalingClient> {
        self.signaling
            .get()
            .expect("signaling is set before the message loop starts")
            .clone()
    }

    // ---- message handlers (spec §4.1) ----

    async fn handle_peers(self: &Arc<Self>, peers: Peers) {
        for peer in peers.peers {
            if peer.peer_id == self.config.local_name {
                continue;
            }

            let already_present = self.peers.lock().contains_key(&peer.peer_id);
            if already_present {
                continue;
            }

            if self.config.local_name < peer.peer_id {
                self.initiate_offer(peer).await;
            }
        }

        let restart_targets: Vec<PeerId> = {
            let mut peers = self.peers.lock();
            peers
                .iter_mut()
                .filter_map(|(id, session)| {
                    if session.needs_restart() {
                        session.clear_needs_restart();
                        Some(id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        for peer_id in restart_targets {
            self.attempt_ice_restart(&peer_id).await;
        }
    }

    async fn initiate_offer(self: &Arc<Self>, peer: PeerInfo) {
        let peer_id = peer.peer_id.clone();

        let rtc_peer = match self.new_peer_connection(peer_id.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create peer connection");
                return;
            }
        };

        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let data_channel = match rtc_peer.create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init)).await {
            Ok(dc) => dc,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create data channel");
                return;
            }
        };

        let mut session = PeerSession::new(peer_id.clone(), rtc_peer.clone());
        apply_peer_info(&mut session, &peer);
        self.peers.lock().insert(peer_id.clone(), session);

        // Registered only after the session exists in the map: `register_data_channel`
        // mutates the session's `data_channel` field through `peers.lock().entry(..)`,
        // which is a no-op against a key that isn't there yet.
        self.register_data_channel(peer_id.clone(), data_channel);

        let offer = match rtc_peer.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create offer");
                return;
            }
        };
        if let Err(e) = rtc_peer.set_local_description(offer.clone()).await {
            tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to set local description");
            return;
        }

        self.send_offer(&peer_id, &offer.sdp);
        tracing::info!(%peer_id, "Sent offer");
    }

    async fn handle_offer(self: &Arc<Self>, offer: Offer) {
        let peer_id = offer.from.clone();

        let existing = self.peers.lock().remove(&peer_id);
        if let Some(prior) = existing {
            tracing::info!(%peer_id, "Replacing existing session on incoming offer (glare)");
            prior.rtc_peer.close().await.ok();
            self.wg_device_remove_if_known(&prior);
            self.bridge.remove_data_channel(&peer_id);
        }

        let rtc_peer = match self.new_peer_connection(peer_id.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create peer connection");
                return;
            }
        };

        let mut session = PeerSession::new(peer_id.clone(), rtc_peer.clone());
        if let Some(public_key) = offer.public_key.as_deref().and_then(connlib_model::decode_public_key) {
            session.wg_public_key = Some(public_key);
        }
        if let Some(tunnel_address) = offer.address.as_deref().and_then(|a| IpNet::from_str(a).ok()) {
            session.tunnel_address = Some(tunnel_address);
        }
        self.peers.lock().insert(peer_id.clone(), session);

        let remote = RTCSessionDescription::offer(offer.sdp);
        let Ok(remote) = remote else {
            tracing::warn!(%peer_id, "Received malformed offer SDP");
            return;
        };

        if let Err(e) = rtc_peer.set_remote_description(remote).await {
            tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to set remote description");
            return;
        }
        self.mark_remote_description_set(&peer_id).await;

        let answer = match rtc_peer.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create answer");
                return;
            }
        };
        if let Err(e) = rtc_peer.set_local_description(answer.clone()).await {
            tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to set local description for answer");
            return;
        }

        let local_public_key = connlib_model::encode_public_key(&boringtun::x25519::PublicKey::from(&self.config.private_key));
        self.signaling().send(WireMessage::Answer(Answer {
            from: self.config.local_name.clone(),
            to: peer_id.clone(),
            sdp: answer.sdp,
            public_key: Some(local_public_key),
        }));
        tracing::info!(%peer_id, "Sent answer");
    }

    async fn handle_answer(self: &Arc<Self>, answer: Answer) {
        let peer_id = answer.from.clone();

        let rtc_peer = {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(&peer_id) else {
                tracing::warn!(%peer_id, "Received answer for unknown session");
                return;
            };

            if session.wg_public_key.is_none() {
                session.wg_public_key = answer.public_key.as_deref().and_then(connlib_model::decode_public_key);
            }

            session.rtc_peer.clone()
        };

        let remote = RTCSessionDescription::answer(answer.sdp);
        let Ok(remote) = remote else {
            tracing::warn!(%peer_id, "Received malformed answer SDP");
            return;
        };

        if let Err(e) = rtc_peer.set_remote_description(remote).await {
            tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to set remote description from answer");
            return;
        }
        self.mark_remote_description_set(&peer_id).await;
    }

    async fn handle_ice_candidate(self: &Arc<Self>, candidate: IceCandidate) {
        let peer_id = candidate.from.clone();

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            ..Default::default()
        };

        let (rtc_peer, should_apply_now) = {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(&peer_id) else {
                tracing::debug!(%peer_id, "Dropping ICE candidate for unknown peer (benign race)");
                return;
            };

            if session.remote_description_set {
                (Some(session.rtc_peer.clone()), true)
            } else {
                session.buffered_ice_candidates.push(init);
                (None, false)
            }
        };

        if should_apply_now {
            if let Some(rtc_peer) = rtc_peer {
                if let Err(e) = rtc_peer.add_ice_candidate(init).await {
                    tracing::debug!(%peer_id, error = %err_with_src(&e), "Failed to add ICE candidate");
                }
            }
        }
    }

    /// Applies the remote description's side effect on candidate ordering
    /// (spec invariant 7): flips `remote_description_set` and replays every
    /// buffered candidate, in arrival order, before returning.
    async fn mark_remote_description_set(self: &Arc<Self>, peer_id: &PeerId) {
        let (rtc_peer, buffered) = {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(peer_id) else {
                return;
            };
            session.remote_description_set = true;
            (session.rtc_peer.clone(), std::mem::take(&mut session.buffered_ice_candidates))
        };

        for candidate in buffered {
            if let Err(e) = rtc_peer.add_ice_candidate(candidate).await {
                tracing::debug!(%peer_id, error = %err_with_src(&e), "Failed to add buffered ICE candidate");
            }
        }
    }

    // ---- peer connection construction and callbacks ----

    async fn new_peer_connection(self: &Arc<Self>, peer_id: PeerId) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let rtc_peer = peer_connection::new_peer_connection(&self.webrtc_api, self.ice_servers.clone()).await?;

        let weak = Arc::downgrade(self);
        let cb_peer_id = peer_id.clone();
        rtc_peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let weak = weak.clone();
            let peer_id = cb_peer_id.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.on_ice_state_change(peer_id, state).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let cb_peer_id = peer_id.clone();
        rtc_peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            let peer_id = cb_peer_id.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.on_local_ice_candidate(peer_id, candidate).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let cb_peer_id = peer_id.clone();
        rtc_peer.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            let peer_id = cb_peer_id.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.register_data_channel(peer_id, dc);
                }
            })
        }));

        Ok(rtc_peer)
    }

    fn register_data_channel(self: &Arc<Self>, peer_id: PeerId, data_channel: Arc<RTCDataChannel>) {
        let weak = Arc::downgrade(self);
        let cb_peer_id = peer_id.clone();
        let cb_dc = data_channel.clone();
        data_channel.on_open(Box::new(move || {
            let weak = weak.clone();
            let peer_id = cb_peer_id.clone();
            let dc = cb_dc.clone();
            Box::pin(async move {
                if let Some(agent) = weak.upgrade() {
                    agent.on_data_channel_open(peer_id, dc).await;
                }
            })
        }));

        self.peers.lock().entry(peer_id.clone()).and_modify(|session| {
            session.data_channel = Some(data_channel);
        });
    }

    async fn on_local_ice_candidate(self: &Arc<Self>, peer_id: PeerId, candidate: Option<RTCIceCandidate>) {
        let Some(candidate) = candidate else {
            return;
        };
        let Ok(init) = candidate.to_json() else {
            return;
        };

        self.signaling().send(WireMessage::IceCandidate(IceCandidate {
            from: self.config.local_name.clone(),
            to: peer_id,
            candidate: init.candidate,
        }));
    }

    /// Data-channel-open callback (spec §4.1): registers the channel with the
    /// bridge, then installs a WireGuard peer iff both the public key and
    /// tunnel address are already known (security invariant in spec §3).
    async fn on_data_channel_open(self: &Arc<Self>, peer_id: PeerId, data_channel: Arc<RTCDataChannel>) {
        self.bridge.set_data_channel(peer_id.clone(), data_channel);

        let install = {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(&peer_id) else {
                return;
            };
            session.connected_at = Some(Instant::now());

            match (session.wg_public_key, session.tunnel_address) {
                (Some(public_key), Some(tunnel_address)) => {
                    let mut allowed_ips = vec![tunnel_address];
                    allowed_ips.extend(accepted_routes(&self.config, peer_id.as_str(), &session.routes));
                    Some((public_key, allowed_ips))
                }
                _ => None,
            }
        };

        let Some((public_key, allowed_ips)) = install else {
            tracing::debug!(%peer_id, "Data channel open without a known tunnel address; no WireGuard peer installed");
            return;
        };

        let result = self.wg_device.add_peer(PeerConfig {
            public_key,
            endpoint: peer_id.as_str().to_owned(),
            allowed_ips,
            persistent_keepalive: Some(PERSISTENT_KEEPALIVE),
        });

        match result {
            Ok(()) => tracing::info!(%peer_id, "Installed WireGuard peer"),
            Err(WireGuardError::PeerAlreadyExists(_)) => {}
            Err(e) => tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to install WireGuard peer"),
        }
    }

    // ---- ICE lifecycle (spec §4.2) ----

    async fn on_ice_state_change(self: &Arc<Self>, peer_id: PeerId, state: RTCIceConnectionState) {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                let mut peers = self.peers.lock();
                if let Some(session) = peers.get_mut(&peer_id) {
                    session.cancel_grace_timer();
                    session.disconnect_time = None;
                    session.ice_restart_count = 0;
                    session.restart_in_flight = false;
                }
            }
            RTCIceConnectionState::Disconnected => {
                self.arm_grace_timer(peer_id);
            }
            RTCIceConnectionState::Failed => {
                {
                    let mut peers = self.peers.lock();
                    if let Some(session) = peers.get_mut(&peer_id) {
                        session.cancel_grace_timer();
                    }
                }
                self.attempt_ice_restart(&peer_id).await;
            }
            _ => {}
        }
    }

    fn arm_grace_timer(self: &Arc<Self>, peer_id: PeerId) {
        let mut peers = self.peers.lock();
        let Some(session) = peers.get_mut(&peer_id) else {
            return;
        };

        if session.grace_timer.is_some() {
            return;
        }
        session.disconnect_time = Some(Instant::now());

        let agent = self.clone();
        let timer_peer_id = peer_id;
        session.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            agent.on_grace_expired(timer_peer_id).await;
        }));
    }

    async fn on_grace_expired(self: &Arc<Self>, peer_id: PeerId) {
        {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(&peer_id) else {
                return;
            };
            session.grace_timer = None;
        }

        self.attempt_ice_restart(&peer_id).await;
    }

    async fn attempt_ice_restart(self: &Arc<Self>, peer_id: &PeerId) {
        let rtc_peer = {
            let mut peers = self.peers.lock();
            let Some(session) = peers.get_mut(peer_id) else {
                return;
            };

            if !session.can_restart() {
                tracing::warn!(%peer_id, "ICE restart budget exhausted, removing session");
                drop(peers);
                self.remove_peer(peer_id).await;
                return;
            }
            if session.restart_in_flight {
                return;
            }

            session.ice_restart_count += 1;
            session.cancel_grace_timer();
            session.restart_in_flight = true;
            session.rtc_peer.clone()
        };

        let offer_options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };

        let offer = match rtc_peer.create_offer(Some(offer_options)).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to create ICE restart offer");
                return;
            }
        };
        if let Err(e) = rtc_peer.set_local_description(offer.clone()).await {
            tracing::warn!(%peer_id, error = %err_with_src(&e), "Failed to set local description for ICE restart");
            return;
        }

        self.send_offer(peer_id, &offer.sdp);
        tracing::info!(%peer_id, "Sent ICE restart offer");
    }

    fn send_offer(self: &Arc<Self>, peer_id: &PeerId, sdp: &str) {
        let local_public_key = connlib_model::encode_public_key(&boringtun::x25519::PublicKey::from(&self.config.private_key));
        self.signaling().send(WireMessage::Offer(Offer {
            from: self.config.local_name.clone(),
            to: peer_id.clone(),
            sdp: sdp.to_owned(),
            public_key: Some(local_public_key),
            address: Some(self.config.tunnel_address.to_string()),
        }));
    }

    // ---- removal and shutdown ----

    async fn remove_peer(self: &Arc<Self>, peer_id: &PeerId) {
        let session = self.peers.lock().remove(peer_id);
        let Some(mut session) = session else {
            return;
        };

        session.cancel_grace_timer();
        self.bridge.remove_data_channel(peer_id);
        self.wg_device_remove_if_known(&session);
        session.rtc_peer.close().await.ok();

        tracing::info!(%peer_id, "Removed peer session");
    }

    fn wg_device_remove_if_known(&self, session: &PeerSession) {
        let Some(public_key) = session.wg_public_key else {
            return;
        };

        match self.wg_device.remove_peer(&public_key) {
            Ok(()) | Err(WireGuardError::UnknownPeer(_)) => {}
            Err(e) => tracing::warn!(error = %err_with_src(&e), "Failed to remove WireGuard peer"),
        }
    }

    async fn shutdown(self: &Arc<Self>) {
        if let Some(signaling) = self.signaling.get() {
            signaling.close().await;
        }

        let peer_ids: Vec<PeerId> = self.peers.lock().keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }

        self.bridge.close();
        self.wg_device.close();
    }

    /// Debounced network-reset hook (spec §5). Resets every session's restart
    /// bookkeeping and defers the actual ICE restart until the next `peers`
    /// message arrives (typically once signaling has reconnected over the new
    /// network).
    pub fn notify_network_change(self: &Arc<Self>) {
        let now = Instant::now();
        {
            let mut last = self.last_network_change.lock();
            if let Some(previous) = *last {
                if now.duration_since(previous) < NETWORK_CHANGE_DEBOUNCE {
                    return;
                }
            }
            *last = Some(now);
        }

        let mut peers = self.peers.lock();
        for session in peers.values_mut() {
            session.ice_restart_count = 0;
            session.cancel_grace_timer();
            session.restart_in_flight = false;
            session.set_needs_restart();
        }

        tracing::info!("Network change observed; ICE restarts deferred until next peer list");
    }
}

/// Route acceptance filter (spec §4.1.1): `0.0.0.0/0`, `::/0`, and any
/// non-parseable CIDR are rejected outright; anything else is only installed
/// if the local config opted into that peer's routes.
fn accepted_routes(config: &AgentConfig, peer_id: &str, advertised: &[IpNet]) -> Vec<IpNet> {
    let Some(opted_in) = config.peer_routes.get(peer_id) else {
        return Vec::new();
    };

    advertised
        .iter()
        .filter(|route| is_acceptable_route(route))
        .filter(|route| opted_in.contains(route))
        .copied()
        .collect()
}

fn is_acceptable_route(route: &IpNet) -> bool {
    match route {
        IpNet::V4(v4) => v4.prefix_len() != 0,
        IpNet::V6(v6) => v6.prefix_len() != 0,
    }
}

fn apply_peer_info(session: &mut PeerSession, peer: &PeerInfo) {
    if let Some(public_key) = peer.public_key.as_str().pipe(connlib_model::decode_public_key) {
        session.wg_public_key = Some(public_key);
    }
    if let Some(address) = peer.address.as_deref().and_then(|a| IpNet::from_str(a).ok()) {
        session.tunnel_address = Some(address);
    }
    session.routes = peer
        .routes
        .iter()
        .filter_map(|r| IpNet::from_str(r).ok())
        .filter(is_acceptable_route)
        .collect();
}

trait Pipe: Sized {
    fn pipe<T>(self, f: impl FnOnce(Self) -> T) -> T {
        f(self)
    }
}
impl<T> Pipe for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    #[test]
    fn rejects_default_route() {
        assert!(!is_acceptable_route(&net("0.0.0.0/0")));
        assert!(!is_acceptable_route(&net("::/0")));
    }

    #[test]
    fn accepts_specific_route() {
        assert!(is_acceptable_route(&net("10.0.0.0/24")));
    }

    #[test]
    fn accepted_routes_requires_opt_in() {
        let config = AgentConfig {
            private_key: boringtun::x25519::StaticSecret::from([1u8; 32]),
            local_name: PeerId::new("alpha"),
            tunnel_address: net("10.0.0.1/24"),
            signaling_url: url::Url::parse("ws://localhost/").unwrap(),
            signaling_token: secrecy::SecretString::from("token".to_owned()),
            stun_servers: Vec::new(),
            peer_routes: HashMap::new(),
            dial_timeout: Duration::from_secs(10),
        };

        let advertised = vec![net("192.168.1.0/24")];
        assert!(accepted_routes(&config, "bravo", &advertised).is_empty());
    }

    #[test]
    fn accepted_routes_installs_opted_in_route() {
        let mut peer_routes = HashMap::new();
        peer_routes.insert("bravo".to_owned(), vec![net("192.168.1.0/24")]);

        let config = AgentConfig {
            private_key: boringtun::x25519::StaticSecret::from([1u8; 32]),
            local_name: PeerId::new("alpha"),
            tunnel_address: net("10.0.0.1/24"),
            signaling_url: url::Url::parse("ws://localhost/").unwrap(),
            signaling_token: secrecy::SecretString::from("token".to_owned()),
            stun_servers: Vec::new(),
            peer_routes,
            dial_timeout: Duration::from_secs(10),
        };

        let advertised = vec![net("192.168.1.0/24"), net("0.0.0.0/0")];
        let accepted = accepted_routes(&config, "bravo", &advertised);

        assert_eq!(accepted, vec![net("192.168.1.0/24")]);
    }
}
