//! Per-peer WebRTC/ICE state. Deliberately a plain data bag: every state
//! transition lives on `Agent` instead, which locks `Agent::peers` once per call
//! rather than handing out a reference a callback could hold onto. See the
//! module docs on [`crate::Agent`] for why.

use connlib_model::PeerId;
use ipnet::IpNet;
use std::sync::Arc;
use std::time::Instant;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Hard ceiling on ICE restarts for one peer before the agent gives up and tears
/// the session down entirely (spec §4.2).
pub const MAX_ICE_RESTARTS: u32 = 5;

/// One remote peer's connection, from the moment an offer/answer is first
/// exchanged until the session is torn down.
pub struct PeerSession {
    pub peer_id: PeerId,
    pub rtc_peer: Arc<RTCPeerConnection>,
    pub data_channel: Option<Arc<RTCDataChannel>>,

    pub wg_public_key: Option<boringtun::x25519::PublicKey>,
    pub tunnel_address: Option<IpNet>,
    pub routes: Vec<IpNet>,

    pub created_at: Instant,
    pub connected_at: Option<Instant>,

    /// Number of ICE restarts issued so far; capped at [`MAX_ICE_RESTARTS`].
    pub ice_restart_count: u32,
    /// Set when the ICE connection state drops to `Disconnected`; cleared on
    /// reconnect. Checked by the grace-period sweep to decide whether the grace
    /// window has elapsed.
    pub disconnect_time: Option<Instant>,
    /// Handle to the task waiting out the disconnect grace period, so it can be
    /// cancelled if the peer reconnects before the grace period elapses.
    pub grace_timer: Option<tokio::task::JoinHandle<()>>,
    /// Set while an ICE restart offer is in flight, so a second `Disconnected` or
    /// `Failed` event doesn't issue an overlapping restart.
    pub restart_in_flight: bool,
    /// Set by `notify_network_change`; a deferred restart queued until the next
    /// `peers` list arrives rather than fired immediately (spec §5).
    needs_restart: bool,

    /// `true` once `set_remote_description` has succeeded; until then inbound ICE
    /// candidates are buffered rather than applied, per WebRTC's own ordering
    /// requirement.
    pub remote_description_set: bool,
    pub buffered_ice_candidates: Vec<RTCIceCandidateInit>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, rtc_peer: Arc<RTCPeerConnection>) -> Self {
        Self {
            peer_id,
            rtc_peer,
            data_channel: None,
            wg_public_key: None,
            tunnel_address: None,
            routes: Vec::new(),
            created_at: Instant::now(),
            connected_at: None,
            ice_restart_count: 0,
            disconnect_time: None,
            grace_timer: None,
            restart_in_flight: false,
            remote_description_set: false,
            buffered_ice_candidates: Vec::new(),
        }
    }

    pub fn can_restart(&self) -> bool {
        self.ice_restart_count < MAX_ICE_RESTARTS
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    pub fn set_needs_restart(&mut self) {
        self.needs_restart = true;
    }

    pub fn clear_needs_restart(&mut self) {
        self.needs_restart = false;
    }

    /// Cancels any pending grace-period sweep. Called both when the peer
    /// reconnects and right before a forced teardown, so neither path races the
    /// timer into re-running teardown logic on a session that's already gone.
    pub fn cancel_grace_timer(&mut self) {
        if let Some(handle) = self.grace_timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;

    async fn dummy_peer() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(api.new_peer_connection(Default::default()).await.unwrap())
    }

    #[tokio::test]
    async fn can_restart_up_to_but_not_past_the_cap() {
        let mut session = PeerSession::new(PeerId::new("peer-a"), dummy_peer().await);
        assert!(session.can_restart());

        session.ice_restart_count = MAX_ICE_RESTARTS - 1;
        assert!(session.can_restart());

        session.ice_restart_count = MAX_ICE_RESTARTS;
        assert!(!session.can_restart());
    }

    #[tokio::test]
    async fn needs_restart_flag_round_trips() {
        let mut session = PeerSession::new(PeerId::new("peer-a"), dummy_peer().await);
        assert!(!session.needs_restart());

        session.set_needs_restart();
        assert!(session.needs_restart());

        session.clear_needs_restart();
        assert!(!session.needs_restart());
    }
}
