//! Builds the shared `webrtc` [`API`](webrtc::api::API) and per-peer
//! [`RTCPeerConnection`]s.

use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Builds the `API` used to construct every peer connection this agent opens.
/// One instance is shared across all peers, the way every `webrtc` crate caller
/// does it; there is nothing per-peer about media engine or interceptor setup.
pub fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn ice_servers(stun_servers: &[String]) -> Vec<RTCIceServer> {
    stun_servers
        .iter()
        .map(|urls| RTCIceServer {
            urls: vec![urls.clone()],
            ..Default::default()
        })
        .collect()
}

/// Opens a new peer connection, with `ice_servers` already configured. No data
/// channel or event handlers are attached here; the caller (`Agent`) wires
/// those up once it holds the connection, since the handlers need to capture a
/// peer id and a weak reference back to the agent.
pub async fn new_peer_connection(
    api: &API,
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}
