//! Adapts [`bridge::PacketBridge`]'s batch-oriented socket shape to the
//! single-packet [`wireguard::Transport`] contract `WireGuardDevice` expects.

use async_trait::async_trait;
use bridge::{BridgeError, Endpoint, PacketBridge};
use std::sync::Arc;
use wireguard::{Transport, TransportClosed};

/// Thin wrapper: every call forwards to the bridge with a one-element batch.
pub struct BridgeTransport {
    bridge: Arc<PacketBridge>,
}

impl BridgeTransport {
    pub fn new(bridge: Arc<PacketBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    type Endpoint = Endpoint;

    fn open(&self, port: u16) -> std::io::Result<u16> {
        self.bridge.open(port)
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint), TransportClosed> {
        let mut bufs: [&mut [u8]; 1] = [buf];
        let mut sizes = [0usize];
        let mut endpoints: [Option<Endpoint>; 1] = [None];

        match self.bridge.receive(&mut bufs, &mut sizes, &mut endpoints).await {
            Ok(0) => Err(TransportClosed),
            Ok(_) => {
                let endpoint = endpoints[0].take().ok_or(TransportClosed)?;
                Ok((sizes[0], endpoint))
            }
            Err(BridgeError::Closed) => Err(TransportClosed),
            Err(_) => Err(TransportClosed),
        }
    }

    async fn send(&self, buf: &[u8], endpoint: &Self::Endpoint) -> std::io::Result<()> {
        self.bridge
            .send(&[buf], endpoint)
            .await
            .map_err(|e| std::io::Error::other(e))?;

        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> Self::Endpoint {
        self.bridge.parse_endpoint(s)
    }

    fn close(&self) {
        self.bridge.close();
    }
}
