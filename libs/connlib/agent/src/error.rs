//! Fatal errors returned from [`crate::Agent::run`]. Everything else (malformed
//! messages, transient signaling loss, ICE churn) is logged and handled in place.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to create the WireGuard device")]
    WireGuard(#[from] wireguard::WireGuardError),
    #[error("failed to connect to the signaling relay")]
    Signaling(#[from] signaling::ConnectError),
    #[error("failed to configure the tunnel interface")]
    Network(#[source] anyhow::Error),
    #[error("agent was cancelled")]
    Cancelled,
}
