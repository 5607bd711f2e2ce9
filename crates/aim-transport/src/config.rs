/// Configuration for the gossip transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local listen address (e.g. "/ip4/0.0.0.0/tcp/7788").
    pub listen_addr: String,
    /// Bootstrap peer multiaddresses.
    pub bootstrap_peers: Vec<String>,
    /// Protocol version string advertised to peers.
    pub protocol_version: String,
    /// Messages retained for store-and-forward recovery, per recipient.
    pub retained_per_recipient: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/7788".into(),
            bootstrap_peers: Vec::new(),
            protocol_version: "/aim/1.0.0".into(),
            retained_per_recipient: 1024,
        }
    }
}
