use std::time::Duration;

use bitcoin::{BlockHash, Network};
use bitcoin_hashes::hex::FromHex;

use crate::types::Transport;

/// Process-wide client configuration, constructed once at startup and threaded
/// through Agent/Api construction.
#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,

    /// WebSocket url of the tunneling proxy used to reach peers over plain TCP.
    /// `None` disables the TCP transport.
    pub tcp_proxy_url: Option<String>,

    /// WebSocket url of the tunneling proxy used to reach peers over SSL.
    /// `None` disables the SSL transport.
    pub ssl_proxy_url: Option<String>,

    /// Client identifier string reported to the peer in `server.version`.
    pub client_id: String,

    pub handshake_timeout: Duration,
    pub block_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Config {
    pub fn new(network: Network) -> Self {
        Config {
            network,
            tcp_proxy_url: None,
            ssl_proxy_url: None,
            client_id: format!("elc v{}", env!("CARGO_PKG_VERSION")),
            handshake_timeout: Duration::from_secs(4),
            block_timeout: Duration::from_secs(4),
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(10),
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        genesis_hash(self.network)
    }

    /// The network token used by the tunneling proxy to address the real peer.
    pub fn network_token(&self) -> &'static str {
        match self.network {
            Network::Bitcoin => "mainnet",
            _ => "testnet",
        }
    }

    #[cfg(feature = "extra")]
    pub fn setup_logger(verbose: usize, timestamp: bool) {
        use log::Level;

        if timestamp {
            pretty_env_logger::formatted_timed_builder()
        } else {
            pretty_env_logger::formatted_builder()
        }
        .filter_module(
            "elc",
            match verbose {
                0 => Level::Info,
                1 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_module("tungstenite", Level::Warn.to_level_filter())
        .filter_level(
            match verbose {
                0 | 1 => Level::Warn,
                2 => Level::Info,
                3 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .init();
    }
}

pub fn genesis_hash(network: Network) -> BlockHash {
    BlockHash::from_hex(match network {
        Network::Bitcoin => "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        Network::Regtest => "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        _ => "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
    })
    .unwrap()
}

/// Default Electrum ports per network, used when a peer advertises a transport
/// feature token with no explicit port.
pub fn default_port(network: Network, transport: Transport) -> u16 {
    match (network, transport) {
        (Network::Bitcoin, Transport::Tcp) => 50001,
        (Network::Bitcoin, Transport::Ssl) => 50002,
        (Network::Bitcoin, Transport::Wss) => 50004,
        (_, Transport::Tcp) => 60001,
        (_, Transport::Ssl) => 60002,
        (_, Transport::Wss) => 60004,
    }
}
