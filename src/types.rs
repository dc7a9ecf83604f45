use std::fmt;
use std::str::FromStr;

use bitcoin::{Address, BlockHash, Network, Script, Txid};
use bitcoin_hashes::hex::{FromHex, ToHex};

use crate::config::default_port;
use crate::error::{Error, Result};

/// How a peer is reached. Plain TCP and SSL go through the configured
/// tunneling proxy; WSS connects to the peer directly.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ssl,
    Wss,
}

impl FromStr for Transport {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "tcp" => Transport::Tcp,
            "ssl" => Transport::Ssl,
            "wss" => Transport::Wss,
            _ => return Err(Error::Protocol(format!("unknown transport {}", s))),
        })
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
            Transport::Wss => "wss",
        })
    }
}

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PeerPorts {
    pub tcp: Option<u16>,
    pub ssl: Option<u16>,
    pub wss: Option<u16>,
}

impl PeerPorts {
    pub fn get(&self, transport: Transport) -> Option<u16> {
        match transport {
            Transport::Tcp => self.tcp,
            Transport::Ssl => self.ssl,
            Transport::Wss => self.wss,
        }
    }
}

/// A peer entry, either configured manually or parsed from the feature tokens
/// advertised over `server.peers.subscribe`. Immutable after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    pub host: String,
    pub version: String,
    pub pruning_limit: Option<u32>,
    pub ports: PeerPorts,
    pub wss_path: Option<String>,
    pub prefer_transport: Option<Transport>,
}

impl Peer {
    pub fn new(host: &str, ports: PeerPorts) -> Self {
        Peer {
            ip: host.into(),
            host: host.into(),
            version: String::new(),
            pruning_limit: None,
            ports,
            wss_path: None,
            prefer_transport: None,
        }
    }

    /// Parse one `server.peers.subscribe` entry: `[ip, host, [features..]]`.
    /// Feature tokens are `v<ver>`, `p<prune>` and `t`/`s`/`w` with an
    /// optional port (empty means the network default).
    pub fn from_response(ip: &str, host: &str, features: &[String], network: Network) -> Self {
        let mut peer = Peer::new(host, PeerPorts::default());
        peer.ip = ip.into();
        for feature in features {
            if feature.is_empty() {
                continue;
            }
            let (tag, rest) = feature.split_at(1);
            match tag {
                "v" => peer.version = rest.into(),
                "p" => peer.pruning_limit = rest.parse().ok(),
                "t" | "s" | "w" => {
                    let transport = match tag {
                        "t" => Transport::Tcp,
                        "s" => Transport::Ssl,
                        _ => Transport::Wss,
                    };
                    let port = if rest.is_empty() {
                        Some(default_port(network, transport))
                    } else {
                        rest.parse().ok()
                    };
                    match transport {
                        Transport::Tcp => peer.ports.tcp = port,
                        Transport::Ssl => peer.ports.ssl = port,
                        Transport::Wss => peer.ports.wss = port,
                    }
                }
                _ => trace!("[{}] unknown feature token {}", host, feature),
            }
        }
        peer
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// An Electrum history entry. `block_height` is -1 for an unconfirmed
/// transaction with unconfirmed parents, 0 for unconfirmed, >0 for confirmed.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "height")]
    pub block_height: i32,
    #[serde(rename = "tx_hash")]
    pub transaction_hash: Txid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

/// Confirmed/unconfirmed balance in satoshis. The unconfirmed part may go
/// negative when mempool transactions spend confirmed outputs.
#[derive(Clone, Copy, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: i64,
}

/// A parsed 80-byte block header. `prev_hash` and `merkle_root` are `None`
/// only for the genesis header.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PlainBlockHeader {
    pub block_hash: BlockHash,
    pub block_height: u32,
    pub version: i32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub weight: usize,
    pub prev_hash: Option<BlockHash>,
    pub merkle_root: Option<bitcoin::TxMerkleNode>,
}

/// A single witness stack item: single bytes render as small integers,
/// anything longer as lowercase hex.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WitnessItem {
    Int(u8),
    Hex(String),
}

impl WitnessItem {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() == 1 {
            WitnessItem::Int(bytes[0])
        } else {
            WitnessItem::Hex(bytes.to_hex())
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(match self {
            WitnessItem::Int(n) => vec![*n],
            WitnessItem::Hex(hex) => Vec::from_hex(hex)?,
        })
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PlainInput {
    pub script: Script,
    /// The spent output's transaction hash (big-endian hex over the wire).
    pub transaction_hash: Txid,
    pub output_index: u32,
    pub index: usize,
    pub sequence: u32,
    pub witness: Vec<WitnessItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PlainOutput {
    pub script: Script,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub value: i64,
    pub index: usize,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct PlainTransaction {
    pub transaction_hash: Txid,
    pub version: i32,
    pub lock_time: u32,
    pub inputs: Vec<PlainInput>,
    pub outputs: Vec<PlainOutput>,
    pub weight: usize,
    pub vsize: usize,
    pub is_coinbase: bool,
    pub replace_by_fee: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<BlockHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,
}

impl PlainTransaction {
    pub fn with_block(mut self, header: &PlainBlockHeader) -> Self {
        self.block_hash = Some(header.block_hash);
        self.block_height = Some(header.block_height);
        self.timestamp = Some(header.timestamp);
        self
    }
}

/// The typed subset of `server.features` the agent cares about.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerFeatures {
    pub genesis_hash: BlockHash,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub protocol_min: Option<String>,
    #[serde(default)]
    pub protocol_max: Option<String>,
    #[serde(default)]
    pub pruning: Option<u32>,
    #[serde(default)]
    pub hash_function: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_from_response() {
        let features = vec![
            "v1.4.2".to_string(),
            "p10000".to_string(),
            "t".to_string(),
            "s50002".to_string(),
        ];
        let peer = Peer::from_response("83.212.111.114", "electrum.example.org", &features, Network::Bitcoin);
        assert_eq!(peer.host, "electrum.example.org");
        assert_eq!(peer.ip, "83.212.111.114");
        assert_eq!(peer.version, "1.4.2");
        assert_eq!(peer.pruning_limit, Some(10000));
        assert_eq!(peer.ports.tcp, Some(50001)); // network default
        assert_eq!(peer.ports.ssl, Some(50002));
        assert_eq!(peer.ports.wss, None);
    }

    #[test]
    fn test_peer_testnet_defaults() {
        let features = vec!["t".to_string(), "w".to_string()];
        let peer = Peer::from_response("1.2.3.4", "tn.example.org", &features, Network::Testnet);
        assert_eq!(peer.ports.tcp, Some(60001));
        assert_eq!(peer.ports.wss, Some(60004));
    }

    #[test]
    fn test_receipt_decoding() {
        let receipts: Vec<Receipt> = serde_json::from_str(
            r#"[{"height": 800001, "tx_hash": "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16", "fee": 144},
                {"height": 0, "tx_hash": "b1fea52486ce0c62bb442b530a3f0132b826c74e473d1f2c220bfa78111c5082"}]"#,
        )
        .unwrap();
        assert_eq!(receipts[0].block_height, 800001);
        assert_eq!(receipts[0].fee, Some(144));
        assert_eq!(
            receipts[0].transaction_hash.to_string(),
            "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16"
        );
        assert_eq!(receipts[1].block_height, 0);
        assert_eq!(receipts[1].fee, None);
    }

    #[test]
    fn test_witness_item_roundtrip() {
        let hex = WitnessItem::from_bytes(&[0xab, 0xcd]);
        assert_eq!(hex, WitnessItem::Hex("abcd".into()));
        assert_eq!(hex.to_bytes().unwrap(), vec![0xab, 0xcd]);

        let int = WitnessItem::from_bytes(&[1]);
        assert_eq!(int, WitnessItem::Int(1));
        assert_eq!(int.to_bytes().unwrap(), vec![1]);

        let empty = WitnessItem::from_bytes(&[]);
        assert_eq!(empty, WitnessItem::Hex(String::new()));
        assert_eq!(empty.to_bytes().unwrap(), Vec::<u8>::new());
    }
}
