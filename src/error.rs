use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no suitable transport for peer {0}")]
    NoSuitableTransport(String),

    #[error("incompatible protocol version: {0}")]
    IncompatibleProtocol(String),

    #[error("Wrong genesis hash: peer is on {0}")]
    WrongGenesis(String),

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Block timeout")]
    BlockTimeout,

    #[error("Ping timeout")]
    PingTimeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("rpc {0} timed out")]
    RpcTimeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid merkle proof for {hash} at height {height}")]
    MerkleProofInvalid { hash: String, height: u32 },

    #[error("transaction broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("agent is not synced")]
    NotSynced,

    #[error("invalid address: {0}")]
    Address(#[from] bitcoin::util::address::Error),

    #[error("invalid consensus encoding: {0}")]
    Encode(#[from] bitcoin::consensus::encode::Error),

    #[error("invalid hex: {0}")]
    Hex(#[from] bitcoin_hashes::hex::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}
