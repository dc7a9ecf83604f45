#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;

pub mod address;
pub mod agent;
pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod merkle;
pub mod rpc;
pub mod store;
pub mod transport;
pub mod types;

pub use agent::{Agent, Event, EventFn, ListenerHandle};
pub use api::ElectrumApi;
pub use config::Config;
pub use error::{Error, Result};
pub use rpc::RpcChannel;
pub use store::{BlockStore, MemoryStore, TransactionStore};
pub use types::{
    Balance, Peer, PeerPorts, PlainBlockHeader, PlainInput, PlainOutput, PlainTransaction,
    Receipt, Transport,
};
