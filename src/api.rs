use std::time::Duration;

use bitcoin::{Address, Network, Txid};
use serde_json::from_value;

use crate::address::address_to_script_hash;
use crate::codec;
use crate::error::{Error, Result};
use crate::merkle::{verify_merkle_proof, MerkleProof};
use crate::rpc::{NotifyFn, RpcChannel};
use crate::types::{Balance, Peer, PlainBlockHeader, PlainTransaction, Receipt, ServerFeatures};

/// The protocol range this client negotiates during the handshake.
pub const PROTOCOL_MIN: &str = "1.4";
pub const PROTOCOL_MAX: &str = "1.4.2";

/// Typed Electrum method surface over one RpcChannel. Every method maps to a
/// single RPC and converts the raw payload at this boundary; the channel below
/// never interprets semantics.
pub struct ElectrumApi {
    channel: RpcChannel,
    network: Network,
}

impl ElectrumApi {
    pub fn new(channel: RpcChannel, network: Network) -> Self {
        ElectrumApi { channel, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn close(&self, reason: &str) {
        self.channel.close(reason);
    }

    /// `server.version`: negotiate the protocol range. Returns the peer's
    /// software and the protocol version it settled on.
    pub fn set_protocol_version(
        &self,
        client_id: &str,
        range: (&str, &str),
        timeout: Duration,
    ) -> Result<(String, String)> {
        let params = [json!(client_id), json!([range.0, range.1])];
        match self.channel.request_timeout("server.version", &params, timeout) {
            Ok(result) => Ok(from_value(result)?),
            Err(Error::Rpc { message, .. }) => Err(Error::IncompatibleProtocol(message)),
            Err(e) => Err(e),
        }
    }

    pub fn get_features(&self, timeout: Duration) -> Result<ServerFeatures> {
        let result = self.channel.request_timeout("server.features", &[], timeout)?;
        Ok(from_value(result)?)
    }

    pub fn ping(&self, timeout: Duration) -> Result<()> {
        self.channel.request_timeout("server.ping", &[], timeout)?;
        Ok(())
    }

    pub fn get_balance(&self, address: &Address) -> Result<Balance> {
        let script_hash = address_to_script_hash(address);
        let result = self
            .channel
            .request("blockchain.scripthash.get_balance", &[json!(script_hash)])?;
        Ok(from_value(result)?)
    }

    pub fn get_receipts(&self, address: &Address) -> Result<Vec<Receipt>> {
        self.get_receipts_by_script_hash(&address_to_script_hash(address))
    }

    pub fn get_receipts_by_script_hash(&self, script_hash: &str) -> Result<Vec<Receipt>> {
        let result = self
            .channel
            .request("blockchain.scripthash.get_history", &[json!(script_hash)])?;
        Ok(from_value(result)?)
    }

    /// Fetch and parse a raw transaction. When `block` is given the peer's
    /// merkle path is verified against the header first, and the block fields
    /// are attached only on success.
    pub fn get_transaction(
        &self,
        txid: &Txid,
        block: Option<&PlainBlockHeader>,
    ) -> Result<PlainTransaction> {
        let result = self
            .channel
            .request("blockchain.transaction.get", &[json!(txid.to_string())])?;
        let hex = result
            .as_str()
            .ok_or_else(|| Error::Protocol(format!("unexpected transaction payload: {}", result)))?;
        let tx = codec::parse_tx(hex, self.network)?;

        Ok(match block {
            Some(header) => {
                self.proof_transaction(txid, header)?;
                tx.with_block(header)
            }
            None => tx,
        })
    }

    /// Standalone inclusion proof for an already-known transaction.
    pub fn proof_transaction(&self, txid: &Txid, header: &PlainBlockHeader) -> Result<()> {
        let proof = self.get_merkle(txid, header.block_height)?;
        verify_merkle_proof(txid, &proof, header)
    }

    pub fn get_merkle(&self, txid: &Txid, height: u32) -> Result<MerkleProof> {
        let result = self.channel.request(
            "blockchain.transaction.get_merkle",
            &[json!(txid.to_string()), json!(height)],
        )?;
        Ok(from_value(result)?)
    }

    pub fn get_block_header(&self, height: u32) -> Result<PlainBlockHeader> {
        let result = self.channel.request("blockchain.block.header", &[json!(height)])?;
        let hex = result
            .as_str()
            .ok_or_else(|| Error::Protocol(format!("unexpected header payload: {}", result)))?;
        codec::parse_header(hex, height)
    }

    /// Broadcast a raw transaction. Electrum v1.0 servers report rejections as
    /// a bare string result, so anything that is not the expected hash is
    /// treated as the server's error message.
    pub fn broadcast_transaction(&self, raw_hex: &str) -> Result<Txid> {
        let expected = codec::parse_tx(raw_hex, self.network)?.transaction_hash;
        let result = self
            .channel
            .request("blockchain.transaction.broadcast", &[json!(raw_hex)])?;
        match result.as_str() {
            Some(returned) if returned == expected.to_string() => Ok(expected),
            Some(message) => Err(Error::BroadcastRejected(message.into())),
            None => Err(Error::BroadcastRejected(result.to_string())),
        }
    }

    /// `mempool.get_fee_histogram`: `[[fee_rate, vsize], ...]`, cumulative
    /// from the top of the mempool.
    pub fn get_fee_histogram(&self) -> Result<Vec<(f64, u64)>> {
        let result = self.channel.request("mempool.get_fee_histogram", &[])?;
        Ok(from_value(result)?)
    }

    /// Fee estimate for confirmation within `target` blocks, in the server's
    /// BTC/kB form (-1 when the peer has no estimate).
    pub fn estimate_fee(&self, target: u16) -> Result<f64> {
        let result = self.channel.request("blockchain.estimatefee", &[json!(target)])?;
        result
            .as_f64()
            .ok_or_else(|| Error::Protocol(format!("unexpected fee estimate: {}", result)))
    }

    pub fn get_relay_fee(&self) -> Result<f64> {
        let result = self.channel.request("blockchain.relayfee", &[])?;
        result
            .as_f64()
            .ok_or_else(|| Error::Protocol(format!("unexpected relay fee: {}", result)))
    }

    pub fn get_peers(&self) -> Result<Vec<Peer>> {
        let result = self.channel.request("server.peers.subscribe", &[])?;
        let entries: Vec<(String, String, Vec<String>)> = from_value(result)?;
        Ok(entries
            .iter()
            .map(|(ip, host, features)| Peer::from_response(ip, host, features, self.network))
            .collect())
    }

    /// Subscribe to chain tips. The callback receives the initial `{hex,
    /// height}` response and every later `[{hex, height}]` notification.
    pub fn subscribe_headers(&self, callback: NotifyFn) -> Result<()> {
        self.channel.subscribe("blockchain.headers.subscribe", vec![], callback)
    }

    /// Subscribe to an address' status changes, keyed by its scripthash.
    /// Returns the scripthash the peer will use in notifications.
    pub fn subscribe_receipts(&self, address: &Address, callback: NotifyFn) -> Result<String> {
        let script_hash = address_to_script_hash(address);
        self.channel.subscribe(
            "blockchain.scripthash.subscribe",
            vec![json!(script_hash)],
            callback,
        )?;
        Ok(script_hash)
    }
}
