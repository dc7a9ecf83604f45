use bitcoin::blockdata::constants::WITNESS_SCALE_FACTOR;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{BlockHeader, Network, OutPoint, Transaction, TxIn, TxOut};
use bitcoin_hashes::hex::{FromHex, ToHex};
use bitcoin_hashes::{sha256d, Hash};

use crate::address;
use crate::error::{Error, Result};
use crate::types::{PlainBlockHeader, PlainInput, PlainOutput, PlainTransaction, WitnessItem};

/// Inputs signalling RBF carry a sequence below this value (BIP-125).
const RBF_SEQUENCE_LIMIT: u32 = 0xFFFF_FFFE;

const HEADER_SIZE: usize = 80;

pub fn sha256d(bytes: &[u8]) -> sha256d::Hash {
    sha256d::Hash::hash(bytes)
}

/// Parse a raw transaction (legacy or segwit wire form) into its plain
/// structural form. Block fields are left unset; they are attached only after
/// a successful inclusion proof.
pub fn parse_tx(hex: &str, network: Network) -> Result<PlainTransaction> {
    let bytes = Vec::from_hex(hex)?;
    let tx: Transaction = deserialize(&bytes)?;
    Ok(from_raw(&tx, network))
}

pub fn from_raw(tx: &Transaction, network: Network) -> PlainTransaction {
    let weight = tx.get_weight();
    let inputs = tx
        .input
        .iter()
        .enumerate()
        .map(|(index, txin)| PlainInput {
            script: txin.script_sig.clone(),
            transaction_hash: txin.previous_output.txid,
            output_index: txin.previous_output.vout,
            index,
            sequence: txin.sequence,
            witness: txin.witness.iter().map(|w| WitnessItem::from_bytes(w)).collect(),
            address: address::input_address(txin, network),
        })
        .collect();
    let outputs = tx
        .output
        .iter()
        .enumerate()
        .map(|(index, txout)| PlainOutput {
            script: txout.script_pubkey.clone(),
            address: address::output_address(&txout.script_pubkey, network),
            value: txout.value as i64,
            index,
        })
        .collect();

    PlainTransaction {
        transaction_hash: tx.txid(),
        version: tx.version,
        lock_time: tx.lock_time,
        inputs,
        outputs,
        weight,
        vsize: (weight + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR,
        is_coinbase: tx.is_coin_base(),
        replace_by_fee: tx.input.iter().any(|txin| txin.sequence < RBF_SEQUENCE_LIMIT),
        block_hash: None,
        block_height: None,
        timestamp: None,
    }
}

/// Rebuild the consensus wire form of a plain transaction.
pub fn to_raw(tx: &PlainTransaction) -> Result<Transaction> {
    let input = tx
        .inputs
        .iter()
        .map(|txin| {
            Ok(TxIn {
                previous_output: OutPoint::new(txin.transaction_hash, txin.output_index),
                script_sig: txin.script.clone(),
                sequence: txin.sequence,
                witness: txin
                    .witness
                    .iter()
                    .map(|item| item.to_bytes())
                    .collect::<Result<Vec<_>>>()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let output = tx
        .outputs
        .iter()
        .map(|txout| TxOut {
            value: txout.value as u64,
            script_pubkey: txout.script.clone(),
        })
        .collect();

    Ok(Transaction {
        version: tx.version,
        lock_time: tx.lock_time,
        input,
        output,
    })
}

pub fn serialize_tx(tx: &PlainTransaction) -> Result<Vec<u8>> {
    Ok(serialize(&to_raw(tx)?))
}

/// Parse an 80-byte header at a known height. `prev_hash`/`merkle_root` are
/// kept only above the genesis height.
pub fn parse_header(hex: &str, height: u32) -> Result<PlainBlockHeader> {
    let bytes = Vec::from_hex(hex)?;
    if bytes.len() != HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "block header must be {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let header: BlockHeader = deserialize(&bytes)?;

    Ok(PlainBlockHeader {
        block_hash: header.block_hash(),
        block_height: height,
        version: header.version,
        timestamp: header.time,
        bits: header.bits,
        nonce: header.nonce,
        weight: HEADER_SIZE * WITNESS_SCALE_FACTOR,
        prev_hash: if height > 0 { Some(header.prev_blockhash) } else { None },
        merkle_root: if height > 0 { Some(header.merkle_root) } else { None },
    })
}

pub fn serialize_header(header: &PlainBlockHeader) -> Result<String> {
    let prev_hash = header
        .prev_hash
        .ok_or_else(|| Error::Protocol("cannot re-serialize a header without prev_hash".into()))?;
    let merkle_root = header
        .merkle_root
        .ok_or_else(|| Error::Protocol("cannot re-serialize a header without merkle_root".into()))?;

    let raw = BlockHeader {
        version: header.version,
        prev_blockhash: prev_hash,
        merkle_root,
        time: header.timestamp,
        bits: header.bits,
        nonce: header.nonce,
    };
    Ok(serialize(&raw).to_hex())
}
