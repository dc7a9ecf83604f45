use bitcoin::{Txid, TxMerkleNode};
use bitcoin_hashes::hex::FromHex;
use bitcoin_hashes::{sha256d, Hash};

use crate::error::{Error, Result};
use crate::types::PlainBlockHeader;

/// The `blockchain.transaction.get_merkle` response: the sibling hashes along
/// the path from the transaction leaf to the block's merkle root.
#[derive(Clone, Debug, Deserialize)]
pub struct MerkleProof {
    pub block_height: u32,
    pub merkle: Vec<String>,
    pub pos: usize,
}

fn merklize(left: sha256d::Hash, right: sha256d::Hash) -> sha256d::Hash {
    let data = [&left[..], &right[..]].concat();
    sha256d::Hash::hash(&data)
}

/// Fold a merkle path up to its root. The transaction's position selects at
/// each level whether the sibling goes on the left or the right.
pub fn merkle_root_from_path(txid: &Txid, proof: &MerkleProof) -> Result<TxMerkleNode> {
    let mut node = sha256d::Hash::from_inner(txid.into_inner());
    let mut index = proof.pos;
    for pair_hash in &proof.merkle {
        let pair = sha256d::Hash::from_hex(pair_hash)?;
        node = if index % 2 == 0 {
            merklize(node, pair)
        } else {
            merklize(pair, node)
        };
        index >>= 1;
    }
    Ok(TxMerkleNode::from_inner(node.into_inner()))
}

/// Check that `txid` is included in `header` according to the server-provided
/// path. The header must carry its merkle root (i.e. not be the genesis stub).
pub fn verify_merkle_proof(txid: &Txid, proof: &MerkleProof, header: &PlainBlockHeader) -> Result<()> {
    let root = merkle_root_from_path(txid, proof)?;
    match header.merkle_root {
        Some(expected) if expected == root => Ok(()),
        _ => Err(Error::MerkleProofInvalid {
            hash: txid.to_string(),
            height: header.block_height,
        }),
    }
}
