use bitcoin::blockdata::opcodes::{all, Class};
use bitcoin::blockdata::script::Instruction;
use bitcoin::{Address, Network, PublicKey, Script, TxIn};
use bitcoin_hashes::hex::ToHex;
use bitcoin_hashes::{sha256, Hash};

/// Recover the paying address of an input from the shape of its script and
/// witness. Unmatched shapes (P2PK, coinbase, exotic contracts) yield `None`.
///
/// shape classification by (script chunks, witness items):
///   (2, 0)   P2PKH            pubkey in the second chunk
///   (1, 2)   P2SH-P2WPKH      pubkey in the second witness item
///   (0, 2)   P2WPKH           pubkey in the second witness item
///   (>2, 0)  P2SH-P2MS        redeem script in the last chunk
///   (1, >2)  P2SH-P2WSH-P2MS  witness script in the last witness item
///   (0, >2)  P2WSH-P2MS       witness script in the last witness item
pub fn input_address(txin: &TxIn, network: Network) -> Option<Address> {
    let chunks = script_pushes(&txin.script_sig)?;
    let witness = &txin.witness;

    match (chunks.len(), witness.len()) {
        (2, 0) => {
            let pubkey = PublicKey::from_slice(&chunks[1]).ok()?;
            Some(Address::p2pkh(&pubkey, network))
        }
        (1, 2) => {
            let pubkey = PublicKey::from_slice(&witness[1]).ok()?;
            Address::p2shwpkh(&pubkey, network).ok()
        }
        (0, 2) => {
            let pubkey = PublicKey::from_slice(&witness[1]).ok()?;
            Address::p2wpkh(&pubkey, network).ok()
        }
        (n, 0) if n > 2 => {
            let redeem = Script::from(chunks[n - 1].clone());
            let (required, _) = parse_multisig(&redeem)?;
            if required != n - 2 {
                return None;
            }
            Some(Address::p2sh(&redeem, network))
        }
        (1, n) if n > 2 => {
            let witness_script = Script::from(witness[n - 1].clone());
            let (required, _) = parse_multisig(&witness_script)?;
            if required != n - 2 {
                return None;
            }
            // the single script chunk is the p2wsh redeem script
            Some(Address::p2sh(&Script::from(chunks[0].clone()), network))
        }
        (0, n) if n > 2 => {
            let witness_script = Script::from(witness[n - 1].clone());
            let (required, _) = parse_multisig(&witness_script)?;
            if required != n - 2 {
                return None;
            }
            Some(Address::p2wsh(&witness_script, network))
        }
        _ => None,
    }
}

pub fn output_address(script: &Script, network: Network) -> Option<Address> {
    Address::from_script(script, network)
}

/// The scripthash Electrum keys its index by: SHA-256 of the output script,
/// byte-reversed and hex-encoded.
pub fn script_hash(script: &Script) -> String {
    let mut hash = sha256::Hash::hash(script.as_bytes()).into_inner();
    hash.reverse();
    hash.to_hex()
}

pub fn address_to_script_hash(address: &Address) -> String {
    script_hash(&address.script_pubkey())
}

/// Decompile a script into its push chunks. Returns `None` when the script
/// contains non-push opcodes or fails to parse (OP_0 counts as an empty push).
fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut chunks = vec![];
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(data)) => chunks.push(data.to_vec()),
            _ => return None,
        }
    }
    Some(chunks)
}

/// Decompile an `m <pubkeys..> n OP_CHECKMULTISIG` script.
fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let mut required = None;
    let mut pubkeys = vec![];
    let mut total = None;
    let mut done = false;

    for instruction in script.instructions() {
        if done {
            return None;
        }
        match instruction {
            Ok(Instruction::Op(op)) => match op.classify() {
                Class::PushNum(num) if required.is_none() => required = Some(num as usize),
                Class::PushNum(num) if total.is_none() => total = Some(num as usize),
                _ if op == all::OP_CHECKMULTISIG && total.is_some() => done = true,
                _ => return None,
            },
            Ok(Instruction::PushBytes(data)) if required.is_some() && total.is_none() => {
                pubkeys.push(PublicKey::from_slice(data).ok()?);
            }
            _ => return None,
        }
    }

    let (required, total) = (required?, total?);
    if !done || total != pubkeys.len() || required == 0 || required > total {
        return None;
    }
    Some((required, pubkeys))
}
