use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitcoin::{Address, Txid};
use serde_json::{from_value, Value};

use crate::address::address_to_script_hash;
use crate::api::{ElectrumApi, PROTOCOL_MAX, PROTOCOL_MIN};
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::rpc::{spawn_thread, RpcChannel};
use crate::store::{BlockStore, TransactionStore};
use crate::transport::{connect_peer, select_transport};
use crate::types::{Balance, Peer, PlainBlockHeader, PlainTransaction, Receipt, Transport};

const LT: &str = "elc::agent"; // log target name

/// Everything an agent tells its observers. CLOSE fires at most once per
/// agent; SYNCING exactly once; SYNCED at most once; BLOCK many times.
#[derive(Clone, Debug)]
pub enum Event {
    Syncing,
    Synced,
    Block(PlainBlockHeader),
    TransactionAdded(PlainTransaction),
    TransactionMined(PlainTransaction, PlainBlockHeader),
    Close(String),
}

pub type EventFn = Box<dyn Fn(&Event) + Send>;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ListenerHandle(usize);

enum AgentMsg {
    Header(Value),
    ScriptStatus(String),
    Subscribe(Vec<Address>),
    PingTick,
    Close(String),
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Deserialize)]
struct HeaderNotification {
    hex: String,
    height: u32,
}

struct AgentShared {
    peer: Peer,
    transport: Transport,
    config: Config,
    api: ElectrumApi,
    block_store: Arc<dyn BlockStore>,
    tx_store: Arc<dyn TransactionStore>,
    msg_tx: mpsc::Sender<AgentMsg>,

    handshaking: AtomicBool,
    syncing: AtomicBool,
    synced: AtomicBool,
    closed: AtomicBool,

    listeners: Mutex<HashMap<usize, EventFn>>,
    next_listener_id: AtomicUsize,
    ping_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    close_reason: Mutex<Option<String>>,
}

/// A per-peer lifecycle driver: transport selection, protocol handshake,
/// initial head sync, steady-state liveness probing and subscription diffing,
/// all owned by a single thread. Consumers observe it through typed events and
/// call the query methods once it reports SYNCED.
pub struct Agent {
    shared: Arc<AgentShared>,
}

impl Agent {
    pub fn start(
        peer: Peer,
        config: Config,
        block_store: Arc<dyn BlockStore>,
        tx_store: Arc<dyn TransactionStore>,
    ) -> Result<Self> {
        Agent::start_with_listener(peer, config, block_store, tx_store, None)
    }

    /// Like `start`, with a listener installed before the lifecycle thread
    /// begins, so even the earliest events are observed.
    pub fn start_with_listener(
        peer: Peer,
        config: Config,
        block_store: Arc<dyn BlockStore>,
        tx_store: Arc<dyn TransactionStore>,
        listener: Option<EventFn>,
    ) -> Result<Self> {
        let transport = select_transport(&peer, &config)?;
        info!(target: LT, "[{}] connecting over {}", peer, transport);

        let connector = {
            let (peer, config) = (peer.clone(), config.clone());
            Box::new(move || connect_peer(&peer, transport, &config))
        };
        // reconnection is not enabled here: a dropped line surfaces through
        // the ping probe and closes the agent
        let channel = RpcChannel::connect(connector, false)?;
        Ok(Agent::spawn(peer, transport, config, channel, block_store, tx_store, listener))
    }

    /// Drive the lifecycle over an already-open channel.
    pub(crate) fn spawn(
        peer: Peer,
        transport: Transport,
        config: Config,
        channel: RpcChannel,
        block_store: Arc<dyn BlockStore>,
        tx_store: Arc<dyn TransactionStore>,
        listener: Option<EventFn>,
    ) -> Self {
        let api = ElectrumApi::new(channel, config.network);

        let (msg_tx, msg_rx) = mpsc::channel();
        let mut listeners = HashMap::new();
        let mut next_listener_id = 0;
        if let Some(listener) = listener {
            listeners.insert(next_listener_id, listener);
            next_listener_id += 1;
        }

        let shared = Arc::new(AgentShared {
            peer,
            transport,
            config,
            api,
            block_store,
            tx_store,
            msg_tx,
            handshaking: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(listeners),
            next_listener_id: AtomicUsize::new(next_listener_id),
            ping_shutdown: Mutex::new(None),
            close_reason: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        spawn_thread("elc-agent", move || run(thread_shared, msg_rx));

        Agent { shared }
    }

    pub fn peer(&self) -> &Peer {
        &self.shared.peer
    }

    pub fn transport(&self) -> Transport {
        self.shared.transport
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().unwrap().clone()
    }

    pub fn on_event(&self, listener: impl Fn(&Event) + Send + 'static) -> ListenerHandle {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(id, Box::new(listener));
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.shared.listeners.lock().unwrap().remove(&handle.0);
    }

    /// Stop the agent. Safe to call any number of times; the CLOSE event
    /// fires only for the first.
    pub fn close(&self, reason: &str) {
        let _ = self.shared.msg_tx.send(AgentMsg::Close(reason.to_string()));
        do_close(&self.shared, reason);
    }

    pub fn get_balance(&self, address: &Address) -> Result<Balance> {
        self.checked_api()?.get_balance(address)
    }

    pub fn get_transaction_receipts(&self, address: &Address) -> Result<Vec<Receipt>> {
        self.checked_api()?.get_receipts(address)
    }

    pub fn get_transaction(&self, txid: &Txid) -> Result<PlainTransaction> {
        let api = self.checked_api()?;
        if let Some(tx) = self.shared.tx_store.get(txid) {
            return Ok(tx);
        }
        let tx = api.get_transaction(txid, None)?;
        self.shared.tx_store.put(tx.clone());
        Ok(tx)
    }

    pub fn get_block_header(&self, height: u32) -> Result<PlainBlockHeader> {
        self.checked_api()?;
        ensure_header(&self.shared, height)
    }

    pub fn get_fee_histogram(&self) -> Result<Vec<(f64, u64)>> {
        self.checked_api()?.get_fee_histogram()
    }

    pub fn get_minimum_relay_fee(&self) -> Result<f64> {
        self.checked_api()?.get_relay_fee()
    }

    pub fn broadcast_transaction(&self, raw_hex: &str) -> Result<Txid> {
        self.checked_api()?.broadcast_transaction(raw_hex)
    }

    pub fn get_peers(&self) -> Result<Vec<Peer>> {
        self.checked_api()?.get_peers()
    }

    /// Watch addresses for history changes. The first snapshot per address is
    /// the diff baseline; later changes emit TRANSACTION_ADDED /
    /// TRANSACTION_MINED events.
    pub fn subscribe(&self, addresses: &[Address]) -> Result<()> {
        self.checked_api()?;
        self.shared
            .msg_tx
            .send(AgentMsg::Subscribe(addresses.to_vec()))
            .map_err(|_| Error::ConnectionLost("agent is gone".into()))
    }

    /// Fee estimates for several confirmation targets. Failing targets come
    /// back as -1 instead of aborting the batch, and no sync is required.
    pub fn estimate_fees(&self, targets: &[u16]) -> Vec<f64> {
        targets
            .iter()
            .map(|target| match self.shared.api.estimate_fee(*target) {
                Ok(fee) => fee,
                Err(e) => {
                    debug!(target: LT, "fee estimate for {} failed: {}", target, e);
                    -1.0
                }
            })
            .collect()
    }

    fn checked_api(&self) -> Result<&ElectrumApi> {
        if !self.is_synced() {
            return Err(Error::NotSynced);
        }
        Ok(&self.shared.api)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close("agent dropped");
    }
}

fn run(shared: Arc<AgentShared>, msg_rx: mpsc::Receiver<AgentMsg>) {
    if let Err(e) = lifecycle(&shared, &msg_rx) {
        warn!(target: LT, "[{}] agent failed: {}", shared.peer, e);
        do_close(&shared, &e.to_string());
    }
}

fn lifecycle(shared: &Arc<AgentShared>, msg_rx: &mpsc::Receiver<AgentMsg>) -> Result<()> {
    handshake(shared)?;

    shared.syncing.store(true, Ordering::SeqCst);
    emit(shared, &Event::Syncing);

    let msg_tx = shared.msg_tx.clone();
    shared.api.subscribe_headers(Box::new(move |value| {
        let _ = msg_tx.send(AgentMsg::Header(value));
    }))?;

    let mut state = SyncState::default();

    // the initial subscription response is treated as a normal block; nothing
    // accepted before the deadline fails the agent
    let deadline = Instant::now() + shared.config.block_timeout;
    while !shared.synced.load(Ordering::SeqCst) {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::BlockTimeout)?;
        match msg_rx.recv_timeout(remaining) {
            Ok(msg) => {
                if let Flow::Stop = handle_msg(shared, &mut state, msg)? {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => return Err(Error::BlockTimeout),
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }

    loop {
        match msg_rx.recv() {
            Ok(msg) => {
                if let Flow::Stop = handle_msg(shared, &mut state, msg)? {
                    return Ok(());
                }
            }
            Err(_) => return Ok(()),
        }
    }
}

/// Negotiate the protocol range, then make sure the peer is on our chain.
fn handshake(shared: &AgentShared) -> Result<()> {
    shared.handshaking.store(true, Ordering::SeqCst);
    let result = (|| {
        let timeout = shared.config.handshake_timeout;
        let (software, version) = shared
            .api
            .set_protocol_version(&shared.config.client_id, (PROTOCOL_MIN, PROTOCOL_MAX), timeout)
            .map_err(map_handshake_timeout)?;
        debug!(target: LT, "[{}] speaking {} to {}", shared.peer, version, software);

        let features = shared
            .api
            .get_features(timeout)
            .map_err(map_handshake_timeout)?;
        if features.genesis_hash != shared.config.genesis_hash() {
            return Err(Error::WrongGenesis(features.genesis_hash.to_string()));
        }
        Ok(())
    })();
    shared.handshaking.store(false, Ordering::SeqCst);
    result
}

fn map_handshake_timeout(e: Error) -> Error {
    match e {
        Error::RpcTimeout(_) => Error::HandshakeTimeout,
        e => e,
    }
}

#[derive(Default)]
struct SyncState {
    /// Per-scripthash receipt baselines; an entry exists iff the initial
    /// snapshot for that subscription has been received.
    known_receipts: HashMap<String, HashMap<Txid, Receipt>>,
}

fn handle_msg(shared: &Arc<AgentShared>, state: &mut SyncState, msg: AgentMsg) -> Result<Flow> {
    match msg {
        AgentMsg::Header(value) => on_header(shared, value),
        AgentMsg::ScriptStatus(script_hash) => on_script_status(shared, state, &script_hash),
        AgentMsg::Subscribe(addresses) => {
            for address in addresses {
                let script_hash = address_to_script_hash(&address);
                let msg_tx = shared.msg_tx.clone();
                let result = shared.api.subscribe_receipts(
                    &address,
                    Box::new(move |_status| {
                        let _ = msg_tx.send(AgentMsg::ScriptStatus(script_hash.clone()));
                    }),
                );
                if let Err(e) = result {
                    warn!(target: LT, "subscribing {} failed: {}", address, e);
                }
            }
        }
        AgentMsg::PingTick => ping(shared)?,
        AgentMsg::Close(reason) => {
            do_close(shared, &reason);
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

/// Accept (or drop) a header pushed by the peer. The value is the initial
/// `{hex, height}` response or a `[{hex, height}]` notification.
fn on_header(shared: &Arc<AgentShared>, value: Value) {
    let payload = match value {
        Value::Array(mut items) if !items.is_empty() => items.remove(0),
        other => other,
    };
    let note: HeaderNotification = match from_value(payload) {
        Ok(note) => note,
        Err(e) => {
            warn!(target: LT, "[{}] bad header notification: {}", shared.peer, e);
            return;
        }
    };
    if let Err(e) = accept_block(shared, &note.hex, note.height) {
        warn!(target: LT, "[{}] header at {} not accepted: {}", shared.peer, note.height, e);
    }
}

fn accept_block(shared: &Arc<AgentShared>, hex: &str, height: u32) -> Result<()> {
    let header = codec::parse_header(hex, height)?;

    if let Some(prev_hash) = header.prev_hash {
        let prev = ensure_header(shared, height - 1)?;
        if prev.block_hash != prev_hash {
            warn!(
                target: LT,
                "[{}] dropping non-consecutive header {} at {} (have {} at {})",
                shared.peer, header.block_hash, height, prev.block_hash, height - 1
            );
            return Ok(());
        }
    }

    debug!(target: LT, "[{}] block {} at {}", shared.peer, header.block_hash, height);
    shared.block_store.put(header.clone());
    emit(shared, &Event::Block(header));

    if !shared.synced.load(Ordering::SeqCst) {
        shared.syncing.store(false, Ordering::SeqCst);
        shared.synced.store(true, Ordering::SeqCst);
        info!(target: LT, "[{}] synced at height {}", shared.peer, height);
        emit(shared, &Event::Synced);
        start_ping_timer(shared);
    }
    Ok(())
}

fn ensure_header(shared: &Arc<AgentShared>, height: u32) -> Result<PlainBlockHeader> {
    if let Some(header) = shared.block_store.get(height) {
        return Ok(header);
    }
    let header = shared.api.get_block_header(height)?;
    shared.block_store.put(header.clone());
    Ok(header)
}

fn start_ping_timer(shared: &Arc<AgentShared>) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    *shared.ping_shutdown.lock().unwrap() = Some(shutdown_tx);

    let msg_tx = shared.msg_tx.clone();
    let interval = shared.config.ping_interval;
    spawn_thread("elc-ping", move || loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if msg_tx.send(AgentMsg::PingTick).is_err() {
                    return;
                }
            }
            _ => return,
        }
    });
}

/// One probe with a single retry; two consecutive failures close the agent.
fn ping(shared: &AgentShared) -> Result<()> {
    for attempt in 1..=2 {
        match shared.api.ping(shared.config.ping_timeout) {
            Ok(()) => {
                trace!(target: LT, "[{}] pong", shared.peer);
                return Ok(());
            }
            Err(e) => warn!(target: LT, "[{}] ping attempt {} failed: {}", shared.peer, attempt, e),
        }
    }
    Err(Error::PingTimeout)
}

/// A watched scripthash's status changed: refetch its receipts and either
/// store the baseline or diff against it.
fn on_script_status(shared: &Arc<AgentShared>, state: &mut SyncState, script_hash: &str) {
    let receipts = match shared.api.get_receipts_by_script_hash(script_hash) {
        Ok(receipts) => receipts,
        Err(e) => {
            warn!(target: LT, "fetching history of {} failed: {}", script_hash, e);
            return;
        }
    };

    match state.known_receipts.entry(script_hash.to_string()) {
        Entry::Vacant(entry) => {
            trace!(target: LT, "baseline of {} receipts for {}", receipts.len(), script_hash);
            entry.insert(
                receipts
                    .into_iter()
                    .map(|receipt| (receipt.transaction_hash, receipt))
                    .collect(),
            );
        }
        Entry::Occupied(mut entry) => diff_receipts(shared, entry.get_mut(), &receipts),
    }
}

/// Emit events for every receipt that is new or moved to another height.
/// A failure on one receipt is logged and skipped without aborting the rest;
/// the failed receipt stays out of the baseline so the next notification
/// retries it.
fn diff_receipts(shared: &Arc<AgentShared>, known: &mut HashMap<Txid, Receipt>, new: &[Receipt]) {
    for receipt in new {
        if let Some(prior) = known.get(&receipt.transaction_hash) {
            if prior.block_height == receipt.block_height {
                continue;
            }
        }
        match process_receipt(shared, receipt) {
            Ok(()) => {
                known.insert(receipt.transaction_hash, *receipt);
            }
            Err(e) => {
                warn!(target: LT, "skipping receipt {}: {}", receipt.transaction_hash, e)
            }
        }
    }
}

fn process_receipt(shared: &Arc<AgentShared>, receipt: &Receipt) -> Result<()> {
    let block = if receipt.block_height > 0 {
        Some(ensure_header(shared, receipt.block_height as u32)?)
    } else {
        None
    };
    let txid = receipt.transaction_hash;

    match (shared.tx_store.get(&txid), block) {
        (Some(tx), Some(header)) => {
            // already known: a standalone proof confirms inclusion at this height
            shared.api.proof_transaction(&txid, &header)?;
            let tx = tx.with_block(&header);
            shared.tx_store.put(tx.clone());
            emit(shared, &Event::TransactionMined(tx, header));
        }
        (Some(tx), None) => emit(shared, &Event::TransactionAdded(tx)),
        (None, Some(header)) => {
            let tx = shared.api.get_transaction(&txid, Some(&header))?;
            shared.tx_store.put(tx.clone());
            emit(shared, &Event::TransactionMined(tx, header));
        }
        (None, None) => {
            let tx = shared.api.get_transaction(&txid, None)?;
            shared.tx_store.put(tx.clone());
            emit(shared, &Event::TransactionAdded(tx));
        }
    }
    Ok(())
}

fn do_close(shared: &AgentShared, reason: &str) {
    if shared.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(target: LT, "[{}] closing: {}", shared.peer, reason);
    shared.synced.store(false, Ordering::SeqCst);
    shared.syncing.store(false, Ordering::SeqCst);
    if let Some(shutdown) = shared.ping_shutdown.lock().unwrap().take() {
        let _ = shutdown.send(());
    }
    shared.api.close(reason);
    *shared.close_reason.lock().unwrap() = Some(reason.to_string());
    emit_unconditionally(shared, &Event::Close(reason.to_string()));
}

fn emit(shared: &AgentShared, event: &Event) {
    if shared.closed.load(Ordering::SeqCst) {
        return;
    }
    emit_unconditionally(shared, event);
}

fn emit_unconditionally(shared: &AgentShared, event: &Event) {
    let listeners = shared.listeners.lock().unwrap();
    for listener in listeners.values() {
        listener(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::genesis_hash;
    use crate::store::MemoryStore;
    use crate::transport::testing::{scripted_peer, Handler};
    use crate::types::PeerPorts;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::{BlockHeader, Network, TxMerkleNode};
    use bitcoin_hashes::hex::{FromHex, ToHex};
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::thread;
    use std::time::Duration;

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    const TX_B170: &str = "0100000001c997a5e56e104102fa209c6a852dd90660a20b2d9c352423edce25857fcd3704000000004847304402204e45e16932b8af514961a1d3a1a25fdf3f4f7732e9d624c6c61548ab5fb8cd410220181522ec8eca07de4860a4acdd12909d831cc56cbbac4622082221a8768d1d0901ffffffff0200ca9a3b00000000434104ae1a62fe09c5f51b13905f07f06b99a2f7159b2225f374cd378d71302fa28414e7aab37397f554a7df5f142c21c1b7303b8a0626f1baded5c72a704f7e6cd84cac00286bee0000000043410411db93e1dcdb8a016b49840f8c53bc1eb68a382e97b1482ecad7b148a6909a5cb2e0eaddfb84ccf9744464f82e160bfa9b8b64f9d4c03f999b8643f656b412a3ac00000000";
    const TX_B170_ID: &str = "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16";
    const COINBASE_170: &str = "b1fea52486ce0c62bb442b530a3f0132b826c74e473d1f2c220bfa78111c5082";
    const ROOT_170: &str = "7dac2c5666815c17a3b36427de37bb9d2e2c5ccec3f8633eb91a4205cb4c10ff";

    const GENESIS_CB_TX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";
    const GENESIS_CB_ID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    const ADDRESS: &str = "1HZwkjkeaoZfTSaJxDw6aKkxp45agDiEzN";
    const SCRIPT_HASH: &str = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    /// A header at height 170 whose merkle root commits to the two block-170
    /// transactions (chain linkage is irrelevant for receipt proofs).
    fn header_170_hex() -> String {
        serialize(&BlockHeader {
            version: 1,
            prev_blockhash: Default::default(),
            merkle_root: TxMerkleNode::from_hex(ROOT_170).unwrap(),
            time: 1231731025,
            bits: 0x1d00ffff,
            nonce: 42,
        })
        .to_hex()
    }

    struct TestPeer {
        genesis: String,
        /// successive blockchain.scripthash.get_history responses
        history: Mutex<VecDeque<Value>>,
        /// headers.subscribe initial response; None answers with null
        tip: Option<Value>,
        ping_ok: AtomicBool,
    }

    impl TestPeer {
        fn new() -> Arc<Self> {
            TestPeer::with(
                genesis_hash(Network::Bitcoin).to_string(),
                Some(json!({"hex": GENESIS_HEADER, "height": 0})),
            )
        }

        fn with(genesis: String, tip: Option<Value>) -> Arc<Self> {
            Arc::new(TestPeer {
                genesis,
                history: Mutex::new(VecDeque::new()),
                tip,
                ping_ok: AtomicBool::new(true),
            })
        }

        fn handler(self: &Arc<Self>) -> Handler {
            let this = self.clone();
            Arc::new(move |method, params| match method {
                "server.version" => Ok(json!(["ElectrumX 1.16", "1.4.2"])),
                "server.features" => Ok(json!({
                    "genesis_hash": this.genesis,
                    "server_version": "ElectrumX 1.16",
                    "protocol_min": "1.4",
                    "protocol_max": "1.4.2",
                    "hash_function": "sha256",
                })),
                "server.ping" => {
                    if this.ping_ok.load(Ordering::SeqCst) {
                        Ok(Value::Null)
                    } else {
                        Err((-1, "gone fishing".to_string()))
                    }
                }
                "blockchain.headers.subscribe" => Ok(this.tip.clone().unwrap_or(Value::Null)),
                "blockchain.scripthash.subscribe" => {
                    assert_eq!(params[0], json!(SCRIPT_HASH));
                    Ok(json!("status-0"))
                }
                "blockchain.scripthash.get_history" => Ok(this
                    .history
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("unscripted history request")),
                "blockchain.block.header" => {
                    assert_eq!(params[0], json!(170));
                    Ok(json!(header_170_hex()))
                }
                "blockchain.transaction.get" => match params[0].as_str().unwrap() {
                    TX_B170_ID => Ok(json!(TX_B170)),
                    GENESIS_CB_ID => Ok(json!(GENESIS_CB_TX)),
                    other => panic!("unscripted transaction {}", other),
                },
                "blockchain.transaction.get_merkle" => {
                    assert_eq!(params[0], json!(TX_B170_ID));
                    Ok(json!({"block_height": 170, "merkle": [COINBASE_170], "pos": 1}))
                }
                "blockchain.estimatefee" => match params[0].as_u64().unwrap() {
                    3 => Err((-1, "no estimate".to_string())),
                    _ => Ok(json!(0.0002)),
                },
                other => panic!("unscripted method {}", other),
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::new(Network::Bitcoin);
        config.handshake_timeout = Duration::from_secs(2);
        config.block_timeout = Duration::from_millis(500);
        config
    }

    fn start_agent(
        peer: &Arc<TestPeer>,
        config: Config,
    ) -> (Agent, mpsc::Receiver<Event>, mpsc::Sender<String>) {
        let (connector, push) = scripted_peer(peer.handler());
        let channel = RpcChannel::connect(connector, false).unwrap();
        let (events_tx, events_rx) = mpsc::channel();
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::spawn(
            Peer::new("fake.example.org", PeerPorts { tcp: None, ssl: None, wss: Some(50004) }),
            Transport::Wss,
            config,
            channel,
            store.clone(),
            store,
            Some(Box::new(move |event| {
                let _ = events_tx.send(event.clone());
            })),
        );
        (agent, events_rx, push)
    }

    fn recv_event(events: &mpsc::Receiver<Event>) -> Event {
        events
            .recv_timeout(Duration::from_secs(5))
            .expect("timed out waiting for an event")
    }

    fn sync_up(events: &mpsc::Receiver<Event>) {
        assert!(matches!(recv_event(events), Event::Syncing));
        match recv_event(events) {
            Event::Block(header) => assert_eq!(header.block_height, 0),
            other => panic!("expected Block, got {:?}", other),
        }
        assert!(matches!(recv_event(events), Event::Synced));
    }

    #[test]
    fn test_sync_from_genesis_tip() {
        let peer = TestPeer::new();
        let (agent, events, _push) = start_agent(&peer, test_config());
        sync_up(&events);
        assert!(agent.is_synced());
        assert!(!agent.is_closed());
        agent.close("test over");
    }

    #[test]
    fn test_wrong_genesis_closes() {
        // the peer follows another chain entirely
        let peer = TestPeer::with(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943".into(),
            None,
        );
        let (agent, events, _push) = start_agent(&peer, test_config());

        // the agent never reaches SYNCING
        match recv_event(&events) {
            Event::Close(reason) => assert!(reason.contains("Wrong genesis"), "{}", reason),
            other => panic!("expected Close, got {:?}", other),
        }
        assert!(!agent.is_synced());
        assert!(agent.is_closed());

        // invariant: once closed, the public surface reports NotSynced
        let address = Address::from_str(ADDRESS).unwrap();
        assert!(matches!(agent.get_balance(&address), Err(Error::NotSynced)));
        assert!(matches!(agent.get_fee_histogram(), Err(Error::NotSynced)));
    }

    #[test]
    fn test_block_timeout_closes() {
        // headers.subscribe answers null and no tip ever arrives
        let peer = TestPeer::with(genesis_hash(Network::Bitcoin).to_string(), None);
        let (agent, events, _push) = start_agent(&peer, test_config());

        assert!(matches!(recv_event(&events), Event::Syncing));
        match recv_event(&events) {
            Event::Close(reason) => assert_eq!(reason, "Block timeout"),
            other => panic!("expected Close, got {:?}", other),
        }
        assert_eq!(agent.close_reason().unwrap(), "Block timeout");
    }

    #[test]
    fn test_subscription_diff() {
        let peer = TestPeer::new();
        peer.history.lock().unwrap().extend(vec![
            // baseline: one unconfirmed transaction, no events
            json!([{"height": 0, "tx_hash": TX_B170_ID}]),
            // later: it got mined, and a new unconfirmed one appeared
            json!([
                {"height": 170, "tx_hash": TX_B170_ID},
                {"height": 0, "tx_hash": GENESIS_CB_ID},
            ]),
            // finally: nothing changed
            json!([
                {"height": 170, "tx_hash": TX_B170_ID},
                {"height": 0, "tx_hash": GENESIS_CB_ID},
            ]),
        ]);
        let (agent, events, push) = start_agent(&peer, test_config());
        sync_up(&events);

        let address = Address::from_str(ADDRESS).unwrap();
        agent.subscribe(&[address]).unwrap();

        // wait for the baseline snapshot to be consumed
        while peer.history.lock().unwrap().len() > 2 {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err(), "baseline must not emit");

        let status_change = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.scripthash.subscribe",
            "params": [SCRIPT_HASH, "status-1"]
        });
        push.send(status_change.to_string()).unwrap();

        match recv_event(&events) {
            Event::TransactionMined(tx, header) => {
                assert_eq!(tx.transaction_hash.to_string(), TX_B170_ID);
                assert_eq!(tx.block_height, Some(170));
                assert_eq!(header.block_height, 170);
                assert_eq!(tx.block_hash, Some(header.block_hash));
            }
            other => panic!("expected TransactionMined, got {:?}", other),
        }
        match recv_event(&events) {
            Event::TransactionAdded(tx) => {
                assert_eq!(tx.transaction_hash.to_string(), GENESIS_CB_ID);
                assert!(tx.is_coinbase);
                assert_eq!(tx.block_height, None);
            }
            other => panic!("expected TransactionAdded, got {:?}", other),
        }

        // an unchanged snapshot diffs to nothing
        push.send(status_change.to_string()).unwrap();
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
        agent.close("test over");
    }

    #[test]
    fn test_estimate_fees_with_failing_targets() {
        let peer = TestPeer::new();
        let (agent, events, _push) = start_agent(&peer, test_config());
        sync_up(&events);

        let fees = agent.estimate_fees(&[1, 3, 6]);
        assert_eq!(fees, vec![0.0002, -1.0, 0.0002]);
        agent.close("test over");
    }

    #[test]
    fn test_ping_failure_closes() {
        let peer = TestPeer::new();
        let mut config = test_config();
        config.ping_interval = Duration::from_millis(100);
        config.ping_timeout = Duration::from_millis(200);
        let (agent, events, _push) = start_agent(&peer, config);
        sync_up(&events);

        peer.ping_ok.store(false, Ordering::SeqCst);
        match recv_event(&events) {
            Event::Close(reason) => assert_eq!(reason, "Ping timeout"),
            other => panic!("expected Close, got {:?}", other),
        }
        assert!(!agent.is_synced());
    }

    #[test]
    fn test_close_is_idempotent() {
        let peer = TestPeer::new();
        let (agent, events, _push) = start_agent(&peer, test_config());
        sync_up(&events);

        agent.close("done");
        agent.close("again");
        match recv_event(&events) {
            Event::Close(reason) => assert_eq!(reason, "done"),
            other => panic!("expected Close, got {:?}", other),
        }
        assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(agent.close_reason().unwrap(), "done");
        assert!(matches!(
            agent.get_minimum_relay_fee(),
            Err(Error::NotSynced)
        ));
    }
}
