use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::Txid;

use crate::types::{PlainBlockHeader, PlainTransaction};

/// Process-wide header cache keyed by height. Implementations shared between
/// agents must be thread safe; duplicate writes of the same header at the same
/// height are benign.
pub trait BlockStore: Send + Sync {
    fn get(&self, height: u32) -> Option<PlainBlockHeader>;
    fn put(&self, header: PlainBlockHeader);
}

/// Process-wide transaction cache keyed by hash.
pub trait TransactionStore: Send + Sync {
    fn get(&self, txid: &Txid) -> Option<PlainTransaction>;
    fn put(&self, tx: PlainTransaction);
}

/// The default in-memory store backing both caches.
#[derive(Default)]
pub struct MemoryStore {
    headers: Mutex<HashMap<u32, PlainBlockHeader>>,
    transactions: Mutex<HashMap<Txid, PlainTransaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl BlockStore for MemoryStore {
    fn get(&self, height: u32) -> Option<PlainBlockHeader> {
        self.headers.lock().unwrap().get(&height).cloned()
    }

    fn put(&self, header: PlainBlockHeader) {
        self.headers
            .lock()
            .unwrap()
            .insert(header.block_height, header);
    }
}

impl TransactionStore for MemoryStore {
    fn get(&self, txid: &Txid) -> Option<PlainTransaction> {
        self.transactions.lock().unwrap().get(txid).cloned()
    }

    fn put(&self, tx: PlainTransaction) {
        self.transactions.lock().unwrap().insert(tx.transaction_hash, tx);
    }
}
