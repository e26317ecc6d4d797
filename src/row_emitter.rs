//! Watches `FileManager` for size growth, decodes newly completed rows, and
//! fans them out to subscribers in ascending physical-index order (§4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::codec::{self, RowUnion};
use crate::config::HEADER_SIZE;
use crate::error::Result;
use crate::file_manager::FileManager;

type RowCallback = Arc<dyn Fn(u64, &RowUnion) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: HashMap<u64, RowCallback>,
}

pub struct RowEmitter {
    file_manager: Arc<FileManager>,
    row_size: u32,
    processed_up_to: Mutex<u64>,
    subscribers: RwLock<Subscribers>,
    fm_subscription: AtomicU64,
}

impl RowEmitter {
    /// Capture `initialSize`, subscribe to `file_manager`, then kickstart by
    /// processing anything appended between the capture and the subscribe
    /// taking effect. Per §4.3 this two-step sequencing guarantees no row is
    /// missed and none is double-delivered.
    pub fn new(file_manager: Arc<FileManager>, row_size: u32) -> Arc<Self> {
        let initial_size = file_manager.size();
        let this = Arc::new(Self {
            file_manager,
            row_size,
            processed_up_to: Mutex::new(initial_size),
            subscribers: RwLock::new(Subscribers::default()),
            fm_subscription: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&this);
        let sub_id = this.file_manager.subscribe(move || {
            // Propagated: for a local write this becomes that write's
            // response error (§4.2); for a watcher-driven cross-process
            // update there is no response channel, so the caller only logs
            // it (see `FileManager::refresh_size_from_disk`).
            match weak.upgrade() {
                Some(this) => this.process_new_rows(),
                None => Ok(()),
            }
        });
        this.fm_subscription.store(sub_id, Ordering::Release);
        let _ = this.process_new_rows();
        this
    }

    /// Register a row-completion callback. Returns an id for
    /// [`RowEmitter::unsubscribe`]. Never replays historical rows.
    pub fn subscribe(&self, callback: impl Fn(u64, &RowUnion) -> Result<()> + Send + Sync + 'static) -> u64 {
        let mut subs = self.subscribers.write();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().callbacks.remove(&id);
    }

    /// Drive delivery of every row that became complete since the last call.
    /// Called by the `FileManager` subscription, and directly by a writer
    /// right after its own append so the error (if any) can propagate back
    /// through that write's response.
    pub fn process_new_rows(&self) -> Result<()> {
        let mut processed = self.processed_up_to.lock();
        let new_size = self.file_manager.size();
        if new_size <= *processed {
            return Ok(());
        }

        let mut cursor = (processed.saturating_sub(HEADER_SIZE)) / self.row_size as u64;
        let result = (|| -> Result<()> {
            loop {
                let slot_start = codec::slot_offset(cursor, self.row_size as u64);
                let slot_end = slot_start + self.row_size as u64;
                if slot_end > new_size {
                    break;
                }
                let bytes = self.file_manager.read(slot_start, self.row_size as u64)?;
                let row = codec::unmarshal_row(&bytes, self.row_size as usize)?;
                if !codec::is_checksum_slot(cursor) {
                    self.emit(cursor, &row)?;
                }
                cursor += 1;
            }
            Ok(())
        })();

        *processed = codec::slot_offset(cursor, self.row_size as u64);
        result
    }

    fn emit(&self, physical_index: u64, row: &RowUnion) -> Result<()> {
        let snapshot: Vec<RowCallback> = {
            let subs = self.subscribers.read();
            subs.callbacks.values().cloned().collect()
        };
        for cb in snapshot {
            cb(physical_index, row)?;
        }
        Ok(())
    }
}

impl Drop for RowEmitter {
    fn drop(&mut self) {
        self.file_manager.unsubscribe(self.fm_subscription.load(Ordering::Acquire));
    }
}
