//! Owns the single file handle backing a database: confirmed-size tracking,
//! the sole writer channel, and subscriber fan-out on every size change
//! (§4.2).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use fs2::FileExt as _;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::watcher::Watcher;

/// Open mode. Write mode takes an advisory exclusive lock; read mode takes
/// none, relying on append-only semantics for safe concurrent reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// One append request sent over the writer channel.
pub struct WriteRequest {
    pub bytes: Vec<u8>,
    pub response: Sender<Result<()>>,
}

type Callback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: std::collections::HashMap<u64, Callback>,
}

/// Poll interval for the read-mode cross-process watcher thread.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often the writer thread wakes to check `writer_stop`, so `close()`
/// doesn't have to wait on every `Sender` clone (held by callers) to drop.
const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct FileManager {
    path: PathBuf,
    mode: Mode,
    read_file: File,
    write_file: Mutex<Option<File>>,
    confirmed_size: AtomicU64,
    subscribers: RwLock<Subscribers>,
    writer_bound: AtomicBool,
    closed: AtomicBool,
    tombstone: RwLock<Option<Error>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    writer_stop: Arc<AtomicBool>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
    watcher_stop: Arc<AtomicBool>,
    _lock_file: Option<()>,
}

impl FileManager {
    /// Open an existing file, returning it already wrapped in `Arc` since
    /// read-mode instances hand a clone to their background watcher thread.
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let read_file = File::open(&path)?;
        let size = read_file.metadata()?.len();

        let write_file = if mode == Mode::Write {
            let f = OpenOptions::new().append(true).open(&path)?;
            fs2::FileExt::try_lock_exclusive(&f)
                .map_err(|_| Error::new(ErrorKind::WriteError, "database already opened for writing"))?;
            Some(f)
        } else {
            None
        };

        let manager = Arc::new(Self {
            path,
            mode,
            read_file,
            write_file: Mutex::new(write_file),
            confirmed_size: AtomicU64::new(size),
            subscribers: RwLock::new(Subscribers::default()),
            writer_bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tombstone: RwLock::new(None),
            writer_thread: Mutex::new(None),
            writer_stop: Arc::new(AtomicBool::new(false)),
            watcher_thread: Mutex::new(None),
            watcher_stop: Arc::new(AtomicBool::new(false)),
            _lock_file: None,
        });

        if mode == Mode::Read {
            manager.spawn_watcher()?;
        }

        Ok(manager)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Read `size` bytes at `offset`. Fails `InvalidInput` if the range
    /// extends past `confirmed_size`.
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let confirmed = self.confirmed_size.load(Ordering::Acquire);
        if offset.checked_add(size).map(|end| end > confirmed).unwrap_or(true) {
            return Err(Error::invalid_input(format!(
                "read [{offset}, {offset}+{size}) exceeds confirmed size {confirmed}"
            )));
        }
        let mut buf = vec![0u8; size as usize];
        self.read_file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn size(&self) -> u64 {
        self.confirmed_size.load(Ordering::Acquire)
    }

    /// Discard a dangling, incomplete tail left by a write that was
    /// interrupted mid-row, so the next append lands exactly at
    /// `new_size` instead of after whatever garbage remains past it. In
    /// write mode this truncates the file on disk; in read mode there is
    /// no write handle to truncate, so only the bound on what `read` will
    /// serve moves back past the garbage — the bytes stay on disk for
    /// whichever process holds the write lock to clean up.
    pub fn discard_tail(&self, new_size: u64) -> Result<()> {
        if let Some(file) = self.write_file.lock().as_mut() {
            file.set_len(new_size)?;
            file.sync_all()?;
        }
        self.confirmed_size.store(new_size, Ordering::Release);
        Ok(())
    }

    /// Bind the sole writer channel, spawning the dedicated writer thread
    /// that serializes every append. Only legal once, and only in write
    /// mode.
    pub fn bind_writer(self: &Arc<Self>) -> Result<Sender<WriteRequest>> {
        if self.mode != Mode::Write {
            return Err(Error::new(ErrorKind::InvalidAction, "set_writer is only legal in write mode"));
        }
        if self.writer_bound.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::InvalidAction, "a writer channel is already bound"));
        }

        let (tx, rx) = mpsc::channel::<WriteRequest>();
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("frozendb-writer".into())
            .spawn(move || loop {
                if this.writer_stop.load(Ordering::Acquire) {
                    return;
                }
                match rx.recv_timeout(WRITER_POLL_INTERVAL) {
                    Ok(req) => {
                        let result = this.do_write(&req.bytes);
                        let _ = req.response.send(result);
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            })
            .map_err(|e| Error::with_cause(ErrorKind::WriteError, "failed to spawn writer thread", e))?;

        *self.writer_thread.lock() = Some(handle);
        Ok(tx)
    }

    fn do_write(&self, bytes: &[u8]) -> Result<()> {
        if let Some(err) = self.tombstone.read().as_ref() {
            return Err(Error::tombstoned(Error::new(err.kind, err.message.clone())));
        }

        let append_result = (|| -> Result<()> {
            let mut guard = self.write_file.lock();
            let file = guard
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::InvalidAction, "no writer bound"))?;
            let offset = self.confirmed_size.load(Ordering::Acquire);
            file.write_all_at(bytes, offset)?;
            file.sync_data()?;
            Ok(())
        })();

        match append_result {
            Ok(()) => {
                self.confirmed_size.fetch_add(bytes.len() as u64, Ordering::AcqRel);
                // The append itself succeeded and is durable; a subscriber
                // error past this point is reported through the write's
                // response but does not undo the write or tombstone us.
                self.notify_subscribers()
            }
            Err(e) => {
                error!(error = %e, "write failed, tombstoning file manager");
                *self.tombstone.write() = Some(Error::new(e.kind, e.message.clone()));
                Err(e)
            }
        }
    }

    fn notify_subscribers(&self) -> Result<()> {
        let snapshot: Vec<Callback> = {
            let subs = self.subscribers.read();
            subs.callbacks.values().cloned().collect()
        };
        for cb in snapshot {
            cb()?;
        }
        Ok(())
    }

    /// Register a notification callback, fired after every confirmed-size
    /// change (local write or watcher-observed growth). Returns an id to
    /// pass to [`FileManager::unsubscribe`].
    pub fn subscribe(&self, callback: impl Fn() -> Result<()> + Send + Sync + 'static) -> u64 {
        let mut subs = self.subscribers.write();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Idempotent: unsubscribing an already-removed or unknown id is a no-op.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.write().callbacks.remove(&id);
    }

    fn spawn_watcher(self: &Arc<Self>) -> Result<()> {
        let watcher = Watcher::new(&self.path)?;
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("frozendb-watcher".into())
            .spawn(move || this.watch_loop(watcher))
            .map_err(|e| Error::with_cause(ErrorKind::PathError, "failed to spawn watcher thread", e))?;
        *self.watcher_thread.lock() = Some(handle);
        Ok(())
    }

    fn watch_loop(&self, watcher: Watcher) {
        loop {
            if self.watcher_stop.load(Ordering::Acquire) {
                return;
            }
            match watcher.poll_growth() {
                Ok(true) => self.refresh_size_from_disk(),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "file watcher failed, cross-process updates stopped");
                    return;
                }
            }
            std::thread::sleep(WATCH_POLL_INTERVAL);
        }
    }

    fn refresh_size_from_disk(&self) {
        let Ok(meta) = std::fs::metadata(&self.path) else { return };
        let new_size = meta.len();
        let old = self.confirmed_size.load(Ordering::Acquire);
        if new_size > old {
            self.confirmed_size.store(new_size, Ordering::Release);
            if let Err(e) = self.notify_subscribers() {
                warn!(error = %e, "subscriber rejected watcher-driven size update");
            }
        }
    }

    /// Idempotent: waits for in-flight writes, releases the lock, stops the
    /// watcher.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer_stop.store(true, Ordering::Release);
        self.watcher_stop.store(true, Ordering::Release);
        if let Some(handle) = self.writer_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher_thread.lock().take() {
            let _ = handle.join();
        }
        debug!(path = %self.path.display(), "file manager closed");
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::AtomicUsize;

    fn make_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn read_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(&dir, "db", b"hello world");
        let fm = FileManager::open(&path, Mode::Read).unwrap();
        assert_eq!(fm.size(), 11);
        assert!(fm.read(0, 100).is_err());
        assert_eq!(fm.read(0, 5).unwrap(), b"hello");
        fm.close();
    }

    #[test]
    fn write_updates_confirmed_size_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(&dir, "db", b"header--");
        let fm = FileManager::open(&path, Mode::Write).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        fm.subscribe(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let tx = fm.bind_writer().unwrap();
        let (resp_tx, resp_rx) = mpsc::channel();
        tx.send(WriteRequest { bytes: b"row1".to_vec(), response: resp_tx }).unwrap();
        resp_rx.recv().unwrap().unwrap();

        assert_eq!(fm.size(), 12);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        fm.close();
    }

    #[test]
    fn second_writer_bind_is_invalid_action() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(&dir, "db", b"header--");
        let fm = FileManager::open(&path, Mode::Write).unwrap();
        let _tx = fm.bind_writer().unwrap();
        assert_eq!(fm.bind_writer().unwrap_err().kind, ErrorKind::InvalidAction);
        fm.close();
    }

    #[test]
    fn second_write_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(&dir, "db", b"header--");
        let fm1 = FileManager::open(&path, Mode::Write).unwrap();
        let err = FileManager::open(&path, Mode::Write).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WriteError);
        fm1.close();
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_file(&dir, "db", b"header--");
        let fm = FileManager::open(&path, Mode::Read).unwrap();
        fm.close();
        fm.close();
    }
}
