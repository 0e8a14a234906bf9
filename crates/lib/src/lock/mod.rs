//! Path-aware node locking.
//!
//! Logical locks over the whole tree are tracked in a single global queue.
//! The model is deliberately simple: at most one writer may hold a lock at
//! any time, any number of readers may coexist while no writer does, and
//! locks requested under the same transaction id are always compatible with
//! each other (the engine re-enters parent-ward while holding a lock). The
//! `path` of a lock is informational; it supports narrowing a held lock to a
//! parent path without a round-trip through the queue.
//!
//! Pending requests are granted in FIFO order, with priority requests
//! jumping ahead of non-priority ones. A granted lock that is not released
//! within a third of the configured timeout is logged; after three such
//! intervals it is flagged expired and forcibly removed, and any operation
//! still carrying it fails with a lock error.

mod errors;

pub use errors::LockError;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

/// A transaction id grouping the lock requests of one logical operation.
pub type TransactionId = Uuid;

use crate::path::PathBuf;

/// Options for a lock request.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Jump ahead of non-priority pending requests.
    pub priority: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum LockState {
    Pending,
    Granted,
}

struct LockEntry {
    id: u64,
    path: PathBuf,
    tid: TransactionId,
    for_writing: bool,
    state: LockState,
    priority: bool,
    comment: String,
    requested_at: Instant,
    granted_at: Option<Instant>,
    waker: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Queue {
    entries: Vec<LockEntry>,
    next_id: u64,
}

impl Queue {
    /// A request is compatible when every granted lock either belongs to the
    /// same transaction or both sides are readers.
    fn is_compatible(&self, tid: TransactionId, for_writing: bool) -> bool {
        self.entries
            .iter()
            .filter(|e| e.state == LockState::Granted)
            .all(|e| e.tid == tid || (!e.for_writing && !for_writing))
    }

    /// Grants every pending request that is now compatible, priority
    /// requests first, then FIFO.
    fn grant_pending(&mut self, manager: &Arc<LockManagerInner>) {
        let mut order: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].state == LockState::Pending)
            .collect();
        order.sort_by_key(|&i| (!self.entries[i].priority, self.entries[i].requested_at));
        for index in order {
            let (tid, for_writing) = {
                let entry = &self.entries[index];
                (entry.tid, entry.for_writing)
            };
            if !self.is_compatible(tid, for_writing) {
                continue;
            }
            let entry = &mut self.entries[index];
            entry.state = LockState::Granted;
            entry.granted_at = Some(Instant::now());
            let id = entry.id;
            if let Some(waker) = entry.waker.take() {
                if waker.send(()).is_err() {
                    // Requester went away while pending; drop the grant.
                    self.entries.retain(|e| e.id != id);
                    continue;
                }
            }
            LockManagerInner::spawn_monitor(manager, id);
        }
    }
}

struct LockManagerInner {
    queue: Mutex<Queue>,
    timeout: Duration,
}

impl LockManagerInner {
    fn spawn_monitor(manager: &Arc<LockManagerInner>, id: u64) {
        let weak: Weak<LockManagerInner> = Arc::downgrade(manager);
        let interval = manager.timeout / 3;
        tokio::spawn(async move {
            for warning in 1..=3u32 {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let mut queue = manager.queue.lock().expect("lock queue poisoned");
                let Some(entry) = queue.entries.iter().find(|e| e.id == id) else {
                    return; // released
                };
                if warning < 3 {
                    tracing::warn!(
                        path = %entry.path,
                        comment = entry.comment,
                        for_writing = entry.for_writing,
                        held_for = ?entry.granted_at.map(|t| t.elapsed()),
                        "Lock not released yet"
                    );
                } else {
                    tracing::error!(
                        path = %entry.path,
                        comment = entry.comment,
                        "Lock timed out, forcibly removing it"
                    );
                    queue.entries.retain(|e| e.id != id);
                    queue.grant_pending(&manager);
                }
            }
        });
    }
}

/// The process-wide lock manager for one database.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

impl LockManager {
    /// Creates a manager with the given lock timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LockManagerInner {
                queue: Mutex::new(Queue::default()),
                timeout,
            }),
        }
    }

    /// Requests a lock on `path` for transaction `tid`.
    ///
    /// Grants immediately when compatible with all currently granted locks,
    /// otherwise waits in the queue. The returned [`NodeLock`] must be
    /// released; a lock held past the manager's timeout is forcibly removed
    /// and later use fails with [`LockError::Expired`].
    pub async fn lock(
        &self,
        path: impl AsRef<crate::path::Path>,
        tid: TransactionId,
        for_writing: bool,
        comment: impl Into<String>,
        options: LockOptions,
    ) -> Result<NodeLock, LockError> {
        let path = path.as_ref().to_path_buf();
        let comment = comment.into();
        let (id, waiter) = {
            let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
            let id = queue.next_id;
            queue.next_id += 1;
            let compatible = queue.is_compatible(tid, for_writing);
            let (state, granted_at, waker, waiter) = if compatible {
                (LockState::Granted, Some(Instant::now()), None, None)
            } else {
                let (tx, rx) = oneshot::channel();
                (LockState::Pending, None, Some(tx), Some(rx))
            };
            queue.entries.push(LockEntry {
                id,
                path: path.clone(),
                tid,
                for_writing,
                state,
                priority: options.priority,
                comment: comment.clone(),
                requested_at: Instant::now(),
                granted_at,
                waker,
            });
            if compatible {
                LockManagerInner::spawn_monitor(&self.inner, id);
            } else {
                tracing::debug!(
                    path = %path,
                    comment = comment,
                    for_writing,
                    "Lock request queued"
                );
            }
            (id, waiter)
        };
        if let Some(waiter) = waiter {
            waiter
                .await
                .map_err(|_| LockError::Aborted { path: path.clone() })?;
        }
        Ok(NodeLock {
            manager: self.clone(),
            id,
            tid,
            path,
            for_writing,
            comment,
        })
    }

    /// Number of currently granted locks. Intended for diagnostics.
    pub fn granted_count(&self) -> usize {
        self.inner
            .queue
            .lock()
            .expect("lock queue poisoned")
            .entries
            .iter()
            .filter(|e| e.state == LockState::Granted)
            .count()
    }

    fn release(&self, id: u64) -> bool {
        let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
        let existed = queue.entries.iter().any(|e| e.id == id);
        queue.entries.retain(|e| e.id != id);
        queue.grant_pending(&self.inner);
        existed
    }

    fn is_active(&self, id: u64) -> bool {
        self.inner
            .queue
            .lock()
            .expect("lock queue poisoned")
            .entries
            .iter()
            .any(|e| e.id == id && e.state == LockState::Granted)
    }

    fn update_path(&self, id: u64, path: &PathBuf) -> bool {
        let mut queue = self.inner.queue.lock().expect("lock queue poisoned");
        match queue.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.path = path.clone();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.inner.queue.lock().expect("lock queue poisoned");
        f.debug_struct("LockManager")
            .field("entries", &queue.entries.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// A granted lock. Release it with [`NodeLock::release`] when the operation
/// completes; checking [`NodeLock::check`] after suspension points surfaces
/// forced expiry.
pub struct NodeLock {
    manager: LockManager,
    id: u64,
    tid: TransactionId,
    path: PathBuf,
    for_writing: bool,
    comment: String,
}

impl NodeLock {
    /// The path this lock currently covers.
    pub fn path(&self) -> &crate::path::Path {
        &self.path
    }

    /// The transaction id this lock belongs to.
    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    /// True for write locks.
    pub fn for_writing(&self) -> bool {
        self.for_writing
    }

    /// Fails with [`LockError::Expired`] if this lock was forcibly removed.
    pub fn check(&self) -> Result<(), LockError> {
        if self.manager.is_active(self.id) {
            Ok(())
        } else {
            Err(LockError::Expired {
                path: self.path.clone(),
                comment: self.comment.clone(),
            })
        }
    }

    /// Narrows this lock to its parent path in place.
    ///
    /// Under the single-writer model a held lock is always compatible at the
    /// parent, so this never re-queues; it fails only when the lock has
    /// already expired.
    pub fn move_to_parent(&mut self) -> Result<(), LockError> {
        let parent = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(PathBuf::root);
        if self.manager.update_path(self.id, &parent) {
            self.path = parent;
            Ok(())
        } else {
            Err(LockError::Expired {
                path: self.path.clone(),
                comment: self.comment.clone(),
            })
        }
    }

    /// Releases the lock and grants any pending requests that became
    /// compatible. Fails with [`LockError::Expired`] if the lock had already
    /// been forcibly removed.
    pub fn release(self) -> Result<(), LockError> {
        if self.manager.release(self.id) {
            Ok(())
        } else {
            Err(LockError::Expired {
                path: self.path.clone(),
                comment: self.comment.clone(),
            })
        }
    }
}

impl std::fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLock")
            .field("path", &self.path.as_str())
            .field("tid", &self.tid)
            .field("for_writing", &self.for_writing)
            .field("comment", &self.comment)
            .finish()
    }
}
