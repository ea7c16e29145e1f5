//! Pending task registry
//!
//! Thread-safe tally of the completion handlers for every in-flight task,
//! keyed by the transport-assigned task identifier. The registry only moves
//! state under its lock; completion closures are always invoked by the
//! caller after the lock is released.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::task::AbortHandle;
use url::Url;

use super::classifier::FetchOutcome;

/// Opaque identifier correlating transport events to a pending completion.
pub type TaskId = u64;

/// Completion handler for one request. Invoked exactly once.
pub type Completion = Box<dyn FnOnce(FetchOutcome) + Send + 'static>;

/// State held for one in-flight task.
pub(crate) struct TaskInfo {
    pub progress_data: Vec<u8>,
    pub started_at: Instant,
    pub url: Url,
    pub completion: Completion,
    pub abort: Option<AbortHandle>,
    pub paused: bool,
}

impl TaskInfo {
    fn new(url: Url, completion: Completion) -> Self {
        Self {
            progress_data: Vec::new(),
            started_at: Instant::now(),
            url,
            completion,
            abort: None,
            paused: false,
        }
    }
}

#[derive(Default)]
struct RegistryMap {
    tasks: HashMap<TaskId, TaskInfo>,
    /// One-hop redirects left behind by [`TaskRegistry::remap`] so stale
    /// handles keep addressing the task after a retry changed its id.
    redirects: HashMap<TaskId, TaskId>,
}

impl RegistryMap {
    fn resolve(&self, id: TaskId) -> TaskId {
        self.redirects.get(&id).copied().unwrap_or(id)
    }
}

/// Thread-safe map from task identifier to pending-completion state.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    inner: Mutex<RegistryMap>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the identifier for the next transport task.
    pub fn allocate_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, id: TaskId, url: Url, completion: Completion) {
        let mut map = self.lock();
        map.tasks.insert(id, TaskInfo::new(url, completion));
    }

    pub fn set_abort(&self, id: TaskId, abort: AbortHandle) {
        let mut map = self.lock();
        let id = map.resolve(id);
        if let Some(info) = map.tasks.get_mut(&id) {
            info.abort = Some(abort);
        }
    }

    /// Accumulates a received body chunk. Returns false when the task is
    /// no longer registered.
    pub fn append_data(&self, id: TaskId, chunk: &[u8]) -> bool {
        let mut map = self.lock();
        let id = map.resolve(id);
        match map.tasks.get_mut(&id) {
            Some(info) => {
                info.progress_data.extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    /// Takes the accumulated body out of the entry, leaving it registered.
    /// Returns `None` when no entry exists for the identifier.
    pub fn take_data(&self, id: TaskId) -> Option<Vec<u8>> {
        let mut map = self.lock();
        let id = map.resolve(id);
        map.tasks
            .get_mut(&id)
            .map(|info| std::mem::take(&mut info.progress_data))
    }

    /// Drops any body bytes accumulated so far, keeping the entry. Used
    /// when a challenge causes the same task to restart its exchange.
    pub fn reset_data(&self, id: TaskId) {
        let mut map = self.lock();
        let id = map.resolve(id);
        if let Some(info) = map.tasks.get_mut(&id) {
            info.progress_data.clear();
        }
    }

    /// Removes the entry, handing its state to the caller. The caller is
    /// responsible for invoking the completion outside of any lock.
    pub fn remove(&self, id: TaskId) -> Option<TaskInfo> {
        let mut map = self.lock();
        let id = map.resolve(id);
        let info = map.tasks.remove(&id);
        if info.is_some() {
            map.redirects.retain(|_, target| *target != id);
        }
        info
    }

    /// Atomically moves an entry to a new identifier, clearing its
    /// accumulated body for the fresh exchange. A redirect from the old
    /// identifier is kept so stale handles still reach the task. Returns
    /// false when the entry is gone, which means the task was cancelled
    /// while waiting.
    pub fn remap(&self, old: TaskId, new: TaskId) -> bool {
        let mut map = self.lock();
        let old = map.resolve(old);
        match map.tasks.remove(&old) {
            Some(mut info) => {
                info.progress_data.clear();
                info.abort = None;
                map.tasks.insert(new, info);
                map.redirects.retain(|_, target| *target != old);
                map.redirects.insert(old, new);
                true
            }
            None => false,
        }
    }

    /// Clears every entry, abandoning their completions. Returns the
    /// abandoned entries so the caller can abort their transport tasks.
    pub fn clear(&self) -> Vec<TaskInfo> {
        let mut map = self.lock();
        map.redirects.clear();
        map.tasks.drain().map(|(_, info)| info).collect()
    }

    /// Flags every registered task as paused or resumed, returning the
    /// affected identifiers.
    pub fn set_all_paused(&self, paused: bool) -> Vec<TaskId> {
        let mut map = self.lock();
        map.tasks
            .iter_mut()
            .filter(|(_, info)| info.paused != paused)
            .map(|(id, info)| {
                info.paused = paused;
                *id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryMap> {
        // A poisoned registry lock means a panic while holding it; the
        // map itself is still structurally sound.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn url() -> Url {
        Url::parse("https://api.example.org/book/1").unwrap()
    }

    fn counting_completion(counter: &Arc<AtomicUsize>) -> Completion {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_allocate_ids_are_unique() {
        let registry = TaskRegistry::new();
        let first = registry.allocate_id();
        let second = registry.allocate_id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_remove_hands_entry_out_exactly_once() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry.allocate_id();
        registry.insert(id, url(), counting_completion(&counter));

        let info = registry.remove(id).expect("first remove");
        (info.completion)(FetchOutcome::Failure(
            crate::error::ExecutorError::Cancelled,
            None,
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_append_and_take_data() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry.allocate_id();
        registry.insert(id, url(), counting_completion(&counter));

        assert!(registry.append_data(id, b"hello "));
        assert!(registry.append_data(id, b"world"));
        assert_eq!(registry.take_data(id).unwrap(), b"hello world");
        // Entry stays registered with an empty buffer.
        assert_eq!(registry.take_data(id).unwrap(), b"");

        assert!(!registry.append_data(9999, b"lost"));
        assert!(registry.take_data(9999).is_none());
    }

    #[test]
    fn test_remap_moves_completion_and_clears_buffer() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let old = registry.allocate_id();
        registry.insert(old, url(), counting_completion(&counter));
        registry.append_data(old, b"stale 401 body");

        let new = registry.allocate_id();
        assert!(registry.remap(old, new));

        // Old identifier now redirects to the new entry.
        assert!(registry.append_data(old, b"fresh"));
        assert_eq!(registry.take_data(new).unwrap(), b"fresh");

        let info = registry.remove(new).expect("remapped entry");
        (info.completion)(FetchOutcome::Failure(
            crate::error::ExecutorError::Cancelled,
            None,
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remap_of_missing_entry_reports_cancellation() {
        let registry = TaskRegistry::new();
        let old = registry.allocate_id();
        let new = registry.allocate_id();
        assert!(!registry.remap(old, new));
    }

    #[test]
    fn test_remove_through_stale_identifier_after_remap() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let old = registry.allocate_id();
        registry.insert(old, url(), counting_completion(&counter));
        let new = registry.allocate_id();
        registry.remap(old, new);

        // A cancel handle that only knows the pre-retry identifier still
        // reaches the task.
        assert!(registry.remove(old).is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_clear_abandons_all_entries() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let id = registry.allocate_id();
            registry.insert(id, url(), counting_completion(&counter));
        }
        let abandoned = registry.clear();
        assert_eq!(abandoned.len(), 3);
        assert_eq!(registry.len(), 0);
        // Abandoned completions are dropped without being invoked.
        drop(abandoned);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_all_paused_touches_every_entry() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry.insert(a, url(), counting_completion(&counter));
        registry.insert(b, url(), counting_completion(&counter));

        let mut paused = registry.set_all_paused(true);
        paused.sort_unstable();
        assert_eq!(paused, vec![a, b]);
    }
}
