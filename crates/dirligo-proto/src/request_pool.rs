//! Tracks in-flight requests keyed by wire id, so replies arriving on a
//! reader thread can be routed back to the thread that sent the request.
//!
//! A request's lifetime is: [`RequestPool::push`] registers a waiting slot,
//! the caller blocks in [`RequestPool::wait`], and the reader thread calls
//! [`RequestPool::serve`] with the matching id once a reply arrives. This
//! uses a blocking `Condvar` rather than a future, matching the crate's
//! OS-thread concurrency model.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ProtoError, Result};

enum Slot<T> {
    Pending,
    Ready(T),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Correlates outgoing request ids with the thread waiting on their reply.
pub struct RequestPool<T> {
    inner: Mutex<HashMap<u32, Arc<Shared<T>>>>,
    shutdown: Mutex<Option<String>>,
}

impl<T> Default for RequestPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestPool<T> {
    pub fn new() -> Self {
        RequestPool {
            inner: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
        }
    }

    /// Registers a new pending request. Fails if `id` is already pending,
    /// or if the pool has been shut down.
    pub fn push(&self, id: u32) -> Result<()> {
        if let Some(reason) = self.shutdown.lock().unwrap().clone() {
            return Err(ProtoError::Shutdown(reason));
        }
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&id) {
            return Err(ProtoError::DuplicateRequestId(id));
        }
        map.insert(
            id,
            Arc::new(Shared {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
            }),
        );
        Ok(())
    }

    /// Blocks the calling thread until `id`'s reply is served, or until
    /// `deadline` elapses.
    pub fn wait(&self, id: u32, deadline: Option<Instant>) -> Result<T> {
        let shared = {
            let map = self.inner.lock().unwrap();
            map.get(&id)
                .cloned()
                .ok_or(ProtoError::UnknownRequestId { reply: id })?
        };

        let mut slot = shared.slot.lock().unwrap();
        loop {
            match &mut *slot {
                Slot::Ready(_) => {
                    let Slot::Ready(value) =
                        std::mem::replace(&mut *slot, Slot::Pending)
                    else {
                        unreachable!()
                    };
                    self.inner.lock().unwrap().remove(&id);
                    return Ok(value);
                }
                Slot::Pending => {
                    if let Some(reason) = self.shutdown.lock().unwrap().clone() {
                        self.inner.lock().unwrap().remove(&id);
                        return Err(ProtoError::Shutdown(reason));
                    }
                    slot = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                self.inner.lock().unwrap().remove(&id);
                                return Err(ProtoError::Timeout);
                            }
                            let (slot, timed_out) = shared
                                .cond
                                .wait_timeout(slot, deadline - now)
                                .unwrap();
                            if timed_out.timed_out() {
                                if matches!(*slot, Slot::Pending) {
                                    self.inner.lock().unwrap().remove(&id);
                                    return Err(ProtoError::Timeout);
                                }
                            }
                            slot
                        }
                        None => shared.cond.wait(slot).unwrap(),
                    };
                }
            }
        }
    }

    /// Delivers a reply to whichever thread is waiting on `id`. Returns
    /// `Err(UnknownRequestId)` if nothing is pending for that id (a stray
    /// or duplicate reply).
    pub fn serve(&self, id: u32, value: T) -> Result<()> {
        let shared = {
            let map = self.inner.lock().unwrap();
            map.get(&id)
                .cloned()
                .ok_or(ProtoError::UnknownRequestId { reply: id })?
        };
        let mut slot = shared.slot.lock().unwrap();
        *slot = Slot::Ready(value);
        shared.cond.notify_all();
        Ok(())
    }

    /// Removes a pending request without waiting on it, e.g. when a caller
    /// abandons a request after its own timeout.
    pub fn remove(&self, id: u32) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Marks the pool permanently shut down and wakes every waiter so it
    /// can observe the failure instead of blocking forever: connection
    /// loss fails every outstanding request.
    pub fn shutdown(&self, reason: impl Into<String>) {
        *self.shutdown.lock().unwrap() = Some(reason.into());
        let map = self.inner.lock().unwrap();
        for shared in map.values() {
            shared.cond.notify_all();
        }
    }
}

/// Generates the next request id from a monotonically increasing counter,
/// wrapping on overflow. SFTP ids are arbitrary `u32`s chosen by the
/// client; wraparound is safe in practice because ids are
/// reclaimed as soon as their request completes. Per spec §4.7, the
/// counter starts at 1, not 0.
#[derive(Debug)]
pub struct IdGenerator {
    next: Mutex<u32>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        let mut next = self.next.lock().unwrap();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_wait_serve_round_trip() {
        let pool: Arc<RequestPool<u32>> = Arc::new(RequestPool::new());
        pool.push(1).unwrap();

        let waiter_pool = pool.clone();
        let handle = thread::spawn(move || waiter_pool.wait(1, None).unwrap());

        // Give the waiter a moment to block; not required for correctness
        // since serve() acquires the same mutex, but keeps the test honest.
        thread::yield_now();
        pool.serve(1, 42).unwrap();

        assert_eq!(handle.join().unwrap(), 42);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn duplicate_id_rejected() {
        let pool: RequestPool<u32> = RequestPool::new();
        pool.push(5).unwrap();
        assert!(matches!(
            pool.push(5),
            Err(ProtoError::DuplicateRequestId(5))
        ));
    }

    #[test]
    fn serve_unknown_id_fails() {
        let pool: RequestPool<u32> = RequestPool::new();
        assert!(matches!(
            pool.serve(9, 1),
            Err(ProtoError::UnknownRequestId { reply: 9 })
        ));
    }

    #[test]
    fn wait_times_out() {
        let pool: RequestPool<u32> = RequestPool::new();
        pool.push(1).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(pool.wait(1, Some(deadline)), Err(ProtoError::Timeout)));
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let pool: Arc<RequestPool<u32>> = Arc::new(RequestPool::new());
        pool.push(1).unwrap();
        let waiter_pool = pool.clone();
        let handle = thread::spawn(move || waiter_pool.wait(1, None));
        thread::yield_now();
        pool.shutdown("connection lost");
        assert!(matches!(handle.join().unwrap(), Err(ProtoError::Shutdown(_))));
    }

    #[test]
    fn id_generator_increments() {
        let gen = IdGenerator::new();
        assert_eq!(gen.next_id(), 1);
        assert_eq!(gen.next_id(), 2);
        assert_eq!(gen.next_id(), 3);
    }
}
