use core::future::Future;
use core::task::Poll;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, instrument, trace, warn};

use crate::panic::{capture, capture_async, PanicError};
use crate::types::{Error, Options, Outcome};

enum Status<T, E> {
    Starting,
    LeaderDrop,
    Done(Result<T, Error<E>>),
}

/// One in-flight execution of the work for a key.
struct Call<T, E> {
    status: Mutex<Status<T, E>>,
    cvar: Condvar,
    notify: Notify,
    followers: AtomicUsize,
}

impl<T: Clone, E: Clone> Call<T, E> {
    fn new() -> Self {
        Call {
            status: Mutex::new(Status::Starting),
            cvar: Condvar::new(),
            notify: Notify::new(),
            followers: AtomicUsize::new(0),
        }
    }

    /// Pending while the leader is still working, Ready(None) if the leader
    /// went away without a result.
    fn poll_done(&self) -> Poll<Option<Result<T, Error<E>>>> {
        match &*self.status.lock() {
            Status::Starting => Poll::Pending,
            Status::LeaderDrop => Poll::Ready(None),
            Status::Done(result) => Poll::Ready(Some(result.clone())),
        }
    }

    fn wait(&self) -> Option<Result<T, Error<E>>> {
        let mut status = self.status.lock();
        loop {
            match &*status {
                Status::Starting => {
                    trace!("Not done, waiting...");
                    self.cvar.wait(&mut status);
                    trace!("Work done noticed");
                }
                Status::LeaderDrop => return None,
                Status::Done(result) => return Some(result.clone()),
            }
        }
    }

    async fn wait_async(&self) -> Option<Result<T, Error<E>>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Poll::Ready(result) = self.poll_done() {
                return result;
            }
            trace!("Not done, waiting...");
            notified.await;
            trace!("Work done noticed");
        }
    }
}

enum Role<'a, K: Eq + Hash, T, E> {
    Leader(Flight<'a, K, T, E>),
    Follower(Arc<Call<T, E>>),
}

/// Flight is held by the leader while it runs the work. Dropping it retires
/// the call: the key leaves the registry first, then the waiters are woken.
/// A flight dropped without a result (the leader's future was cancelled) wakes
/// the followers with `LeaderDrop` so one of them can take over.
struct Flight<'a, K: Eq + Hash, T, E> {
    group: &'a Group<K, T, E>,
    key: K,
    call: Arc<Call<T, E>>,
    result: Option<Result<T, Error<E>>>,
}

impl<'a, K: Eq + Hash, T, E> Flight<'a, K, T, E> {
    fn complete(mut self, result: Result<T, Error<E>>) {
        self.result = Some(result);
    }
}

impl<'a, K: Eq + Hash, T, E> Drop for Flight<'a, K, T, E> {
    fn drop(&mut self) {
        let status = match self.result.take() {
            Some(result) => Status::Done(result),
            None => {
                warn!("Leader dropped before work finished");
                Status::LeaderDrop
            }
        };

        let mut calls = self.group.calls.lock();
        calls.remove(&self.key);
        drop(calls);
        trace!("Entry removed");

        *self.call.status.lock() = status;
        self.call.cvar.notify_all();
        self.call.notify.notify_waiters();
        trace!(
            followers = self.call.followers.load(Ordering::Relaxed),
            "Followers woken"
        );
    }
}

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Clones share the same in-flight registry.
pub struct Group<K, T, E> {
    calls: Arc<Mutex<HashMap<K, Arc<Call<T, E>>>>>,
    options: Options,
}

impl<K, T, E> Clone for Group<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            options: self.options.clone(),
        }
    }
}

impl<K, T, E> fmt::Debug for Group<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.calls.lock().len())
            .field("options", &self.options)
            .finish()
    }
}

impl<K, T, E> Default for Group<K, T, E> {
    fn default() -> Self {
        Self::with_options(Options::default())
    }
}

impl<K, T, E> Group<K, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Group {
            calls: Arc::new(Mutex::new(HashMap::with_capacity(options.capacity))),
            options,
        }
    }

    /// in_flight returns the number of keys whose work is currently running.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<K, T, E> Group<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
    E: Clone,
{
    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    /// The shared flag of the outcome tells whether this caller received
    /// another caller's result.
    ///
    /// A panic inside `work` is returned to every caller as `Error::Panic`.
    #[instrument(skip(self, work))]
    pub fn work<F>(&self, key: K, work: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        loop {
            match self.join(&key) {
                Role::Follower(call) => match call.wait() {
                    Some(result) => {
                        trace!("Shared value returned");
                        return Outcome {
                            result,
                            shared: true,
                        };
                    }
                    None => {
                        trace!("Leader dropped, retrying");
                        continue;
                    }
                },
                Role::Leader(flight) => {
                    trace!("working...");
                    let result = match capture(self.options.capture_backtrace, work) {
                        Ok(r) => r.map_err(Error::Work),
                        Err(p) => Err(self.panicked(p)),
                    };
                    flight.complete(result.clone());
                    trace!("Work done");
                    return Outcome {
                        result,
                        shared: false,
                    };
                }
            }
        }
    }

    /// work_async is like work but for futures. Duplicate callers suspend
    /// without blocking their thread. If the leader's future is dropped before
    /// the work finishes, one of the waiting callers runs its own work instead.
    #[instrument(skip(self, fut))]
    pub async fn work_async<Fut>(&self, key: K, fut: Fut) -> Outcome<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match self.join(&key) {
                Role::Follower(call) => match call.wait_async().await {
                    Some(result) => {
                        trace!("Shared value returned");
                        return Outcome {
                            result,
                            shared: true,
                        };
                    }
                    None => {
                        trace!("Leader dropped, retrying");
                        continue;
                    }
                },
                Role::Leader(flight) => {
                    trace!("working...");
                    let result = match capture_async(self.options.capture_backtrace, fut).await {
                        Ok(r) => r.map_err(Error::Work),
                        Err(p) => Err(self.panicked(p)),
                    };
                    flight.complete(result.clone());
                    trace!("Work done");
                    return Outcome {
                        result,
                        shared: false,
                    };
                }
            }
        }
    }

    /// join registers the caller under `key`, as the leader if nothing is in
    /// flight for it, as a follower of the running call otherwise.
    fn join(&self, key: &K) -> Role<'_, K, T, E> {
        let mut calls = self.calls.lock();
        trace!("Aquire registry lock");
        if let Some(call) = calls.get(key) {
            call.followers.fetch_add(1, Ordering::Relaxed);
            return Role::Follower(call.clone());
        }
        let call = Arc::new(Call::new());
        calls.insert(key.clone(), call.clone());
        trace!("entry inited");
        Role::Leader(Flight {
            group: self,
            key: key.clone(),
            call,
            result: None,
        })
    }

    fn panicked(&self, p: PanicError) -> Error<E> {
        if self.options.log_panics {
            error!(
                location = p.location().unwrap_or("unknown"),
                "Work panicked: {}",
                p.message()
            );
        }
        Error::Panic(p)
    }

    #[cfg(test)]
    fn followers(&self, key: &K) -> usize {
        match self.calls.lock().get(key) {
            Some(call) => call.followers.load(Ordering::Relaxed),
            None => 0,
        }
    }
}
