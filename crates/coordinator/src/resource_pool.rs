//! Atomic multi-resource acquisition
//!
//! A [`ResourcePool`] hands out named resources to owners all-or-nothing:
//! either every requested name is granted in one critical section or none is.
//! Blocking acquirers queue with a ticket; a waiter never claims a resource an
//! earlier overlapping waiter is still queued for.

use ai_agent_common::error::Result;
use ai_agent_common::CoordinationError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Anything usable as a resource name
pub trait Resource: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> Resource for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// The resource that blocked an acquisition and who holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Held<K> {
    pub resource: K,
    pub owner: String,
}

struct PoolState<K> {
    holders: HashMap<K, String>,
    waiters: BTreeMap<u64, HashSet<K>>,
}

impl<K: Resource> PoolState<K> {
    fn conflict(&self, owner: &str, names: &HashSet<K>) -> Option<Held<K>> {
        names.iter().find_map(|name| match self.holders.get(name) {
            Some(holder) if holder != owner => Some(Held {
                resource: name.clone(),
                owner: holder.clone(),
            }),
            _ => None,
        })
    }

    fn queued_ahead(&self, ticket: u64, names: &HashSet<K>) -> bool {
        self.waiters
            .range(..ticket)
            .any(|(_, wanted)| !wanted.is_disjoint(names))
    }

    fn grant(&mut self, owner: &str, names: &HashSet<K>) {
        for name in names {
            self.holders.insert(name.clone(), owner.to_string());
        }
    }
}

pub struct ResourcePool<K> {
    state: Mutex<PoolState<K>>,
    released: Notify,
    next_ticket: AtomicU64,
}

impl<K: Resource> ResourcePool<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                holders: HashMap::new(),
                waiters: BTreeMap::new(),
            }),
            released: Notify::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Grant every name to `owner` or report the first one held by someone else.
    ///
    /// Names `owner` already holds do not conflict.
    pub fn claim(&self, owner: &str, names: &HashSet<K>) -> std::result::Result<(), Held<K>> {
        let mut state = self.state.lock();
        if let Some(held) = state.conflict(owner, names) {
            trace!("{} blocked on {:?} held by {}", owner, held.resource, held.owner);
            return Err(held);
        }
        state.grant(owner, names);
        Ok(())
    }

    /// Non-blocking all-or-nothing acquisition
    pub fn try_acquire(&self, owner: &str, names: &HashSet<K>) -> bool {
        self.claim(owner, names).is_ok()
    }

    /// Blocking all-or-nothing acquisition.
    ///
    /// Waits until the whole set is free and no earlier overlapping waiter is
    /// queued. `None` waits forever. Dropping the future leaves the queue.
    pub async fn acquire(
        &self,
        owner: &str,
        names: &HashSet<K>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let _waiter = Waiter::register(self, ticket, names);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.conflict(owner, names).is_none() && !state.queued_ahead(ticket, names) {
                    state.waiters.remove(&ticket);
                    state.grant(owner, names);
                    debug!("{} acquired {} resources after waiting", owner, names.len());
                    return Ok(());
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(CoordinationError::timeout(format!(
                            "{} acquiring {:?}",
                            owner, names
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release the given names held by `owner`; anything else is a logged no-op.
    pub fn release(&self, owner: &str, names: &HashSet<K>) -> Vec<K> {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            for name in names {
                let holder = state.holders.get(name).cloned();
                match holder {
                    Some(holder) if holder == owner => {
                        state.holders.remove(name);
                        released.push(name.clone());
                    }
                    Some(holder) => {
                        debug!("{} cannot release {:?}: held by {}", owner, name, holder)
                    }
                    None => debug!("{} released {:?} which was not held", owner, name),
                }
            }
        }
        if !released.is_empty() {
            self.released.notify_waiters();
        }
        released
    }

    /// Release everything `owner` holds
    pub fn release_all(&self, owner: &str) -> Vec<K> {
        let released: Vec<K> = {
            let mut state = self.state.lock();
            let names: Vec<K> = state
                .holders
                .iter()
                .filter(|(_, holder)| holder.as_str() == owner)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                state.holders.remove(name);
            }
            names
        };
        if !released.is_empty() {
            self.released.notify_waiters();
        }
        released
    }

    /// Move names from one owner to another without ever freeing them
    pub fn transfer(&self, from: &str, to: &str, names: &HashSet<K>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(name) = names
            .iter()
            .find(|name| state.holders.get(*name).map(String::as_str) != Some(from))
        {
            return Err(CoordinationError::NotOwner {
                path: format!("{:?}", name),
                agent: from.to_string(),
            });
        }
        state.grant(to, names);
        Ok(())
    }

    /// Record ownership without conflict checks (state restore)
    pub fn seed(&self, owner: &str, names: &HashSet<K>) {
        self.state.lock().grant(owner, names);
    }

    pub fn owner_of(&self, name: &K) -> Option<String> {
        self.state.lock().holders.get(name).cloned()
    }

    pub fn held_by(&self, owner: &str) -> Vec<K> {
        self.state
            .lock()
            .holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == owner)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<K, String> {
        self.state.lock().holders.clone()
    }

    /// Number of blocked acquirers
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl<K: Resource> Default for ResourcePool<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue entry of a blocking acquirer, removed on success, timeout or drop
struct Waiter<'a, K: Resource> {
    pool: &'a ResourcePool<K>,
    ticket: u64,
}

impl<'a, K: Resource> Waiter<'a, K> {
    fn register(pool: &'a ResourcePool<K>, ticket: u64, names: &HashSet<K>) -> Self {
        pool.state.lock().waiters.insert(ticket, names.clone());
        Self { pool, ticket }
    }
}

impl<K: Resource> Drop for Waiter<'_, K> {
    fn drop(&mut self) {
        self.pool.state.lock().waiters.remove(&self.ticket);
        // Waiters queued behind this one may now be eligible
        self.pool.released.notify_waiters();
    }
}
