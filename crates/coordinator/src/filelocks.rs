//! File lock manager for concurrent access control
//!
//! Implements exclusive per-file ownership with:
//! - Atomic multi-file acquisition through a [`ResourcePool`]
//! - Per-path bulk locking for interactive use
//! - Request / approve / deny transfer between agents
//! - Write-through persistence of every ownership change
//!
//! Mutations are serialized by one async gate; lock records live in a
//! concurrent map so queries never wait on a writer.

use crate::resource_pool::{Held, ResourcePool};
use ai_agent_common::error::Result;
use ai_agent_common::{
    CoordinationError, FileLock, LockConfig, LockRequest, LockRequestStatus, LockStatus,
    RequestId, StateStore,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Resolved requests kept for lookups; older ones are evicted
pub const RESOLVED_HISTORY: usize = 256;

/// Lexically normalise a lock path.
///
/// Relative paths are joined to `root` when one is given; `.` is dropped and
/// `..` folded. The file does not need to exist.
pub fn normalize_path(root: Option<&Path>, path: &Path) -> PathBuf {
    let joined = match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.file_name().is_some() {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// File lock manager with request/approval transfer
pub struct FileLockManager {
    pool: ResourcePool<PathBuf>,

    /// Map of path -> active lock
    records: DashMap<PathBuf, FileLock>,

    requests: DashMap<RequestId, LockRequest>,

    /// Resolution order, oldest first
    resolved: SyncMutex<VecDeque<RequestId>>,

    gate: Mutex<()>,

    root: Option<PathBuf>,

    /// Default timeout for blocking acquisition
    acquire_timeout: Duration,

    store: Arc<dyn StateStore>,
}

impl FileLockManager {
    pub fn new(config: &LockConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            pool: ResourcePool::new(),
            records: DashMap::new(),
            requests: DashMap::new(),
            resolved: SyncMutex::new(VecDeque::new()),
            gate: Mutex::new(()),
            root: config.workspace_root.clone(),
            acquire_timeout: config.acquire_timeout(),
            store,
        }
    }

    pub fn normalize(&self, path: &Path) -> PathBuf {
        normalize_path(self.root.as_deref(), path)
    }

    fn normalize_all(&self, paths: &[PathBuf]) -> HashSet<PathBuf> {
        paths.iter().map(|p| self.normalize(p)).collect()
    }

    /// Lock each path independently; partial success is reported per path.
    #[instrument(name = "file_lock_files", skip(self, paths), fields(count = paths.len()))]
    pub async fn lock_files(
        &self,
        agent: &str,
        paths: &[PathBuf],
        description: &str,
    ) -> HashMap<PathBuf, LockStatus> {
        let _gate = self.gate.lock().await;
        let mut outcome = HashMap::new();

        for path in self.normalize_all(paths) {
            if self.pool.owner_of(&path).as_deref() == Some(agent) {
                outcome.insert(path, LockStatus::AlreadyOwned);
                continue;
            }
            let single = HashSet::from([path.clone()]);
            match self.pool.claim(agent, &single) {
                Ok(()) => {
                    self.record(FileLock::new(path.clone(), agent, description)).await;
                    outcome.insert(path, LockStatus::Locked);
                }
                Err(held) => {
                    debug!("{} is locked by {}", path.display(), held.owner);
                    outcome.insert(path, LockStatus::AlreadyLocked(held.owner));
                }
            }
        }

        outcome
    }

    /// Atomically lock every path or none of them.
    ///
    /// Returns the paths that were not already owned by `agent`.
    #[instrument(name = "file_lock_all", skip(self, paths), fields(count = paths.len()))]
    pub async fn lock_all(
        &self,
        agent: &str,
        paths: &[PathBuf],
        description: &str,
    ) -> Result<Vec<PathBuf>> {
        let wanted = self.normalize_all(paths);
        let _gate = self.gate.lock().await;

        let newly: Vec<PathBuf> = wanted
            .iter()
            .filter(|p| self.pool.owner_of(p).as_deref() != Some(agent))
            .cloned()
            .collect();

        self.pool.claim(agent, &wanted).map_err(conflict)?;

        for path in &newly {
            self.record(FileLock::new(path.clone(), agent, description)).await;
        }
        debug!("{} locked {} files ({} new)", agent, wanted.len(), newly.len());
        Ok(newly)
    }

    /// Blocking atomic acquisition; `None` uses the configured timeout.
    #[instrument(name = "file_lock_blocking", skip(self, paths), fields(count = paths.len()))]
    pub async fn acquire_blocking(
        &self,
        agent: &str,
        paths: &[PathBuf],
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<PathBuf>> {
        let wanted = self.normalize_all(paths);
        let timeout = timeout.unwrap_or(self.acquire_timeout);

        if let Err(e) = self.pool.acquire(agent, &wanted, Some(timeout)).await {
            warn!("{} timed out waiting for {} files", agent, wanted.len());
            return Err(e);
        }

        // The pool already names `agent`; records follow before the next await
        let mut newly = Vec::new();
        for path in wanted {
            if self.owned_by(&path, agent) {
                continue;
            }
            let lock = FileLock::new(path.clone(), agent, description);
            self.records.insert(path, lock.clone());
            newly.push(lock);
        }

        let _gate = self.gate.lock().await;
        for lock in &newly {
            if self.owned_by(&lock.path, agent) {
                self.persist(lock).await;
            }
        }
        Ok(newly.into_iter().map(|l| l.path).collect())
    }

    fn owned_by(&self, path: &Path, agent: &str) -> bool {
        self.records.get(path).map_or(false, |l| l.owner == agent)
    }

    /// Release the given paths, or everything `agent` holds when `paths` is `None`.
    ///
    /// Paths not owned by `agent` are ignored.
    #[instrument(name = "file_release", skip(self, paths))]
    pub async fn release_files(&self, agent: &str, paths: Option<&[PathBuf]>) -> Vec<PathBuf> {
        let _gate = self.gate.lock().await;

        let released = match paths {
            Some(paths) => self.pool.release(agent, &self.normalize_all(paths)),
            None => self.pool.release_all(agent),
        };

        for path in &released {
            if self.records.remove_if(path, |_, lock| lock.owner == agent).is_some() {
                if let Err(e) = self.store.delete_lock(path).await {
                    warn!("Failed to persist release of {}: {:#}", path.display(), e);
                }
            }
        }

        if !released.is_empty() {
            debug!("{} released {} files", agent, released.len());
        }
        released
    }

    /// Ask the current owner of `path` to hand it over
    pub async fn request_file(&self, requester: &str, path: &Path, reason: &str) -> Result<RequestId> {
        let path = self.normalize(path);
        let _gate = self.gate.lock().await;

        let owner = self.pool.owner_of(&path).ok_or_else(|| CoordinationError::NotLocked {
            path: path.display().to_string(),
        })?;
        if owner == requester {
            return Err(CoordinationError::InvalidRequest(format!(
                "{} already owns {}",
                requester,
                path.display()
            )));
        }

        if let Some(existing) = self.requests.iter().find(|r| {
            r.status == LockRequestStatus::Pending && r.requester == requester && r.path == path
        }) {
            return Ok(existing.id);
        }

        let request = LockRequest {
            id: RequestId::new(),
            requester: requester.to_string(),
            path: path.clone(),
            reason: reason.to_string(),
            status: LockRequestStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let id = request.id;
        self.requests.insert(id, request);

        info!("{} requested {} from {} ({})", requester, path.display(), owner, id);
        Ok(id)
    }

    /// Transfer the file to the requester.
    ///
    /// `approver` must be the current owner; `None` is an administrative override.
    #[instrument(name = "file_request_approve", skip(self))]
    pub async fn approve_request(&self, id: RequestId, approver: Option<&str>) -> Result<LockRequest> {
        let _gate = self.gate.lock().await;
        let request = self.pending_request(id, approver)?;
        let path = request.path.clone();
        let single = HashSet::from([path.clone()]);

        match self.pool.owner_of(&path) {
            Some(owner) if owner == request.requester => {}
            Some(owner) => self.pool.transfer(&owner, &request.requester, &single)?,
            None => self.pool.claim(&request.requester, &single).map_err(conflict)?,
        }

        self.record(FileLock::new(path.clone(), request.requester.clone(), request.reason.clone()))
            .await;

        let request = self.resolve(request, LockRequestStatus::Approved);
        info!("{} now owns {} (request {})", request.requester, path.display(), id);
        Ok(request)
    }

    /// Refuse the request; ownership does not change
    pub async fn deny_request(&self, id: RequestId, approver: Option<&str>) -> Result<LockRequest> {
        let _gate = self.gate.lock().await;
        let request = self.pending_request(id, approver)?;
        let request = self.resolve(request, LockRequestStatus::Denied);

        info!("Request {} for {} denied", id, request.path.display());
        Ok(request)
    }

    /// Close every pending request made by `requester`
    pub async fn withdraw_requests(&self, requester: &str) -> Vec<LockRequest> {
        let _gate = self.gate.lock().await;
        let pending: Vec<LockRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == LockRequestStatus::Pending && r.requester == requester)
            .map(|r| r.clone())
            .collect();

        let withdrawn: Vec<LockRequest> = pending
            .into_iter()
            .map(|r| self.resolve(r, LockRequestStatus::Withdrawn))
            .collect();
        if !withdrawn.is_empty() {
            info!("Withdrew {} pending requests from {}", withdrawn.len(), requester);
        }
        withdrawn
    }

    fn resolve(&self, mut request: LockRequest, status: LockRequestStatus) -> LockRequest {
        request.status = status;
        request.resolved_at = Some(Utc::now());
        self.requests.insert(request.id, request.clone());

        let mut resolved = self.resolved.lock();
        resolved.push_back(request.id);
        while resolved.len() > RESOLVED_HISTORY {
            if let Some(old) = resolved.pop_front() {
                self.requests.remove(&old);
            }
        }
        request
    }

    fn pending_request(&self, id: RequestId, approver: Option<&str>) -> Result<LockRequest> {
        let request = self
            .requests
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| CoordinationError::not_found("lock_request", id))?;

        if request.status != LockRequestStatus::Pending {
            return Err(CoordinationError::AlreadyResolved {
                request_id: id.to_string(),
            });
        }

        if let (Some(approver), Some(owner)) = (approver, self.pool.owner_of(&request.path)) {
            if approver != owner {
                return Err(CoordinationError::NotOwner {
                    path: request.path.display().to_string(),
                    agent: approver.to_string(),
                });
            }
        }

        Ok(request)
    }

    async fn record(&self, lock: FileLock) {
        self.records.insert(lock.path.clone(), lock.clone());
        self.persist(&lock).await;
    }

    async fn persist(&self, lock: &FileLock) {
        if let Err(e) = self.store.put_lock(lock).await {
            warn!("Failed to persist lock on {}: {:#}", lock.path.display(), e);
        }
    }

    /// Rebuild ownership from persisted locks without conflict checks
    pub fn restore(&self, locks: Vec<FileLock>) {
        for lock in locks {
            let path = self.normalize(&lock.path);
            self.pool.seed(&lock.owner, &HashSet::from([path.clone()]));
            self.records.insert(path.clone(), FileLock { path, ..lock });
        }
    }

    /// Whether `agent` could lock every path right now
    pub fn is_lockable(&self, agent: &str, paths: &[PathBuf]) -> bool {
        self.normalize_all(paths).iter().all(|p| {
            self.pool
                .owner_of(p)
                .map_or(true, |owner| owner == agent)
        })
    }

    pub fn owner_of(&self, path: &Path) -> Option<String> {
        self.pool.owner_of(&self.normalize(path))
    }

    pub fn list_locks(&self) -> Vec<FileLock> {
        let mut locks: Vec<FileLock> = self.records.iter().map(|l| l.clone()).collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    pub fn locks_for(&self, agent: &str) -> Vec<FileLock> {
        self.list_locks()
            .into_iter()
            .filter(|l| l.owner == agent)
            .collect()
    }

    pub fn get_request(&self, id: RequestId) -> Option<LockRequest> {
        self.requests.get(&id).map(|r| r.clone())
    }

    pub fn list_requests(&self) -> Vec<LockRequest> {
        let mut requests: Vec<LockRequest> = self.requests.iter().map(|r| r.clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Pending requests for files `owner` currently holds
    pub fn pending_requests_for(&self, owner: &str) -> Vec<LockRequest> {
        self.list_requests()
            .into_iter()
            .filter(|r| {
                r.status == LockRequestStatus::Pending
                    && self.pool.owner_of(&r.path).as_deref() == Some(owner)
            })
            .collect()
    }
}

fn conflict(held: Held<PathBuf>) -> CoordinationError {
    CoordinationError::conflict(held.resource.display(), held.owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_agent_common::MemoryStore;

    fn manager() -> (FileLockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = LockConfig {
            workspace_root: Some(PathBuf::from("/repo")),
            acquire_timeout_secs: 1,
        };
        (FileLockManager::new(&config, store.clone()), store)
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_normalize_path() {
        let root = Some(Path::new("/repo"));
        assert_eq!(normalize_path(root, Path::new("src/./a.py")), PathBuf::from("/repo/src/a.py"));
        assert_eq!(normalize_path(root, Path::new("src/../a.py")), PathBuf::from("/repo/a.py"));
        assert_eq!(normalize_path(root, Path::new("/etc/../tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(normalize_path(None, Path::new("../a/../../b")), PathBuf::from("../../b"));
        assert_eq!(normalize_path(None, Path::new("/../x")), PathBuf::from("/x"));
    }

    #[tokio::test]
    async fn test_scenario_request_and_approve_transfers_ownership() {
        let (manager, _) = manager();
        let status = manager.lock_files("alice", &paths(&["a.py"]), "refactor").await;
        assert_eq!(status[&PathBuf::from("/repo/a.py")], LockStatus::Locked);

        let id = manager
            .request_file("bob", Path::new("a.py"), "need to fix import")
            .await
            .unwrap();
        assert_eq!(manager.pending_requests_for("alice").len(), 1);

        manager.approve_request(id, Some("alice")).await.unwrap();

        let locks = manager.list_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner, "bob");
        assert_eq!(locks[0].description, "need to fix import");
        assert!(manager.locks_for("alice").is_empty());
        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_lock_files_reports_per_path() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;

        let status = manager
            .lock_files("bob", &paths(&["a.py", "b.py"]), "edit")
            .await;
        assert_eq!(
            status[&PathBuf::from("/repo/a.py")],
            LockStatus::AlreadyLocked("alice".into())
        );
        assert_eq!(status[&PathBuf::from("/repo/b.py")], LockStatus::Locked);

        let again = manager.lock_files("bob", &paths(&["b.py"]), "edit").await;
        assert_eq!(again[&PathBuf::from("/repo/b.py")], LockStatus::AlreadyOwned);
    }

    #[tokio::test]
    async fn test_lock_all_is_atomic() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;

        let err = manager
            .lock_all("bob", &paths(&["b.py", "a.py"]), "task")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { ref owner, .. } if owner == "alice"));
        assert_eq!(manager.owner_of(Path::new("b.py")), None);
        assert_eq!(manager.list_locks().len(), 1);
    }

    #[tokio::test]
    async fn test_release_only_touches_own_files() {
        let (manager, store) = manager();
        manager.lock_files("alice", &paths(&["a.py", "b.py"]), "edit").await;
        manager.lock_files("bob", &paths(&["c.py"]), "edit").await;

        assert!(manager.release_files("bob", Some(&paths(&["a.py"]))).await.is_empty());
        assert_eq!(manager.release_files("alice", Some(&paths(&["a.py"]))).await.len(), 1);
        assert!(manager.release_files("alice", Some(&paths(&["a.py"]))).await.is_empty());

        let released = manager.release_files("alice", None).await;
        assert_eq!(released, vec![PathBuf::from("/repo/b.py")]);

        let persisted = store.load().await.unwrap();
        assert_eq!(persisted.locks.len(), 1);
        assert_eq!(persisted.locks[0].owner, "bob");
    }

    #[tokio::test]
    async fn test_request_errors() {
        let (manager, _) = manager();
        let err = manager
            .request_file("bob", Path::new("free.py"), "please")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotLocked { .. }));

        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;
        let err = manager
            .request_file("alice", Path::new("a.py"), "mine")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidRequest(_)));

        let first = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
        let second = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_approval_rules() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;
        let id = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();

        let err = manager.approve_request(id, Some("carol")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));

        let err = manager
            .approve_request(RequestId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { .. }));

        manager.approve_request(id, None).await.unwrap();
        let err = manager.approve_request(id, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::AlreadyResolved { .. }));
        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_deny_keeps_owner() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;
        let id = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();

        let denied = manager.deny_request(id, Some("alice")).await.unwrap();
        assert_eq!(denied.status, LockRequestStatus::Denied);
        assert!(denied.resolved_at.is_some());
        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("alice"));
        assert!(manager.pending_requests_for("alice").is_empty());

        let err = manager.approve_request(id, Some("alice")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn test_approve_after_release_grants_directly() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;
        let id = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
        manager.release_files("alice", None).await;

        manager.approve_request(id, Some("alice")).await.unwrap();
        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_blocking_acquire_after_release() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .acquire_blocking("bob", &paths(&["a.py", "b.py"]), "wait", None)
                    .await
            })
        };
        while manager.pool.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        manager.release_files("alice", None).await;

        let newly = waiter.await.unwrap().unwrap();
        assert_eq!(newly.len(), 2);
        assert_eq!(manager.locks_for("bob").len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_grant_is_listed_even_if_caller_goes_away() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let gate = manager.gate.lock().await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .acquire_blocking("bob", &paths(&["a.py"]), "wait", None)
                    .await
            })
        };
        while manager.pool.owner_of(&PathBuf::from("/repo/a.py")).is_none() {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        drop(gate);

        let locks = manager.locks_for("bob");
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].path, PathBuf::from("/repo/a.py"));

        let status = manager.lock_files("alice", &paths(&["a.py"]), "edit").await;
        assert_eq!(
            status[&PathBuf::from("/repo/a.py")],
            LockStatus::AlreadyLocked("bob".into())
        );
        assert_eq!(manager.release_files("bob", None).await.len(), 1);
        assert!(manager.list_locks().is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_closes_only_the_requesters_pending_requests() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py", "b.py"]), "edit").await;
        let from_bob = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
        let from_carol = manager.request_file("carol", Path::new("b.py"), "y").await.unwrap();

        let withdrawn = manager.withdraw_requests("bob").await;
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].id, from_bob);
        assert_eq!(withdrawn[0].status, LockRequestStatus::Withdrawn);

        let err = manager.approve_request(from_bob, Some("alice")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::AlreadyResolved { .. }));
        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("alice"));

        let pending = manager.pending_requests_for("alice");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, from_carol);
        assert!(manager.withdraw_requests("bob").await.is_empty());
    }

    #[tokio::test]
    async fn test_resolved_requests_are_evicted_oldest_first() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;

        let mut ids = Vec::new();
        for _ in 0..RESOLVED_HISTORY + 3 {
            let id = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
            manager.deny_request(id, Some("alice")).await.unwrap();
            ids.push(id);
        }

        assert_eq!(manager.list_requests().len(), RESOLVED_HISTORY);
        assert!(manager.get_request(ids[0]).is_none());
        assert!(manager.get_request(ids[2]).is_none());
        assert_eq!(
            manager.get_request(ids[3]).map(|r| r.status),
            Some(LockRequestStatus::Denied)
        );

        let pending = manager.request_file("bob", Path::new("a.py"), "x").await.unwrap();
        assert_eq!(manager.list_requests().len(), RESOLVED_HISTORY + 1);
        assert_eq!(manager.pending_requests_for("alice")[0].id, pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let (manager, _) = manager();
        manager.lock_files("alice", &paths(&["a.py"]), "edit").await;

        let err = manager
            .acquire_blocking("bob", &paths(&["a.py"]), "wait", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(manager.locks_for("bob").is_empty());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_ownership() {
        let (manager, _) = manager();
        manager.restore(vec![FileLock::new(PathBuf::from("/repo/a.py"), "alice", "edit")]);

        assert_eq!(manager.owner_of(Path::new("a.py")).as_deref(), Some("alice"));
        assert!(!manager.is_lockable("bob", &paths(&["a.py"])));
        assert!(manager.is_lockable("alice", &paths(&["a.py", "b.py"])));
        let status = manager.lock_files("bob", &paths(&["a.py"]), "edit").await;
        assert_eq!(
            status[&PathBuf::from("/repo/a.py")],
            LockStatus::AlreadyLocked("alice".into())
        );
    }
}
