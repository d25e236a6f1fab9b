//! Named cluster-wide locks stored as rows.
//!
//! The row's value names the owner that holds the lock. Acquiring is a
//! compare-and-set through an ordinary command: two nodes racing for the
//! same free lock both try to write the row and the loser's commit fails
//! with an optimistic locking error.
//!
//! The row is not reentrant. Only the [`LockManager`] that wrote it holds the
//! lock; another manager with the same owner id is refused like any other.

use crate::command::{Command, CommandConfig, CommandExecutor};
use crate::context::CommandContext;
use agenda_core::{EngineError, EngineResult};
use agenda_persistence::{Entity, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LOCKS: Table<LockEntity> = Table::new("locks");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntity {
    pub name: String,
    /// Owner currently holding the lock
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}

impl Entity for LockEntity {
    fn id(&self) -> &str {
        &self.name
    }
}

pub struct AcquireLockCmd {
    pub name: String,
    pub owner: String,
    /// A lock held longer than this is considered abandoned
    pub force_acquire_after: Option<Duration>,
}

impl Command for AcquireLockCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let now = ctx.now();
        let Some(mut lock) = ctx.tx().find(LOCKS, &self.name)? else {
            ctx.tx().insert(
                LOCKS,
                &LockEntity {
                    name: self.name.clone(),
                    value: Some(self.owner.clone()),
                    acquired_at: Some(now),
                },
            )?;
            return Ok(true);
        };

        match lock.value.as_deref() {
            None => {}
            Some(holder) => {
                let expired = match (self.force_acquire_after, lock.acquired_at) {
                    (Some(after), Some(at)) => chrono::Duration::from_std(after)
                        .map_or(false, |after| at + after < now),
                    _ => false,
                };
                if !expired {
                    return Ok(false);
                }
                tracing::warn!(
                    "Lock {} held by {} since {:?} is taken over by {}",
                    self.name,
                    holder,
                    lock.acquired_at,
                    self.owner
                );
            }
        }

        lock.value = Some(self.owner.clone());
        lock.acquired_at = Some(now);
        ctx.tx().update(LOCKS, &lock)?;
        Ok(true)
    }

    fn description(&self) -> String {
        format!("Acquire lock {} for {}", self.name, self.owner)
    }
}

/// Clear a lock. With an owner, only when that owner holds it.
pub struct ReleaseLockCmd {
    pub name: String,
    pub owner: Option<String>,
}

impl Command for ReleaseLockCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let Some(mut lock) = ctx.tx().find(LOCKS, &self.name)? else {
            return Ok(false);
        };
        let Some(holder) = lock.value.as_deref() else {
            return Ok(false);
        };
        if let Some(owner) = &self.owner {
            if holder != owner {
                tracing::debug!(
                    "Lock {} is held by {}, not releasing for {}",
                    self.name,
                    holder,
                    owner
                );
                return Ok(false);
            }
        }
        lock.value = None;
        lock.acquired_at = None;
        ctx.tx().update(LOCKS, &lock)?;
        Ok(true)
    }

    fn description(&self) -> String {
        format!("Release lock {}", self.name)
    }
}

pub struct GetLockValueCmd {
    pub name: String,
}

impl Command for GetLockValueCmd {
    type Output = Option<LockEntity>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<LockEntity>> {
        ctx.tx().find(LOCKS, &self.name)
    }

    fn description(&self) -> String {
        format!("Get lock {}", self.name)
    }
}

/// One owner's handle on one named lock.
///
/// Every acquire and release runs as its own command with retries disabled,
/// so a lost race is reported immediately instead of being retried.
#[derive(Debug)]
pub struct LockManager {
    executor: Arc<CommandExecutor>,
    name: String,
    owner: String,
    poll_interval: Duration,
    force_acquire_after: Option<Duration>,
    held: AtomicBool,
}

impl LockManager {
    pub fn new(
        executor: Arc<CommandExecutor>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let lock_config = &executor.services().config.lock;
        let poll_interval = lock_config.poll_interval();
        let force_acquire_after = lock_config.force_acquire_after();
        Self {
            executor,
            name: name.into(),
            owner: owner.into(),
            poll_interval,
            force_acquire_after,
            held: AtomicBool::new(false),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_force_acquire_after(mut self, after: Option<Duration>) -> Self {
        self.force_acquire_after = after;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// One attempt; `Ok(false)` when someone else holds the lock
    pub fn acquire_lock(&self) -> EngineResult<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let command = AcquireLockCmd {
            name: self.name.clone(),
            owner: self.owner.clone(),
            force_acquire_after: self.force_acquire_after,
        };
        match self
            .executor
            .execute_with_config(&CommandConfig::without_retry(), &command)
        {
            Ok(acquired) => {
                if acquired {
                    tracing::debug!("Lock {} acquired by {}", self.name, self.owner);
                    self.held.store(true, Ordering::SeqCst);
                }
                Ok(acquired)
            }
            Err(e) if e.is_optimistic_locking() => {
                tracing::debug!("Lost the race for lock {}: {}", self.name, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the lock is ours or `timeout` passed
    pub fn wait_for_lock(&self, timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire_lock()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let holder = self.lock_value()?;
                tracing::warn!(
                    "Gave up waiting for lock {} after {:?}, held by {:?}",
                    self.name,
                    timeout,
                    holder
                );
                return Err(EngineError::LockUnavailable {
                    name: self.name.clone(),
                    holder,
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Release if this manager holds the lock; otherwise a no-op
    pub fn release_lock(&self) -> EngineResult<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            tracing::debug!("Lock {} not held by this manager, nothing to release", self.name);
            return Ok(());
        }
        let released = self.executor.execute_with_config(
            &CommandConfig::without_retry(),
            &ReleaseLockCmd {
                name: self.name.clone(),
                owner: Some(self.owner.clone()),
            },
        )?;
        if released {
            tracing::debug!("Lock {} released by {}", self.name, self.owner);
        } else {
            tracing::warn!("Lock {} was no longer held by {}", self.name, self.owner);
        }
        Ok(())
    }

    /// Clear the lock whoever holds it
    pub fn force_release(&self) -> EngineResult<bool> {
        let released = self.executor.execute(&ReleaseLockCmd {
            name: self.name.clone(),
            owner: None,
        })?;
        self.held.store(false, Ordering::SeqCst);
        if released {
            tracing::warn!("Lock {} force-released by {}", self.name, self.owner);
        }
        Ok(released)
    }

    /// Current holder, if any
    pub fn lock_value(&self) -> EngineResult<Option<String>> {
        let lock = self.executor.execute(&GetLockValueCmd {
            name: self.name.clone(),
        })?;
        Ok(lock.and_then(|lock| lock.value))
    }

    /// Wait for the lock and hold it until the guard drops
    pub fn lock(&self, timeout: Duration) -> EngineResult<LockGuard<'_>> {
        self.wait_for_lock(timeout)?;
        Ok(LockGuard { manager: self })
    }

    /// Run `f` while holding the lock. The lock is released afterwards, also
    /// when `f` fails or panics.
    pub fn wait_for_lock_run_and_release<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.lock(timeout)?;
        f()
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_lock() {
            tracing::error!("Failed to release lock {}: {}", self.manager.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use agenda_core::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const DEPLOYMENTS: &str = "appDeploymentsLock";

    fn manager(engine: &ProcessEngine, owner: &str) -> LockManager {
        LockManager::new(Arc::clone(engine.command_executor()), DEPLOYMENTS, owner)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_second_owner_waits_until_release() {
        let engine = ProcessEngine::builder().build();
        let node1 = manager(&engine, "node-1");
        let node2 = manager(&engine, "node-2");

        assert!(node1.acquire_lock().unwrap());
        assert!(node1.acquire_lock().unwrap());
        assert!(!node2.acquire_lock().unwrap());

        let err = node2.wait_for_lock(Duration::from_millis(30)).unwrap_err();
        match err {
            EngineError::LockUnavailable { name, holder } => {
                assert_eq!(name, DEPLOYMENTS);
                assert_eq!(holder.as_deref(), Some("node-1"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Not the holder: nothing happens
        node2.release_lock().unwrap();
        assert_eq!(node1.lock_value().unwrap().as_deref(), Some("node-1"));

        node1.release_lock().unwrap();
        assert!(node2.acquire_lock().unwrap());
        assert_eq!(node1.lock_value().unwrap().as_deref(), Some("node-2"));
    }

    #[test]
    fn test_managers_sharing_an_owner_id_exclude_each_other() {
        let engine = ProcessEngine::builder().build();
        let first = engine.lock_manager(DEPLOYMENTS);
        let second = engine.lock_manager(DEPLOYMENTS);
        assert_eq!(first.owner(), second.owner());

        assert!(first.acquire_lock().unwrap());
        assert!(!second.acquire_lock().unwrap());
        assert!(!second.is_held());

        // The refused manager must not clear the row
        second.release_lock().unwrap();
        assert!(first.is_held());
        assert_eq!(
            first.lock_value().unwrap().as_deref(),
            Some(engine.node_id())
        );

        first.release_lock().unwrap();
        assert!(second.acquire_lock().unwrap());
    }

    #[test]
    fn test_waiter_gets_lock_once_holder_releases() {
        let engine = ProcessEngine::builder().build();
        let node1 = manager(&engine, "node-1");
        assert!(node1.acquire_lock().unwrap());

        let executor = Arc::clone(engine.command_executor());
        let waiter = thread::spawn(move || {
            let node2 = LockManager::new(executor, DEPLOYMENTS, "node-2")
                .with_poll_interval(Duration::from_millis(5));
            let started = Instant::now();
            node2.wait_for_lock(Duration::from_secs(5))?;
            Ok::<_, EngineError>((started.elapsed(), node2.lock_value()?))
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        node1.release_lock().unwrap();

        let (waited, holder) = waiter.join().unwrap().unwrap();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(5));
        assert_eq!(holder.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_run_and_release_releases_on_error() {
        let engine = ProcessEngine::builder().build();
        let node1 = manager(&engine, "node-1");

        let result: EngineResult<()> = node1
            .wait_for_lock_run_and_release(Duration::from_millis(50), || {
                Err(EngineError::Validation("deployment rejected".into()))
            });
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(!node1.is_held());
        assert_eq!(node1.lock_value().unwrap(), None);
    }

    #[test]
    fn test_only_one_of_many_contenders_holds_the_lock() {
        let engine = ProcessEngine::builder().build();
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let executor = Arc::clone(engine.command_executor());
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let node = LockManager::new(executor, DEPLOYMENTS, format!("node-{i}"));
                    if node.acquire_lock().unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_lock_is_taken_over() {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder().with_clock(clock.clone()).build();
        let node1 = manager(&engine, "node-1");
        let node2 =
            manager(&engine, "node-2").with_force_acquire_after(Some(Duration::from_secs(60)));

        assert!(node1.acquire_lock().unwrap());
        assert!(!node2.acquire_lock().unwrap());

        clock.advance(chrono::Duration::seconds(61));
        assert!(node2.acquire_lock().unwrap());
        assert_eq!(node2.lock_value().unwrap().as_deref(), Some("node-2"));
    }

    #[test]
    fn test_force_release_ignores_owner() {
        let engine = ProcessEngine::builder().build();
        let node1 = manager(&engine, "node-1");
        let admin = manager(&engine, "admin");

        node1.acquire_lock().unwrap();
        assert!(admin.force_release().unwrap());
        assert_eq!(admin.lock_value().unwrap(), None);
        assert!(!admin.force_release().unwrap());
    }
}
