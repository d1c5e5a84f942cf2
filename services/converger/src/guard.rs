//! Per-path serialization and call timeouts.
//!
//! Two convergence calls for the same path must never interleave their
//! plans. [`ConvergeGuard`] holds one async lock per path for the whole
//! observe, execute and verify cycle. Distinct paths run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use vmlife_model::{DesiredState, MachinePath};

use crate::engine::{ConvergenceResult, Engine};
use crate::error::{ConvergeError, ErrorKind};

/// Errors from a guarded convergence call.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Converge(#[from] ConvergeError),

    /// The call was abandoned. A task already submitted may still finish on
    /// the backend; the next call observes whatever it left behind.
    #[error("{path}: convergence abandoned after {after:?}")]
    TimedOut { path: MachinePath, after: Duration },
}

impl GuardError {
    pub fn path(&self) -> &MachinePath {
        match self {
            GuardError::Converge(err) => err.path(),
            GuardError::TimedOut { path, .. } => path,
        }
    }

    /// Error class, `None` for a timeout.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GuardError::Converge(err) => Some(err.kind()),
            GuardError::TimedOut { .. } => None,
        }
    }
}

/// One async lock per machine path.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<MachinePath, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`.
    pub async fn lock(&self, path: &MachinePath) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop locks nobody holds or waits on.
            locks.retain(|p, l| p == path || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(path.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of paths currently tracked.
    pub async fn tracked_paths(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Engine wrapper that serializes calls per path.
#[derive(Clone)]
pub struct ConvergeGuard {
    engine: Arc<Engine>,
    locks: Arc<PathLocks>,
}

impl ConvergeGuard {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            locks: Arc::new(PathLocks::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Converge `desired` while holding the lock for its path.
    ///
    /// `timeout` bounds the whole call, including the wait for the lock.
    pub async fn converge(
        &self,
        desired: &DesiredState,
        timeout: Option<Duration>,
    ) -> Result<ConvergenceResult, GuardError> {
        let run = async {
            let _guard = self.locks.lock(&desired.path).await;
            debug!(path = %desired.path, "Acquired path lock");
            self.engine.converge(desired).await
        };

        match timeout {
            None => Ok(run.await?),
            Some(after) => match tokio::time::timeout(after, run).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    warn!(path = %desired.path, ?after, "Convergence timed out");
                    Err(GuardError::TimedOut {
                        path: desired.path.clone(),
                        after,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{Hypervisor, MockHypervisor};
    use vmlife_model::Ensure;
    use vmlife_reconcile::PlanPolicy;

    fn path(s: &str) -> MachinePath {
        MachinePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_same_path_is_serialized() {
        let locks = Arc::new(PathLocks::new());
        let web01 = path("/opdx1/vm/eng/web01");

        let held = locks.lock(&web01).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let web01 = web01.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&web01).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_paths_do_not_block() {
        let locks = PathLocks::new();
        let _a = locks.lock(&path("/opdx1/vm/eng/web01")).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(&path("/opdx1/vm/eng/web02")),
        )
        .await
        .expect("distinct path should not wait");
        assert_eq!(locks.tracked_paths().await, 2);
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = PathLocks::new();
        drop(locks.lock(&path("/opdx1/vm/eng/web01")).await);
        drop(locks.lock(&path("/opdx1/vm/eng/web02")).await);
        assert_eq!(locks.tracked_paths().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_path_converge_once() {
        let web01 = path("/opdx1/vm/eng/web01");
        let mock = Arc::new(MockHypervisor::new("ds1").with_running_machine(&web01));
        let hypervisor: Arc<dyn Hypervisor> = mock.clone();
        let guard = ConvergeGuard::new(Arc::new(Engine::new(
            hypervisor,
            "ds1",
            PlanPolicy::default(),
        )));
        let desired = DesiredState::new(web01, Ensure::Unregistered);

        let (a, b) = tokio::join!(
            guard.converge(&desired, None),
            guard.converge(&desired, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.changed ^ b.changed);
        assert_eq!(mock.task_log().await.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_while_waiting_for_lock() {
        let web01 = path("/opdx1/vm/eng/web01");
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(MockHypervisor::new("ds1"));
        let guard = ConvergeGuard::new(Arc::new(Engine::new(
            hypervisor,
            "ds1",
            PlanPolicy::default(),
        )));

        let _held = guard.locks.lock(&web01).await;
        let err = guard
            .converge(
                &DesiredState::new(web01.clone(), Ensure::Absent),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::TimedOut { .. }));
        assert_eq!(err.path(), &web01);
        assert_eq!(err.kind(), None);
    }
}
