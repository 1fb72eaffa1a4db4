//! Single-flight ownership of the one live sandbox host.

use super::{SandboxBooter, SandboxHost};
use crate::errors::AppResult;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

type BootFuture = Shared<BoxFuture<'static, AppResult<Arc<dyn SandboxHost>>>>;

enum SessionSlot {
    Empty,
    Booting { generation: u64, boot: BootFuture },
    Ready(Arc<dyn SandboxHost>),
}

/// Created once per process and shared by reference with every orchestrator.
/// Concurrent `get_session` calls collapse onto a single boot.
pub struct SessionManager {
    booter: Arc<dyn SandboxBooter>,
    slot: Mutex<SessionSlot>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(booter: Arc<dyn SandboxBooter>) -> Self {
        Self {
            booter,
            slot: Mutex::new(SessionSlot::Empty),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of boots started so far.
    pub fn boot_count(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.slot.lock().await, SessionSlot::Ready(_))
    }

    pub async fn get_session(&self) -> AppResult<Arc<dyn SandboxHost>> {
        let (generation, boot) = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                SessionSlot::Ready(host) => return Ok(host.clone()),
                SessionSlot::Booting { generation, boot } => {
                    tracing::debug!(generation, "joining in-flight sandbox boot");
                    (*generation, boot.clone())
                }
                SessionSlot::Empty => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let booter = self.booter.clone();
                    let boot = async move { booter.boot().await }.boxed().shared();
                    tracing::info!(generation, "booting sandbox");
                    *slot = SessionSlot::Booting {
                        generation,
                        boot: boot.clone(),
                    };
                    (generation, boot)
                }
            }
        };

        let result = boot.await;

        let mut slot = self.slot.lock().await;
        if matches!(&*slot, SessionSlot::Booting { generation: current, .. } if *current == generation) {
            *slot = match &result {
                Ok(host) => SessionSlot::Ready(host.clone()),
                Err(error) => {
                    tracing::warn!(generation, error = %error, "sandbox boot failed");
                    SessionSlot::Empty
                }
            };
        }
        result
    }

    /// Releases the current host, waiting out an in-flight boot first.
    /// Safe to call repeatedly; teardown errors are logged only.
    pub async fn teardown(&self) {
        let previous = {
            let mut slot = self.slot.lock().await;
            std::mem::replace(&mut *slot, SessionSlot::Empty)
        };

        let host = match previous {
            SessionSlot::Empty => return,
            SessionSlot::Ready(host) => host,
            SessionSlot::Booting { generation, boot } => match boot.await {
                Ok(host) => host,
                Err(error) => {
                    tracing::debug!(generation, error = %error, "nothing to tear down after failed boot");
                    return;
                }
            },
        };

        if let Err(error) = host.teardown().await {
            tracing::warn!(error = %error, "sandbox teardown failed");
        } else {
            tracing::info!("sandbox torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionManager;
    use crate::errors::{AppError, AppResult};
    use crate::files::FileSystemTree;
    use crate::sandbox::{SandboxBooter, SandboxHost, SandboxProcess};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    struct NullHost {
        teardowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SandboxHost for NullHost {
        async fn mount(&self, _tree: &FileSystemTree) -> AppResult<()> {
            Ok(())
        }

        async fn spawn(&self, command: &str, _args: &[String]) -> AppResult<SandboxProcess> {
            Err(AppError::Internal(format!("{} not scripted", command)))
        }

        async fn read_file(&self, path: &str) -> AppResult<String> {
            Err(AppError::Io(format!("{} missing", path)))
        }

        async fn write_file(&self, _path: &str, _contents: &str) -> AppResult<()> {
            Ok(())
        }

        async fn teardown(&self) -> AppResult<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Sandbox("already gone".to_string()))
        }
    }

    struct SlowBooter {
        boots: AtomicUsize,
        fail_first: bool,
        teardowns: Arc<AtomicUsize>,
    }

    impl SlowBooter {
        fn new(fail_first: bool) -> Self {
            Self {
                boots: AtomicUsize::new(0),
                fail_first,
                teardowns: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SandboxBooter for SlowBooter {
        async fn boot(&self) -> AppResult<Arc<dyn SandboxHost>> {
            let attempt = self.boots.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            if self.fail_first && attempt == 0 {
                return Err(AppError::OutOfMemory("Out of memory".to_string()));
            }
            Ok(Arc::new(NullHost {
                teardowns: self.teardowns.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_boot() {
        let booter = Arc::new(SlowBooter::new(false));
        let manager = SessionManager::new(booter.clone());

        let (first, second) = tokio::join!(manager.get_session(), manager.get_session());
        let first = first.expect("first session");
        let second = second.expect("second session");

        assert_eq!(booter.boots.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.is_ready().await);

        let third = manager.get_session().await.expect("cached session");
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(manager.boot_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_see_the_in_flight_failure_and_next_call_reboots() {
        let booter = Arc::new(SlowBooter::new(true));
        let manager = SessionManager::new(booter.clone());

        let (first, second) = tokio::join!(manager.get_session(), manager.get_session());
        assert!(matches!(first, Err(AppError::OutOfMemory(_))));
        assert!(matches!(second, Err(AppError::OutOfMemory(_))));
        assert!(!manager.is_ready().await);

        manager.get_session().await.expect("second boot succeeds");
        assert_eq!(booter.boots.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_is_idempotent_and_swallows_errors() {
        let booter = Arc::new(SlowBooter::new(false));
        let manager = SessionManager::new(booter.clone());

        manager.teardown().await;
        manager.get_session().await.expect("session");
        manager.teardown().await;
        manager.teardown().await;

        assert_eq!(booter.teardowns.load(Ordering::SeqCst), 1);
        assert!(!manager.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_during_boot_releases_the_booted_host() {
        let booter = Arc::new(SlowBooter::new(false));
        let manager = Arc::new(SessionManager::new(booter.clone()));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_session().await })
        };
        while manager.boot_count() == 0 {
            tokio::task::yield_now().await;
        }
        manager.teardown().await;

        assert!(waiter.await.expect("join").is_ok());
        assert_eq!(booter.teardowns.load(Ordering::SeqCst), 1);
        assert!(!manager.is_ready().await);
    }
}
