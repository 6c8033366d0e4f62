//! Background pool lifecycle
//!
//! `Pool::start` moves the pool's run loops onto a task; `PoolHandle`
//! signals shutdown and gives in-flight handlers a bounded window to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pool::Pool;

pub struct PoolHandle {
    pool: Arc<Pool>,
    task: JoinHandle<()>,
}

impl Pool {
    /// Run `work()` in the background.
    pub fn start(self: Arc<Self>) -> PoolHandle {
        let pool = self.clone();
        let task = tokio::spawn(async move { pool.work().await });
        PoolHandle { pool: self, task }
    }
}

impl PoolHandle {
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait up to `timeout` for the workers to exit.
    ///
    /// Returns `false` if workers were still busy when the timeout elapsed,
    /// in which case they are aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.pool.shutdown();

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {
                info!("All queue workers finished");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Pool task ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for queue workers, aborting"
                );
                task.abort();
                false
            }
        }
    }
}
