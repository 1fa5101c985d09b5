//! I/O thread group
//!
//! Owns the worker threads that drive every socket. Servers, clients and
//! receivers are handed a `Handle` onto this group and post their tasks there.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Thread lifecycle errors
#[derive(Error, Debug)]
pub enum ThreadLifecycleError {
    #[error("Thread group is already running")]
    AlreadyRunning,

    #[error("Thread group is not running")]
    NotRunning,

    #[error("Thread group cannot be stopped from inside an async runtime")]
    InsideRuntime,

    #[error("Failed to start worker threads: {0}")]
    Runtime(#[from] std::io::Error),
}

pub type ThreadLifecycleResult<T> = Result<T, ThreadLifecycleError>;

/// How long `stop` waits for in-flight tasks before abandoning them
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A fixed pool of worker threads running the async event loop
pub struct IoThreadGroup {
    runtime: Mutex<Option<Runtime>>,
}

impl IoThreadGroup {
    /// Create a stopped group
    pub fn new() -> Self {
        Self {
            runtime: Mutex::new(None),
        }
    }

    /// Create a group and start `threads` workers
    pub fn with_threads(threads: usize) -> ThreadLifecycleResult<Self> {
        let group = Self::new();
        group.start(threads)?;
        Ok(group)
    }

    /// Spin up `threads` workers (at least one)
    pub fn start(&self, threads: usize) -> ThreadLifecycleResult<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(ThreadLifecycleError::AlreadyRunning);
        }

        let threads = threads.max(1);
        *runtime = Some(
            Builder::new_multi_thread()
                .worker_threads(threads)
                .thread_name("io-worker")
                .enable_all()
                .build()?,
        );

        tracing::info!("I/O thread group started with {} workers", threads);
        Ok(())
    }

    /// Cancel outstanding tasks and join the workers
    ///
    /// Once this returns no handler runs on this group again. Joining blocks,
    /// so calling this from async code fails with `InsideRuntime`.
    pub fn stop(&self) -> ThreadLifecycleResult<()> {
        if Handle::try_current().is_ok() {
            return Err(ThreadLifecycleError::InsideRuntime);
        }

        let runtime = self
            .runtime
            .lock()
            .take()
            .ok_or(ThreadLifecycleError::NotRunning)?;
        runtime.shutdown_timeout(STOP_TIMEOUT);

        tracing::info!("I/O thread group stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Handle for posting work onto the group
    pub fn handle(&self) -> ThreadLifecycleResult<Handle> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or(ThreadLifecycleError::NotRunning)
    }

    pub fn spawn<F>(&self, future: F) -> ThreadLifecycleResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.handle()?.spawn(future))
    }

    /// Run a future to completion from a thread outside the group
    pub fn block_on<F: Future>(&self, future: F) -> ThreadLifecycleResult<F::Output> {
        Ok(self.handle()?.block_on(future))
    }
}

impl Default for IoThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IoThreadGroup {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.get_mut().take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // Dropped from async code: workers wind down without being joined
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(STOP_TIMEOUT);
        }
    }
}
