//! # Services
//!
//! A service is one named, long-running part of an event loop. Services are
//! started in order and stopped in reverse.

use std::any::Any;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::task::JoinHandle;

#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique within one event loop.
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    /// Stops the service. A no-op when it is not running.
    async fn stop(&self);

    fn running(&self) -> bool;

    /// For downcasting to the concrete service type.
    fn as_any(&self) -> &dyn Any;
}

/// Holds the background task of a service, aborting it on replacement or stop.
#[derive(Default)]
pub struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn set(&self, handle: JoinHandle<()>) {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Aborts the task. Returns whether there was one.
    pub fn abort(&self) -> bool {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forgets the task without aborting it.
    pub fn detach(&self) {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
