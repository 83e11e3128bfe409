use std::{sync::Arc, future::Future};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_context::task::TaskController;

/// Spawns tasks that can all be cancelled together. A cancelled controller
/// starts over with a fresh inner controller and can be reused.
pub struct Controller {
    inner: Arc<RwLock<TaskController>>
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TaskController::new()))
        }
    }

    pub async fn cancel(&mut self) {
        let mut target = self.inner.write().await;
        let ctrl = std::mem::replace(&mut *target, TaskController::new());
        ctrl.cancel();
    }

    pub async fn spawn<T>(&mut self, future:T) -> JoinHandle<Option<T::Output>>
    where
        T: Future + Send + 'static,
        T::Output: Send + 'static,
    {
        let mut controller_mut = self.inner.write().await;
        controller_mut.spawn(future)
    }
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}
