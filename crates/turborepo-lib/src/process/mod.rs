//! Child process management.
//!
//! Every task command runs under the manager so that a single global
//! shutdown can take down everything: graceful signal first, then a hard
//! kill after the deadline. Children get their own process group so the
//! signal reaches grandchildren too.

mod child;

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, Command};
use futures::future::join_all;
use tracing::debug;

struct ProcessManagerState {
    children: Vec<Child>,
    is_closing: bool,
}

#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerState>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager {
            state: Arc::new(Mutex::new(ProcessManagerState {
                children: Vec::new(),
                is_closing: false,
            })),
        }
    }

    /// Spawns a child. Returns `None` once the manager is shutting down:
    /// no new work starts during a close.
    pub fn spawn(
        &self,
        command: Command,
        stop_timeout: Duration,
    ) -> Option<Result<Child, io::Error>> {
        let mut state = self.state.lock().expect("process manager mutex poisoned");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, stop_timeout);
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Graceful-then-forceful shutdown of every running child.
    pub async fn stop(&self) {
        self.close(|child| async move { child.stop().await }).await
    }

    /// Immediate kill of every running child.
    pub async fn kill(&self) {
        self.close(|child| async move { child.kill().await }).await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C,
        C: std::future::Future<Output = Option<ChildExit>>,
    {
        let children = {
            let mut state = self.state.lock().expect("process manager mutex poisoned");
            state.is_closing = true;
            state.children.clone()
        };

        let callback = &callback;
        let shutdowns = children.into_iter().map(|child| async move {
            let exit = callback(child).await;
            debug!("child shut down with {exit:?}");
        });
        join_all(shutdowns).await;

        let mut state = self.state.lock().expect("process manager mutex poisoned");
        state.children.clear();
    }

    /// Whether the manager has begun shutting down.
    pub fn is_closing(&self) -> bool {
        self.state
            .lock()
            .expect("process manager mutex poisoned")
            .is_closing
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
