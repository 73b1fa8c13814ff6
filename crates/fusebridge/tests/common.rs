//! Shared fixtures for the bridge integration tests.
//!
//! Every test runs inside a `LocalSet` so the dispatcher and the handlers
//! share the test's thread. Simulated kernel calls block, so they go
//! through [`blocking`].

#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use fusebridge::{Bridge, BridgeConfig, SimKernel};
use tokio::task::LocalSet;

pub async fn local<F: Future>(f: F) -> F::Output {
    LocalSet::new().run_until(f).await
}

/// Creates a bridge over a fresh simulated kernel and starts its dispatcher.
/// Must be called inside [`local`].
pub fn setup(config: BridgeConfig) -> (Bridge, SimKernel) {
    let kernel = SimKernel::new();
    let (bridge, dispatcher) = Bridge::new(kernel.clone(), config).expect("valid config");
    tokio::task::spawn_local(dispatcher.run());
    (bridge, kernel)
}

/// Runs a blocking kernel call off the dispatcher's thread.
pub async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("blocking call panicked")
}

/// Polls `cond` until it holds, for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Event log shared between a test and its handlers.
#[derive(Clone, Default)]
pub struct Events(Rc<RefCell<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.borrow_mut().push(event.into());
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.borrow().iter().any(|e| e == event)
    }

    pub fn all(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}
