//! Lazily constructed, process-wide shared resources
//!
//! A [`SharedResource`] holds at most one instance of `T`. The first caller of
//! [`SharedResource::get_or_create`] runs the async factory; callers that
//! arrive while it runs wait on the same construction and receive the same
//! `Arc`. Once built, lookups take a lock-free path. A failed construction is
//! remembered and reported to every later caller without running the factory
//! again.

use once_cell::sync::OnceCell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Observable construction state of a [`SharedResource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Failed = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Ready,
            3 => LifecycleState::Failed,
            _ => LifecycleState::Uninitialized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Failed to construct {resource}: {message}")]
    Failed {
        resource: &'static str,
        message: String,
    },
}

pub struct SharedResource<T: ?Sized> {
    name: &'static str,
    instance: OnceCell<Arc<T>>,
    failure: OnceCell<String>,
    state: AtomicU8,
    init_guard: Mutex<()>,
}

impl<T: ?Sized> SharedResource<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            instance: OnceCell::new(),
            failure: OnceCell::new(),
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            init_guard: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The instance, if construction already succeeded
    pub fn get(&self) -> Option<Arc<T>> {
        self.instance.get().cloned()
    }

    /// Return the shared instance, constructing it with `factory` on first use
    ///
    /// `factory` runs at most once across all callers. If it fails, this and
    /// every later call return [`LifecycleError::Failed`].
    pub async fn get_or_create<F, Fut, E>(&self, factory: F) -> Result<Arc<T>, LifecycleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, E>>,
        E: fmt::Display,
    {
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        let _guard = self.init_guard.lock().await;

        // Another caller may have finished while we waited for the guard
        if let Some(outcome) = self.settled() {
            debug!(resource = self.name, "Shared resource built by concurrent caller");
            return outcome;
        }

        self.set_state(LifecycleState::Initializing);
        info!(resource = self.name, "Constructing shared resource");

        match factory().await {
            Ok(instance) => {
                // The guard is held, so the cell is still empty here
                let _ = self.instance.set(Arc::clone(&instance));
                self.set_state(LifecycleState::Ready);
                info!(resource = self.name, "Shared resource ready");
                Ok(instance)
            }
            Err(e) => {
                let message = e.to_string();
                error!(resource = self.name, error = %message, "Shared resource construction failed");
                let _ = self.failure.set(message.clone());
                self.set_state(LifecycleState::Failed);
                Err(LifecycleError::Failed {
                    resource: self.name,
                    message,
                })
            }
        }
    }

    fn settled(&self) -> Option<Result<Arc<T>, LifecycleError>> {
        if let Some(instance) = self.instance.get() {
            return Some(Ok(Arc::clone(instance)));
        }
        self.failure.get().map(|message| {
            Err(LifecycleError::Failed {
                resource: self.name,
                message: message.clone(),
            })
        })
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl<T: ?Sized> fmt::Debug for SharedResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResource")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
