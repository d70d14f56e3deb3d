//! Middleware chain run on every inbound envelope before command resolution.
//!
//! Entries run sequentially in descending priority against the same
//! `&mut Envelope`, so later middleware sees mutations made by earlier ones.
//! Ties keep registration order. A middleware that fails or panics is
//! reported and skipped; the rest of the chain still runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use hpx_bot::middleware::{DispatchPipeline, MiddlewareConfig, middleware_fn};
//!
//! let pipeline = DispatchPipeline::new();
//! pipeline.use_middleware(
//!     middleware_fn(|envelope| {
//!         tracing::debug!(kind = %envelope.kind, "Inbound envelope");
//!         Ok(())
//!     }),
//!     MiddlewareConfig::new().name("logging").priority(10),
//! )?;
//! ```

use std::{
    cmp::Reverse,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::{envelope::Envelope, error::MiddlewareError};

/// A cross-cutting handler run on each inbound envelope.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Inspect or mutate the envelope.
    async fn handle(&self, envelope: &mut Envelope) -> Result<(), MiddlewareError>;
}

/// A closure-based middleware for convenience.
pub struct FnMiddleware<F>
where
    F: Fn(&mut Envelope) -> Result<(), MiddlewareError> + Send + Sync + 'static,
{
    f: F,
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Envelope) -> Result<(), MiddlewareError> + Send + Sync + 'static,
{
    async fn handle(&self, envelope: &mut Envelope) -> Result<(), MiddlewareError> {
        (self.f)(envelope)
    }
}

/// Wrap a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut Envelope) -> Result<(), MiddlewareError> + Send + Sync + 'static,
{
    FnMiddleware { f }
}

/// Registration options for a middleware.
#[derive(Clone, Debug)]
pub struct MiddlewareConfig {
    /// Unique name. Generated as `middleware-N` when omitted.
    pub name: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    /// Disabled entries are skipped by `execute`.
    pub enabled: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            name: None,
            priority: 0,
            enabled: true,
        }
    }
}

impl MiddlewareConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set whether the entry starts enabled.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Clone)]
struct MiddlewareEntry {
    name: String,
    middleware: Arc<dyn Middleware>,
    priority: i32,
    enabled: bool,
}

/// Public view of a registered middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiddlewareInfo {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
}

/// A middleware that failed during [`DispatchPipeline::execute`].
#[derive(Debug)]
pub struct MiddlewareFailure {
    pub name: String,
    pub error: MiddlewareError,
}

/// Outcome of one pipeline run.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Names of the middleware that ran, in execution order.
    pub ran: Vec<String>,
    /// Middleware that failed or panicked.
    pub failures: Vec<MiddlewareFailure>,
}

impl ExecutionReport {
    /// Whether every middleware succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered, fault-isolated middleware chain.
#[derive(Default)]
pub struct DispatchPipeline {
    entries: RwLock<Vec<MiddlewareEntry>>,
    generated: AtomicU64,
}

impl fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("middleware", &self.list())
            .finish()
    }
}

impl DispatchPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware and return its name.
    ///
    /// Fails with [`MiddlewareError::Duplicate`] if the name is taken.
    pub fn use_middleware<M: Middleware>(
        &self,
        middleware: M,
        config: MiddlewareConfig,
    ) -> Result<String, MiddlewareError> {
        self.use_arc(Arc::new(middleware), config)
    }

    /// Register an already shared middleware.
    pub fn use_arc(
        &self,
        middleware: Arc<dyn Middleware>,
        config: MiddlewareConfig,
    ) -> Result<String, MiddlewareError> {
        let mut entries = self.entries.write();
        let name = match config.name {
            Some(name) => {
                if entries.iter().any(|e| e.name == name) {
                    return Err(MiddlewareError::Duplicate { name });
                }
                name
            }
            None => loop {
                let n = self.generated.fetch_add(1, Ordering::Relaxed) + 1;
                let candidate = format!("middleware-{n}");
                if !entries.iter().any(|e| e.name == candidate) {
                    break candidate;
                }
            },
        };

        entries.push(MiddlewareEntry {
            name: name.clone(),
            middleware,
            priority: config.priority,
            enabled: config.enabled,
        });
        Ok(name)
    }

    /// Remove a middleware. Returns `true` if it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    /// Enable or disable a middleware. Returns `true` if it was registered.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.write().iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Registered middleware in registration order.
    pub fn list(&self) -> Vec<MiddlewareInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| MiddlewareInfo {
                name: e.name.clone(),
                priority: e.priority,
                enabled: e.enabled,
            })
            .collect()
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run every enabled middleware against `envelope`.
    pub async fn execute(&self, envelope: &mut Envelope) -> ExecutionReport {
        let mut chain: Vec<MiddlewareEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        // Stable: equal priorities keep registration order.
        chain.sort_by_key(|e| Reverse(e.priority));

        let mut report = ExecutionReport::default();
        for entry in chain {
            trace!(middleware = %entry.name, "Running middleware");
            let outcome = AssertUnwindSafe(entry.middleware.handle(envelope))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_) => Some(MiddlewareError::Panicked {
                    name: entry.name.clone(),
                }),
            };
            if let Some(error) = error {
                warn!(middleware = %entry.name, error = %error, "Middleware failed");
                report.failures.push(MiddlewareFailure {
                    name: entry.name.clone(),
                    error,
                });
            }
            report.ran.push(entry.name);
        }
        report
    }
}
