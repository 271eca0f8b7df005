//! Shared controller context

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::compiler::{ConfigRenderer, JsonConfigRenderer};
use crate::config::ControllerConfig;
use crate::store::{ObjectStore, TimeoutStore};

/// Controller context shared by every reconcile
///
/// Holds the object store (wrapped in a per-request deadline), the config
/// renderer and the tuning knobs. Use [`ContextBuilder`] to construct
/// instances:
///
/// ```ignore
/// let ctx = Context::builder(Arc::new(KubeStore::new(client)))
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Object store (trait object for testability)
    pub store: Arc<dyn ObjectStore>,
    /// Renders the configuration Secret
    pub renderer: Arc<dyn ConfigRenderer>,
    /// Tuning knobs
    pub config: ControllerConfig,
    /// Cancelled on shutdown; interrupts retry waits
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(store: Arc<dyn ObjectStore>) -> ContextBuilder {
        ContextBuilder::new(store)
    }

    /// Create a context for testing with default settings
    ///
    /// The store is used as-is, without the request deadline decorator.
    pub fn for_testing(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            renderer: Arc::new(JsonConfigRenderer),
            config: ControllerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Arc<dyn ObjectStore>,
    renderer: Option<Arc<dyn ConfigRenderer>>,
    config: ControllerConfig,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            renderer: None,
            config: ControllerConfig::default(),
            cancel: None,
        }
    }

    /// Set the tuning knobs
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the config renderer
    pub fn renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Use an externally owned cancellation token
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let store: Arc<dyn ObjectStore> = Arc::new(TimeoutStore::new(
            self.store,
            self.config.request_timeout(),
        ));

        Context {
            store,
            renderer: self
                .renderer
                .unwrap_or_else(|| Arc::new(JsonConfigRenderer)),
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}
