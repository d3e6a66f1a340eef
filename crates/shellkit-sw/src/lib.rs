//! # ShellKit Service Worker
//!
//! Client-side request interceptor for an installable single-page app that
//! is reachable through more than one origin (a stable public origin and a
//! transient tunnel). Every outgoing request is classified and answered
//! from a versioned cache, from the network, or by loading the canonical
//! shell URL instead.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache one generation), activate (sweep the
//!   others, claim clients)
//! - **Cache Store**: named generations, in memory or backed by a directory
//! - **Routing**: redirect navigations, network-only API, cache-first assets
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker ── dispatch(WorkerEvent)
//!     │
//!     ├── Lifecycle ── install / activate ──┐
//!     │       └── watch::Sender<current>    │
//!     │                                     ▼
//!     ├── Router ── watch::Receiver ──► CacheStorage
//!     │       └── Fetcher (network)         └── CacheHandle ("v1", "v2", …)
//!     └── Clients
//! ```
//!
//! Only activation moves the current-generation pointer. The router takes
//! one snapshot of it per request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shellkit_net::{Fetcher, NetError, Request};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use url::Url;

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod router;

pub use cache::{CacheEntry, CacheHandle, CacheStorage, RequestKey};
pub use config::{ConfigError, InstallPolicy, ResolvedConfig, WorkerConfig};
pub use lifecycle::{
    ActivationReport, Client, Clients, InstallReport, Lifecycle, ServiceWorkerState,
};
pub use router::{classify, FetchDisposition, Router, Rule, Strategy};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache of {url} failed: {source}")]
    PrecacheFailed {
        url: Url,
        #[source]
        source: NetError,
    },

    #[error("Precache of {url} returned status {status}")]
    PrecacheStatus { url: Url, status: u16 },

    #[error("Navigation to {url} failed and no cached copy exists: {source}")]
    NavigationFailed {
        url: Url,
        #[source]
        source: NetError,
    },

    #[error("Network request to {url} failed: {source}")]
    Network {
        url: Url,
        #[source]
        source: NetError,
    },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {message}: {source}")]
    Storage {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ==================== Types ====================

/// Unique identifier for a service worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Notifications for the host.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A stale generation was removed during activation.
    GenerationDeleted { name: String },
    /// A client is now controlled by this worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Events the host delivers to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
}

/// Completion value for each [`WorkerEvent`].
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Fetch(FetchDisposition),
}

// ==================== Service Worker ====================

/// One worker instance: configuration, lifecycle and router bound together.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: Arc<ResolvedConfig>,
    lifecycle: Lifecycle,
    router: Router,
}

impl ServiceWorker {
    /// Create a worker over `storage`, reaching the network through `fetcher`.
    pub fn new(
        config: ResolvedConfig,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let id = ServiceWorkerId::new();
        let config = Arc::new(config);

        let lifecycle = Lifecycle::new(
            id,
            Arc::clone(&config),
            storage,
            Arc::clone(&fetcher),
            event_tx,
        );
        let router = Router::new(Arc::clone(&config), fetcher, lifecycle.subscribe());

        info!(
            worker = id.raw(),
            version = %config.cache_version,
            canonical_url = %config.canonical_url,
            "Service worker created"
        );

        (
            Self {
                id,
                config,
                lifecycle,
                router,
            },
            event_rx,
        )
    }

    /// Share the host's client registry instead of a private one.
    pub fn with_clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.lifecycle.set_clients(clients);
        self
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.lifecycle.clients()
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.state().await
    }

    /// Label of the generation currently served, once activated.
    pub fn current_generation(&self) -> Option<String> {
        self.lifecycle.current_generation()
    }

    /// Handle one host event. Every fetch event yields exactly one
    /// disposition or an error for that request's caller.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => self.handle_fetch(&request).await.map(EventOutcome::Fetch),
        }
    }

    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.lifecycle.activate().await
    }

    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchDisposition, ServiceWorkerError> {
        self.router.handle(request).await
    }

    /// Install, then activate immediately (the worker always skips waiting).
    pub async fn start(&self) -> Result<(InstallReport, ActivationReport), ServiceWorkerError> {
        let installed = self.install().await?;
        let activated = self.activate().await?;
        Ok((installed, activated))
    }
}
