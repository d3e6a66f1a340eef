//! Lifecycle Manager: install (precache one generation) and activate
//! (sweep stale generations, publish the current one, claim clients).

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shellkit_common::{retry_with_backoff, RetryConfig};
use shellkit_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheHandle, CacheStorage, RequestKey};
use crate::config::{InstallPolicy, ResolvedConfig};
use crate::{ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId};

// ==================== State ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Constructed, nothing run yet.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Precache complete; may be activated.
    Installed,
    /// Sweeping stale generations.
    Activating,
    /// Serving from its generation and controlling clients.
    Activated,
    /// First install failed under the strict policy.
    Redundant,
}

/// Result of a completed install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub version: String,
    /// Assets stored, in precache order.
    pub cached: Vec<Url>,
    /// Assets skipped under the best-effort policy, with the reason.
    pub skipped: Vec<(Url, String)>,
    /// Always set: the worker asks to be activated right away.
    pub skip_waiting: bool,
}

/// Result of a completed activation.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub version: String,
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Stale generations that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Clients newly taken under control.
    pub claimed: Vec<String>,
}

// ==================== Clients ====================

/// An open window of the origin.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            controller: None,
        }
    }
}

/// Open clients of the origin.
#[derive(Debug, Default)]
pub struct Clients {
    clients: hashbrown::HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients controlled by `worker`, plus uncontrolled ones if asked.
    pub fn match_all(&self, worker: ServiceWorkerId, include_uncontrolled: bool) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| c.controller == Some(worker) || (include_uncontrolled && c.controller.is_none()))
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Take control of every client. Returns the ids whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}

// ==================== Lifecycle ====================

/// Drives install and activate for one worker instance.
pub struct Lifecycle {
    worker_id: ServiceWorkerId,
    config: Arc<ResolvedConfig>,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    /// Held across a whole install or activate so they never interleave.
    state: Mutex<ServiceWorkerState>,
    /// Single writer of the current-generation pointer.
    current: watch::Sender<Option<CacheHandle>>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Lifecycle {
    pub(crate) fn new(
        worker_id: ServiceWorkerId,
        config: Arc<ResolvedConfig>,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            worker_id,
            config,
            storage,
            fetcher,
            state: Mutex::new(ServiceWorkerState::Parsed),
            current,
            clients: Arc::new(RwLock::new(Clients::new())),
            event_tx,
        }
    }

    pub(crate) fn set_clients(&mut self, clients: Arc<RwLock<Clients>>) {
        self.clients = clients;
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    /// A reader of the current-generation pointer.
    pub fn subscribe(&self) -> watch::Receiver<Option<CacheHandle>> {
        self.current.subscribe()
    }

    /// Label of the generation currently served, if activated.
    pub fn current_generation(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|h| h.name().to_string())
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.lock().await
    }

    fn transition(&self, state: &mut ServiceWorkerState, next: ServiceWorkerState) {
        debug!(worker = ?self.worker_id, from = ?*state, to = ?next, "State change");
        *state = next;
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: self.worker_id,
            new_state: next,
        });
    }

    /// Populate the configured generation with the precache list.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let mut state = self.state.lock().await;
        let version = self.config.cache_version.clone();
        let before = *state;

        info!(
            version = %version,
            assets = self.config.precache.len(),
            policy = ?self.config.install_policy,
            "Installing"
        );
        self.transition(&mut state, ServiceWorkerState::Installing);

        let existed = self.storage.has(&version).await;
        let cache = match self.storage.open(&version).await {
            Ok(cache) => cache,
            Err(e) => {
                error!(version = %version, error = %e, "Cannot open generation");
                self.transition(&mut state, ServiceWorkerState::Redundant);
                return Err(e);
            }
        };

        let retry = RetryConfig::attempts(self.config.precache_attempts);
        let fetches = self
            .config
            .precache
            .iter()
            .map(|url| self.fetch_asset(url, &retry));
        let results: Vec<(Url, Result<Response, ServiceWorkerError>)> = self
            .config
            .precache
            .iter()
            .cloned()
            .zip(join_all(fetches).await)
            .collect();

        let strict = self.config.install_policy == InstallPolicy::Strict;
        let mut fetched = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();

        for (url, result) in results {
            match result {
                Ok(response) => fetched.push((url, response)),
                Err(e) if strict => {
                    error!(version = %version, url = %url, error = %e, "Precache failed, aborting install");
                    self.abort_install(&mut state, before, &version, existed).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(version = %version, url = %url, error = %e, "Precache failed, skipping asset");
                    skipped.push((url, e.to_string()));
                }
            }
        }

        let mut cached = Vec::with_capacity(fetched.len());
        for (url, response) in fetched {
            if let Err(e) = cache.put(RequestKey::get(&url), &response).await {
                if strict {
                    error!(version = %version, url = %url, error = %e, "Cache write failed, aborting install");
                    self.abort_install(&mut state, before, &version, existed).await;
                    return Err(e);
                }
                warn!(version = %version, url = %url, error = %e, "Cache write failed, skipping asset");
                skipped.push((url, e.to_string()));
                continue;
            }
            cached.push(url);
        }

        self.transition(&mut state, ServiceWorkerState::Installed);
        info!(
            version = %version,
            cached = cached.len(),
            skipped = skipped.len(),
            "Install complete, skipping wait"
        );

        Ok(InstallReport {
            version,
            cached,
            skipped,
            skip_waiting: true,
        })
    }

    async fn fetch_asset(&self, url: &Url, retry: &RetryConfig) -> Result<Response, ServiceWorkerError> {
        retry_with_backoff(retry, || async {
            let request = Request::get(url.clone());
            let response = self
                .fetcher
                .fetch(&request)
                .await
                .map_err(|source| ServiceWorkerError::PrecacheFailed {
                    url: url.clone(),
                    source,
                })?;
            if !response.ok() {
                return Err(ServiceWorkerError::PrecacheStatus {
                    url: url.clone(),
                    status: response.status.as_u16(),
                });
            }
            Ok(response)
        })
        .await
    }

    /// Undo a strict install. A generation this install created is dropped
    /// and the worker becomes redundant. A failed re-install by a worker
    /// that already installed keeps its generation and its previous state,
    /// so it goes on serving and can still be activated.
    async fn abort_install(
        &self,
        state: &mut ServiceWorkerState,
        before: ServiceWorkerState,
        version: &str,
        existed: bool,
    ) {
        if !existed {
            if let Err(e) = self.storage.delete(version).await {
                warn!(version = %version, error = %e, "Could not discard partial generation");
            }
        }

        match before {
            ServiceWorkerState::Installed | ServiceWorkerState::Activated if existed => {
                warn!(version = %version, state = ?before, "Re-install failed, keeping previous state");
                self.transition(state, before);
            }
            _ => self.transition(state, ServiceWorkerState::Redundant),
        }
    }

    /// Delete every other generation, publish ours as current, claim clients.
    ///
    /// A rejected activation leaves the state, the current pointer and all
    /// generations untouched, so calling it again retries.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let mut state = self.state.lock().await;
        let version = self.config.cache_version.clone();

        match *state {
            ServiceWorkerState::Installed | ServiceWorkerState::Activated => {}
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "cannot activate from {other:?}"
                )));
            }
        }

        if !self.storage.has(&version).await {
            return Err(ServiceWorkerError::NotFound(format!(
                "generation '{version}' is missing"
            )));
        }
        let handle = self.storage.open(&version).await?;

        let previous = *state;
        self.transition(&mut state, ServiceWorkerState::Activating);
        info!(version = %version, "Activating");

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for name in self.storage.keys().await {
            if name == version {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(true) => {
                    info!(cache = %name, "Deleted stale generation");
                    let _ = self
                        .event_tx
                        .send(ServiceWorkerEvent::GenerationDeleted { name: name.clone() });
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %name, error = %e, "Could not delete stale generation");
                    failed.push((name, e.to_string()));
                }
            }
        }

        self.current.send_replace(Some(handle));
        self.transition(&mut state, ServiceWorkerState::Activated);

        let claimed = self.clients.write().await.claim(self.worker_id);
        for client_id in &claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.worker_id,
            });
        }

        info!(
            version = %version,
            was = ?previous,
            deleted = deleted.len(),
            failed = failed.len(),
            claimed = claimed.len(),
            "Activation complete"
        );

        Ok(ActivationReport {
            version,
            deleted,
            failed,
            claimed,
        })
    }
}
