//! Request Router: classifies each intercepted request and executes the
//! chosen strategy.
//!
//! Classification order, first match wins:
//!
//! 1. navigation → [`Strategy::Redirect`] (load the canonical URL instead)
//! 2. path under the API prefix → [`Strategy::NetworkOnly`]
//! 3. same origin, or an exact precache entry → [`Strategy::CacheFirst`]
//! 4. anything else → [`Strategy::NetworkOnly`], handed back to the host

use std::sync::Arc;

use http::Method;
use shellkit_net::{Fetcher, Request, Response};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::cache::{CacheHandle, RequestKey};
use crate::config::ResolvedConfig;
use crate::ServiceWorkerError;

/// Request-handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Redirect,
    CacheFirst,
    NetworkOnly,
}

/// Which classification rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Navigation,
    ApiPrefix,
    SameOrigin,
    Precached,
    Unclassified,
}

impl Rule {
    pub fn strategy(self) -> Strategy {
        match self {
            Rule::Navigation => Strategy::Redirect,
            Rule::ApiPrefix | Rule::Unclassified => Strategy::NetworkOnly,
            Rule::SameOrigin | Rule::Precached => Strategy::CacheFirst,
        }
    }
}

/// Classify a request. Pure: depends only on the navigation flag, the
/// path and the origin of the request.
pub fn classify(config: &ResolvedConfig, request: &Request) -> Rule {
    if request.is_navigation() {
        Rule::Navigation
    } else if config.is_api_path(request.url.path()) {
        Rule::ApiPrefix
    } else if config.is_same_origin(&request.url) {
        Rule::SameOrigin
    } else if config.is_precached(&request.url) {
        Rule::Precached
    } else {
        Rule::Unclassified
    }
}

/// What the host should do with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Answer the request with this response.
    Respond(Response),
    /// Let the request continue to the network unmodified.
    Passthrough,
}

impl FetchDisposition {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDisposition::Respond(response) => Some(response),
            FetchDisposition::Passthrough => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchDisposition::Respond(response) => Some(response),
            FetchDisposition::Passthrough => None,
        }
    }
}

/// Stateless per-request dispatcher.
pub struct Router {
    config: Arc<ResolvedConfig>,
    fetcher: Arc<dyn Fetcher>,
    current: watch::Receiver<Option<CacheHandle>>,
}

impl Router {
    pub fn new(
        config: Arc<ResolvedConfig>,
        fetcher: Arc<dyn Fetcher>,
        current: watch::Receiver<Option<CacheHandle>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            current,
        }
    }

    /// Snapshot of the current generation, held for one request.
    fn snapshot(&self) -> Option<CacheHandle> {
        self.current.borrow().clone()
    }

    /// Handle one intercepted request.
    pub async fn handle(&self, request: &Request) -> Result<FetchDisposition, ServiceWorkerError> {
        let rule = classify(&self.config, request);
        debug!(
            url = %request.url,
            method = %request.method,
            rule = ?rule,
            strategy = ?rule.strategy(),
            "Routing request"
        );

        match rule {
            Rule::Navigation => self.redirect(request).await.map(FetchDisposition::Respond),
            Rule::ApiPrefix => self.network_only(request).await.map(FetchDisposition::Respond),
            Rule::SameOrigin | Rule::Precached => {
                self.cache_first(request).await.map(FetchDisposition::Respond)
            }
            Rule::Unclassified => Ok(FetchDisposition::Passthrough),
        }
    }

    /// Load the canonical URL live; on any rejection fall back to its
    /// cached copy in the current generation.
    async fn redirect(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let canonical = &self.config.canonical_url;
        debug!(requested = %request.url, canonical = %canonical, "Navigation redirected to canonical URL");

        let mut live = Request::get(canonical.clone());
        live.timeout = request.timeout;

        let source = match self.fetcher.fetch(&live).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        warn!(canonical = %canonical, error = %source, "Canonical fetch failed, trying cache");

        if let Some(cache) = self.snapshot() {
            if let Some(entry) = cache.match_request(&RequestKey::get(canonical)).await {
                trace!(cache = %cache.name(), "Serving canonical document from cache");
                return entry.to_response();
            }
        }

        error!(canonical = %canonical, "Navigation failed: no network and no cached shell");
        Err(ServiceWorkerError::NavigationFailed {
            url: canonical.clone(),
            source,
        })
    }

    /// Always live; never touches the cache.
    async fn network_only(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        self.fetcher
            .fetch(request)
            .await
            .map_err(|source| ServiceWorkerError::Network {
                url: request.url.clone(),
                source,
            })
    }

    /// Serve from the snapshotted generation; on a miss fetch live and,
    /// if configured, store successful GET responses for next time.
    async fn cache_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let cache = self.snapshot();
        let key = RequestKey::from_request(request);

        if let Some(ref cache) = cache {
            if let Some(entry) = cache.match_request(&key).await {
                trace!(cache = %cache.name(), url = %request.url, "Cache hit");
                return entry.to_response();
            }
        }

        trace!(url = %request.url, "Cache miss, fetching live");
        let response = self.network_only(request).await?;

        if self.config.cache_on_miss && request.method == Method::GET && response.ok() {
            if let Some(cache) = cache {
                if let Err(e) = cache.put(key, &response).await {
                    warn!(cache = %cache.name(), url = %request.url, error = %e, "Could not store response");
                }
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerConfig;
    use shellkit_net::RequestMode;
    use url::Url;

    fn config() -> ResolvedConfig {
        WorkerConfig::new(
            Url::parse("https://pages.example.io/shop/").unwrap(),
            Url::parse("https://abc-def.tunnel.example/").unwrap(),
            "v1",
        )
        .with_precache(["", "index.html", "https://cdn.example.com/chart.js"])
        .resolve()
        .unwrap()
    }

    fn request(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[test]
    fn test_navigation_wins_over_everything() {
        let config = config();
        for url in [
            "https://abc-def.tunnel.example/api/orders",
            "https://abc-def.tunnel.example/app.js",
            "https://elsewhere.example/",
        ] {
            let req = request(url).mode(RequestMode::Navigate);
            assert_eq!(classify(&config, &req), Rule::Navigation);
            assert_eq!(classify(&config, &req).strategy(), Strategy::Redirect);
        }
    }

    #[test]
    fn test_api_wins_over_same_origin() {
        let config = config();
        let rule = classify(&config, &request("https://abc-def.tunnel.example/api/orders"));
        assert_eq!(rule, Rule::ApiPrefix);

        // Cross-origin API paths are still network-only.
        let rule = classify(&config, &request("https://backend.example/api/products"));
        assert_eq!(rule.strategy(), Strategy::NetworkOnly);
    }

    #[test]
    fn test_same_origin_and_precached_are_cache_first() {
        let config = config();
        assert_eq!(
            classify(&config, &request("https://abc-def.tunnel.example/app.js")),
            Rule::SameOrigin
        );
        assert_eq!(
            classify(&config, &request("https://pages.example.io/shop/index.html")),
            Rule::Precached
        );
        assert_eq!(
            classify(&config, &request("https://cdn.example.com/chart.js")),
            Rule::Precached
        );
    }

    #[test]
    fn test_unclassified_defaults_to_network_only() {
        let config = config();
        let rule = classify(&config, &request("https://pages.example.io/shop/other.css"));
        assert_eq!(rule, Rule::Unclassified);
        assert_eq!(rule.strategy(), Strategy::NetworkOnly);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let config = config();
        let req = request("https://abc-def.tunnel.example/styles.css");
        assert_eq!(classify(&config, &req), classify(&config, &req));
    }

    #[test]
    fn test_disposition_accessors() {
        let response = Response::new(
            Url::parse("https://a.example/").unwrap(),
            http::StatusCode::OK,
            "x",
        );
        assert!(FetchDisposition::Respond(response).into_response().is_some());
        assert!(FetchDisposition::Passthrough.response().is_none());
    }
}
