//! Scripted in-memory network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

/// A [`Fetcher`] answering from a route table.
///
/// Unknown URLs answer 404. When switched offline every fetch is rejected,
/// but the attempt is still recorded. Routes can be given latency to hold
/// a request in flight.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    failing: Mutex<Vec<String>>,
    requests: Mutex<Vec<String>>,
    latency: Mutex<HashMap<String, Duration>>,
    offline: AtomicBool,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with 200 at `url`, replacing any previous route.
    pub fn route(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.route_status(url, StatusCode::OK, body)
    }

    /// Serve `body` with `status` at `url`.
    pub fn route_status(&self, url: &str, status: StatusCode, body: impl Into<Bytes>) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(normalize(url), (status, body.into()));
        self
    }

    /// Reject every fetch of `url` with a transport error.
    pub fn fail(&self, url: &str) -> &Self {
        self.failing.lock().unwrap().push(normalize(url));
        self
    }

    /// Delay every answer for `url` by `latency`.
    pub fn delay(&self, url: &str, latency: Duration) -> &Self {
        self.latency.lock().unwrap().insert(normalize(url), latency);
        self
    }

    /// Toggle the whole network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// How many times `url` was requested.
    pub fn hits(&self, url: &str) -> usize {
        let url = normalize(url);
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == url)
            .count()
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.requests.lock().unwrap().push(url.clone());

        let latency = self.latency.lock().unwrap().get(&url).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(url));
        }
        if self.failing.lock().unwrap().contains(&url) {
            return Err(NetError::RequestFailed(format!("connection reset: {url}")));
        }

        let (status, body) = self
            .routes
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));

        let mut response = Response::new(request.url.clone(), status, body);
        response
            .headers
            .insert("x-mock", HeaderValue::from_static("network"));
        Ok(response)
    }
}
