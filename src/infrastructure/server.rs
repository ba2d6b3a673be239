use crate::domain::ProjectStatus;
use crate::foundation::{BackendError, Result};
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

pub type StatusCallback = Box<dyn FnOnce(Result<ProjectStatus>) + Send>;

/// Fetches a project's authoritative status from its payment URL. The
/// fetch happens off the engine thread; implementations invoke the
/// callback from their own thread and the backend marshals it back.
pub trait StatusTransport: Send + Sync {
    fn fetch_status(&self, url: &Url, callback: StatusCallback);
}

/// HTTPS transport against a real project server. Each fetch runs on a
/// short-lived thread driving a blocking client.
pub struct HttpStatusTransport {
    timeout: Duration,
}

impl HttpStatusTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpStatusTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl StatusTransport for HttpStatusTransport {
    fn fetch_status(&self, url: &Url, callback: StatusCallback) {
        let url = url.clone();
        let timeout = self.timeout;
        let spawned = std::thread::Builder::new().name("pharos-status-fetch".to_string()).spawn(move || {
            debug!("fetching project status from {url}");
            callback(fetch_blocking(&url, timeout));
        });
        if let Err(err) = spawned {
            log::error!("failed to spawn status fetch thread: {err}");
        }
    }
}

fn fetch_blocking(url: &Url, timeout: Duration) -> Result<ProjectStatus> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| BackendError::Transport { operation: "client build".to_string(), details: err.to_string() })?;
    let response = client
        .get(url.clone())
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| BackendError::Transport { operation: "status fetch".to_string(), details: err.to_string() })?;
    response
        .json::<ProjectStatus>()
        .map_err(|err| BackendError::Transport { operation: "status decode".to_string(), details: err.to_string() })
}

/// Transport double: statuses are keyed by URL; missing entries surface as
/// transport errors. Callbacks run on the caller's thread.
#[derive(Default)]
pub struct StaticStatusTransport {
    statuses: Mutex<HashMap<String, ProjectStatus>>,
}

impl StaticStatusTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, url: &Url, status: ProjectStatus) {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner()).insert(url.to_string(), status);
    }

    pub fn clear_status(&self, url: &Url) {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner()).remove(&url.to_string());
    }
}

impl StatusTransport for StaticStatusTransport {
    fn fetch_status(&self, url: &Url, callback: StatusCallback) {
        let status = self.statuses.lock().unwrap_or_else(|e| e.into_inner()).get(&url.to_string()).cloned();
        match status {
            Some(status) => callback(Ok(status)),
            None => callback(Err(BackendError::Transport {
                operation: "status fetch".to_string(),
                details: format!("no scripted status for {url}"),
            })),
        }
    }
}
