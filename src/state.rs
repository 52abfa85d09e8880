//! Shared state of the local sandbox service.

use crate::api::SandboxInfo;
use crate::config::Credential;
use crate::sandbox::Limits;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A local sandbox backed by a directory.
#[derive(Debug)]
pub struct Sandbox {
    pub id: String,
    pub root: PathBuf,
    pub labels: HashMap<String, String>,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl Sandbox {
    pub fn info(&self, now: Instant) -> SandboxInfo {
        SandboxInfo {
            id: self.id.clone(),
            state: "started".to_string(),
            labels: self.labels.clone(),
            age_secs: now.duration_since(self.created_at).as_secs(),
            idle_secs: now.duration_since(self.last_used).as_secs(),
        }
    }
}

/// Thread-safe sandbox storage.
pub type Sandboxes = Arc<RwLock<HashMap<String, Sandbox>>>;

/// Settings fixed at service start.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding one subdirectory per sandbox.
    pub root: PathBuf,
    /// Host used when building preview links.
    pub public_host: String,
    /// Bearer token clients must present, if any.
    pub api_key: Option<Credential>,
    pub limits: Limits,
    /// Sandboxes idle longer than this are removed. `None` keeps them.
    pub idle_ttl: Option<Duration>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sandboxes: Sandboxes,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }
}
