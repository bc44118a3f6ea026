//! Shared runtime state handed to every agent duty.

use anyhow::{Context as _, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::identity;

pub struct AgentContext {
    pub config: AgentConfig,
    pub machine_id: String,
    http: reqwest::Client,
    cancel_shutdown: AtomicBool,
    last_known_ip: RwLock<Option<String>>,
    temp_root: PathBuf,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        Self::with_temp_root(config, std::env::temp_dir())
    }

    /// Build a context with an explicit temp directory.
    ///
    /// The temp root is injected so destructive cleanup can be pointed at
    /// a scratch directory in tests.
    pub fn with_temp_root(config: AgentConfig, temp_root: PathBuf) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.server.accept_invalid_certs)
            .timeout(config.server.http_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Arc::new(Self {
            machine_id: identity::machine_id(),
            http,
            cancel_shutdown: AtomicBool::new(false),
            last_known_ip: RwLock::new(None),
            temp_root,
            config,
        }))
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Full URL for an API path such as `/telemetry`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.server.base_url.trim_end_matches('/'), path)
    }

    /// Full URL for a file served from the update channel.
    pub fn update_endpoint(&self, file: &str) -> String {
        format!(
            "{}/{}",
            self.config.server.update_base_url.trim_end_matches('/'),
            file
        )
    }

    /// Flag the next automatic shutdown as cancelled.
    ///
    /// One-way: the flag stays set until the process restarts.
    pub fn request_shutdown_cancel(&self) {
        self.cancel_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_cancelled(&self) -> bool {
        self.cancel_shutdown.load(Ordering::SeqCst)
    }

    /// Record the address the server saw us register from.
    pub fn set_last_known_ip(&self, ip: String) {
        *self.last_known_ip.write() = Some(ip);
    }

    pub fn last_known_ip(&self) -> Option<String> {
        self.last_known_ip.read().clone()
    }

    /// Directory targeted by temp cleanup and used for downloaded assets.
    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }
}
