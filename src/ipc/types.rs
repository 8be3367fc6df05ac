use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Identity;
use crate::config::DaemonConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: DaemonConfig,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Set by `session.begin`; cleared whenever the workspace changes.
    pub session: Option<Identity>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            session: None,
        }
    }
}
