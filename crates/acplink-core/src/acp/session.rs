//! Session state for ACP
//!
//! [`SessionStore`] holds the one current [`Session`] of a connection. It is
//! written from two places only: the result of a session-establishing RPC,
//! which replaces modes, models and config options wholesale, and inbound
//! `session/update` notifications, which patch single fields. Hosts get
//! cloned snapshots.

use crate::types::{
    AvailableCommand, CapabilityFlags, ConfigOption, SessionMode, SessionModel, SessionSetup,
    SessionUpdate, SessionUpdateNotification,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of the current session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub available_modes: Vec<SessionMode>,
    pub current_mode: Option<String>,
    pub available_models: Vec<SessionModel>,
    pub current_model: Option<String>,
    pub config_options: Vec<ConfigOption>,
    pub available_commands: Vec<AvailableCommand>,
    pub title: Option<String>,
    pub last_updated: Option<String>,
    pub capabilities: CapabilityFlags,
}

impl Session {
    fn from_setup(
        id: String,
        working_directory: String,
        setup: SessionSetup,
        capabilities: CapabilityFlags,
    ) -> Self {
        let modes = setup.modes.unwrap_or_default();
        let models = setup.models.unwrap_or_default();

        Self {
            id,
            working_directory,
            created_at: Utc::now(),
            is_active: true,
            available_modes: modes.available_modes,
            current_mode: modes.current_mode_id,
            available_models: models.available_models,
            current_model: models.current_model_id,
            config_options: setup.config_options.unwrap_or_default(),
            available_commands: Vec::new(),
            title: None,
            last_updated: None,
            capabilities,
        }
    }

    /// Apply one notification. Returns false when the update carried
    /// nothing that changes session state.
    fn apply(&mut self, update: &SessionUpdate) -> bool {
        match update {
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                self.current_mode = Some(current_mode_id.clone());
            }
            SessionUpdate::ConfigOptionUpdate { config_options } => {
                self.config_options = config_options.clone();
            }
            SessionUpdate::SessionInfoUpdate { title, updated_at } => {
                if title.is_some() {
                    self.title = title.clone();
                }
                if updated_at.is_some() {
                    self.last_updated = updated_at.clone();
                }
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                self.available_commands = available_commands.clone();
            }
            _ => return false,
        }
        true
    }
}

/// Shared holder of the current session
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current session with the result of new/load/resume/fork
    pub fn establish(
        &self,
        id: String,
        working_directory: String,
        setup: SessionSetup,
        capabilities: CapabilityFlags,
    ) -> Session {
        let session = Session::from_setup(id, working_directory, setup, capabilities);
        debug!(
            "Session {} established with {} modes, {} models, {} config options",
            session.id,
            session.available_modes.len(),
            session.available_models.len(),
            session.config_options.len()
        );
        *self.inner.write() = Some(session.clone());
        session
    }

    /// Patch the current session from a notification
    ///
    /// Notifications never create a session; ones for an unknown or
    /// different session are dropped.
    pub fn apply_update(&self, notification: &SessionUpdateNotification) {
        if !Self::is_state_update(&notification.update) {
            return;
        }

        let mut guard = self.inner.write();
        match guard.as_mut() {
            Some(session) if session.id == notification.session_id => {
                session.apply(&notification.update);
            }
            Some(session) => {
                warn!(
                    "Dropping state update for session {} (current: {})",
                    notification.session_id, session.id
                );
            }
            None => {
                warn!(
                    "Dropping state update for session {}: no current session",
                    notification.session_id
                );
            }
        }
    }

    fn is_state_update(update: &SessionUpdate) -> bool {
        matches!(
            update,
            SessionUpdate::CurrentModeUpdate { .. }
                | SessionUpdate::ConfigOptionUpdate { .. }
                | SessionUpdate::SessionInfoUpdate { .. }
                | SessionUpdate::AvailableCommandsUpdate { .. }
        )
    }

    pub fn set_current_mode(&self, mode_id: &str) {
        if let Some(session) = self.inner.write().as_mut() {
            session.current_mode = Some(mode_id.to_string());
        }
    }

    pub fn set_current_model(&self, model_id: &str) {
        if let Some(session) = self.inner.write().as_mut() {
            session.current_model = Some(model_id.to_string());
        }
    }

    pub fn replace_config_options(&self, options: Vec<ConfigOption>) {
        if let Some(session) = self.inner.write().as_mut() {
            session.config_options = options;
        }
    }

    /// The agent went away; keep the snapshot readable but inactive
    pub fn mark_inactive(&self) {
        if let Some(session) = self.inner.write().as_mut() {
            session.is_active = false;
        }
    }

    /// Drop the session entirely
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.inner.read().clone()
    }

    pub fn current_id(&self) -> Option<String> {
        self.inner.read().as_ref().map(|s| s.id.clone())
    }

    pub fn with<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.inner.read().as_ref().map(f)
    }
}
