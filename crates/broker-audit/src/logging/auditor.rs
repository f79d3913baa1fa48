use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use super::records::log_event;
use crate::{
    auditor::{Auditor, AuditorState},
    error::AuditorError,
    events::AuditEvent,
};

/// Writes every audit event to the structured audit log on the calling thread.
///
/// Takes no options of its own; options meant for other auditors are ignored.
#[derive(Debug)]
pub struct AuditLogAuditor {
    state: RwLock<AuditorState>,
}

impl Default for AuditLogAuditor {
    fn default() -> Self {
        Self {
            state: RwLock::new(AuditorState::Unconfigured),
        }
    }
}

impl AuditLogAuditor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        f: impl FnOnce(AuditorState) -> Result<AuditorState, AuditorError>,
    ) -> Result<(), AuditorError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = f(*state)?;
        Ok(())
    }
}

impl Display for AuditLogAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuditLogAuditor")
    }
}

#[async_trait]
impl Auditor for AuditLogAuditor {
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), AuditorError> {
        tracing::debug!("{self} ignores {} options", options.len());
        self.transition(|state| match state {
            AuditorState::Unconfigured | AuditorState::Configured => {
                Ok(AuditorState::Configured)
            }
            AuditorState::Started => Err(AuditorError::AlreadyStarted),
            AuditorState::Closed => Err(AuditorError::Closed),
        })
    }

    fn start(&self) -> Result<(), AuditorError> {
        self.transition(|state| match state {
            AuditorState::Unconfigured => Err(AuditorError::NotConfigured),
            AuditorState::Configured | AuditorState::Started => Ok(AuditorState::Started),
            AuditorState::Closed => Err(AuditorError::Closed),
        })
    }

    fn audit(&self, event: Arc<AuditEvent>) -> Result<(), AuditorError> {
        match self.state() {
            AuditorState::Started => {
                log_event(&event);
                Ok(())
            }
            AuditorState::Unconfigured | AuditorState::Configured => {
                Err(AuditorError::NotStarted)
            }
            AuditorState::Closed => Err(AuditorError::Closed),
        }
    }

    async fn close(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = AuditorState::Closed;
    }

    fn state(&self) -> AuditorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}
