use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{error::AuditorError, events::AuditEvent};

/// Lifecycle phase of an auditor. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AuditorState {
    Unconfigured,
    Configured,
    Started,
    Closed,
}

/// A consumer of audit events.
///
/// Implementations move through `configure` → `start` → `audit`* → `close`.
/// `audit` is called concurrently from request-handling threads and must return
/// promptly: remote I/O belongs on a background task owned by the auditor, and failures
/// of that work are logged instead of being returned to the caller.
#[async_trait]
pub trait Auditor: Send + Sync + Debug + Display {
    /// Validates and stores `options`. Must not perform I/O.
    ///
    /// # Errors
    /// Fails with [`AuditorError::Configuration`] on malformed options.
    fn configure(&self, options: &HashMap<String, String>) -> Result<(), AuditorError>;

    /// Acquires background resources. Calling it again while started is a no-op.
    ///
    /// # Errors
    /// Fails if the auditor was not configured, was closed, or a collaborator could not
    /// be created.
    fn start(&self) -> Result<(), AuditorError>;

    /// Hands `event` to the auditor.
    ///
    /// # Errors
    /// Only lifecycle misuse is reported: [`AuditorError::NotStarted`] before `start`,
    /// [`AuditorError::Closed`] after `close`.
    fn audit(&self, event: Arc<AuditEvent>) -> Result<(), AuditorError>;

    /// Stops accepting events and releases everything acquired in `start`, waiting at
    /// most the configured grace period for outstanding work. Safe to call in any state.
    async fn close(&self);

    fn state(&self) -> AuditorState;
}

/// Fans every call out to a set of auditors.
#[derive(Clone, Default)]
pub struct AuditorCollection(pub(crate) Vec<Arc<dyn Auditor>>);

impl Debug for AuditorCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Auditors").field(&self.0.len()).finish()
    }
}

impl Display for AuditorCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuditorCollection with [")?;
        for (idx, auditor) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{auditor}")?;
        }
        write!(f, "]")
    }
}

impl AuditorCollection {
    #[must_use]
    pub fn new(auditors: Vec<Arc<dyn Auditor>>) -> Self {
        Self(auditors)
    }

    pub fn append(&mut self, auditor: Arc<dyn Auditor>) -> &mut Self {
        self.0.push(auditor);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Configures every auditor with the same options.
    ///
    /// # Errors
    /// Returns the first configuration error. Auditors after the failing one are left
    /// unconfigured.
    pub fn configure(&self, options: &HashMap<String, String>) -> Result<(), AuditorError> {
        self.0
            .iter()
            .try_for_each(|auditor| auditor.configure(options))
    }

    /// # Errors
    /// Returns the first start error. Auditors started before the failure keep running
    /// until [`close`](Self::close).
    pub fn start(&self) -> Result<(), AuditorError> {
        self.0.iter().try_for_each(|auditor| auditor.start())
    }

    /// Hands `event` to every auditor. Failures are logged, never returned.
    pub fn audit(&self, event: AuditEvent) {
        let event = Arc::new(event);
        for auditor in &self.0 {
            if let Err(e) = auditor.audit(Arc::clone(&event)) {
                tracing::warn!(
                    "Auditor '{auditor}' encountered error on {}: {e}",
                    event.payload().kind()
                );
            }
        }
    }

    /// Closes all auditors concurrently.
    pub async fn close(&self) {
        futures::future::join_all(self.0.iter().map(|auditor| auditor.close())).await;
    }
}
