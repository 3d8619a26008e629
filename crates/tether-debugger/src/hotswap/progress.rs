use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tether_scheduler::{CancellationToken, ProgressIndicator, ProgressSender};
use tether_vm::RedefinitionErrorKind;

use crate::session::{DebuggerSession, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

/// One line of hot-swap output, attributed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotSwapMessage {
    pub session_id: SessionId,
    pub session_name: String,
    pub severity: MessageSeverity,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<RedefinitionErrorKind>,
}

/// Progress of a scan or reload across sessions. Owns the cancellation token
/// shared with the per-process sub-commands.
#[derive(Clone)]
pub struct HotSwapProgress {
    indicator: ProgressIndicator,
    messages: Arc<Mutex<Vec<HotSwapMessage>>>,
}

impl HotSwapProgress {
    pub fn new(sender: &ProgressSender, title: impl Into<String>) -> Self {
        Self::with_indicator(ProgressIndicator::new(sender, title))
    }

    pub fn with_indicator(indicator: ProgressIndicator) -> Self {
        Self {
            indicator,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn indicator(&self) -> &ProgressIndicator {
        &self.indicator
    }

    pub fn add_message(
        &self,
        session: &DebuggerSession,
        severity: MessageSeverity,
        text: impl Into<String>,
    ) {
        self.push(session, severity, text.into(), None);
    }

    /// Record a failed redefinition together with its category.
    pub fn add_error(
        &self,
        session: &DebuggerSession,
        text: impl Into<String>,
        error_kind: Option<RedefinitionErrorKind>,
    ) {
        self.push(session, MessageSeverity::Error, text.into(), error_kind);
    }

    fn push(
        &self,
        session: &DebuggerSession,
        severity: MessageSeverity,
        text: String,
        error_kind: Option<RedefinitionErrorKind>,
    ) {
        match severity {
            MessageSeverity::Error => {
                tracing::warn!(target: "tether.hotswap", session = %session.name(), message = %text, "hot swap error");
            }
            _ => {
                tracing::debug!(target: "tether.hotswap", session = %session.name(), ?severity, message = %text);
            }
        }
        self.messages.lock().push(HotSwapMessage {
            session_id: session.id(),
            session_name: session.name().to_string(),
            severity,
            text,
            error_kind,
        });
    }

    pub fn messages(&self) -> Vec<HotSwapMessage> {
        self.messages.lock().clone()
    }

    pub fn messages_for(&self, session: &DebuggerSession) -> Vec<HotSwapMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.session_id == session.id())
            .cloned()
            .collect()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.indicator.set_text(text);
    }

    pub fn set_fraction(&self, fraction: f64) {
        self.indicator.set_fraction(fraction);
    }

    pub fn token(&self) -> CancellationToken {
        self.indicator.token()
    }

    pub fn cancel(&self) {
        self.indicator.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.indicator.is_cancelled()
    }

    pub fn finish(&self) {
        self.indicator.finish(None);
    }
}
