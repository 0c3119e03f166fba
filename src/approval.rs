//! User approval for tool actions, and the per-step relay that surfaces
//! approval requests on the outbound channel.
//!
//! Every [`Approval`] handle belongs to one session. Requests carry that
//! session's id and go into that session's own queue, so a nested agent
//! (see [`Approval::child`]) never has its requests picked up by the
//! parent's relay, or the other way round.

use crate::types::*;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResponse {
    Approve,
    /// Approve, and auto-approve the same action for the rest of the session.
    ApproveForSession,
    Reject,
}

/// A pending question for the user. Clones share the same responder.
#[derive(Clone)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: SessionId,
    pub tool_call_id: String,
    /// Tool asking for approval.
    pub sender: String,
    /// Short action key, used for "approve for session".
    pub action: String,
    pub description: String,
    responder: Arc<Mutex<Option<oneshot::Sender<ApprovalResponse>>>>,
}

impl ApprovalRequest {
    /// Answer the request. Returns false if it was already answered or the
    /// requesting tool stopped waiting.
    pub fn resolve(&self, response: ApprovalResponse) -> bool {
        let sender = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for ApprovalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalRequest")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("sender", &self.sender)
            .field("action", &self.action)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

struct Inner {
    session_id: SessionId,
    yolo: AtomicBool,
    auto_approve: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<ApprovalRequest>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ApprovalRequest>>,
}

/// Per-session approval handle. Cheap to clone.
#[derive(Clone)]
pub struct Approval {
    inner: Arc<Inner>,
}

impl Approval {
    pub fn new(yolo: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                session_id: SessionId::new(),
                yolo: AtomicBool::new(yolo),
                auto_approve: Mutex::new(HashSet::new()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// A nested session with its own queue. Inherits yolo mode.
    pub fn child(&self) -> Self {
        Self::new(self.is_yolo())
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn set_yolo(&self, yolo: bool) {
        self.inner.yolo.store(yolo, Ordering::SeqCst);
    }

    pub fn is_yolo(&self) -> bool {
        self.inner.yolo.load(Ordering::SeqCst)
    }

    /// Ask the user whether the calling tool may perform `action`.
    ///
    /// Returns true right away in yolo mode or when the action was approved
    /// for the session. A request dropped without an answer, or a cancelled
    /// tool call, counts as a rejection.
    pub async fn request(&self, ctx: &ToolContext, action: &str, description: &str) -> bool {
        if self.is_yolo() || self.auto_approved(action) {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            session_id: self.inner.session_id,
            tool_call_id: ctx.tool_call_id.clone(),
            sender: ctx.tool_name.clone(),
            action: action.to_string(),
            description: description.to_string(),
            responder: Arc::new(Mutex::new(Some(tx))),
        };
        debug!(session = %self.inner.session_id, action, "approval requested");
        if self.inner.tx.send(request).is_err() {
            return false;
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            response = rx => response,
        };
        match response {
            Ok(ApprovalResponse::Approve) => true,
            Ok(ApprovalResponse::ApproveForSession) => {
                self.inner
                    .auto_approve
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(action.to_string());
                true
            }
            Ok(ApprovalResponse::Reject) | Err(_) => false,
        }
    }

    fn auto_approved(&self, action: &str) -> bool {
        self.inner
            .auto_approve
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(action)
    }

    /// Next request raised in this session, in arrival order.
    pub async fn fetch_request(&self) -> Option<ApprovalRequest> {
        self.inner.rx.lock().await.recv().await
    }
}

impl Default for Approval {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for Approval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Approval")
            .field("session_id", &self.inner.session_id)
            .field("yolo", &self.is_yolo())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Background task forwarding one session's approval requests to the
/// outbound channel for the duration of a step.
///
/// Call [`ApprovalRelay::stop`] on every exit path; dropping the relay
/// aborts the task without waiting for it.
pub struct ApprovalRelay {
    handle: Option<JoinHandle<()>>,
}

impl ApprovalRelay {
    pub fn start(approval: Approval, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        let handle = tokio::spawn(async move {
            while let Some(request) = approval.fetch_request().await {
                if tx.send(AgentEvent::ApprovalRequested(request)).is_err() {
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Cancel the task and wait until it has finished.
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ApprovalRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
