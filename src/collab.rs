//! Narrow interfaces to the collaborators around the workflow core.
//!
//! Identity, notification and report upload live outside this crate. The
//! core only needs an acting user, a way to tell that user what happened,
//! and a place to put uploaded report files.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Access level of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Sees every task.
    Admin,
    /// Sees only tasks assigned to them.
    Staff,
}

/// The user performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Display name, recorded as `completed_by`.
    pub name: String,

    /// Access level.
    pub role: Role,
}

impl Actor {
    /// Creates an admin actor.
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Admin,
        }
    }

    /// Creates a staff actor.
    pub fn staff(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Staff,
        }
    }

    /// Returns true for admins.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// How a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// The operation succeeded.
    Success,
    /// Informational.
    Info,
    /// The operation was rejected or failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Info => f.write_str("info"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Fire-and-forget channel to the acting user.
pub trait Notifier: Send + Sync {
    /// Delivers a message. Must not fail or block.
    fn notify(&self, message: &str, severity: Severity);
}

/// Notifier that writes to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Success | Severity::Info => info!(%severity, "{}", message),
            Severity::Error => warn!(%severity, "{}", message),
        }
    }
}

/// Notifier that keeps every message, for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<(Severity, String)>>>,
}

impl RecordingNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far, oldest first.
    pub fn messages(&self) -> Vec<(Severity, String)> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The most recent message, if any.
    pub fn last(&self) -> Option<(Severity, String)> {
        self.messages().pop()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        let mut messages = match self.messages.lock() {
            Ok(messages) => messages,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages.push((severity, message.to_string()));
    }
}

/// Storage for uploaded report files.
#[async_trait]
pub trait ReportUploader: Send + Sync {
    /// Stores `bytes` and returns the URL to record on the stage.
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Uploader that keeps files in memory under `memory://reports/N` URLs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUploader {
    files: Arc<tokio::sync::RwLock<BTreeMap<String, (String, Vec<u8>)>>>,
}

impl InMemoryUploader {
    /// Creates an empty uploader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the content type and bytes stored under `url`.
    pub async fn get(&self, url: &str) -> Option<(String, Vec<u8>)> {
        self.files.read().await.get(url).cloned()
    }
}

#[async_trait]
impl ReportUploader for InMemoryUploader {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        if bytes.is_empty() {
            error!("rejected empty upload");
            return Err(crate::WardflowError::validation("Please choose a report file"));
        }

        let mut files = self.files.write().await;
        let url = format!("memory://reports/{}", files.len() + 1);
        files.insert(url.clone(), (content_type.to_string(), bytes));
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_roles() {
        assert!(Actor::admin("Matron").is_admin());
        assert!(!Actor::staff("Dr. Mehta").is_admin());
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify("Saved", Severity::Success);
        notifier.notify("Please enter remarks", Severity::Error);

        assert_eq!(notifier.messages().len(), 2);
        assert_eq!(
            notifier.last(),
            Some((Severity::Error, "Please enter remarks".to_string()))
        );
    }

    #[test]
    fn test_tracing_notifier_does_not_panic() {
        TracingNotifier.notify("Saved", Severity::Success);
        TracingNotifier.notify("Failed", Severity::Error);
    }

    #[tokio::test]
    async fn test_upload_returns_distinct_urls() {
        let uploader = InMemoryUploader::new();
        let first = uploader
            .upload(b"%PDF-1".to_vec(), "application/pdf")
            .await
            .unwrap();
        let second = uploader
            .upload(b"%PDF-2".to_vec(), "application/pdf")
            .await
            .unwrap();

        assert_ne!(first, second);
        let (content_type, bytes) = uploader.get(&first).await.unwrap();
        assert_eq!(content_type, "application/pdf");
        assert_eq!(bytes, b"%PDF-1");
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let uploader = InMemoryUploader::new();
        let err = uploader.upload(Vec::new(), "text/plain").await.unwrap_err();
        assert!(err.is_validation());
    }
}
