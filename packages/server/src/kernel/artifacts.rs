//! Artifact persistence for result submissions.
//!
//! Workers attach artifacts either as pre-uploaded URLs (passed through) or
//! as inline base64 bodies, which are written to the blob sink and rewritten
//! to URLs before the result record is stored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::common::{QueueResult, TaskId};

/// Inbound artifact as submitted by a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactIn {
    pub name: String,
    /// Inline base64 body; mutually exclusive with `url`.
    #[serde(default)]
    pub body: Option<String>,
    /// Pre-uploaded location; passed through untouched.
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist one blob and return its public URL.
    async fn put(&self, task_id: &TaskId, name: &str, bytes: Vec<u8>) -> QueueResult<String>;
}

/// Filesystem blob sink: `{root}/{task_id}/{name}`, served under
/// `{public_base}`.
pub struct FsArtifactStore {
    root: PathBuf,
    public_base: String,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, task_id: &TaskId, name: &str, bytes: Vec<u8>) -> QueueResult<String> {
        let name = sanitize(name);
        let dir = self.root.join(task_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .context("creating artifact directory")?;
        tokio::fs::write(dir.join(&name), bytes)
            .await
            .context("writing artifact")?;
        Ok(format!(
            "{}/{task_id}/{name}",
            self.public_base.trim_end_matches('/')
        ))
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn len(&self) -> usize {
        self.objects.lock().expect("artifact lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, task_id: &TaskId, name: &str, bytes: Vec<u8>) -> QueueResult<String> {
        let url = format!("memory://{task_id}/{}", sanitize(name));
        self.objects
            .lock()
            .expect("artifact lock poisoned")
            .insert(url.clone(), bytes);
        Ok(url)
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryArtifactStore::default();
        let id = TaskId::new();
        let url = store.put(&id, "master.wav", vec![1, 2, 3]).await.unwrap();
        assert!(url.starts_with("memory://"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize("mix final.wav"), "mix_final.wav");
        assert_eq!(sanitize(""), "artifact");
    }
}
