//! In-process channel that records every publish
//!
//! Used for dry runs without a broker and as the channel in tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::WorkerError;
use crate::publish::channel::PublishChannel;

/// A message accepted by a [`MemoryChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub key: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct Inner {
    published: Vec<Published>,
    failures: Vec<(String, usize)>,
    attempts: usize,
    close_count: usize,
}

/// Recording channel
#[derive(Debug, Default)]
pub struct MemoryChannel {
    inner: Mutex<Inner>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `times` publishes whose payload contains `fragment`
    pub fn fail_payloads_containing(&self, fragment: &str, times: usize) {
        self.lock().failures.push((fragment.to_string(), times));
    }

    /// Every accepted message, in publish order
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Accepted payloads for one key, in publish order
    pub fn payloads(&self, key: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.key == key)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Publish attempts, rejected ones included
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PublishChannel for MemoryChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), WorkerError> {
        let payload = String::from_utf8_lossy(&payload).into_owned();
        let mut inner = self.lock();
        inner.attempts += 1;

        let rejected = inner
            .failures
            .iter_mut()
            .find(|(fragment, times)| *times > 0 && payload.contains(fragment.as_str()));
        if let Some((_, times)) = rejected {
            *times -= 1;
            return Err(WorkerError::PublishError {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }

        debug!(key = %key, payload = %payload, "published");
        inner.published.push(Published {
            key: key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.lock().close_count += 1;
        Ok(())
    }
}
