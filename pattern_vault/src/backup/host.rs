//! Protected background execution
//!
//! The host platform grants a limited window to finish work after the app
//! leaves the foreground. A run holds a [`ProtectionToken`] for its whole
//! duration and always hands it back.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Grant for one protected operation
#[derive(Debug, Clone)]
pub struct ProtectionToken {
    id: u64,
    expiry: CancellationToken,
}

impl ProtectionToken {
    pub fn new(id: u64, expiry: CancellationToken) -> Self {
        Self { id, expiry }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The host withdrew the grant
    pub fn is_expired(&self) -> bool {
        self.expiry.is_cancelled()
    }

    pub fn expiry(&self) -> &CancellationToken {
        &self.expiry
    }
}

pub trait ExecutionHost: Send + Sync {
    fn begin_protected_operation(&self) -> ProtectionToken;

    fn end_protected_operation(&self, token: &ProtectionToken);
}

/// Ends the protected operation on every exit path
pub(crate) struct ProtectionGuard<'a> {
    host: &'a dyn ExecutionHost,
    token: ProtectionToken,
}

impl<'a> ProtectionGuard<'a> {
    pub(crate) fn begin(host: &'a dyn ExecutionHost) -> Self {
        let token = host.begin_protected_operation();
        tracing::debug!(token = token.id(), "protected operation started");
        Self { host, token }
    }

    pub(crate) fn token(&self) -> &ProtectionToken {
        &self.token
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        self.host.end_protected_operation(&self.token);
        tracing::debug!(token = self.token.id(), "protected operation ended");
    }
}

/// Host that never withdraws a grant (CLI, foreground use)
#[derive(Debug, Default)]
pub struct ForegroundHost {
    next: AtomicU64,
}

impl ExecutionHost for ForegroundHost {
    fn begin_protected_operation(&self) -> ProtectionToken {
        ProtectionToken::new(self.next.fetch_add(1, Ordering::Relaxed), CancellationToken::new())
    }

    fn end_protected_operation(&self, _token: &ProtectionToken) {}
}

/// Host whose grants are withdrawn explicitly; tracks begin/end pairing
#[derive(Debug, Default)]
pub struct ManualHost {
    next: AtomicU64,
    active: AtomicUsize,
    ended: AtomicUsize,
    expiry: Mutex<Option<CancellationToken>>,
}

impl ManualHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Withdraw every outstanding grant
    pub fn expire(&self) {
        if let Some(token) = self.expiry.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl ExecutionHost for ManualHost {
    fn begin_protected_operation(&self) -> ProtectionToken {
        let expiry = CancellationToken::new();
        *self.expiry.lock() = Some(expiry.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        ProtectionToken::new(self.next.fetch_add(1, Ordering::SeqCst), expiry)
    }

    fn end_protected_operation(&self, _token: &ProtectionToken) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}
