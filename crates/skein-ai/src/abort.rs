// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cooperative cancellation: a one-way flag shared between the caller and
//! every task participating in a run.

use tokio::sync::watch;

/// Caller-side handle to request an abort.
///
/// Aborting is idempotent; the paired [`AbortSignal`]s observe the flag at
/// their own suspension points.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

/// Observer side of an abort request.  Cheap to clone; every clone sees the
/// same flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortHandle {
    /// Create a new handle + signal pair.
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    /// Trigger the abort.  Safe to call more than once.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the abort fires.  Also resolves if the handle is
    /// dropped without aborting, so selects against a dead handle never
    /// hang; callers should re-check [`is_aborted`](Self::is_aborted) when
    /// they need to distinguish the two.
    pub async fn fired(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                return;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
