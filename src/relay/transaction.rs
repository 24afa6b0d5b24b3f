//! Transaction coordination.
//!
//! The session counts executions made with autocommit off. Work is only ever
//! finished by an explicit commit or rollback on the link it was done on; if
//! that link dies first, the transaction is marked lost and must be
//! acknowledged with a rollback before new work is accepted.

use super::connection::Connection;
use super::error::{RelayError, RelayResult};
use super::protocol::{Payload, Request, RequestKind};
use super::session::Link;

/// Transaction bookkeeping for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransactionState {
    pub(crate) autocommit: bool,
    pending: u32,
    lost: bool,
    /// Link epoch the pending work was done on
    epoch: u64,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self {
            autocommit: true,
            pending: 0,
            lost: false,
            epoch: 0,
        }
    }
}

impl TransactionState {
    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.pending > 0
    }

    pub(crate) fn pending(&self) -> u32 {
        self.pending
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost
    }

    pub(crate) fn record_execution(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.pending = self.pending.saturating_add(1);
    }

    /// The link in use is `epoch`; pending work from another epoch is gone.
    pub(crate) fn observe_epoch(&mut self, epoch: u64) {
        if self.pending > 0 && epoch != self.epoch {
            self.link_lost();
        }
    }

    /// The link dropped outside commit or rollback.
    pub(crate) fn link_lost(&mut self) {
        if self.pending > 0 && !self.lost {
            log::warn!(
                "link lost with {} uncommitted operation(s); transaction must be rolled back",
                self.pending
            );
            self.lost = true;
        }
    }

    pub(crate) fn check_usable(&self) -> RelayResult<()> {
        if self.lost {
            return Err(RelayError::TransactionLost {
                pending: self.pending,
            });
        }
        Ok(())
    }

    /// Nothing is pending anymore.
    pub(crate) fn settle(&mut self) {
        self.pending = 0;
        self.lost = false;
    }
}

impl Connection {
    pub fn autocommit(&self) -> bool {
        self.inner.shared.lock().txn.autocommit
    }

    /// Whether uncommitted work is pending.
    pub fn is_dirty(&self) -> bool {
        self.inner.shared.lock().txn.is_dirty()
    }

    /// Number of executions since the last commit or rollback.
    pub fn pending(&self) -> u32 {
        self.inner.shared.lock().txn.pending()
    }

    /// Whether the pending transaction died with its link.
    pub fn transaction_lost(&self) -> bool {
        self.inner.shared.lock().txn.is_lost()
    }

    /// Commit pending work.
    ///
    /// If the link fails after the request may have reached the proxy, the
    /// result is [`RelayError::AmbiguousOutcome`] and the commit is not resent.
    pub async fn commit(&self) -> RelayResult<()> {
        self.commit_pending(false).await
    }

    /// With `keep_pending`, an unknown outcome leaves the work pending and
    /// marks the transaction lost instead of settling it.
    async fn commit_pending(&self, keep_pending: bool) -> RelayResult<()> {
        self.shared()?.txn.check_usable()?;
        let mut link = self.live_link().await?;
        self.shared()?.txn.check_usable()?;

        let result = link.round_trip(&Request::Commit).await;
        self.finish("commit", &mut link, RequestKind::Commit, result, keep_pending)
            .await
    }

    /// Roll back pending work. Acknowledges a lost transaction without
    /// contacting the proxy.
    pub async fn rollback(&self) -> RelayResult<()> {
        if self.discard_lost()? {
            return Ok(());
        }
        let mut link = self.live_link().await?;
        if self.discard_lost()? {
            return Ok(());
        }

        let result = link.round_trip(&Request::Rollback).await;
        self.finish("rollback", &mut link, RequestKind::Rollback, result, false)
            .await
    }

    fn discard_lost(&self) -> RelayResult<bool> {
        let mut shared = self.shared()?;
        if !shared.txn.is_lost() {
            return Ok(false);
        }
        log::info!(
            "discarding lost transaction with {} operation(s)",
            shared.txn.pending()
        );
        shared.txn.settle();
        Ok(true)
    }

    async fn finish(
        &self,
        operation: &'static str,
        link: &mut Link,
        kind: RequestKind,
        result: RelayResult<Payload>,
        keep_pending: bool,
    ) -> RelayResult<()> {
        let source = match result {
            Ok(Payload::Ack) => {
                self.inner.shared.lock().txn.settle();
                log::debug!("{} acknowledged", operation);
                return Ok(());
            }
            Ok(other) => link.unexpected(other, kind).await,
            Err(e) if e.is_transport() => e,
            // Clean rejection; the transaction is still open
            Err(e) => return Err(e),
        };

        {
            let mut shared = self.inner.shared.lock();
            if keep_pending {
                shared.txn.link_lost();
            } else {
                // The backend is gone either way, and its work with it
                shared.txn.settle();
            }
        }
        log::warn!("outcome of {} unknown: {}", operation, source);
        Err(RelayError::AmbiguousOutcome {
            operation,
            source: Box::new(source),
        })
    }

    /// Switch autocommit. Enabling it while dirty commits first; if that
    /// commit fails the mode is unchanged, the work stays pending and the
    /// error is [`RelayError::AutoCommitSwitch`].
    pub async fn set_autocommit(&self, on: bool) -> RelayResult<()> {
        let (current, dirty) = {
            let shared = self.shared()?;
            (shared.txn.autocommit, shared.txn.is_dirty())
        };
        if current == on {
            return Ok(());
        }
        if on && dirty {
            self.commit_pending(true)
                .await
                .map_err(|e| RelayError::AutoCommitSwitch(Box::new(e)))?;
        }

        let mut link = self.live_link().await?;
        self.call_ack(&mut link, &Request::SetAutocommit { on }).await?;
        self.shared()?.txn.autocommit = on;
        log::debug!("autocommit {}", if on { "on" } else { "off" });
        Ok(())
    }

    pub async fn savepoint(&self, name: &str) -> RelayResult<()> {
        self.savepoint_request(
            "savepoint",
            Request::Savepoint {
                name: name.to_string(),
            },
        )
        .await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> RelayResult<()> {
        self.savepoint_request(
            "rollback to savepoint",
            Request::RollbackToSavepoint {
                name: name.to_string(),
            },
        )
        .await
    }

    pub async fn release_savepoint(&self, name: &str) -> RelayResult<()> {
        self.savepoint_request(
            "release savepoint",
            Request::ReleaseSavepoint {
                name: name.to_string(),
            },
        )
        .await
    }

    async fn savepoint_request(&self, operation: &'static str, request: Request) -> RelayResult<()> {
        {
            let shared = self.shared()?;
            if shared.txn.autocommit {
                return Err(RelayError::NotInTransaction(operation));
            }
            shared.txn.check_usable()?;
        }
        let mut link = self.live_link().await?;
        self.shared()?.txn.check_usable()?;
        self.call_ack(&mut link, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_and_settle() {
        let mut txn = TransactionState::default();
        assert!(txn.autocommit);
        assert!(!txn.is_dirty());

        txn.record_execution(1);
        txn.record_execution(1);
        assert_eq!(txn.pending(), 2);
        assert!(txn.is_dirty());

        txn.settle();
        assert!(!txn.is_dirty());
        assert!(txn.check_usable().is_ok());
    }

    #[test]
    fn test_new_epoch_loses_pending_work() {
        let mut txn = TransactionState::default();
        txn.record_execution(3);
        txn.observe_epoch(3);
        assert!(!txn.is_lost());

        txn.observe_epoch(4);
        assert!(txn.is_lost());
        assert!(matches!(
            txn.check_usable(),
            Err(RelayError::TransactionLost { pending: 1 })
        ));
    }

    #[test]
    fn test_clean_state_survives_reconnect() {
        let mut txn = TransactionState::default();
        txn.observe_epoch(9);
        txn.link_lost();
        assert!(!txn.is_lost());
    }
}
