//! Admission gate chain.
//!
//! Parent workflows that submit batches of child workflows onto a bounded
//! pool can deadlock the pool if several of them race their batches in at
//! once. The chain serializes only the admission moment: parent *i* may
//! start submitting children once parent *i-1* has finished submitting its
//! own, while all other (non-admitting) work proceeds in parallel.
//!
//! Each gate is a single-use signal pair built on one-shot channels: the
//! receiver is armed by the predecessor's sender, so at most one parent is
//! between `wait_turn` and `finish_admitting` at any instant.

use tokio::sync::oneshot;
use tracing::warn;

/// Issues gates in strict FIFO order. Issue one gate per parent, in the same
/// order the parents are submitted to their pool.
#[derive(Default)]
pub struct GateChain {
    tail: Option<oneshot::Receiver<()>>,
}

pub struct AdmissionGate {
    owner: String,
    can_admit: Option<oneshot::Receiver<()>>,
    finished_admitting: Option<oneshot::Sender<()>>,
}

impl GateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, owner: impl Into<String>) -> AdmissionGate {
        let (finished_admitting, next_can_admit) = oneshot::channel();
        AdmissionGate {
            owner: owner.into(),
            // The first gate in the chain has no predecessor and is
            // pre-satisfied.
            can_admit: self.tail.replace(next_can_admit),
            finished_admitting: Some(finished_admitting),
        }
    }
}

impl AdmissionGate {
    /// Block until the predecessor has finished admitting its children.
    ///
    /// A predecessor that is dropped without finishing admission releases
    /// this gate with a warning rather than stalling the rest of the chain
    /// forever. Idempotent: later calls return immediately.
    pub async fn wait_turn(&mut self) {
        if let Some(can_admit) = self.can_admit.take()
            && can_admit.await.is_err()
        {
            warn!(
                gate = %self.owner,
                "predecessor dropped without finishing admission, proceeding"
            );
        }
    }

    /// Signal the successor that every child of this parent has been
    /// submitted (not completed). Idempotent.
    pub fn finish_admitting(&mut self) {
        if let Some(finished) = self.finished_admitting.take() {
            let _ = finished.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn first_gate_is_pre_satisfied() {
        let mut chain = GateChain::new();
        let mut gate = chain.issue("first");
        timeout(Duration::from_millis(50), gate.wait_turn())
            .await
            .expect("first gate must not block");
    }

    #[tokio::test]
    async fn successor_blocks_until_predecessor_finishes() {
        let mut chain = GateChain::new();
        let mut first = chain.issue("first");
        let mut second = chain.issue("second");

        assert!(
            timeout(Duration::from_millis(30), second.wait_turn())
                .await
                .is_err(),
            "second gate must wait for the first"
        );

        first.wait_turn().await;
        first.finish_admitting();

        timeout(Duration::from_millis(50), second.wait_turn())
            .await
            .expect("second gate must open after the first finishes");
    }

    #[tokio::test]
    async fn admission_is_strictly_ordered_and_exclusive() {
        let mut chain = GateChain::new();
        let admitting = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for index in 0..5 {
            let mut gate = chain.issue(format!("parent-{index}"));
            let admitting = admitting.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // Preparatory work of varying length, fully parallel.
                sleep(Duration::from_millis(5 * (5 - index as u64))).await;
                gate.wait_turn().await;
                assert_eq!(admitting.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().push(index);
                sleep(Duration::from_millis(5)).await;
                admitting.fetch_sub(1, Ordering::SeqCst);
                gate.finish_admitting();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn dropped_predecessor_releases_the_successor() {
        let mut chain = GateChain::new();
        let first = chain.issue("first");
        let mut second = chain.issue("second");

        drop(first);

        timeout(Duration::from_millis(50), second.wait_turn())
            .await
            .expect("successor must not stall behind a dropped gate");
    }

    #[tokio::test]
    async fn finish_admitting_is_idempotent() {
        let mut chain = GateChain::new();
        let mut first = chain.issue("first");
        let mut second = chain.issue("second");

        first.finish_admitting();
        first.finish_admitting();
        second.wait_turn().await;
        second.wait_turn().await;
    }
}
