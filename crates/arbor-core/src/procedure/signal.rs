//! Node state and cooperative preemption signals

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Procedure / visitor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Uninitialized,
    Idle,
    Active,
    Preempted,
    Error,
    Completed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Uninitialized => "uninitialized",
            NodeState::Idle => "idle",
            NodeState::Active => "active",
            NodeState::Preempted => "preempted",
            NodeState::Error => "error",
            NodeState::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct PreemptInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Edge-triggered preemption request.
///
/// `take` observes and clears the request in one step. `requested`
/// waits without polling until a request is made.
#[derive(Clone, Default)]
pub struct PreemptFlag {
    inner: Arc<PreemptInner>,
}

impl PreemptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Observe and clear a pending request.
    pub fn take(&self) -> bool {
        self.inner.requested.swap(false, Ordering::SeqCst)
    }

    /// Resolve once a request is pending. Does not clear it.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// A flag that does not share state with this one.
    pub fn detached(&self) -> Self {
        let flag = Self::new();
        if self.is_requested() {
            flag.inner.requested.store(true, Ordering::SeqCst);
        }
        flag
    }
}

impl fmt::Debug for PreemptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreemptFlag")
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// Per-node state channel and preemption flag.
pub struct NodeSignals {
    state: watch::Sender<NodeState>,
    preempt: PreemptFlag,
}

impl NodeSignals {
    pub fn new() -> Self {
        let (state, _) = watch::channel(NodeState::Uninitialized);
        Self {
            state,
            preempt: PreemptFlag::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.send_replace(state);
    }

    pub fn preempt_flag(&self) -> &PreemptFlag {
        &self.preempt
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            state: self.state.subscribe(),
            preempt: self.preempt.clone(),
        }
    }
}

impl Default for NodeSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies carry the current state on fresh channels, so observers of the
/// original never see transitions of the copy.
impl Clone for NodeSignals {
    fn clone(&self) -> Self {
        let (state, _) = watch::channel(self.state());
        Self {
            state,
            preempt: self.preempt.detached(),
        }
    }
}

impl fmt::Debug for NodeSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSignals")
            .field("state", &self.state())
            .field("preempt", &self.preempt)
            .finish()
    }
}

/// Observer handle for a node, usable from other tasks.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    state: watch::Receiver<NodeState>,
    preempt: PreemptFlag,
}

impl NodeHandle {
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Ask the node to stop. Only effective while it is active.
    pub fn preempt(&self) {
        self.preempt.request();
    }

    /// Wait until the node's state is `target` (`isset`) or is no longer
    /// `target` (`!isset`). Returns the state observed.
    pub async fn wait_state(&self, target: NodeState, isset: bool) -> NodeState {
        let mut rx = self.state.clone();
        let observed = rx
            .wait_for(|state| (*state == target) == isset)
            .await
            .map(|state| *state);
        match observed {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_preempt_flag_is_edge_triggered() {
        let flag = PreemptFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.requested().await })
        };
        tokio::task::yield_now().await;
        flag.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert!(flag.take());
        assert!(!flag.take());
    }

    #[tokio::test]
    async fn test_wait_state_sees_transition() {
        let signals = NodeSignals::new();
        let handle = signals.handle();
        let waiter = tokio::spawn(async move { handle.wait_state(NodeState::Active, false).await });

        signals.set_state(NodeState::Active);
        tokio::task::yield_now().await;
        signals.set_state(NodeState::Completed);

        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(seen, NodeState::Active);
    }

    #[test]
    fn test_cloned_signals_are_independent() {
        let signals = NodeSignals::new();
        signals.set_state(NodeState::Idle);
        let copy = signals.clone();
        copy.set_state(NodeState::Error);
        copy.preempt_flag().request();

        assert_eq!(signals.state(), NodeState::Idle);
        assert!(!signals.preempt_flag().is_requested());
    }
}
