//! Ordering barrier between test groups.
//!
//! Some test groups must not run while another one holds the shared pool
//! namespace. A group registers under a name and is finished when its guard
//! drops; a dependent group waits for it. If the upstream group was never
//! scheduled (filtered out of the run, for instance) the wait gives up after
//! a short bound instead of blocking forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Pending,
    Running,
    Finished,
}

/// How a wait on another group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The group ran and finished.
    Completed,
    /// The group did not register in time; it is assumed not to run.
    NotScheduled,
}

/// Registry of named one-shot signals, created lazily by whichever side comes first.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    groups: Arc<Mutex<HashMap<String, Arc<watch::Sender<GroupState>>>>>,
    wait_timeout: Duration,
}

/// Marks a group as running; the group is finished when this is dropped.
#[derive(Debug)]
pub struct GroupGuard {
    name: String,
    signal: Arc<watch::Sender<GroupState>>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        debug!("Test group {} finished", self.name);
        self.signal.send_replace(GroupState::Finished);
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Rendezvous {
    /// Create a registry whose waits give up after `wait_timeout` if the group never registers.
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            wait_timeout,
        }
    }

    fn signal(&self, name: &str) -> Arc<watch::Sender<GroupState>> {
        // A poisoned registry still holds valid senders.
        let mut groups = self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            groups
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(watch::channel(GroupState::Pending).0)),
        )
    }

    /// Register a group as running.
    pub fn register(&self, name: &str) -> GroupGuard {
        let signal = self.signal(name);
        let previous = signal.send_replace(GroupState::Running);
        if previous != GroupState::Pending {
            warn!("Test group {} registered more than once", name);
        }
        debug!("Test group {} running", name);
        GroupGuard {
            name: name.to_string(),
            signal,
        }
    }

    /// Wait for a group to finish.
    pub async fn wait_for(&self, name: &str) -> WaitOutcome {
        let mut state = self.signal(name).subscribe();

        let started = tokio::time::timeout(self.wait_timeout, async {
            state.wait_for(|s| *s != GroupState::Pending).await.map(|_| ())
        })
        .await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                debug!("Test group {} was not scheduled", name);
                return WaitOutcome::NotScheduled;
            }
        }

        // The registry holds a sender for as long as it lives, so this only
        // fails if the registry itself is gone.
        let finished = state.wait_for(|s| *s == GroupState::Finished).await.is_ok();
        if finished {
            WaitOutcome::Completed
        } else {
            WaitOutcome::NotScheduled
        }
    }
}
