//! Multicast fan-out of discovery events.
//!
//! Keeps the last event seen from every source address still in the mesh plus the
//! terminal state, and hands each subscriber its own queue. A late subscriber first
//! receives the buffered per-source state, then (if the stream already ended) the
//! terminal signal.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::types::{DiscoveryEvent, DiscoveryEventType, DiscoveryEvents};
use crate::error::{MeshError, MeshResult};
use crate::membership::types::Address;

enum Terminal {
    Completed,
    Failed(MeshError),
}

#[derive(Default)]
struct BroadcastState {
    last_known: BTreeMap<Address, DiscoveryEvent>,
    terminal: Option<Terminal>,
    subscribers: Vec<mpsc::UnboundedSender<MeshResult<DiscoveryEvent>>>,
}

#[derive(Default)]
pub(crate) struct EventBroadcaster {
    state: Mutex<BroadcastState>,
}

impl EventBroadcaster {
    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> DiscoveryEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();

        for event in state.last_known.values() {
            let _ = sender.send(Ok(event.clone()));
        }

        match &state.terminal {
            // Dropping the sender completes the subscriber once the replay is drained.
            Some(Terminal::Completed) => {}
            Some(Terminal::Failed(error)) => {
                let _ = sender.send(Err(error.clone()));
            }
            None => state.subscribers.push(sender),
        }

        DiscoveryEvents::new(receiver)
    }

    pub fn publish(&self, event: DiscoveryEvent) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }

        // A departed member has nothing left to replay.
        if event.kind == DiscoveryEventType::Unregistered {
            state.last_known.remove(&event.from);
        } else {
            state.last_known.insert(event.from.clone(), event.clone());
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(Ok(event.clone())).is_ok());
    }

    pub fn complete(&self) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }

        state.terminal = Some(Terminal::Completed);
        state.subscribers.clear();
    }

    pub fn fail(&self, error: MeshError) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }

        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.send(Err(error.clone()));
        }
        state.terminal = Some(Terminal::Failed(error));
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}
