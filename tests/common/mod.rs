//! Two accounts wired together through an in-process queue

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use offrecord::{
    Advisory, AppCallbacks, Engine, EngineConfig, Inbound, OtrError, Policy, PolicyTable, SessionId,
    StateChange, UnreadableReason, UserState,
};

pub const ALICE: &str = "oneeyedian";
pub const BOB: &str = "otr4ian";
pub const PROTO: &str = "prpl-oscar";

/// Something one of the applications observed
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(StateChange),
    Unreadable(SessionId, UnreadableReason),
    Advisory(SessionId, Advisory),
    Delivered { to: String, text: String, encrypted: bool },
}

#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<(String, String, String)>>,
    seen: Mutex<Vec<Seen>>,
}

impl Wire {
    pub fn push(&self, from: &str, to: &str, message: String) {
        self.queue
            .lock()
            .unwrap()
            .push_back((from.to_string(), to.to_string(), message));
    }

    fn pop(&self) -> Option<(String, String, String)> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn record(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn clear_seen(&self) {
        self.seen.lock().unwrap().clear();
    }
}

impl AppCallbacks for Wire {
    fn inject_message(&self, session: &SessionId, message: &str) {
        self.push(&session.account, &session.peer, message.to_string());
    }

    fn state_changed(&self, change: &StateChange) {
        self.record(Seen::State(change.clone()));
    }

    fn unreadable_message(&self, session: &SessionId, reason: &UnreadableReason) {
        self.record(Seen::Unreadable(session.clone(), reason.clone()));
    }

    fn display_advisory(&self, session: &SessionId, advisory: &Advisory) {
        self.record(Seen::Advisory(session.clone(), advisory.clone()));
    }
}

pub fn id(account: &str, peer: &str) -> SessionId {
    SessionId::new(account, peer, PROTO)
}

pub struct Pair {
    pub user_state: UserState,
    pub policies: PolicyTable,
    pub wire: Wire,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_policies(Policy::DEFAULT, Policy::DEFAULT)
    }

    pub fn with_policies(alice: Policy, bob: Policy) -> Self {
        Self::build(UserState::new(), alice, bob)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(UserState::with_config(config), Policy::DEFAULT, Policy::DEFAULT)
    }

    fn build(user_state: UserState, alice: Policy, bob: Policy) -> Self {
        user_state.generate_key(ALICE, PROTO);
        user_state.generate_key(BOB, PROTO);

        let mut policies = PolicyTable::new(Policy::DEFAULT);
        policies.set(ALICE, alice);
        policies.set(BOB, bob);

        Self {
            user_state,
            policies,
            wire: Wire::default(),
        }
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine::new(&self.user_state, &self.policies, &self.wire)
    }

    /// Send through the engine and put the result on the wire
    pub fn send(&self, from: &str, to: &str, text: &str) -> Result<String, OtrError> {
        let wire = self.engine().send(&id(from, to), text)?;
        self.wire.push(from, to, wire.clone());
        Ok(wire)
    }

    /// Deliver `message` as if it came from `from`
    pub fn deliver(&self, from: &str, to: &str, message: &str) -> Inbound {
        let inbound = self.engine().receive(&id(to, from), message);
        if let Inbound::Message {
            text, encrypted, ..
        } = &inbound
        {
            self.wire.record(Seen::Delivered {
                to: to.to_string(),
                text: text.clone(),
                encrypted: *encrypted,
            });
        }
        inbound
    }

    /// Deliver everything queued, including replies, until the wire is quiet
    pub fn dispatch(&self) -> Vec<Inbound> {
        let mut results = Vec::new();
        let mut rounds = 0;
        while let Some((from, to, message)) = self.wire.pop() {
            rounds += 1;
            assert!(rounds < 100, "exchange did not settle");
            results.push(self.deliver(&from, &to, &message));
        }
        results
    }

    /// Like `dispatch`, returning every message that crossed the wire
    pub fn dispatch_logged(&self) -> Vec<(String, String, String)> {
        let mut delivered = Vec::new();
        while let Some((from, to, message)) = self.wire.pop() {
            assert!(delivered.len() < 100, "exchange did not settle");
            self.deliver(&from, &to, &message);
            delivered.push((from, to, message));
        }
        delivered
    }

    /// Alice queries Bob and the exchange runs to completion
    pub fn establish(&self) {
        self.send(ALICE, BOB, "?OTR?").unwrap();
        self.dispatch();
    }

    pub fn state_changes(&self) -> Vec<StateChange> {
        self.wire
            .seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::State(change) => Some(change),
                _ => None,
            })
            .collect()
    }
}
