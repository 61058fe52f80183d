//! Session Registry
//!
//! The set of live sessions and the bounded message history, behind one
//! lock. Every mutation and every fan-out happens under that lock, so all
//! session queues see messages in the same order and a newcomer's history
//! replay lines up exactly with the live traffic that follows it.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::session::{Frame, Session, SessionId};

/// Default number of history lines kept
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    history: VecDeque<String>,
}

/// Shared server state: live sessions plus history ring
pub struct Registry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                history: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Register a session.
    ///
    /// `greeting` builds the frames the newcomer receives first, from the
    /// history as it stands at registration time. They are queued before the
    /// session becomes visible to any broadcast.
    pub fn register<F>(&self, session: Session, greeting: F) -> bool
    where
        F: FnOnce(&VecDeque<String>) -> Vec<Frame>,
    {
        let mut inner = self.inner.lock();
        for frame in greeting(&inner.history) {
            if session.send(frame).is_err() {
                return false;
            }
        }
        log::info!("Session {} registered as {}", session.id, session.nickname);
        inner.sessions.insert(session.id, session);
        true
    }

    /// Remove a session. Only the first caller for a given id gets it back.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().sessions.remove(id)
    }

    /// Record `line` in history and fan `frame` out to every session except
    /// `except`.
    ///
    /// Sessions whose queue is closed or full are dropped from the registry
    /// and returned so the caller can announce their departure.
    pub fn publish(&self, line: String, frame: Frame, except: Option<SessionId>) -> Vec<Session> {
        let mut inner = self.inner.lock();

        inner.history.push_back(line);
        while inner.history.len() > self.capacity {
            inner.history.pop_front();
        }

        let snapshot: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| Some(s.id) != except)
            .cloned()
            .collect();

        let mut dead = Vec::new();
        for session in snapshot {
            if let Err(e) = session.send(frame.clone()) {
                log::warn!("Dropping {}: {}", session.nickname, e);
                dead.push(session.id);
            }
        }

        dead.iter()
            .filter_map(|id| inner.sessions.remove(id))
            .collect()
    }

    /// Remove every session (server shutdown)
    pub fn drain(&self) -> Vec<Session> {
        self.inner.lock().sessions.drain().map(|(_, s)| s).collect()
    }

    /// Snapshot of history, oldest first
    pub fn history(&self) -> Vec<String> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn nicknames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .sessions
            .values()
            .map(|s| s.nickname.clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn frame(text: &str) -> Frame {
        Arc::new(text.as_bytes().to_vec())
    }

    fn session(name: &str) -> (Session, mpsc::Receiver<Frame>) {
        session_with_queue(name, 64)
    }

    fn session_with_queue(name: &str, queue: usize) -> (Session, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue);
        (Session::new(name.to_string(), tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(String::from_utf8(f.to_vec()).unwrap());
        }
        out
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let registry = Registry::default();
        for i in 0..150 {
            registry.publish(format!("m{}", i), frame("x"), None);
        }

        let history = registry.history();
        assert_eq!(history.len(), 100);
        assert_eq!(history.first().unwrap(), "m50");
        assert_eq!(history.last().unwrap(), "m149");
        let expected: Vec<String> = (50..150).map(|i| format!("m{}", i)).collect();
        assert_eq!(history, expected);
    }

    #[test]
    fn test_greeting_sees_history_before_live_traffic() {
        let registry = Registry::default();
        registry.publish("m1".to_string(), frame("m1"), None);
        registry.publish("m2".to_string(), frame("m2"), None);

        let (alice, mut rx) = session("alice");
        assert!(registry.register(alice, |history| {
            vec![frame(&history.iter().cloned().collect::<Vec<_>>().join(","))]
        }));
        registry.publish("m3".to_string(), frame("m3"), None);

        assert_eq!(drain(&mut rx), vec!["m1,m2", "m3"]);
    }

    #[test]
    fn test_publish_skips_excluded() {
        let registry = Registry::default();
        let (alice, mut alice_rx) = session("alice");
        let (bob, mut bob_rx) = session("bob");
        let alice_id = alice.id;
        registry.register(alice, |_| Vec::new());
        registry.register(bob, |_| Vec::new());

        registry.publish("alice joined".to_string(), frame("j"), Some(alice_id));

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec!["j"]);
    }

    #[test]
    fn test_dead_session_pruned_without_aborting_fanout() {
        let registry = Registry::default();
        let (alice, alice_rx) = session("alice");
        let (bob, mut bob_rx) = session("bob");
        let (carol, mut carol_rx) = session("carol");
        registry.register(alice, |_| Vec::new());
        registry.register(bob, |_| Vec::new());
        registry.register(carol, |_| Vec::new());
        drop(alice_rx);

        let dead = registry.publish("bob: hi".to_string(), frame("hi"), None);

        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].nickname, "alice");
        assert_eq!(drain(&mut bob_rx), vec!["hi"]);
        assert_eq!(drain(&mut carol_rx), vec!["hi"]);
        assert_eq!(registry.nicknames(), vec!["bob", "carol"]);
    }

    #[test]
    fn test_backlogged_session_pruned() {
        let registry = Registry::default();
        let (alice, mut alice_rx) = session("alice");
        let (bob, _bob_rx) = session_with_queue("bob", 1);
        registry.register(alice, |_| Vec::new());
        registry.register(bob, |_| Vec::new());

        assert!(registry.publish("m1".to_string(), frame("m1"), None).is_empty());
        let dead = registry.publish("m2".to_string(), frame("m2"), None);

        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].nickname, "bob");
        assert_eq!(drain(&mut alice_rx), vec!["m1", "m2"]);
        assert_eq!(registry.nicknames(), vec!["alice"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::default();
        let (alice, _rx) = session("alice");
        let id = alice.id;
        registry.register(alice, |_| Vec::new());

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_refused_when_queue_closed() {
        let registry = Registry::default();
        let (alice, rx) = session("alice");
        drop(rx);

        assert!(!registry.register(alice, |_| vec![frame("welcome")]));
        assert!(registry.is_empty());
    }
}
