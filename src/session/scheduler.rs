use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::session::node_session::NodeSession;
use crate::session::SessionKey;
use crate::wire::Block;

/// Picks the next block to transmit across all sessions of a connection.
///
/// Control traffic of any session is served before application data of every
///  session. Within each class, sessions are visited round-robin from a
///  remembered cursor: the session after the last one served goes first, and
///  sessions with nothing ready are skipped without moving the cursor.
///  Selection never blocks.
pub struct Scheduler {
    cursor: usize,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { cursor: 0 }
    }

    pub fn select_next(
        &mut self,
        sessions: &mut BTreeMap<SessionKey, NodeSession>,
        max_block_size: usize,
        now: Instant,
    ) -> Option<(SessionKey, Block)> {
        let keys = sessions.keys().copied().collect::<Vec<_>>();
        if keys.is_empty() {
            return None;
        }
        if self.cursor >= keys.len() {
            self.cursor = 0;
        }

        for i in 0..keys.len() {
            let idx = (self.cursor + i) % keys.len();
            let key = keys[idx];
            if let Some(session) = sessions.get_mut(&key) {
                if let Some(block) = session.poll_control(now) {
                    self.cursor = (idx + 1) % keys.len();
                    return Some((key, block));
                }
            }
        }

        for i in 0..keys.len() {
            let idx = (self.cursor + i) % keys.len();
            let key = keys[idx];
            if let Some(session) = sessions.get_mut(&key) {
                if let Some(block) = session.poll_app_data(max_block_size, now) {
                    self.cursor = (idx + 1) % keys.len();
                    return Some((key, block));
                }
            }
        }
        None
    }

    /// earliest instant at which any session will have something to transmit
    pub fn next_deadline(
        sessions: &mut BTreeMap<SessionKey, NodeSession>,
        now: Instant,
    ) -> Option<Instant> {
        sessions
            .values_mut()
            .filter_map(|session| session.next_deadline(now))
            .min()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::config::ProtocolConfig;
    use crate::message::Priority;
    use crate::wire::{CtlKind, HelloKind};

    use super::*;

    const MAX_BLOCK: usize = 64;

    fn key(port: u16) -> SessionKey {
        SessionKey(([10, 0, 0, 1], port).into())
    }

    /// a session pair wired open, keyed under `local` in the scheduler's map
    fn open_session(local: u16, config: &Arc<ProtocolConfig>, now: Instant) -> NodeSession {
        let mut session = NodeSession::new(key(local), config.clone(), now);
        let mut peer = NodeSession::new(key(local + 1000), config.clone(), now);
        session.initiate();
        loop {
            let mut moved = false;
            while let Some(block) = session.poll_control(now) {
                peer.on_block(block, now);
                moved = true;
            }
            while let Some(block) = peer.poll_control(now) {
                session.on_block(block, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
        assert!(session.is_open());
        session
    }

    fn is_data(block: &Block) -> bool {
        matches!(block, Block::MessageData { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_returns_none() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut sessions = BTreeMap::new();
        assert!(scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_none());

        let config = Arc::new(ProtocolConfig::new(1));
        sessions.insert(key(1), open_session(1, &config, t0));
        // fully drained session: nothing to do until the next ping
        while scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_some() {}
        assert!(scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_across_sessions() {
        let t0 = Instant::now();
        let config = Arc::new(ProtocolConfig::new(1));
        let mut scheduler = Scheduler::new();
        let mut sessions = BTreeMap::new();
        for port in [1, 2, 3] {
            sessions.insert(key(port), open_session(port, &config, t0));
        }
        while scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_some() {}

        // every session has plenty of fragments pending
        for session in sessions.values_mut() {
            session.send(Bytes::from(vec![0u8; 500]), Priority::Normal, t0).unwrap();
        }
        // announcements first (control class), one per session in order
        let mut served = Vec::new();
        for _ in 0..6 {
            let (key, block) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
            if is_data(&block) {
                served.push(key);
            }
        }
        assert_eq!(served, vec![key(1), key(2), key(3)]);

        let (next, _) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(next, key(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipping_does_not_move_the_cursor() {
        let t0 = Instant::now();
        let config = Arc::new(ProtocolConfig::new(1));
        let mut scheduler = Scheduler::new();
        let mut sessions = BTreeMap::new();
        for port in [1, 2, 3] {
            sessions.insert(key(port), open_session(port, &config, t0));
        }
        while scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_some() {}

        // only session 2 has data
        sessions
            .get_mut(&key(2))
            .unwrap()
            .send(Bytes::from(vec![0u8; 200]), Priority::Normal, t0)
            .unwrap();

        let (served, _) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(served, key(2));
        let (served, _) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(served, key(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_preempts_application_data() {
        let t0 = Instant::now();
        let config = Arc::new(ProtocolConfig::new(1));
        let mut scheduler = Scheduler::new();
        let mut sessions = BTreeMap::new();
        for port in [1, 2] {
            sessions.insert(key(port), open_session(port, &config, t0));
        }
        while scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_some() {}

        // session 1 has a long-running transfer
        sessions
            .get_mut(&key(1))
            .unwrap()
            .send(Bytes::from(vec![0u8; 500]), Priority::Normal, t0)
            .unwrap();
        let (served, block) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(served, key(1));
        assert!(matches!(block, Block::MessageCtl { kind: CtlKind::New, .. }));

        // session 2 closes, its farewell jumps ahead of session 1's data
        sessions.get_mut(&key(2)).unwrap().close();
        let (served, block) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(served, key(2));
        assert!(matches!(block, Block::Hello { kind: HelloKind::Bye, .. }));

        let (served, _) = scheduler.select_next(&mut sessions, MAX_BLOCK, t0).unwrap();
        assert_eq!(served, key(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_tracks_the_earliest_session() {
        let t0 = Instant::now();
        let config = Arc::new(ProtocolConfig::new(1));
        let mut scheduler = Scheduler::new();
        let mut sessions = BTreeMap::new();
        sessions.insert(key(1), open_session(1, &config, t0));
        while scheduler.select_next(&mut sessions, MAX_BLOCK, t0).is_some() {}

        // quiet session: the next deadline is the ping
        let deadline = Scheduler::next_deadline(&mut sessions, t0).unwrap();
        assert_eq!(deadline, t0 + config.ping_interval);

        sessions
            .get_mut(&key(1))
            .unwrap()
            .send(Bytes::from_static(b"x"), Priority::Normal, t0)
            .unwrap();
        assert_eq!(Scheduler::next_deadline(&mut sessions, t0), Some(t0));
    }
}
