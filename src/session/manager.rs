use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::models::{
    generate_token, QueuedMessage, RejectReason, Rotation, Session, SessionStatus,
    TransitionToken,
};
use crate::config::SessionConfig;
use crate::error::SessionError;

/// Everything the manager guards with its single lock
#[derive(Debug, Default)]
struct SessionTables {
    sessions: HashMap<String, Session>,
    tokens: HashMap<String, TransitionToken>,
    /// Token values removed by garbage collection, with the reason they can
    /// never be redeemed again. Forgotten after `retired_retention`.
    retired_tokens: HashMap<String, RetiredToken>,
    queues: HashMap<String, Vec<QueuedMessage>>,
}

#[derive(Debug, Clone, Copy)]
struct RetiredToken {
    reason: RejectReason,
    retired_at: DateTime<Utc>,
}

impl SessionTables {
    /// Check-and-set redemption. Leaves every table untouched on rejection.
    fn redeem(
        &mut self,
        old_session: &str,
        new_session: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        let Some(entry) = self.tokens.get_mut(token) else {
            return Err(self
                .retired_tokens
                .get(token)
                .map(|retired| retired.reason)
                .unwrap_or(RejectReason::UnknownToken));
        };

        if entry.used {
            return Err(RejectReason::AlreadyUsed);
        }
        if entry.is_expired(now) {
            return Err(RejectReason::Expired);
        }
        if entry.old_session != old_session || entry.new_session != new_session {
            return Err(RejectReason::SessionMismatch);
        }

        entry.used = true;
        Ok(())
    }

    fn mark_invalidated(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.status = SessionStatus::Invalidated;
        }
    }
}

/// Counts of entries removed by one garbage collection pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GarbageReport {
    pub tokens: usize,
    pub sessions: usize,
    pub queues: usize,
    /// Retired token values old enough to be forgotten
    pub forgotten: usize,
}

/// Owns sessions, transition tokens and rotation queues.
///
/// Pure state machine: no I/O and no user-facing output. Every operation
/// takes the same lock, so `rotate`, `validate_transition`, `enqueue` and
/// `drain` are atomic with respect to each other.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    tables: Mutex<SessionTables>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            tables: Mutex::new(SessionTables::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn tables(&self) -> MutexGuard<'_, SessionTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seconds(value: u64) -> Duration {
        Duration::seconds(value.min(i64::MAX as u64 / 1000) as i64)
    }

    /// How long a spent token value is still recognised as a replay. Covers a
    /// full rotation interval plus one token lifetime after it was retired.
    fn retired_retention(&self) -> Duration {
        Self::seconds(self.config.rotation_interval.saturating_add(self.config.token_lifetime))
    }

    /// Allocate a new ACTIVE session for `peer_id` and return its id
    pub fn create_session(&self, peer_id: &str) -> String {
        let session_id = generate_token();
        let now = self.clock.now();
        self.tables()
            .sessions
            .insert(session_id.clone(), Session::new(peer_id, now));
        debug!(peer = %peer_id, "session created");
        session_id
    }

    /// True iff the session exists and is ACTIVE
    pub fn is_valid(&self, session_id: &str) -> bool {
        self.tables()
            .sessions
            .get(session_id)
            .is_some_and(Session::is_active)
    }

    /// Force a session to INVALIDATED. Unknown ids are ignored.
    pub fn invalidate(&self, session_id: &str) {
        self.tables().mark_invalidated(session_id);
    }

    /// True once the session is at least `rotation_interval` old
    pub fn rotation_due(&self, session_id: &str) -> bool {
        let now = self.clock.now();
        let interval = Self::seconds(self.config.rotation_interval);
        self.tables()
            .sessions
            .get(session_id)
            .is_some_and(|session| now - session.created_at >= interval)
    }

    /// Replace `old_session` with a fresh ACTIVE session for the same peer and
    /// mint the token that authorizes the handoff.
    pub fn rotate(&self, old_session: &str) -> Result<Rotation, SessionError> {
        let now = self.clock.now();
        let mut tables = self.tables();

        let current = tables
            .sessions
            .get(old_session)
            .ok_or(SessionError::NotFound)?;
        if !current.is_active() {
            return Err(SessionError::NotActive);
        }
        let peer_id = current.peer_id.clone();

        let new_session = generate_token();
        let token = generate_token();
        tables.tokens.insert(
            token.clone(),
            TransitionToken {
                token: token.clone(),
                old_session: old_session.to_string(),
                new_session: new_session.clone(),
                expires_at: now + Self::seconds(self.config.token_lifetime),
                used: false,
            },
        );
        tables.mark_invalidated(old_session);
        tables
            .sessions
            .insert(new_session.clone(), Session::new(peer_id, now));

        debug!("session rotated");
        Ok(Rotation { new_session, token })
    }

    /// Redeem `token` for exactly this old -> new transition.
    ///
    /// Fails without touching any state if the token is unknown, already used,
    /// expired, or bound to different sessions.
    pub fn validate_transition(
        &self,
        old_session: &str,
        new_session: &str,
        token: &str,
    ) -> Result<(), SessionError> {
        let now = self.clock.now();
        self.tables()
            .redeem(old_session, new_session, token, now)
            .map_err(SessionError::TransitionRejected)
    }

    /// Apply a rotation notice received from the remote end.
    ///
    /// A token this manager has never seen was minted by the peer; it is
    /// recorded against `current_session` with a fresh lifetime and then goes
    /// through the same redemption rules as a local token. On success
    /// `new_session` becomes ACTIVE here. Either way `current_session` is
    /// invalidated, because an authenticated notice means the peer has already
    /// left it.
    pub fn receive_transition(
        &self,
        current_session: &str,
        new_session: &str,
        token: &str,
    ) -> Result<(), SessionError> {
        let now = self.clock.now();
        let mut tables = self.tables();

        let known = tables.tokens.contains_key(token) || tables.retired_tokens.contains_key(token);
        if !known {
            let current = tables
                .sessions
                .get(current_session)
                .ok_or(SessionError::NotFound)?;
            if !current.is_active() {
                return Err(SessionError::NotActive);
            }
            if tables.sessions.contains_key(new_session) {
                tables.mark_invalidated(current_session);
                return Err(SessionError::TransitionRejected(RejectReason::SessionMismatch));
            }
            tables.tokens.insert(
                token.to_string(),
                TransitionToken {
                    token: token.to_string(),
                    old_session: current_session.to_string(),
                    new_session: new_session.to_string(),
                    expires_at: now + Self::seconds(self.config.token_lifetime),
                    used: false,
                },
            );
        }

        let verdict = tables.redeem(current_session, new_session, token, now);
        if verdict.is_ok() {
            let peer_id = tables
                .sessions
                .get(current_session)
                .map(|session| session.peer_id.clone())
                .ok_or(SessionError::NotFound)?;
            tables
                .sessions
                .entry(new_session.to_string())
                .or_insert_with(|| Session::new(peer_id, now));
        }
        tables.mark_invalidated(current_session);

        verdict.map_err(SessionError::TransitionRejected)
    }

    /// Queue a payload under `session_id`.
    ///
    /// Fails with `QueueFull` once the queue holds `max_queue_size` entries;
    /// the payload is not stored in that case.
    pub fn enqueue(&self, session_id: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let now = self.clock.now();
        let capacity = self.config.max_queue_size;
        let mut tables = self.tables();

        let queue = tables.queues.entry(session_id.to_string()).or_default();
        if queue.len() >= capacity {
            return Err(SessionError::QueueFull { capacity });
        }
        queue.push(QueuedMessage {
            payload,
            enqueued_at: now,
        });
        trace!(queued = queue.len(), "message queued for rotation");
        Ok(())
    }

    /// Take every queued payload no older than `max_queue_age` and discard
    /// the queue. A second call for the same id returns nothing.
    pub fn drain(&self, session_id: &str) -> Vec<Vec<u8>> {
        let now = self.clock.now();
        let max_age = Self::seconds(self.config.max_queue_age);

        let Some(queue) = self.tables().queues.remove(session_id) else {
            return Vec::new();
        };

        let total = queue.len();
        let fresh: Vec<Vec<u8>> = queue
            .into_iter()
            .filter(|message| now - message.enqueued_at <= max_age)
            .map(|message| message.payload)
            .collect();

        if fresh.len() < total {
            debug!(dropped = total - fresh.len(), "expired queued messages dropped");
        }
        fresh
    }

    /// Bump the operation counter of a session, if it exists
    pub fn record_operation(&self, session_id: &str) {
        if let Some(session) = self.tables().sessions.get_mut(session_id) {
            session.operation_count += 1;
        }
    }

    pub fn session_info(&self, session_id: &str) -> Option<Session> {
        self.tables().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.tables().sessions.len()
    }

    pub fn token_count(&self) -> usize {
        self.tables().tokens.len()
    }

    pub fn queue_count(&self) -> usize {
        self.tables().queues.len()
    }

    pub fn retired_token_count(&self) -> usize {
        self.tables().retired_tokens.len()
    }

    /// Drop tokens that can no longer be redeemed, invalidated sessions no
    /// live token refers to, and queues that only hold expired entries.
    ///
    /// Retired token values are remembered so a replayed notice is still
    /// rejected after its token entry is gone, until they are older than the
    /// retention window.
    pub fn collect_garbage(&self) -> GarbageReport {
        let now = self.clock.now();
        let max_age = Self::seconds(self.config.max_queue_age);
        let retention = self.retired_retention();
        let mut tables = self.tables();
        let mut report = GarbageReport::default();

        let dead_tokens: Vec<(String, RejectReason)> = tables
            .tokens
            .iter()
            .filter_map(|(value, token)| {
                if token.used {
                    Some((value.clone(), RejectReason::AlreadyUsed))
                } else if token.is_expired(now) {
                    Some((value.clone(), RejectReason::Expired))
                } else {
                    None
                }
            })
            .collect();
        let before = tables.retired_tokens.len();
        tables
            .retired_tokens
            .retain(|_, retired| now - retired.retired_at < retention);
        report.forgotten = before - tables.retired_tokens.len();

        for (value, reason) in dead_tokens {
            tables.tokens.remove(&value);
            tables.retired_tokens.insert(
                value,
                RetiredToken {
                    reason,
                    retired_at: now,
                },
            );
            report.tokens += 1;
        }

        let referenced: HashSet<String> = tables
            .tokens
            .values()
            .flat_map(|token| [token.old_session.clone(), token.new_session.clone()])
            .collect();
        let before = tables.sessions.len();
        tables
            .sessions
            .retain(|id, session| session.is_active() || referenced.contains(id));
        report.sessions = before - tables.sessions.len();

        let before = tables.queues.len();
        tables.queues.retain(|_, queue| {
            queue
                .iter()
                .any(|message| now - message.enqueued_at <= max_age)
        });
        report.queues = before - tables.queues.len();

        if report != GarbageReport::default() {
            debug!(
                tokens = report.tokens,
                sessions = report.sessions,
                queues = report.queues,
                forgotten = report.forgotten,
                "session garbage collected"
            );
        }
        report
    }
}
