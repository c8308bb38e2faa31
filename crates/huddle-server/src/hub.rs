//! Room hub: one actor per room owning membership and fan-out.
//!
//! Every admit, remove, and publish for a room is processed serially by the
//! hub's control loop. Each member's outbound queue is bounded; the hub holds
//! the only strong sender, so dropping a member closes its queue and ends the
//! session's outbound pump.
//!
//! A new member's queue receives presence, then its history replay, before
//! any later broadcast. The loop alone decides whether an empty hub may stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

use huddle_core::{RoomId, SessionToken, UserId, WireEvent};
use huddle_store::ChatStore;

use crate::metrics::{HUB_BROADCASTS_TOTAL, HUB_EVICTIONS_TOTAL, STORE_ERRORS_TOTAL};

/// A serialized frame shared by every recipient of one broadcast.
pub type Payload = Arc<str>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("room {0} is shutting down")]
    ShuttingDown(RoomId),
}

/// A session as seen by its hub.
pub struct Member {
    token: SessionToken,
    user_id: UserId,
    tx: mpsc::Sender<Payload>,
    history: u32,
}

impl Member {
    /// `tx` must be the only strong sender for the session's queue.
    pub fn new(token: SessionToken, user_id: UserId, tx: mpsc::Sender<Payload>) -> Self {
        Self {
            token,
            user_id,
            tx,
            history: 0,
        }
    }

    /// Replay up to `limit` recent messages to this member on admission.
    pub fn with_history(mut self, limit: u32) -> Self {
        self.history = limit;
        self
    }
}

enum Command {
    Admit {
        member: Member,
        ack: oneshot::Sender<()>,
    },
    Remove {
        token: SessionToken,
    },
    Publish {
        payload: Payload,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SessionToken>>,
    },
    ShutdownIfIdle {
        idle_after: Duration,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Lock-free view of a hub, readable without entering its loop.
#[derive(Debug)]
struct HubState {
    members: AtomicUsize,
    shutting_down: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl HubState {
    fn new() -> Self {
        Self {
            members: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    room_id: RoomId,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<HubState>,
}

impl Hub {
    /// Start the control loop inside `span`. The loop exits on `shutdown()` or
    /// once every handle is dropped.
    pub fn spawn(room_id: RoomId, store: Arc<dyn ChatStore>, span: Span) -> (Hub, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(HubState::new());
        let hub_loop = HubLoop {
            room_id,
            store,
            state: Arc::clone(&state),
            members: HashMap::new(),
        };
        let handle = tokio::spawn(hub_loop.run(rx).instrument(span));
        (
            Hub {
                room_id,
                commands,
                state,
            },
            handle,
        )
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Resolves once the member is in the set, presence has been broadcast,
    /// and its history is queued.
    pub async fn admit(&self, member: Member) -> Result<(), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown(self.room_id));
        }
        let (ack, admitted) = oneshot::channel();
        self.commands
            .send(Command::Admit { member, ack })
            .map_err(|_| HubError::ShuttingDown(self.room_id))?;
        admitted
            .await
            .map_err(|_| HubError::ShuttingDown(self.room_id))
    }

    /// Idempotent. Always triggers a presence rebroadcast.
    pub fn remove(&self, token: &SessionToken) {
        let _ = self.commands.send(Command::Remove {
            token: token.clone(),
        });
    }

    pub fn publish(&self, payload: Payload) {
        let _ = self.commands.send(Command::Publish { payload });
    }

    /// Terminal and idempotent. Admissions are refused from this call on.
    pub fn shutdown(&self) {
        if !self.state.shutting_down.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Shutdown);
        }
    }

    /// Stop the loop if it has no members and has been idle for at least
    /// `idle_after`, decided inside the loop so no admission can slip in
    /// between. True when the hub is stopped.
    pub async fn shutdown_if_idle(&self, idle_after: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ShutdownIfIdle { idle_after, reply })
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Tokens of the current members, in no particular order. Empty once the
    /// loop has stopped.
    pub async fn members(&self) -> Vec<SessionToken> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn member_count(&self) -> usize {
        self.state.members.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.load(Ordering::SeqCst)
    }

    /// Time since the last admit, member removal, or publish.
    pub fn idle_for(&self) -> Duration {
        self.state.last_activity.lock().elapsed()
    }

    /// Whether both handles drive the same loop.
    pub fn same_hub(&self, other: &Hub) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Resolves when the control loop has exited.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }
}

struct HubLoop {
    room_id: RoomId,
    store: Arc<dyn ChatStore>,
    state: Arc<HubState>,
    members: HashMap<SessionToken, Member>,
}

impl HubLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("hub started");
        while let Some(command) = commands.recv().await {
            match command {
                Command::Admit { member, ack } => {
                    if self.state.shutting_down.load(Ordering::SeqCst) {
                        // Dropping `ack` tells the caller to retry elsewhere.
                        debug!(session_token = %member.token, "admission refused, hub shutting down");
                        continue;
                    }
                    self.admit(member).await;
                    let _ = ack.send(());
                }
                Command::Remove { token } => self.remove(&token).await,
                Command::Publish { payload } => {
                    self.state.touch();
                    self.fan_out(&payload);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.members.keys().cloned().collect());
                }
                Command::ShutdownIfIdle { idle_after, reply } => {
                    let idle = self.members.is_empty()
                        && self.state.last_activity.lock().elapsed() >= idle_after;
                    if idle {
                        self.state.shutting_down.store(true, Ordering::SeqCst);
                    }
                    let _ = reply.send(idle);
                    if idle {
                        debug!(idle_secs = idle_after.as_secs(), "idle hub stopping");
                        break;
                    }
                }
                Command::Shutdown => break,
            }
        }

        self.state.shutting_down.store(true, Ordering::SeqCst);
        let closed = self.members.len();
        self.members.clear();
        self.sync_count();
        info!(closed_sessions = closed, "hub stopped");
    }

    async fn admit(&mut self, member: Member) {
        debug!(session_token = %member.token, user_id = %member.user_id, "session admitted");
        let token = member.token.clone();
        let history = member.history;
        self.members.insert(token.clone(), member);
        self.sync_count();
        self.state.touch();
        self.broadcast_presence().await;
        self.replay_history(&token, history).await;
    }

    /// Queue recent messages, oldest first, for one member only. Stops at the
    /// first full queue and leaves the member in place.
    async fn replay_history(&self, token: &SessionToken, limit: u32) {
        let Some(member) = self.members.get(token).filter(|_| limit > 0) else {
            return;
        };
        let messages = match self.store.recent_messages(self.room_id, limit).await {
            Ok(messages) => messages,
            Err(e) => {
                counter!(STORE_ERRORS_TOTAL, "op" => "recent_messages").increment(1);
                warn!(error = %e, "history load failed");
                return;
            }
        };
        for message in &messages {
            let payload = match WireEvent::history(message).to_json() {
                Ok(json) => Payload::from(json),
                Err(e) => {
                    warn!(error = %e, "history serialization failed");
                    return;
                }
            };
            if member.tx.try_send(payload).is_err() {
                debug!(session_token = %token, "history replay stopped, queue full or closed");
                return;
            }
        }
        debug!(session_token = %token, replayed = messages.len(), "history replayed");
    }

    async fn remove(&mut self, token: &SessionToken) {
        if self.members.remove(token).is_some() {
            debug!(session_token = %token, "session removed");
            self.sync_count();
            self.state.touch();
        }
        self.broadcast_presence().await;
    }

    async fn broadcast_presence(&mut self) {
        if self.members.is_empty() {
            return;
        }
        let users = match self.store.list_active_users(self.room_id).await {
            Ok(users) => users,
            Err(e) => {
                counter!(STORE_ERRORS_TOTAL, "op" => "list_active_users").increment(1);
                warn!(error = %e, "presence fetch failed, skipping broadcast");
                return;
            }
        };
        match WireEvent::presence(users, Utc::now()).to_json() {
            Ok(json) => self.fan_out(&Payload::from(json)),
            Err(e) => warn!(error = %e, "presence serialization failed"),
        }
    }

    /// Non-blocking enqueue to every member; full or closed queues are evicted.
    fn fan_out(&mut self, payload: &Payload) {
        let before = self.members.len();
        self.members
            .retain(|token, member| match member.tx.try_send(Arc::clone(payload)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(session_token = %token, "outbound queue full, evicting slow session");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_token = %token, "outbound queue closed, dropping session");
                    false
                }
            });
        counter!(HUB_BROADCASTS_TOTAL).increment(1);

        let evicted = before - self.members.len();
        if evicted > 0 {
            counter!(HUB_EVICTIONS_TOTAL).increment(evicted as u64);
            self.sync_count();
        }
    }

    fn sync_count(&self) {
        self.state.members.store(self.members.len(), Ordering::SeqCst);
    }
}
