//! Connection session: bridges one WebSocket to its room hub.
//!
//! A session persists its presence row before it is usable, joins the hub,
//! then runs two pumps. The inbound pump reads frames and publishes chat
//! lines; the outbound pump drains the session's queue onto the socket and
//! keeps the connection alive with pings. Whichever pump ends first ends
//! the session, and the presence row is removed exactly once on the way out.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use huddle_core::ids::TokenError;
use huddle_core::{RoomId, SessionToken, UserId, WireEvent};
use huddle_store::{ChatStore, StoreError};

use crate::config::SessionConfig;
use crate::hub::{Hub, HubError, Member, Payload};
use crate::manager::HubManager;
use crate::metrics::{MESSAGES_TOTAL, SESSIONS_ACTIVE, SESSIONS_TOTAL, STORE_ERRORS_TOTAL};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("presence row not persisted: {0}")]
    Persist(#[source] StoreError),
    #[error("room unavailable: {0}")]
    Unavailable(#[from] HubError),
}

/// Who is connecting, and to which room. Produced by the front door.
#[derive(Clone, Debug)]
pub struct Admission {
    pub user_id: UserId,
    pub username: String,
    pub room_id: RoomId,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub manager: HubManager,
    pub store: Arc<dyn ChatStore>,
    pub config: Arc<SessionConfig>,
}

#[derive(Clone, Copy, Debug)]
pub struct PumpTiming {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
}

impl From<&SessionConfig> for PumpTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            pong_wait: config.pong_wait(),
            write_timeout: config.write_timeout(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundExit {
    /// Close frame or end of stream.
    Closed,
    /// No frame arrived within the read deadline.
    ReadDeadline,
    TransportError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundExit {
    /// The hub dropped the queue; a close frame was sent.
    QueueClosed,
    WriteTimeout,
    TransportError,
    /// Did not finish flushing in time after the session ended.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionEnd {
    /// `None` when the outbound pump ended first.
    pub inbound: Option<InboundExit>,
    pub outbound: OutboundExit,
}

pub struct Session {
    admission: Admission,
    token: SessionToken,
    deps: SessionDeps,
    guard: PresenceGuard,
    span: Span,
}

impl Session {
    /// Generate a token and persist the presence row. A failure here means
    /// the connection must be closed without joining any hub.
    pub async fn open(deps: SessionDeps, admission: Admission) -> Result<Self, SessionError> {
        let token = SessionToken::generate()?;
        deps.store
            .create_session(admission.user_id, admission.room_id, &token)
            .await
            .map_err(SessionError::Persist)?;

        let span = info_span!(
            "session",
            room_id = %admission.room_id,
            user_id = %admission.user_id,
            session_token = %token,
        );
        let guard = PresenceGuard::new(
            Arc::clone(&deps.store),
            admission.user_id,
            admission.room_id,
            token.clone(),
        );
        Ok(Self {
            admission,
            token,
            deps,
            guard,
            span,
        })
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub async fn run(self, socket: WebSocket) -> Result<SessionEnd, SessionError> {
        let (sink, stream) = socket.split();
        self.serve(sink, stream).await
    }

    /// Admit to the hub and pump until either side ends.
    pub async fn serve<Si, St, E>(self, mut sink: Si, stream: St) -> Result<SessionEnd, SessionError>
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let Session {
            admission,
            token,
            deps,
            mut guard,
            span,
        } = self;

        async move {
            let (hub, queue) = match admit(&deps, &admission, &token).await {
                Ok(admitted) => admitted,
                Err(e) => {
                    warn!(error = %e, "admission failed");
                    guard.finish().await;
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(e.into());
                }
            };
            guard.attach(hub.clone());
            counter!(SESSIONS_TOTAL).increment(1);
            gauge!(SESSIONS_ACTIVE).increment(1.0);
            info!("session admitted");

            let timing = PumpTiming::from(deps.config.as_ref());
            let mut outbound = tokio::spawn(run_outbound(sink, queue, timing).in_current_span());
            let ctx = InboundCtx {
                store: Arc::clone(&deps.store),
                hub,
                user_id: admission.user_id,
                username: admission.username.clone(),
                room_id: admission.room_id,
                token: token.clone(),
            };

            let (inbound_exit, outbound_exit) = tokio::select! {
                exit = run_inbound(stream, &ctx, timing.pong_wait) => (Some(exit), None),
                joined = &mut outbound => (None, Some(joined.unwrap_or(OutboundExit::Aborted))),
            };

            // Dropping the hub's sender lets the writer flush and send Close.
            guard.finish().await;

            let outbound_exit = match outbound_exit {
                Some(exit) => exit,
                None => match timeout(timing.write_timeout, &mut outbound).await {
                    Ok(joined) => joined.unwrap_or(OutboundExit::Aborted),
                    Err(_) => {
                        outbound.abort();
                        OutboundExit::Aborted
                    }
                },
            };

            gauge!(SESSIONS_ACTIVE).decrement(1.0);
            info!(?inbound_exit, ?outbound_exit, "session ended");
            Ok(SessionEnd {
                inbound: inbound_exit,
                outbound: outbound_exit,
            })
        }
        .instrument(span)
        .await
    }
}

/// Join the room's hub, retrying when admission races a hub shutdown.
/// Each attempt uses a fresh queue; the hub keeps the only strong sender and
/// queues presence and history before returning.
async fn admit(
    deps: &SessionDeps,
    admission: &Admission,
    token: &SessionToken,
) -> Result<(Hub, mpsc::Receiver<Payload>), HubError> {
    let attempts = deps.config.admit_attempts.max(1);
    let mut last = HubError::ShuttingDown(admission.room_id);
    for attempt in 1..=attempts {
        let hub = deps.manager.get_or_create(admission.room_id);
        let (tx, rx) = mpsc::channel(deps.config.send_queue_capacity.max(1));
        let member = Member::new(token.clone(), admission.user_id, tx)
            .with_history(deps.config.history_limit);
        match hub.admit(member).await {
            Ok(()) => return Ok((hub, rx)),
            Err(e) => {
                debug!(attempt, error = %e, "admission raced hub shutdown");
                last = e;
            }
        }
    }
    Err(last)
}

struct InboundCtx {
    store: Arc<dyn ChatStore>,
    hub: Hub,
    user_id: UserId,
    username: String,
    room_id: RoomId,
    token: SessionToken,
}

impl InboundCtx {
    async fn handle_chat(&self, text: &str) {
        if let Err(e) = self
            .store
            .touch_session(self.user_id, self.room_id, &self.token)
            .await
        {
            counter!(STORE_ERRORS_TOTAL, "op" => "touch_session").increment(1);
            warn!(error = %e, "presence touch failed");
        }
        if let Err(e) = self
            .store
            .save_message(self.user_id, self.room_id, text)
            .await
        {
            counter!(STORE_ERRORS_TOTAL, "op" => "save_message").increment(1);
            warn!(error = %e, "message not persisted");
        }
        counter!(MESSAGES_TOTAL).increment(1);

        match WireEvent::chat(text, self.username.as_str(), Utc::now()).to_json() {
            Ok(json) => self.hub.publish(Payload::from(json)),
            Err(e) => warn!(error = %e, "chat serialization failed"),
        }
    }
}

/// Read frames until close, error, or the read deadline. Any frame pushes
/// the deadline out by `pong_wait`.
async fn run_inbound<St, E>(mut stream: St, ctx: &InboundCtx, pong_wait: Duration) -> InboundExit
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!("read deadline expired");
                return InboundExit::ReadDeadline;
            }
            Ok(None) => return InboundExit::Closed,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                return InboundExit::TransportError;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        deadline = Instant::now() + pong_wait;

        let text = match &frame {
            Message::Text(text) => text.as_str(),
            Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => return InboundExit::Closed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if text.trim().is_empty() {
            continue;
        }
        ctx.handle_chat(text).await;
    }
}

/// Drain the queue onto the socket, pinging every `ping_interval`. A closed
/// queue ends the pump with a close frame.
async fn run_outbound<Si>(
    mut sink: Si,
    mut queue: mpsc::Receiver<Payload>,
    timing: PumpTiming,
) -> OutboundExit
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = tokio::time::interval(timing.ping_interval);
    ping.tick().await; // consume first immediate tick

    loop {
        let frame = tokio::select! {
            next = queue.recv() => match next {
                Some(payload) => Message::Text(String::from(&*payload).into()),
                None => {
                    let _ = write(&mut sink, Message::Close(None), timing.write_timeout).await;
                    return OutboundExit::QueueClosed;
                }
            },
            _ = ping.tick() => Message::Ping(vec![].into()),
        };
        if let Err(exit) = write(&mut sink, frame, timing.write_timeout).await {
            return exit;
        }
    }
}

async fn write<Si>(sink: &mut Si, frame: Message, limit: Duration) -> Result<(), OutboundExit>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "write failed");
            Err(OutboundExit::TransportError)
        }
        Err(_) => {
            debug!(timeout_secs = limit.as_secs(), "write timed out");
            Err(OutboundExit::WriteTimeout)
        }
    }
}

/// Removes the presence row and leaves the hub exactly once. `finish` is the
/// normal path; dropping an unfinished guard schedules the same cleanup.
struct PresenceGuard {
    store: Arc<dyn ChatStore>,
    user_id: UserId,
    room_id: RoomId,
    token: SessionToken,
    hub: Option<Hub>,
    armed: bool,
}

impl PresenceGuard {
    fn new(store: Arc<dyn ChatStore>, user_id: UserId, room_id: RoomId, token: SessionToken) -> Self {
        Self {
            store,
            user_id,
            room_id,
            token,
            hub: None,
            armed: true,
        }
    }

    fn attach(&mut self, hub: Hub) {
        self.hub = Some(hub);
    }

    async fn finish(mut self) {
        self.armed = false;
        release(
            Arc::clone(&self.store),
            self.user_id,
            self.room_id,
            self.token.clone(),
            self.hub.take(),
        )
        .await;
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let cleanup = release(
            Arc::clone(&self.store),
            self.user_id,
            self.room_id,
            self.token.clone(),
            self.hub.take(),
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup);
            }
            Err(_) => warn!(
                session_token = %self.token,
                "no runtime for session cleanup, leaving row to the staleness purge"
            ),
        }
    }
}

/// Row first, so the hub's presence recompute no longer sees this session.
async fn release(
    store: Arc<dyn ChatStore>,
    user_id: UserId,
    room_id: RoomId,
    token: SessionToken,
    hub: Option<Hub>,
) {
    if let Err(e) = store.remove_session(user_id, room_id, &token).await {
        counter!(STORE_ERRORS_TOTAL, "op" => "remove_session").increment(1);
        warn!(error = %e, "presence row not removed");
    }
    if let Some(hub) = hub {
        hub.remove(&token);
    }
}
