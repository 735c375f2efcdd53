use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handler::SessionContext;
use super::messages::{CloseReason, Outbound, SampleView};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const REPLY_CAPACITY: usize = 32;

/// Frame-level seam between a client session and whatever carries it.
#[async_trait]
pub trait ClientTransport: Send {
    /// Next inbound text frame. `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn send(&mut self, message: &Outbound) -> Result<()>;

    async fn close(&mut self, reason: CloseReason) -> Result<()>;
}

/// Drives one client from accept to teardown: role resolution, the
/// `connection_established` greeting, then telemetry and command replies
/// interleaved until the peer leaves or `shutdown` fires.
pub async fn run_session<T: ClientTransport>(
    mut transport: T,
    identity: Option<String>,
    ctx: SessionContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let session = match ctx.accept(identity.as_deref()).await {
        Ok(session) => session,
        Err(reason) => return transport.close(reason).await,
    };

    let mut subscription = ctx.engine.hub.subscribe(session.id);
    let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_CAPACITY);

    let mut outcome = transport.send(&ctx.established(&session)).await;
    let mut close_with = None;

    while outcome.is_ok() {
        tokio::select! {
            _ = shutdown.cancelled() => {
                close_with = Some(CloseReason::Normal);
                break;
            }
            frame = transport.recv() => match frame {
                Some(Ok(text)) => {
                    let reply = ctx.dispatch(&session, &text, &reply_tx).await;
                    outcome = transport.send(&reply).await;
                }
                Some(Err(err)) => {
                    log_warn!("Receive error on session {}: {err:#}", session.id);
                    break;
                }
                None => break,
            },
            sample = subscription.recv() => match sample {
                Some(sample) => {
                    let data = Outbound::Data { data: SampleView::for_role(&sample, session.role) };
                    outcome = transport.send(&data).await;
                }
                None => {
                    close_with = Some(CloseReason::InternalError);
                    outcome = Err(anyhow!("subscription closed"));
                }
            },
            Some(reply) = reply_rx.recv() => {
                outcome = transport.send(&reply).await;
            }
        }
    }

    // Leave the hub before the transport goes away.
    drop(subscription);

    if let Some(reason) = close_with {
        if let Err(err) = transport.close(reason).await {
            log_debug!("Close frame not delivered to session {}: {err:#}", session.id);
        }
    }

    log_info!(
        "Client session {} for {} ended",
        session.id,
        session.identity
    );
    outcome
}

/// In-process transport over two channels. The far end is a
/// [`ChannelPeer`].
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::UnboundedSender<PeerEvent>,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Message(Outbound),
    Closed(CloseReason),
}

/// Client side of a [`ChannelTransport`].
pub struct ChannelPeer {
    pub frames: mpsc::Sender<String>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelPeer) {
        let (frames_tx, frames_rx) = mpsc::channel(REPLY_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: frames_rx,
                outbound: events_tx,
            },
            ChannelPeer {
                frames: frames_tx,
                events: events_rx,
            },
        )
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, message: &Outbound) -> Result<()> {
        self.outbound
            .send(PeerEvent::Message(message.clone()))
            .map_err(|_| anyhow!("peer dropped"))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        self.outbound
            .send(PeerEvent::Closed(reason))
            .map_err(|_| anyhow!("peer dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::session::role::{Role, UserDirectory};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn context() -> SessionContext {
        let directory = Arc::new(UserDirectory::with_users([
            ("olga".to_string(), Role::Operator),
            ("ada".to_string(), Role::Admin),
        ]));
        SessionContext::new(Engine::default(), directory.clone(), directory)
    }

    async fn next_message(peer: &mut ChannelPeer) -> Outbound {
        match timeout(Duration::from_secs(5), peer.events.recv()).await {
            Ok(Some(PeerEvent::Message(message))) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn anonymous_client_is_closed_with_4001() {
        let ctx = context();
        let (transport, mut peer) = ChannelTransport::pair();
        run_session(transport, None, ctx.clone(), CancellationToken::new())
            .await
            .unwrap();

        match peer.events.recv().await {
            Some(PeerEvent::Closed(reason)) => assert_eq!(reason.code(), 4001),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.engine.hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn session_greets_answers_and_unsubscribes_on_disconnect() {
        let ctx = context();
        let (transport, mut peer) = ChannelTransport::pair();
        let task = tokio::spawn(run_session(
            transport,
            Some("olga".into()),
            ctx.clone(),
            CancellationToken::new(),
        ));

        match next_message(&mut peer).await {
            Outbound::ConnectionEstablished { user, role, .. } => {
                assert_eq!(user, "olga");
                assert_eq!(role, Role::Operator);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.engine.hub.subscriber_count(), 1);

        peer.frames
            .send(r#"{"action":"get_status"}"#.into())
            .await
            .unwrap();
        assert!(matches!(next_message(&mut peer).await, Outbound::Status(_)));

        drop(peer.frames);
        task.await.unwrap().unwrap();
        assert_eq!(ctx.engine.hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_with_normal_code() {
        let ctx = context();
        let shutdown = CancellationToken::new();
        let (transport, mut peer) = ChannelTransport::pair();
        let task = tokio::spawn(run_session(
            transport,
            Some("ada".into()),
            ctx,
            shutdown.clone(),
        ));

        next_message(&mut peer).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        match peer.events.recv().await {
            Some(PeerEvent::Closed(reason)) => assert_eq!(reason, CloseReason::Normal),
            other => panic!("unexpected {other:?}"),
        }
    }
}
