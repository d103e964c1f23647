/**
 * AGENT SESSION - Session de contrôle avec un WTP
 *
 * RÔLE :
 * Porte le handshake, la machine à états de connexion, le timer de vivacité
 * et l'écriture ordonnée des messages sortants d'un agent WTP.
 *
 * FONCTIONNEMENT :
 * - connect() : attend le Hello (Heartbeat toléré avant), enregistre le WTP,
 *   répond HelloAck, passe Active et démarre la tâche d'écriture
 * - Inbound::next() : séquence paresseuse des messages entrants ; chaque
 *   lecture est bornée par le timeout de vivacité
 * - fin de séquence (vivacité, transport, fermeture) : état Disconnected et
 *   entrée du registre marquée Disconnected (époque de la session uniquement)
 * - aucune reconnexion côté contrôleur : c'est toujours l'agent qui revient
 *
 * FSM :
 *   Disconnected -(TransportOpened)-> Handshaking -(HelloAccepted)-> Active
 *   Handshaking|Active -(CloseRequested)-> Draining -(Drained)-> Disconnected
 *   * -(LivenessExpired|TransportLost)-> Disconnected
 */

use crate::models::{ConnectionState, DeviceId, WtpAddr};
use crate::registry::SharedDeviceRegistry;
use crate::wire::{read_frame, write_frame, AgentMessage, ControllerMessage, Envelope, WireError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TransportOpened,
    HelloAccepted,
    CloseRequested,
    LivenessExpired,
    TransportLost,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition: {event:?} in state {from}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: SessionEvent,
}

/// Machine à états explicite, pilotable sans transport
#[derive(Debug, Clone)]
pub struct SessionFsm {
    state: ConnectionState,
}

impl SessionFsm {
    pub fn new() -> Self {
        Self { state: ConnectionState::Disconnected }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<ConnectionState, TransitionError> {
        use ConnectionState::*;
        use SessionEvent::*;

        let next = match (self.state, event) {
            (Disconnected, TransportOpened) => Handshaking,
            (Handshaking, HelloAccepted) => Active,
            (Handshaking | Active, CloseRequested) => Draining,
            (Draining, Drained) => Disconnected,
            (Handshaking | Active | Draining, LivenessExpired | TransportLost) => Disconnected,
            (from, event) => return Err(TransitionError { from, event }),
        };
        self.state = next;
        Ok(next)
    }

    /// Hello précède tout ; Heartbeat s'intercale partout
    pub fn admits(&self, message: &AgentMessage) -> bool {
        match (self.state, message) {
            (_, AgentMessage::Heartbeat { .. }) => self.state != ConnectionState::Disconnected,
            (ConnectionState::Handshaking, AgentMessage::Hello { .. }) => true,
            (ConnectionState::Active, AgentMessage::Hello { .. }) => false,
            (ConnectionState::Active, _) => true,
            (ConnectionState::Draining, AgentMessage::SessionClose { .. }) => true,
            _ => false,
        }
    }

    pub fn accepts_send(&self, message: &ControllerMessage) -> bool {
        match self.state {
            ConnectionState::Active => true,
            ConnectionState::Handshaking => matches!(
                message,
                ControllerMessage::HelloAck { .. } | ControllerMessage::Heartbeat
            ),
            ConnectionState::Draining | ConnectionState::Disconnected => false,
        }
    }
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub liveness_timeout: Duration,
    pub max_frame: usize,
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(10),
            max_frame: crate::wire::DEFAULT_MAX_FRAME,
            queue_depth: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no hello within {0:?}")]
    Timeout(Duration),
    #[error("expected hello, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("transport closed during handshake")]
    Closed,
    #[error(transparent)]
    Wire(WireError),
}

impl From<WireError> for HandshakeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Closed => HandshakeError::Closed,
            other => HandshakeError::Wire(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("session is {0}, not accepting this message")]
    NotAccepting(ConnectionState),
    #[error("outbound queue full")]
    QueueFull,
    #[error("transport closed")]
    TransportClosed,
}

struct SessionInner {
    device_id: DeviceId,
    addr: WtpAddr,
    epoch: u64,
    session_id: Uuid,
    fsm: Mutex<SessionFsm>,
    outbound: mpsc::Sender<ControllerMessage>,
    closed: watch::Sender<bool>,
    registry: SharedDeviceRegistry,
}

/// Poignée partagée (dispatcher, worker de session) vers une session vivante
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    pub fn addr(&self) -> WtpAddr {
        self.inner.addr
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.fsm.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Mise en file sans attente ; l'écriture se fait dans la tâche dédiée
    pub fn send(&self, message: ControllerMessage) -> Result<(), SendError> {
        {
            let fsm = self.inner.fsm.lock();
            if !fsm.accepts_send(&message) {
                return Err(SendError::NotAccepting(fsm.state()));
            }
        }
        if self.is_closed() {
            return Err(SendError::TransportClosed);
        }
        self.inner.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::TransportClosed,
        })
    }

    /// Passe en Draining, envoie SessionClose et arrête la lecture
    pub fn close(&self, reason: Option<String>) {
        let moved = self.inner.fsm.lock().apply(SessionEvent::CloseRequested).is_ok();
        if !moved {
            return;
        }
        info!("[session] closing {} ({})", self.inner.device_id, reason.as_deref().unwrap_or("no reason"));
        self.inner.registry.set_state(self.inner.device_id, self.inner.epoch, ConnectionState::Draining);
        if self.inner.outbound.try_send(ControllerMessage::SessionClose { reason }).is_err() {
            debug!("[session] could not queue session_close for {}", self.inner.device_id);
        }
        self.inner.closed.send_replace(true);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device_id", &self.inner.device_id)
            .field("epoch", &self.inner.epoch)
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

#[derive(Debug)]
pub enum InboundEvent {
    Message(AgentMessage),
    /// Message écarté (illisible ou hors séquence) ; la session continue
    Violation(WireError),
}

/// Côté lecture d'une session : séquence des messages de l'agent
pub struct Inbound<R> {
    reader: R,
    session: SessionHandle,
    closed: watch::Receiver<bool>,
    liveness: Duration,
    max_frame: usize,
    done: bool,
}

impl<R> std::fmt::Debug for Inbound<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("session", &self.session)
            .field("liveness", &self.liveness)
            .field("done", &self.done)
            .finish()
    }
}

enum ReadOutcome {
    Frame(Result<Envelope<AgentMessage>, WireError>),
    Expired,
    Closed,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub async fn next(&mut self) -> Option<InboundEvent> {
        if self.done {
            return None;
        }
        if *self.closed.borrow() {
            self.finish(SessionEvent::Drained);
            return None;
        }
        let liveness = self.liveness;
        let max_frame = self.max_frame;

        let outcome = {
            let closed = &mut self.closed;
            let reader = &mut self.reader;
            tokio::select! {
                biased;
                _ = closed.changed() => ReadOutcome::Closed,
                res = tokio::time::timeout(liveness, read_frame::<_, AgentMessage>(reader, max_frame)) => {
                    match res {
                        Ok(frame) => ReadOutcome::Frame(frame),
                        Err(_) => ReadOutcome::Expired,
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Frame(Ok(envelope)) => {
                let id = self.session.device_id();
                self.session.inner.registry.touch(id, self.session.epoch(), None);
                let message = envelope.body;
                if self.session.inner.fsm.lock().admits(&message) {
                    Some(InboundEvent::Message(message))
                } else {
                    Some(InboundEvent::Violation(WireError::OutOfOrder(message.kind())))
                }
            }
            ReadOutcome::Frame(Err(e)) if e.is_protocol() => Some(InboundEvent::Violation(e)),
            ReadOutcome::Frame(Err(e)) => {
                debug!("[session] transport error on {}: {}", self.session.device_id(), e);
                self.finish(SessionEvent::TransportLost);
                None
            }
            ReadOutcome::Expired => {
                warn!(
                    "[session] {} silent for {:?}, marking disconnected",
                    self.session.device_id(),
                    liveness
                );
                self.finish(SessionEvent::LivenessExpired);
                None
            }
            ReadOutcome::Closed => {
                self.finish(SessionEvent::Drained);
                None
            }
        }
    }

    fn finish(&mut self, event: SessionEvent) {
        self.done = true;
        let inner = &self.session.inner;
        {
            let mut fsm = inner.fsm.lock();
            if let Err(e) = fsm.apply(event) {
                // fermeture sans passage par Draining (échec d'écriture)
                debug!("[session] {}", e);
                let _ = fsm.apply(SessionEvent::TransportLost);
            }
        }
        inner.closed.send_replace(true);
        inner.registry.mark_disconnected(inner.device_id, inner.epoch);
    }
}

/// Handshake complet sur un transport fraîchement accepté
pub async fn connect<S>(
    stream: S,
    registry: SharedDeviceRegistry,
    config: &SessionConfig,
) -> Result<(SessionHandle, Inbound<ReadHalf<S>>), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut fsm = SessionFsm::new();
    fsm.apply(SessionEvent::TransportOpened).map_err(|_| HandshakeError::Closed)?;

    let hello = tokio::time::timeout(config.handshake_timeout, async {
        loop {
            let envelope: Envelope<AgentMessage> = read_frame(&mut reader, config.max_frame).await?;
            match envelope.body {
                AgentMessage::Hello { addr, elements, capacity } => {
                    return Ok::<_, HandshakeError>((addr, elements, capacity))
                }
                AgentMessage::Heartbeat { .. } => continue,
                other => return Err(HandshakeError::UnexpectedMessage(other.kind())),
            }
        }
    })
    .await
    .map_err(|_| HandshakeError::Timeout(config.handshake_timeout))??;

    let (addr, elements, capacity) = hello;
    let registration = registry.register(addr, elements, capacity);
    let session_id = Uuid::new_v4();

    let ack = ControllerMessage::HelloAck {
        device_id: registration.id,
        session_id: session_id.to_string(),
        liveness_ms: config.liveness_timeout.as_millis() as u64,
    };
    if let Err(e) = write_frame(&mut writer, &Envelope::new(0, ack)).await {
        registry.mark_disconnected(registration.id, registration.epoch);
        return Err(e.into());
    }

    fsm.apply(SessionEvent::HelloAccepted).map_err(|_| HandshakeError::Closed)?;
    registry.activate(registration.id, registration.epoch);

    let (outbound, rx) = mpsc::channel(config.queue_depth.max(1));
    let (closed, closed_rx) = watch::channel(false);
    let session = SessionHandle {
        inner: Arc::new(SessionInner {
            device_id: registration.id,
            addr,
            epoch: registration.epoch,
            session_id,
            fsm: Mutex::new(fsm),
            outbound,
            closed,
            registry,
        }),
    };
    spawn_writer(writer, rx, Arc::downgrade(&session.inner));

    info!("[session] {} ({}) active, session {}", registration.id, addr, session_id);
    let inbound = Inbound {
        reader,
        session: session.clone(),
        closed: closed_rx,
        liveness: config.liveness_timeout,
        max_frame: config.max_frame,
        done: false,
    };
    Ok((session, inbound))
}

/// Tâche d'écriture : sérialise la file sortante, numérote les trames.
/// S'arrête après SessionClose, sur erreur d'écriture ou quand plus personne
/// ne détient la session.
fn spawn_writer<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<ControllerMessage>,
    session: std::sync::Weak<SessionInner>,
) where
    S: AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let mut seq: u32 = 1;
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, ControllerMessage::SessionClose { .. });
            if let Err(e) = write_frame(&mut writer, &Envelope::new(seq, message)).await {
                debug!("[session] write failed: {}", e);
                if let Some(inner) = session.upgrade() {
                    inner.closed.send_replace(true);
                }
                break;
            }
            seq = seq.wrapping_add(1);
            if closing {
                let _ = writer.shutdown().await;
                break;
            }
        }
    });
}
