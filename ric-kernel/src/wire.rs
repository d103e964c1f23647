/**
 * WIRE - Protocole du canal de contrôle contrôleur ↔ WTP
 *
 * RÔLE :
 * Définit les messages échangés avec les agents WTP et leur encodage sur le
 * transport (TCP en production, flux mémoire en test).
 *
 * FONCTIONNEMENT :
 * - Trame = longueur u32 big-endian + enveloppe JSON {version, seq, xid, body}
 * - `body` est un enum tagué par `type` (hello, heartbeat, telemetry_report...)
 * - Hello précède tout autre message d'une session, Heartbeat peut s'intercaler partout
 * - Une trame illisible est une violation de protocole (la trame est consommée,
 *   le flux reste synchronisé) ; EOF / IO / longueur hors borne = erreur transport
 */

use crate::models::{DeviceId, Dscp, Element, ElementKind, SliceId, WtpAddr};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unexpected {0} message")]
    OutOfOrder(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Vrai si l'erreur concerne un message isolé (le transport reste utilisable)
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            WireError::Malformed(_) | WireError::Version(_) | WireError::OutOfOrder(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<B> {
    pub version: u8,
    pub seq: u32,
    #[serde(default)]
    pub xid: u32,
    pub body: B,
}

impl<B> Envelope<B> {
    pub fn new(seq: u32, body: B) -> Self {
        Self { version: PROTOCOL_VERSION, seq, xid: 0, body }
    }
}

/// Entrée de la table DSCP remontée par l'élément DSCP-Stat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DscpMapEntry {
    pub code: Dscp,
    pub packets: u64,
    pub bytes: u64,
    #[serde(default)]
    pub avg_packet_size: u32,
}

/// Messages agent → contrôleur
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Hello {
        addr: WtpAddr,
        elements: Vec<Element>,
        #[serde(default)]
        capacity: Option<u32>,
    },
    Heartbeat {
        #[serde(default)]
        capacity: Option<u32>,
    },
    TelemetryReport {
        /// Fenêtre de mesure ; 0 = compteurs cumulatifs
        window_ms: u64,
        entries: Vec<DscpMapEntry>,
    },
    SessionClose {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Hello { .. } => "hello",
            AgentMessage::Heartbeat { .. } => "heartbeat",
            AgentMessage::TelemetryReport { .. } => "telemetry_report",
            AgentMessage::SessionClose { .. } => "session_close",
        }
    }
}

/// Commande d'enforcement dérivée à chaque tick (jamais persistée)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EnforcementCommand {
    InstallRule {
        dscp: Dscp,
        slice: SliceId,
        #[serde(default)]
        tos: Option<u8>,
    },
    RemoveRule {
        dscp: Dscp,
    },
    SetShare {
        slice: SliceId,
        share: u32,
    },
    RemoveShare {
        slice: SliceId,
    },
}

impl EnforcementCommand {
    pub fn required_element(&self) -> ElementKind {
        match self {
            EnforcementCommand::InstallRule { .. } | EnforcementCommand::RemoveRule { .. } => {
                ElementKind::TrafficRules
            }
            EnforcementCommand::SetShare { .. } | EnforcementCommand::RemoveShare { .. } => {
                ElementKind::SliceQuantum
            }
        }
    }
}

/// Messages contrôleur → agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    HelloAck {
        device_id: DeviceId,
        session_id: String,
        liveness_ms: u64,
    },
    Heartbeat,
    DscpStatsRequest,
    Enforcement {
        command: EnforcementCommand,
    },
    SessionClose {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ControllerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::HelloAck { .. } => "hello_ack",
            ControllerMessage::Heartbeat => "heartbeat",
            ControllerMessage::DscpStatsRequest => "dscp_stats_request",
            ControllerMessage::Enforcement { .. } => "enforcement",
            ControllerMessage::SessionClose { .. } => "session_close",
        }
    }
}

pub fn encode_frame<B: Serialize>(envelope: &Envelope<B>) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(envelope)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub async fn write_frame<W, B>(writer: &mut W, envelope: &Envelope<B>) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    B: Serialize,
{
    let bytes = encode_frame(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, B>(reader: &mut R, max_frame: usize) -> Result<Envelope<B>, WireError>
where
    R: AsyncRead + Unpin,
    B: DeserializeOwned,
{
    let len = reader.read_u32().await.map_err(eof_as_closed)? as usize;
    if len > max_frame {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof_as_closed)?;

    let envelope: Envelope<B> = serde_json::from_slice(&buf)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(WireError::Version(envelope.version));
    }
    Ok(envelope)
}

fn eof_as_closed(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Closed
    } else {
        WireError::Io(e)
    }
}
