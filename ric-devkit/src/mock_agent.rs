/*!
Agent WTP simulé pour tests sans réseau

Parle le protocole du canal de contrôle sur un flux mémoire (`tokio::io::duplex`) :
Hello, rapports DSCP, heartbeats, fermeture. Enregistre les commandes
d'enforcement reçues pour les assertions.
*/

use anyhow::{bail, Context, Result};
use ric_kernel::models::{DeviceId, Element, WtpAddr};
use ric_kernel::wire::{
    read_frame, write_frame, AgentMessage, ControllerMessage, EnforcementCommand, Envelope, WireError,
    DEFAULT_MAX_FRAME,
};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use crate::builders::WireMessageBuilder;

pub struct MockAgent {
    stream: DuplexStream,
    seq: u32,
    device_id: Option<DeviceId>,
    /// Tout ce que le contrôleur a envoyé, dans l'ordre de réception
    received: Vec<ControllerMessage>,
}

impl MockAgent {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream, seq: 0, device_id: None, received: Vec::new() }
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    pub fn received(&self) -> &[ControllerMessage] {
        &self.received
    }

    /// Handshake complet : Hello puis attente du HelloAck
    pub async fn hello(&mut self, addr: WtpAddr, elements: Vec<Element>, capacity: Option<u32>) -> Result<DeviceId> {
        self.send(AgentMessage::Hello { addr, elements, capacity }).await?;
        match self.recv(Duration::from_secs(2)).await? {
            Some(ControllerMessage::HelloAck { device_id, .. }) => {
                log::info!("🤝 [MOCK] {} registered as {}", addr, device_id);
                self.device_id = Some(device_id);
                Ok(device_id)
            }
            Some(other) => bail!("expected hello_ack, got {}", other.kind()),
            None => bail!("no hello_ack from controller"),
        }
    }

    pub async fn send(&mut self, message: AgentMessage) -> Result<()> {
        self.seq += 1;
        write_frame(&mut self.stream, &Envelope::new(self.seq, message))
            .await
            .context("agent write failed")?;
        Ok(())
    }

    /// Trame brute préfixée de sa longueur (pour provoquer des violations)
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Rapport DSCP fenêtré : (code, paquets, octets)
    pub async fn report(&mut self, window_ms: u64, entries: &[(u8, u64, u64)]) -> Result<()> {
        self.send(WireMessageBuilder::report(window_ms, entries)).await
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send(AgentMessage::Heartbeat { capacity: None }).await
    }

    pub async fn close(&mut self, reason: &str) -> Result<()> {
        self.send(AgentMessage::SessionClose { reason: Some(reason.to_string()) }).await
    }

    /// Prochain message du contrôleur ; None si rien avant `wait`.
    /// Err(Closed) quand le contrôleur a fermé le transport.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<ControllerMessage>> {
        match timeout(wait, read_frame::<_, ControllerMessage>(&mut self.stream, DEFAULT_MAX_FRAME)).await {
            Ok(Ok(envelope)) => {
                self.received.push(envelope.body.clone());
                Ok(Some(envelope.body))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Lit jusqu'au silence (`quiet`) et garde les commandes d'enforcement
    pub async fn collect_commands(&mut self, quiet: Duration) -> Result<Vec<EnforcementCommand>> {
        let mut commands = Vec::new();
        while let Some(message) = self.recv(quiet).await? {
            if let ControllerMessage::Enforcement { command } = message {
                commands.push(command);
            }
        }
        log::debug!("📥 [MOCK] collected {} command(s)", commands.len());
        Ok(commands)
    }

    /// Attend la fin du transport côté contrôleur ; true si fermé avant `wait`
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return false;
            }
            match self.recv(left).await {
                Ok(Some(_)) => continue,
                Ok(None) => return false,
                Err(e) => return matches!(e.downcast_ref::<WireError>(), Some(WireError::Closed) | Some(WireError::Io(_))),
            }
        }
    }
}
