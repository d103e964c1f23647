/**
 * CONTROL SERVER - Canal de contrôle TCP des agents WTP
 *
 * RÔLE :
 * Accepte les connexions des agents et fait tourner, pour chacune, un worker
 * de session : handshake, lecture des messages, routage via le dispatcher.
 *
 * FONCTIONNEMENT :
 * - échec du bind = seule erreur fatale du processus
 * - une tâche par connexion ; fermer une session n'annule qu'elle
 * - violations de protocole comptées, session fermée au-delà du seuil
 */

use crate::dispatcher::Flow;
use crate::session::{self, InboundEvent};
use crate::state::Kernel;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("[control] listening for agents on {}", addr);
    Ok(listener)
}

pub async fn serve(listener: TcpListener, kernel: Kernel) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("[control] connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[control] set_nodelay failed for {}: {}", peer, e);
                }
                tokio::spawn(serve_connection(stream, kernel.clone()));
            }
            Err(e) => warn!("[control] accept failed: {}", e),
        }
    }
}

/// Worker d'une session agent, de l'ouverture du transport à sa fermeture
pub async fn serve_connection<S>(stream: S, kernel: Kernel)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = kernel.config.session_config();
    let (session, mut inbound) = match session::connect(stream, kernel.registry.clone(), &config).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!("[control] handshake failed: {}", e);
            return;
        }
    };
    kernel.dispatcher.attach(session.clone());

    let threshold = kernel.config.session.violation_threshold.max(1);
    let mut violations = 0u32;
    while let Some(event) = inbound.next().await {
        let violation = match event {
            InboundEvent::Message(message) => match kernel.dispatcher.handle_inbound(&session, message) {
                Ok(Flow::Continue) => None,
                Ok(Flow::Close) => {
                    session.close(None);
                    None
                }
                Err(e) => Some(e),
            },
            InboundEvent::Violation(e) => Some(e),
        };

        if let Some(e) = violation {
            violations += 1;
            kernel.dispatcher.record_violation();
            debug!("[control] protocol violation {}/{} from {}: {}", violations, threshold, session.device_id(), e);
            if violations >= threshold {
                warn!("[control] {} exceeded protocol violation threshold", session.device_id());
                session.close(Some("protocol violation threshold exceeded".into()));
            }
        }
    }

    kernel.dispatcher.detach(session.device_id(), session.epoch());
    info!("[control] session {} of {} ended", session.session_id(), session.device_id());
}
