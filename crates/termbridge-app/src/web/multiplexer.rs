//! Per-connection multiplexing of many terminal sessions over one socket.
//!
//! Inbound frames are routed by `sessionId`. Each (connection, session) pair
//! gets a forwarder task that drains the session's event stream into the
//! connection's bounded outbound queue.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termbridge_terminal::{
    Attachment, CloseReason, ConnectionId, SessionEvent, SessionRegistry, TerminalError,
};

use super::protocol::{parse_client_frame, ClientCommand, ServerFrame, SessionId};

/// One client connection's routing table
pub struct Connection {
    id: ConnectionId,
    registry: SessionRegistry,
    outbound: mpsc::Sender<ServerFrame>,
    forwarders: HashMap<SessionId, JoinHandle<()>>,
}

impl Connection {
    pub fn new(registry: SessionRegistry, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            outbound,
            forwarders: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sessions this connection currently receives output from
    pub fn attached_sessions(&self) -> Vec<SessionId> {
        self.forwarders.keys().cloned().collect()
    }

    async fn send(&self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            debug!(connection = %self.id, "outbound queue closed");
        }
    }

    /// Answer something that is not a frame at all
    pub async fn reject(&self, message: &str) {
        self.send(ServerFrame::error(None, message)).await;
    }

    /// Handle one text frame. Bad frames are answered with an `error` frame;
    /// they never end the connection.
    pub async fn handle_text(&mut self, text: &str) {
        match parse_client_frame(text) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                debug!(connection = %self.id, "rejected frame: {}", e);
                self.send(ServerFrame::error(e.session_id(), e.to_string()))
                    .await;
            }
        }
    }

    pub async fn handle_command(&mut self, command: ClientCommand) {
        let (session_id, result) = match command {
            ClientCommand::Input { session_id, data } => {
                let result = self.registry.write(&session_id, Bytes::from(data)).await;
                (Some(session_id), result)
            }
            ClientCommand::Resize {
                session_id,
                dimensions,
            } => {
                let result = self
                    .registry
                    .resize(&session_id, dimensions)
                    .await
                    .map(|_| ());
                (Some(session_id), result)
            }
            ClientCommand::Create { request } => {
                let (dimensions, options) = request.into_parts();
                (None, self.create(dimensions, options).await)
            }
            ClientCommand::Attach {
                session_id,
                after_seq,
            } => {
                let result = self.attach(&session_id, after_seq).await;
                (Some(session_id), result)
            }
            ClientCommand::Detach { session_id } => {
                self.detach(&session_id).await;
                (Some(session_id), Ok(()))
            }
            ClientCommand::Terminate { session_id } => {
                let result = self.terminate(&session_id).await;
                (Some(session_id), result)
            }
            ClientCommand::List => {
                let sessions = self.registry.list().await;
                self.send(ServerFrame::sessions(&sessions)).await;
                (None, Ok(()))
            }
        };

        if let Err(e) = result {
            self.send(ServerFrame::error(session_id.as_deref(), e.to_string()))
                .await;
        }
    }

    async fn create(
        &mut self,
        dimensions: Option<termbridge_terminal::Dimensions>,
        options: termbridge_terminal::CreateOptions,
    ) -> Result<(), TerminalError> {
        let session = self
            .registry
            .create_session(Some(self.id), dimensions, options)
            .await?;
        let attachment = self.registry.attach(session.id(), self.id).await?;

        self.send(ServerFrame::session_created(
            session.id(),
            session.status(),
            session.dimensions(),
        ))
        .await;
        self.start_forwarder(attachment, 0);
        Ok(())
    }

    /// Attach and replay buffered output newer than `after_seq`
    async fn attach(&mut self, session_id: &str, after_seq: Option<u64>) -> Result<(), TerminalError> {
        let mut attachment = self.registry.attach(session_id, self.id).await?;
        let after = after_seq.unwrap_or(0);

        // Chunks between the client's last seq and the oldest buffered one are gone
        let missed = match attachment.replay.first() {
            Some(oldest) if after > 0 && oldest.seq > after + 1 => oldest.seq - after - 1,
            _ => 0,
        };
        attachment.replay.retain(|chunk| chunk.seq > after);

        let session = &attachment.session;
        info!(
            session = %session_id,
            connection = %self.id,
            after,
            replay = attachment.replay.len(),
            "connection attached"
        );

        self.send(ServerFrame::attached(
            session_id,
            session.status(),
            session.dimensions(),
            attachment.replay.len(),
        ))
        .await;
        if missed > 0 {
            self.send(ServerFrame::error(
                Some(session_id),
                format!("{} output chunks were evicted before the reattach", missed),
            ))
            .await;
        }
        self.start_forwarder(attachment, after);
        Ok(())
    }

    async fn detach(&mut self, session_id: &str) {
        if let Some(forwarder) = self.forwarders.remove(session_id) {
            forwarder.abort();
        }
        self.registry.detach(session_id, self.id).await;
        self.send(ServerFrame::detached(session_id)).await;
    }

    async fn terminate(&mut self, session_id: &str) -> Result<(), TerminalError> {
        // Attached connections hear about it from their forwarder
        let forwarded = self
            .forwarders
            .get(session_id)
            .map(|f| !f.is_finished())
            .unwrap_or(false);
        let performed = self
            .registry
            .terminate(session_id, CloseReason::Requested)
            .await?;

        if performed && !forwarded {
            self.send(ServerFrame::session_closed(
                session_id,
                &CloseReason::Requested,
                None,
            ))
            .await;
        }
        Ok(())
    }

    fn start_forwarder(&mut self, attachment: Attachment, after_seq: u64) {
        let session_id = attachment.session.id().to_string();
        if let Some(previous) = self.forwarders.remove(&session_id) {
            previous.abort();
        }
        let handle = tokio::spawn(forward(attachment, after_seq, self.outbound.clone()));
        self.forwarders.insert(session_id, handle);
    }

    /// Server shutdown: let forwarders deliver their sessions' close frames,
    /// for at most `timeout`, then close as usual
    pub async fn drain(&mut self, timeout: Duration) {
        let pending: Vec<_> = self.forwarders.values_mut().collect();
        let finished = tokio::time::timeout(timeout, async {
            for forwarder in pending {
                let _ = forwarder.await;
            }
        })
        .await;
        if finished.is_err() {
            debug!(connection = %self.id, "forwarders still busy at shutdown");
        }
        self.close().await;
    }

    /// Transport closed: stop forwarding and detach, leaving shells running
    pub async fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        let detached = self.registry.detach_all(self.id).await;
        info!(connection = %self.id, detached, "connection closed");
    }
}

/// Replay, then live events, de-duplicated by sequence number
async fn forward(attachment: Attachment, after_seq: u64, outbound: mpsc::Sender<ServerFrame>) {
    let Attachment {
        session,
        replay,
        mut events,
    } = attachment;
    let id = session.id().to_string();
    let mut last_seq = after_seq;

    for chunk in replay {
        last_seq = chunk.seq;
        if outbound.send(ServerFrame::output(&id, chunk.seq, &chunk.data)).await.is_err() {
            return;
        }
    }

    loop {
        let frame = match events.recv().await {
            Ok(SessionEvent::Output(chunk)) => {
                if chunk.seq <= last_seq {
                    continue;
                }
                last_seq = chunk.seq;
                ServerFrame::output(&id, chunk.seq, &chunk.data)
            }
            Ok(SessionEvent::Error { message }) => ServerFrame::error(Some(&id), message),
            Ok(SessionEvent::Closed { reason, exit_code }) => {
                let _ = outbound
                    .send(ServerFrame::session_closed(&id, &reason, exit_code))
                    .await;
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                // Catch up from the replay buffer instead of dropping output
                let (chunks, missed) = session.output_since(last_seq);
                debug!(session = %id, skipped, recovered = chunks.len(), missed, "forwarder lagged");
                if missed > 0 {
                    warn!(session = %id, missed, "output evicted before it could be delivered");
                    let gap = ServerFrame::error(
                        Some(&id),
                        format!("{} output chunks were dropped for a slow connection", missed),
                    );
                    if outbound.send(gap).await.is_err() {
                        return;
                    }
                }
                for chunk in chunks {
                    last_seq = chunk.seq;
                    if outbound.send(ServerFrame::output(&id, chunk.seq, &chunk.data)).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        if outbound.send(frame).await.is_err() {
            return;
        }
    }
}
