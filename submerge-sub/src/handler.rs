//! Subscription Handler: the wire-serving counterpart of the Subscription
//! Connection (I), one instance per accepted `Subscription`-operation
//! socket. Grounded in `submerge-repl::InboundHandler`'s negotiate-then-loop
//! shape, adapted to register with the Supervisor (J) and stream
//! `SubscriptionBatchMessage`/`SubscriptionAck` pairs instead of replaying
//! a replication batch.

use crate::connection::SubscriptionConnection;
use crate::error::SubError;
use crate::state::SubscriptionStrategy;
use crate::supervisor::{RegistrationOutcome, SubscriptionSupervisor};
use std::sync::Arc;
use submerge_cluster::ConsensusLog;
use submerge_net::{
    SubscriptionAck, SubscriptionAckOutcome, SubscriptionBatchMessage, SubscriptionOpenOutcome,
    SubscriptionOpenReply, SubscriptionOpenRequest, WireChangeLogEntry,
};
use submerge_store::DocumentStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Parses the wire strategy string; unrecognized values fall back to
/// `OpenIfFree`, the strictest default (§4.9 has no "unknown strategy"
/// fault of its own).
fn parse_strategy(s: &str) -> SubscriptionStrategy {
    match s {
        "WaitForFree" => SubscriptionStrategy::WaitForFree,
        "TakeOver" => SubscriptionStrategy::TakeOver,
        "Concurrent" => SubscriptionStrategy::Concurrent,
        _ => SubscriptionStrategy::OpenIfFree,
    }
}

pub struct SubscriptionHandler<L: ConsensusLog, D: DocumentStore> {
    supervisor: Arc<SubscriptionSupervisor>,
    connection: SubscriptionConnection<L, D>,
}

impl<L: ConsensusLog, D: DocumentStore> SubscriptionHandler<L, D> {
    pub fn new(supervisor: Arc<SubscriptionSupervisor>, connection: SubscriptionConnection<L, D>) -> Self {
        SubscriptionHandler { supervisor, connection }
    }

    /// Runs the registration handshake and, once active, the
    /// pull-batch/send/await-ack loop (§4.8/§4.9) until `cancel` fires or
    /// the connection is dropped. The caller has already read and consumed
    /// the `TcpConnectionHeader`.
    pub async fn serve<S>(
        &self,
        request: SubscriptionOpenRequest,
        reader: &mut submerge_net::FrameReader<tokio::io::ReadHalf<S>>,
        writer: &mut submerge_net::FrameWriter<tokio::io::WriteHalf<S>>,
        cancel: &CancellationToken,
    ) -> Result<(), SubError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let name = self.connection.name().to_string();
        let strategy = parse_strategy(&request.strategy);
        let outcome = self.supervisor.register_subscription_connection(&name, request.worker_id, strategy)?;

        self.send_open_reply(writer, outcome).await?;

        if outcome == RegistrationOutcome::Queued {
            info!(subscription = %name, worker = request.worker_id, "subscription worker queued, waiting for promotion");
            if !self.supervisor.wait_for_turn(&name, request.worker_id, cancel).await {
                return Ok(()); // cancelled while queued: nothing to tear down yet.
            }
        }

        let result = self.stream_batches(reader, writer, cancel).await;
        self.supervisor.drop_subscription_connection(
            &name,
            request.worker_id,
            match &result {
                Ok(()) => "connection closed",
                Err(e) => &e.to_string(),
            },
        );
        result
    }

    async fn stream_batches<S>(
        &self,
        reader: &mut submerge_net::FrameReader<tokio::io::ReadHalf<S>>,
        writer: &mut submerge_net::FrameWriter<tokio::io::WriteHalf<S>>,
        cancel: &CancellationToken,
    ) -> Result<(), SubError>
    where
        S: AsyncRead + AsyncWrite,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(batch) = self.connection.next_batch().await? else {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => continue,
                    _ = cancel.cancelled() => return Ok(()),
                }
            };

            if self.connection.cursor_was_jumped_past(&batch).await? {
                continue; // §4.8 change-vector jump rule: skip, don't redeliver.
            }

            let wire = SubscriptionBatchMessage {
                items: batch
                    .items
                    .iter()
                    .map(|item| WireChangeLogEntry {
                        kind: submerge_base::MutationKind::Document,
                        bucket: 0,
                        etag: item.etag,
                        id: item.id.clone(),
                        change_vector: item.change_vector.clone(),
                        payload: item.payload.clone(),
                    })
                    .collect(),
            };
            writer.write_json(&wire).await.map_err(|e| self.transport_err(e))?;

            let ack: SubscriptionAck = reader.read_json().await.map_err(|e| self.transport_err(e))?;
            match ack.outcome {
                SubscriptionAckOutcome::Processed => {
                    self.connection.ack(&batch).await?;
                }
                SubscriptionAckOutcome::Failed if self.connection.ignore_subscriber_errors() => {
                    self.connection.ack(&batch).await?;
                }
                SubscriptionAckOutcome::Failed => {
                    // §4.8 step 5: leave the cursor where it is so the same
                    // batch is redelivered on the next pull.
                    tracing::warn!(subscription = %self.connection.name(), "subscriber handler failed, batch will be redelivered");
                }
            }
        }
    }

    async fn send_open_reply<S: AsyncWrite>(
        &self,
        writer: &mut submerge_net::FrameWriter<tokio::io::WriteHalf<S>>,
        outcome: RegistrationOutcome,
    ) -> Result<(), SubError> {
        let wire_outcome = match outcome {
            RegistrationOutcome::Connected => SubscriptionOpenOutcome::Connected,
            RegistrationOutcome::Queued => SubscriptionOpenOutcome::Queued,
            RegistrationOutcome::TookOver => SubscriptionOpenOutcome::TookOver,
        };
        writer
            .write_json(&SubscriptionOpenReply { outcome: wire_outcome, reason: None })
            .await
            .map_err(|e| self.transport_err(e))
    }

    fn transport_err(&self, e: submerge_net::TransportError) -> SubError {
        SubError::Transport { name: self.connection.name().to_string(), message: e.to_string() }
    }
}
