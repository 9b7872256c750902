//! Accept loop: binds the one TCP port a node listens on (§6) and routes
//! each connection to the inbound replication handler or the subscription
//! handler based on the `TcpConnectionHeader.operation` field.

use crate::NodeContext;
use std::sync::Arc;
use submerge_base::DatabaseId;
use submerge_net::{Operation, ReplicationLatestEtagRequest, SubscriptionOpenRequest, TcpConnectionHeader};
use submerge_repl::InboundHandler;
use submerge_sub::{SubscriptionConnection, SubscriptionHandler};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub async fn accept_loop(ctx: Arc<NodeContext>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(ctx, stream, shutdown).await {
                                tracing::info!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn serve_connection(
    ctx: Arc<NodeContext>,
    stream: tokio::net::TcpStream,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let (mut reader, mut writer) = submerge_net::split(stream);
    let header: TcpConnectionHeader = reader.read_json().await.map_err(|e| e.to_string())?;
    if header.protocol_version != submerge_net::PROTOCOL_VERSION {
        return Err(format!("protocol version mismatch: peer speaks {}", header.protocol_version));
    }

    match header.operation {
        Operation::Replication => {
            let request: ReplicationLatestEtagRequest = reader.read_json().await.map_err(|e| e.to_string())?;
            let source = request.source_database_id.clone();
            ctx.replication_loader.admit_incoming(&source)?;
            let handler = InboundHandler::new(source.clone(), ctx.node_tag.clone());
            let result = handler
                .serve(request, &mut reader, &mut writer, ctx.document_store.as_ref())
                .await;
            ctx.replication_loader.drop_incoming(&source);
            result.map_err(|e| e.to_string())
        }
        Operation::Subscription => {
            let request: SubscriptionOpenRequest = reader.read_json().await.map_err(|e| e.to_string())?;
            let database = DatabaseId::from(header.database.as_str());
            let connection = SubscriptionConnection::new(
                ctx.subscription_store.clone(),
                ctx.document_store.clone(),
                database,
                request.name.clone(),
            )
            .with_options(&ctx.config.subscriptions.to_options());
            let handler = SubscriptionHandler::new(ctx.subscription_supervisor.clone(), connection);
            handler.serve(request, &mut reader, &mut writer, &shutdown).await.map_err(|e| e.to_string())
        }
    }
}
