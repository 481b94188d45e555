use crate::auth::{Identity, IdentityVerifier};
use crate::handlers::ClientHandlers;
use crate::presence::PresenceCoordinator;
use crate::protocol::{ClientRequest, ProtocolError, SocketFrame, INVALID_ACCESS_TOKEN};
use crate::registry::{frame_channel, Connection};
use anyhow::{Context, Result};
use beacon_core::GatewayConfig;
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const ACCESS_TOKEN_PARAM: &str = "accessToken";

/// Pull `accessToken` out of a raw query string
pub fn access_token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ACCESS_TOKEN_PARAM)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty() && value != "undefined" && value != "null")
}

#[derive(Clone)]
struct ConnectionContext {
    config: GatewayConfig,
    verifier: Arc<dyn IdentityVerifier>,
    coordinator: Arc<PresenceCoordinator>,
    handlers: Arc<ClientHandlers>,
}

/// Gateway server
pub struct GatewayServer {
    context: ConnectionContext,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        verifier: Arc<dyn IdentityVerifier>,
        coordinator: Arc<PresenceCoordinator>,
        handlers: Arc<ClientHandlers>,
    ) -> Self {
        Self {
            context: ConnectionContext {
                config,
                verifier,
                coordinator,
                handlers,
            },
        }
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            ws_path = %self.context.config.ws_path,
            instance_id = %self.context.config.instance_id,
            "Gateway server listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let context = self.context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, context).await {
                            tracing::debug!(%addr, "Connection ended with error: {:#}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &SocketFrame) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = frame.to_text()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

// Handle a WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: ConnectionContext,
) -> Result<()> {
    let ws_path = context.config.ws_path.clone();
    let mut query: Option<String> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != ws_path {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        query = request.uri().query().map(str::to_string);
        Ok(response)
    })
    .await
    .context("WebSocket handshake failed")?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let token = query.as_deref().and_then(access_token_from_query);
    let identity = match token {
        Some(token) => context.verifier.verify(&token).await,
        None => Err(beacon_core::BeaconError::auth_failure("missing access token")),
    };
    let identity: Identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            tracing::info!(%addr, error = %e, "Rejecting connection");
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: INVALID_ACCESS_TOKEN.into(),
            };
            ws_sender.send(Message::Close(Some(close))).await?;
            return Ok(());
        }
    };

    let (tx, mut rx) = frame_channel();
    let connection = Connection::new(
        identity.user_id.clone(),
        context.config.instance_id.clone(),
        tx.clone(),
    );
    let connection_id = connection.connection_id.clone();
    tracing::info!(
        %addr,
        user_id = %identity.user_id,
        connection_id = %connection_id,
        "WebSocket connection established"
    );
    context.coordinator.connect(connection).await;

    let max_frame_bytes = context.config.max_frame_bytes;
    let result: Result<()> = async {
        loop {
            tokio::select! {
                msg_result = ws_receiver.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > max_frame_bytes {
                                let error = ProtocolError::new(
                                    ProtocolError::INVALID_REQUEST,
                                    format!("Frame too large (max {} bytes)", max_frame_bytes),
                                );
                                send_frame(&mut ws_sender, &SocketFrame::error(&error)).await?;
                                continue;
                            }
                            tracing::debug!(connection_id = %connection_id, "Received frame");

                            match ClientRequest::parse(text.as_str()) {
                                Ok(request) => context.handlers.handle(&identity, request, tx.clone()),
                                Err(error) => send_frame(&mut ws_sender, &SocketFrame::error(&error)).await?,
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let error = ProtocolError::new(
                                ProtocolError::INVALID_REQUEST,
                                "Binary frames are not supported",
                            );
                            send_frame(&mut ws_sender, &SocketFrame::error(&error)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                            break;
                        }
                    }
                }

                frame = rx.recv() => {
                    match frame {
                        Some(frame) => send_frame(&mut ws_sender, &frame).await?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    // Socket errors take the same path as a clean close
    context
        .coordinator
        .disconnect(&identity.user_id, &connection_id)
        .await;
    tracing::info!(
        user_id = %identity.user_id,
        connection_id = %connection_id,
        "Connection closed"
    );
    result
}
