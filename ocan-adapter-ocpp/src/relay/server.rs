//! Websocket front of the interception relay
//!
//! Accepts a charge point, dials the real CSMS with the same request path
//! and subprotocol, then hands both connections to [`bridge`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
    },
};
use tracing::{error, info, warn};

use super::registry::ConnectionRegistry;
use super::session::{bridge, SessionContext};
use super::transform::Transformer;
use super::RelayError;
use crate::config::RelayConfig;

/// Man-in-the-middle relay for OCPP websockets
pub struct InterceptionRelay {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
}

impl InterceptionRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind `listen_addr` and serve forever
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve charge points arriving on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        info!("Interception relay listening on ws://{}", listener.local_addr()?);
        info!("Upstream: {}", self.config.upstream_url);
        info!("Attack mode: {}", self.config.attack);
        if !self.config.attack.is_none() {
            warn!("Attack simulation active, for test environments only");
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);

            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, peer, config, registry).await {
                    error!("Relay error for {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
) -> Result<(), RelayError> {
    let mut path = String::from("/");
    let mut protocol: Option<String> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();

        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))
            .map(str::to_string);

        if let Some(chosen) = &offered {
            if let Ok(value) = HeaderValue::from_str(chosen) {
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        protocol = offered;
        Ok(response)
    };

    let cp_ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| RelayError::Handshake(e.to_string()))?;

    let protocol = protocol.unwrap_or_else(|| config.default_subprotocol.clone());
    info!("Charge point connected: {} {} ({})", peer, path, protocol);

    let url = upstream_url(&config.upstream_url, &path);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::Handshake(e.to_string()))?;
    let value = HeaderValue::from_str(&protocol).map_err(|e| RelayError::Handshake(e.to_string()))?;
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);

    let (csms_ws, _) = connect_async(request).await.map_err(|e| {
        error!("Upstream connection to {} failed: {}", url, e);
        RelayError::Handshake(e.to_string())
    })?;
    info!("Upstream connected: {}", url);

    let id = registry.register(peer, path);
    let ctx = SessionContext {
        id,
        transformer: Arc::new(Transformer::new(config.attack.clone())),
        registry,
        channel_capacity: config.channel_capacity,
    };

    let (cp_sink, cp_stream) = cp_ws.split();
    let (csms_sink, csms_stream) = csms_ws.split();

    bridge(ctx, (cp_stream, cp_sink), (csms_stream, csms_sink)).await
}

/// Append the charge point's request path to the upstream base URL
pub fn upstream_url(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}
