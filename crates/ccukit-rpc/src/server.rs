// ── Inbound callback server ──
//
// The CCU's interface processes call back into us after init: events,
// device lists, pings. One server carries both dialects — an axum HTTP
// endpoint for XML callbacks and a framed TCP listener for binary ones —
// and funnels every inbound call into a single mpsc channel. The session
// layer answers through the per-call oneshot; the server side stays
// oblivious to method semantics (system.multicall included, which is
// handed up whole).

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bin::{BinCodec, BinFrame};
use crate::client::Protocol;
use crate::error::Error;
use crate::value::Value;
use crate::xml;

/// A fault answer produced by the call handler.
#[derive(Debug, Clone)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

impl Fault {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Fault { code, message: message.into() }
    }
}

/// One inbound call, waiting to be answered.
///
/// Dropping `reply` without sending makes the server answer with a
/// generic fault, so a crashed handler never leaves the peer hanging.
#[derive(Debug)]
pub struct InboundCall {
    pub protocol: Protocol,
    pub method: String,
    pub params: Vec<Value>,
    pub reply: oneshot::Sender<Result<Value, Fault>>,
}

/// Listen addresses for the two dialects.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub xml_addr: SocketAddr,
    pub bin_addr: SocketAddr,
    /// Inbound call queue depth before the listeners apply backpressure.
    pub queue_depth: usize,
}

impl ServerConfig {
    /// Ephemeral loopback ports on both dialects.
    pub fn loopback() -> Self {
        ServerConfig {
            xml_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bin_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            queue_depth: 64,
        }
    }
}

/// Handle to the running callback server.
pub struct RpcServer {
    xml_addr: SocketAddr,
    bin_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl RpcServer {
    /// Bind both listeners and start serving.
    ///
    /// Returns the server handle and the channel on which inbound calls
    /// arrive. Bound addresses are available immediately, so callers can
    /// bind port 0 and register the real port with the CCU.
    pub async fn bind(config: &ServerConfig) -> Result<(Self, mpsc::Receiver<InboundCall>), Error> {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let xml_listener = TcpListener::bind(config.xml_addr).await?;
        let xml_addr = xml_listener.local_addr()?;
        let bin_listener = TcpListener::bind(config.bin_addr).await?;
        let bin_addr = bin_listener.local_addr()?;

        let app = Router::new()
            .route("/", post(handle_xml_call))
            .route("/{*path}", post(handle_xml_call))
            .with_state(tx.clone());
        let xml_shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(xml_listener, app)
                .with_graceful_shutdown(xml_shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "xml callback server exited");
            }
        });

        let bin_shutdown = shutdown.clone();
        tasks.spawn(async move {
            accept_bin_connections(bin_listener, tx, bin_shutdown).await;
        });

        debug!(%xml_addr, %bin_addr, "callback server listening");
        Ok((RpcServer { xml_addr, bin_addr, shutdown, tasks }, rx))
    }

    /// Bound address of the XML (HTTP) listener.
    pub fn xml_addr(&self) -> SocketAddr {
        self.xml_addr
    }

    /// Bound address of the binary (TCP) listener.
    pub fn bin_addr(&self) -> SocketAddr {
        self.bin_addr
    }

    /// Stop both listeners, waiting a bounded time for in-flight calls.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(std::time::Duration::from_secs(2), drain)
            .await
            .is_err()
        {
            warn!("callback server did not drain within 2s, aborting");
            self.tasks.abort_all();
        }
    }
}

// ── XML dialect ──

async fn handle_xml_call(
    State(calls): State<mpsc::Sender<InboundCall>>,
    body: String,
) -> Response {
    let (method, params) = match xml::decode_request(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "unparseable xml callback");
            return xml_body(xml::encode_fault(-32_700, "parse error"));
        }
    };
    debug!(method, "xml callback");
    let answer = dispatch(&calls, Protocol::Xml, method, params).await;
    match answer {
        Ok(value) => xml_body(xml::encode_response(&value)),
        Err(fault) => xml_body(xml::encode_fault(fault.code, &fault.message)),
    }
}

fn xml_body(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

// ── Binary dialect ──

async fn accept_bin_connections(
    listener: TcpListener,
    calls: mpsc::Sender<InboundCall>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "binary callback connection");
                    let calls = calls.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_bin_connection(stream, calls, shutdown).await {
                            debug!(%peer, error = %e, "binary connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "binary accept failed");
                }
            },
            () = shutdown.cancelled() => break,
        }
    }
    connections.shutdown().await;
}

async fn serve_bin_connection(
    stream: TcpStream,
    calls: mpsc::Sender<InboundCall>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut framed = Framed::new(stream, BinCodec);
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            () = shutdown.cancelled() => return Ok(()),
        };
        match frame {
            Some(Ok(BinFrame::Request { method, params })) => {
                debug!(method, "binary callback");
                let answer = dispatch(&calls, Protocol::Bin, method, params).await;
                let reply = match answer {
                    Ok(value) => BinFrame::Response(value),
                    Err(fault) => BinFrame::Fault { code: fault.code, message: fault.message },
                };
                framed.send(reply).await?;
            }
            Some(Ok(other)) => {
                warn!(?other, "unexpected frame on server connection");
                framed
                    .send(BinFrame::Fault { code: -32_600, message: "expected a request".into() })
                    .await?;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

// ── Shared dispatch ──

async fn dispatch(
    calls: &mpsc::Sender<InboundCall>,
    protocol: Protocol,
    method: String,
    params: Vec<Value>,
) -> Result<Value, Fault> {
    let (reply, answered) = oneshot::channel();
    let call = InboundCall { protocol, method, params, reply };
    if calls.send(call).await.is_err() {
        return Err(Fault::new(-32_603, "handler unavailable"));
    }
    match answered.await {
        Ok(result) => result,
        // Handler dropped the reply without answering.
        Err(_) => Err(Fault::new(-32_603, "handler dropped the call")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::RpcClient;

    #[tokio::test]
    async fn xml_callback_round_trips() {
        let (server, mut calls) = RpcServer::bind(&ServerConfig::loopback())
            .await
            .expect("bind");
        let endpoint = format!("http://{}", server.xml_addr());

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                assert_eq!(call.protocol, Protocol::Xml);
                assert_eq!(call.method, "event");
                assert_eq!(call.params.len(), 4);
                let _ = call.reply.send(Ok(Value::empty()));
            }
        });

        let client = RpcClient::xml(&endpoint, Duration::from_secs(2)).expect("client");
        let answer = client
            .call(
                "event",
                &[
                    Value::String("ck_abc123_BidCos-RF".into()),
                    Value::String("NEQ1234567:1".into()),
                    Value::String("STATE".into()),
                    Value::Bool(true),
                ],
            )
            .await
            .expect("call");
        assert_eq!(answer, Value::empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_reply_becomes_fault() {
        let (server, mut calls) = RpcServer::bind(&ServerConfig::loopback())
            .await
            .expect("bind");
        let endpoint = format!("http://{}", server.xml_addr());

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                drop(call.reply);
            }
        });

        let client = RpcClient::xml(&endpoint, Duration::from_secs(2)).expect("client");
        let err = client.call("event", &[]).await.expect_err("fault");
        assert!(err.is_fault());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn xml_callback_on_subpath_is_served() {
        let (server, mut calls) = RpcServer::bind(&ServerConfig::loopback())
            .await
            .expect("bind");
        let endpoint = format!("http://{}/cb", server.xml_addr());

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                let _ = call.reply.send(Ok(Value::Array(vec![])));
            }
        });

        let client = RpcClient::xml(&endpoint, Duration::from_secs(2)).expect("client");
        let answer = client.call("listDevices", &[]).await.expect("call");
        assert_eq!(answer, Value::Array(vec![]));
        server.shutdown().await;
    }
}
