// ── Outbound RPC client ──
//
// One client per interface process. The XML dialect rides on HTTP POST,
// the binary dialect opens a TCP connection per call; both present the
// same `call` surface so the session layer never branches on protocol.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};
use url::Url;

use crate::bin::{BinCodec, BinFrame};
use crate::error::Error;
use crate::value::Value;
use crate::xml;

/// Which wire dialect an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xml,
    Bin,
}

#[derive(Debug, Clone)]
enum Endpoint {
    Xml(Url),
    Bin(String),
}

/// Transport options for the XML dialect.
#[derive(Debug, Clone, Default)]
pub struct XmlOptions {
    /// HTTP basic auth credentials.
    pub auth: Option<(String, String)>,
    /// Accept the CCU's self-signed certificate.
    pub insecure_tls: bool,
}

/// RPC client for a single interface process endpoint.
///
/// Cheap to clone; the XML variant shares one `reqwest::Client`
/// connection pool across clones.
#[derive(Debug, Clone)]
pub struct RpcClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    auth: Option<(String, String)>,
    timeout: Duration,
}

impl RpcClient {
    /// Client for an XML-dialect endpoint, e.g. `http://ccu:2001`.
    pub fn xml(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        Self::xml_with(endpoint, timeout, XmlOptions::default())
    }

    /// Client for an XML-dialect endpoint with transport options.
    pub fn xml_with(endpoint: &str, timeout: Duration, options: XmlOptions) -> Result<Self, Error> {
        let url = Url::parse(endpoint).map_err(|e| Error::InvalidUrl(format!("{endpoint}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(options.insecure_tls)
            .build()?;
        Ok(Self { endpoint: Endpoint::Xml(url), http, auth: options.auth, timeout })
    }

    /// Client for a binary-dialect endpoint, e.g. `ccu:8701`.
    pub fn bin(host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        if host.is_empty() {
            return Err(Error::InvalidUrl("empty host".into()));
        }
        // Unused for the binary dialect but kept so clones stay uniform.
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: Endpoint::Bin(format!("{host}:{port}")),
            http,
            auth: None,
            timeout,
        })
    }

    /// The wire dialect this client speaks.
    pub fn protocol(&self) -> Protocol {
        match self.endpoint {
            Endpoint::Xml(_) => Protocol::Xml,
            Endpoint::Bin(_) => Protocol::Bin,
        }
    }

    /// Invoke `method` and wait for the answer.
    ///
    /// A fault answer surfaces as [`Error::Fault`]; everything else that
    /// goes wrong is a transport-class error (see [`Error::is_transport`]).
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, Error> {
        trace!(method, params = params.len(), "rpc call");
        match &self.endpoint {
            Endpoint::Xml(url) => self.call_xml(url, method, params).await,
            Endpoint::Bin(addr) => {
                tokio::time::timeout(self.timeout, self.call_bin(addr, method, params))
                    .await
                    .map_err(|_| Error::Timeout(self.timeout))?
            }
        }
    }

    async fn call_xml(&self, url: &Url, method: &str, params: &[Value]) -> Result<Value, Error> {
        let body = xml::encode_request(method, params);
        debug!(method, %url, "POST");
        let mut request = self
            .http
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }
        let resp = request.send().await?;
        let text = resp.text().await?;
        xml::decode_response(&text)
    }

    async fn call_bin(&self, addr: &str, method: &str, params: &[Value]) -> Result<Value, Error> {
        debug!(method, addr, "binary call");
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, BinCodec);
        framed
            .send(BinFrame::Request { method: method.to_owned(), params: params.to_vec() })
            .await?;
        match framed.next().await {
            Some(Ok(BinFrame::Response(value))) => Ok(value),
            Some(Ok(BinFrame::Fault { code, message })) => Err(Error::Fault { code, message }),
            Some(Ok(BinFrame::Request { .. })) => {
                Err(Error::codec("peer sent a request on a client connection"))
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::server::{Fault, RpcServer, ServerConfig};

    #[tokio::test]
    async fn bin_call_round_trips_through_server() {
        let (server, mut calls) = RpcServer::bind(&ServerConfig::loopback())
            .await
            .expect("bind");
        let addr = server.bin_addr();

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                assert_eq!(call.method, "ping");
                let _ = call.reply.send(Ok(Value::String("pong".into())));
            }
        });

        let client = RpcClient::bin(&addr.ip().to_string(), addr.port(), Duration::from_secs(2))
            .expect("client");
        let answer = client.call("ping", &[Value::String("x".into())]).await.expect("call");
        assert_eq!(answer, Value::String("pong".into()));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn bin_fault_surfaces_as_fault_error() {
        let (server, mut calls) = RpcServer::bind(&ServerConfig::loopback())
            .await
            .expect("bind");
        let addr = server.bin_addr();

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                let _ = call
                    .reply
                    .send(Err(Fault { code: -2, message: "Unknown instance".into() }));
            }
        });

        let client = RpcClient::bin(&addr.ip().to_string(), addr.port(), Duration::from_secs(2))
            .expect("client");
        let err = client.call("nope", &[]).await.expect_err("fault");
        assert!(err.is_fault());
        assert!(!err.is_transport());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_bin_endpoint_is_transport_error() {
        // Port 9 on loopback is expected to refuse connections.
        let client = RpcClient::bin("127.0.0.1", 9, Duration::from_millis(500)).expect("client");
        let err = client.call("ping", &[]).await.expect_err("refused");
        assert!(err.is_transport());
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RpcClient::xml("not a url", Duration::from_secs(1)).is_err());
    }
}
