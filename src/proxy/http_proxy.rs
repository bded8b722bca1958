//! HTTP proxy routing requests through the balancer.
//!
//! The target service is named by the request authority: a request for
//! `api:8080` (or `!api`) borrows a connection to `api`, forwards the
//! request over HTTP/1.1 and hands the connection back with the outcome.

use crate::balancer::Balancer;
use crate::config::ProxyConfig;
use crate::metrics::UNKNOWN_SERVICE;
use crate::upstream::Connection;
use crate::util::{REQUEST_ID_HEADER, RequestId};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Failure talking to a service instance.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Extract the service name from a request authority.
///
/// Drops a leading `!` and any port. Returns `None` when nothing is left.
pub fn service_from_authority(authority: &str) -> Option<&str> {
    let name = authority.trim().trim_start_matches('!');
    let name = match name.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => name,
    };

    if name.is_empty() { None } else { Some(name) }
}

/// Listener forwarding HTTP requests to balanced service instances.
pub struct HttpProxy {
    balancer: Balancer,
    listener: TcpListener,
    connect_timeout: Duration,
}

impl HttpProxy {
    /// Bind the proxy listener.
    pub async fn bind(config: &ProxyConfig, balancer: Balancer) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(listen = %config.listen, "proxy listener bound");

        Ok(Self {
            balancer,
            listener,
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("proxy listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown.recv() => {
                    info!("proxy listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let balancer = self.balancer.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let balancer = balancer.clone();
                async move { proxy_request(req, client_addr, balancer, connect_timeout).await }
            });

            let result = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await;

            if let Err(e) = result {
                debug!(client = %client_addr, error = %e, "client connection ended with error");
            }
        });
    }
}

/// Proxy a single request to an instance of the service it names.
#[instrument(skip_all, fields(method = %req.method(), uri = %req.uri(), client = %client_addr))]
async fn proxy_request(
    mut req: Request<Incoming>,
    client_addr: SocketAddr,
    balancer: Balancer,
    connect_timeout: Duration,
) -> Result<Response<ProxyBody>, Infallible> {
    let start = Instant::now();
    let request_id = request_id_of(&req);

    let Some(service) = target_service(&req) else {
        return Ok(error_response(StatusCode::BAD_REQUEST, "missing host"));
    };

    let Some(conn) = balancer.borrow(&service) else {
        warn!(request_id = %request_id, service = %service, "no instance available");
        let label = if balancer.upstream(&service).is_some() {
            service.as_str()
        } else {
            UNKNOWN_SERVICE
        };
        balancer
            .metrics()
            .record_request(label, 503, start.elapsed());
        return Ok(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no instance available",
        ));
    };

    add_request_headers(&mut req, client_addr, &request_id);
    let host = conn.host().to_string();

    match forward(req, &conn, connect_timeout).await {
        Ok(mut response) => {
            let status = response.status().as_u16();
            balancer.return_connection(conn, None);
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }

            let duration = start.elapsed();
            balancer.metrics().record_request(&service, status, duration);
            info!(
                request_id = %request_id,
                service = %service,
                upstream = %host,
                status,
                duration_ms = duration.as_millis(),
                "proxied request completed"
            );
            Ok(response)
        }
        Err(e) => {
            error!(
                request_id = %request_id,
                service = %service,
                upstream = %host,
                error = %e,
                "upstream request failed"
            );
            balancer.return_connection(conn, Some(&e));
            balancer
                .metrics()
                .record_request(&service, 502, start.elapsed());
            Ok(error_response(StatusCode::BAD_GATEWAY, "upstream request failed"))
        }
    }
}

async fn forward(
    mut req: Request<Incoming>,
    conn: &Connection,
    connect_timeout: Duration,
) -> Result<Response<ProxyBody>, ProxyError> {
    let host = conn.host();
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(host))
        .await
        .map_err(|_| ProxyError::ConnectTimeout(host.to_string()))?
        .map_err(|source| ProxyError::Connect {
            host: host.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "upstream connection error");
        }
    });

    // Upstreams expect origin-form targets.
    if let Some(path_and_query) = req.uri().path_and_query().cloned() {
        *req.uri_mut() = path_and_query.into();
    }

    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

fn target_service(req: &Request<Incoming>) -> Option<String> {
    let authority = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    service_from_authority(authority).map(str::to_string)
}

fn request_id_of<B>(req: &Request<B>) -> RequestId {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(RequestId::from_string)
        .unwrap_or_default()
}

fn add_request_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, request_id: &RequestId) {
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert("x-forwarded-for", value.clone());
        headers.insert("x-real-ip", value);
    }

    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}: {}\n", status, message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_from_authority() {
        assert_eq!(service_from_authority("api"), Some("api"));
        assert_eq!(service_from_authority("api:8080"), Some("api"));
        assert_eq!(service_from_authority("!api:8080"), Some("api"));
        assert_eq!(service_from_authority("!"), None);
        assert_eq!(service_from_authority(":80"), None);
        assert_eq!(service_from_authority(""), None);
    }

    #[test]
    fn test_request_id_propagated_or_generated() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(())
            .unwrap();
        assert_eq!(request_id_of(&req).as_str(), "abc-123");

        let req = Request::builder().body(()).unwrap();
        assert!(!request_id_of(&req).as_str().is_empty());
    }

    #[test]
    fn test_forwarding_headers() {
        let mut req = Request::builder().body(()).unwrap();
        let id = RequestId::from_string("req-1");
        add_request_headers(&mut req, "192.168.1.100:12345".parse().unwrap(), &id);

        assert_eq!(req.headers()["x-forwarded-for"], "192.168.1.100");
        assert_eq!(req.headers()["x-real-ip"], "192.168.1.100");
        assert_eq!(req.headers()[REQUEST_ID_HEADER], "req-1");
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "test error");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()["content-type"], "text/plain");
    }
}
