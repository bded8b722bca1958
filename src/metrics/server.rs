//! Prometheus metrics HTTP server.
//!
//! Serves metrics on a configurable path, plus `/health` and a plain-text
//! `/services` table of the balancer's pools.

use crate::balancer::Balancer;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    address: SocketAddr,
    path: String,
    balancer: Balancer,
}

impl MetricsServer {
    /// Create a metrics server exposing `balancer` and its collector.
    pub fn new(address: SocketAddr, path: String, balancer: Balancer) -> Self {
        Self {
            address,
            path,
            balancer,
        }
    }

    /// Run the metrics server.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, address = %self.address, "failed to bind metrics server");
                return;
            }
        };

        info!(address = %self.address, path = %self.path, "metrics server started");

        let path: Arc<str> = Arc::from(self.path);
        let balancer = self.balancer;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let balancer = balancer.clone();
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let response = route(req.method(), req.uri().path(), &balancer, &path);
                                    async move { Ok::<_, Infallible>(response) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

fn route(method: &Method, path: &str, balancer: &Balancer, metrics_path: &str) -> Response<Full<Bytes>> {
    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n".to_string());
    }

    if path == metrics_path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, balancer.metrics().registry()) {
            error!(error = %e, "failed to encode metrics");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics\n".to_string(),
            );
        }

        let mut response = text_response(StatusCode::OK, buffer);
        response.headers_mut().insert(
            "content-type",
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        response
    } else if path == "/health" || path == "/healthz" {
        text_response(StatusCode::OK, "OK\n".to_string())
    } else if path == "/services" {
        text_response(StatusCode::OK, services_table(balancer))
    } else if path == "/" {
        let body = format!(
            "reglb\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Health check\n  /services - Upstream pools\n",
            metrics_path
        );
        text_response(StatusCode::OK, body)
    } else {
        text_response(StatusCode::NOT_FOUND, "Not found\n".to_string())
    }
}

/// One line per service: name, members, total weight, idle connections.
fn services_table(balancer: &Balancer) -> String {
    let mut out = format!("{:<24} {:>6} {:>10} {:>6}\n", "SERVICE", "ITEMS", "WEIGHT", "IDLE");
    for name in balancer.services() {
        if let Some(upstream) = balancer.upstream(&name) {
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>10} {:>6}",
                name,
                upstream.len(),
                upstream.total_weight(),
                upstream.idle_len()
            );
        }
    }
    out
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
