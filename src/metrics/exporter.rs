//! HTTP scrape endpoint for the device registry.
//!
//! Serves the registry snapshot on `/metrics` and a short index page on `/`.
//! The server never mutates registry state; it only reads a snapshot per
//! scrape. One task per connection, HTTP/1.1 only.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::metrics::DeviceRegistry;

/// Content type of the OpenMetrics text exposition format.
pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

const INDEX_PAGE: &str = "\
ruuvi-prometheus exporter

/                This page
/metrics         Prometheus metrics endpoint
";

/// Accept scrape connections until the shutdown signal fires.
///
/// The listener is bound by the caller so that bind errors surface at
/// startup rather than inside a background task.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accepting scrape connection failed");
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let registry = Arc::clone(&registry);
                        async move {
                            Ok::<_, Infallible>(respond(req.method(), req.uri().path(), &registry))
                        }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%peer, error = %e, "scrape connection error");
                    }
                });
            }
        }
    }
    debug!("metrics endpoint stopped");
}

fn respond(method: &Method, path: &str, registry: &DeviceRegistry) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => match registry.export() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
                .body(Full::new(Bytes::from(body)))
                .expect("response build failed"),
            Err(e) => {
                error!(error = %e, "metrics snapshot encoding failed");
                plain_text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error\n")
            }
        },
        (&Method::GET, "/") => plain_text(StatusCode::OK, INDEX_PAGE),
        _ => plain_text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn plain_text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("response build failed")
}
