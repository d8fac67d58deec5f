use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use http_body_util::Full;
use hyper::{
    body::{self, Bytes},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use ipnet::IpNet;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{ExporterError, ExporterFuture};
use crate::common::BuildError;
use crate::registry::Registry;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

struct HttpListeningExporter {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    allowed_addresses: Option<Vec<IpNet>>,
}

impl HttpListeningExporter {
    async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ExporterError> {
        let listener = TcpListener::from_std(listener)?;

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Error accepting connection. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            let remote_addr = match stream.peer_addr() {
                Ok(remote_address) => remote_address.ip(),
                Err(e) => {
                    warn!("Error obtaining remote address. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            self.process_stream(stream, remote_addr);
        }
    }

    fn process_stream(&self, stream: TcpStream, remote_address: IpAddr) {
        let inner = self.inner.clone();
        let service = service_fn(move |req: Request<body::Incoming>| {
            let inner = inner.clone();
            let path = req.uri().path().to_owned();
            async move {
                Ok::<_, hyper::Error>(Self::handle_http_request(&inner, remote_address, &path).await)
            }
        });

        tokio::task::spawn(async move {
            if let Err(err) =
                HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!("Error serving connection.  Error: {:?}", err);
            };
        });
    }

    async fn handle_http_request(
        inner: &Inner,
        remote_address: IpAddr,
        path: &str,
    ) -> Response<Full<Bytes>> {
        if !Self::is_allowed(inner, remote_address) {
            debug!(%remote_address, "rejecting scrape from address outside the allowlist");
            return Self::new_forbidden_response();
        }

        match path {
            "/health" => Response::new("OK".into()),
            _ => {
                let mut response = Response::new(inner.registry.render().await.into());
                response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
        }
    }

    fn is_allowed(inner: &Inner, remote_address: IpAddr) -> bool {
        match &inner.allowed_addresses {
            Some(addresses) => addresses.iter().any(|address| address.contains(&remote_address)),
            None => true,
        }
    }

    fn new_forbidden_response() -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::<Bytes>::default());
        *response.status_mut() = StatusCode::FORBIDDEN;
        response
    }
}

/// Creates an `ExporterFuture` implementing an HTTP listener that serves the registry.
///
/// # Errors
/// Will return Err if it cannot bind to the listen address
pub(crate) fn new_http_listener(
    registry: Registry,
    listen_address: SocketAddr,
    allowed_addresses: Option<Vec<IpNet>>,
) -> Result<(SocketAddr, ExporterFuture), BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;
    let local_address = listener
        .local_addr()
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;

    let exporter = HttpListeningExporter { inner: Arc::new(Inner { registry, allowed_addresses }) };

    Ok((local_address, Box::pin(async move { exporter.serve(listener).await })))
}
