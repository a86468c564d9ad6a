//! HTTP server with per-request stats

use crate::body::{AbortGuard, TrackedBody};
use crate::connection::{Connection, CountingIo};
use crate::hub::ServerStatsHub;
use crate::recorder::RequestInfo;
use crate::tracker::ByteCounters;
use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqstats_common::{HeaderField, Headers};
use std::collections::btree_map::Entry;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Body type handlers respond with
pub type ResponseBody = BoxBody<Bytes, Infallible>;

type HandlerFuture = BoxFuture<'static, Result<Response<ResponseBody>>>;
type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

/// HTTP/1.1 server that records stats for every request it dispatches.
///
/// A handler error drops the connection, which records the request as
/// aborted.
pub struct HttpStatsServer {
    handler: Handler,
    hub: ServerStatsHub,
}

impl HttpStatsServer {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<ResponseBody>>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |req: Request<Incoming>| -> HandlerFuture { Box::pin(handler(req)) }),
            hub: ServerStatsHub::new(),
        }
    }

    pub(crate) fn set_hub(&mut self, hub: ServerStatsHub) {
        self.hub = hub;
    }

    pub fn hub(&self) -> &ServerStatsHub {
        &self.hub
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("HTTP server listening on http://{}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let connection = Connection::new();
            debug!(connection = %connection.id(), %remote_addr, "Accepted connection");

            let io = TokioIo::new(CountingIo::new(stream, connection.clone()));
            let server = server.clone();

            tokio::spawn(async move {
                let closed = connection.clone();
                let service = service_fn(move |req| {
                    let server = server.clone();
                    let connection = connection.clone();
                    async move { server.handle_request(req, connection).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error: {:?}", err);
                }
                debug!(
                    connection = %closed.id(),
                    bytes_read = closed.bytes_read(),
                    bytes_written = closed.bytes_written(),
                    "Connection closed"
                );
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        connection: Arc<Connection>,
    ) -> Result<Response<TrackedBody<ResponseBody>>> {
        let bodiless_method = req.method() == Method::HEAD;
        let handle = self.hub.dispatch(request_info(&req, connection));

        let guard = AbortGuard::new(handle.clone());
        let response = (self.handler)(req).await?;
        guard.disarm();

        let status = response.status();
        handle.set_response_head(status.as_u16(), collect_headers(response.headers()));
        let bodiless = bodiless_method || is_bodiless_status(status);

        Ok(response.map(|body| {
            let body = TrackedBody::new(body, handle);
            if bodiless {
                body.bodiless()
            } else {
                body
            }
        }))
    }
}

fn request_info(req: &Request<Incoming>, connection: Arc<Connection>) -> RequestInfo {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path());

    RequestInfo::new(req.method().as_str(), path)
        .with_headers(collect_headers(req.headers()))
        .with_connection(connection)
}

/// Responses hyper sends without a body
fn is_bodiless_status(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// Copy a header map, folding repeated names into one entry
pub fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut collected = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match collected.entry(name.as_str().to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(HeaderField::One(value));
            }
            Entry::Occupied(mut entry) => entry.get_mut().push(value),
        }
    }
    collected
}

/// Create a full body response
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).boxed()
}
