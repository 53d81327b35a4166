//! JSON provisioning: many descriptors per request.
//!
//! [`provision`] answers with one rendered response once every descriptor is
//! written. [`provision_stream`] decodes the body as it arrives and renders
//! `start`, then a `body` or `error` section per descriptor as it is
//! processed, then `end`.

use std::io;
use std::sync::Arc;

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{remote_addr, Endpoint};
use crate::error::plain_error;
use crate::site::RawDescriptor;
use crate::template::{self, Templates};

/// Rendered sections buffered ahead of a slow client.
const STREAM_BACKLOG: usize = 16;

async fn read_body(endpoint: &Endpoint, req: Request) -> Result<Bytes, Response> {
    axum::body::to_bytes(req.into_body(), endpoint.max_body)
        .await
        .map_err(|e| {
            plain_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("unable to read request body - {e}"),
            )
        })
}

/// `POST <route>`: provision a JSON array of descriptors in order.
///
/// The first validation failure answers 412 and the first write failure
/// 500. Descriptors before the failing one stay written.
pub async fn provision(State(endpoint): State<Arc<Endpoint>>, req: Request) -> Response {
    let remote = remote_addr(&req);
    let body = match read_body(&endpoint, req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let raws: Vec<RawDescriptor> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(route = %endpoint.route, remote = ?remote, "bad JSON body: {e}");
            return plain_error(StatusCode::BAD_REQUEST, &format!("bad JSON body - {e}"));
        }
    };

    let mut sites = Vec::with_capacity(raws.len());
    for raw in raws {
        match endpoint.provisioner.provision(raw).await {
            Ok(site) => sites.push(site),
            Err(e) => return endpoint.reject(remote, e),
        }
    }

    match endpoint.provisioner.render_response(&sites) {
        Ok(text) => endpoint.ok(text),
        Err(e) => endpoint.reject(remote, e),
    }
}

/// `POST <route>`: provision descriptors one at a time, streaming a rendered
/// section for each.
///
/// The body is either one JSON array or a sequence of JSON objects
/// (concatenated or newline-delimited). Objects in a sequence are provisioned
/// as soon as they have been received. Elements that are not descriptors
/// are skipped.
pub async fn provision_stream(State(endpoint): State<Arc<Endpoint>>, req: Request) -> Response {
    let remote = remote_addr(&req);
    let body = req.into_body().into_data_stream();

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_BACKLOG);
    let worker = Arc::clone(&endpoint);
    tokio::spawn(async move {
        if let Err(e) = stream_sections(&worker, body, &tx).await {
            error!(route = %worker.route, remote = ?remote, "stream aborted: {e}");
            let _ = tx.send(Err(e)).await;
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    endpoint.ok(Body::from_stream(stream))
}

fn section<S: Serialize>(templates: &Templates, name: &str, ctx: S) -> io::Result<String> {
    templates.render(name, ctx).map_err(io::Error::other)
}

/// Render every section into `tx`. Returns early if the client went away.
async fn stream_sections(
    endpoint: &Endpoint,
    mut body: BodyDataStream,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<()> {
    let templates = endpoint.provisioner.templates();
    let send = |text: String| async move { tx.send(Ok(Bytes::from(text))).await.is_ok() };

    if !send(section(templates, template::START, json!({}))?).await {
        return Ok(());
    }

    let mut decoder = ElementDecoder::default();
    let mut received = 0usize;
    let (mut written, mut failed) = (0usize, 0usize);
    let mut finished = false;

    while !finished && !decoder.stopped() {
        let elements = match body.next().await {
            Some(chunk) => {
                let chunk = chunk.map_err(io::Error::other)?;
                received += chunk.len();
                if received > endpoint.max_body {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("request body exceeds {} bytes", endpoint.max_body),
                    ));
                }
                decoder.push(&chunk)
            }
            None => {
                finished = true;
                decoder.finish()
            }
        };

        for element in elements {
            let raw: RawDescriptor = match serde_json::from_value(element) {
                Ok(r) => r,
                Err(e) => {
                    warn!(route = %endpoint.route, "skipping malformed element: {e}");
                    continue;
                }
            };
            let text = match endpoint.provisioner.provision(raw.clone()).await {
                Ok(site) => {
                    written += 1;
                    section(templates, template::BODY, &site)?
                }
                Err(e) => {
                    failed += 1;
                    if e.is_rejection() {
                        warn!(route = %endpoint.route, host = %raw.host, "rejected: {e}");
                    } else {
                        error!(route = %endpoint.route, host = %raw.host, "provisioning failed: {e}");
                    }
                    section(
                        templates,
                        template::ERROR,
                        json!({ "error": e.to_string(), "host": raw.host, "ip": raw.ip }),
                    )?
                }
            };
            if !send(text).await {
                debug!(route = %endpoint.route, "client left mid-stream");
                return Ok(());
            }
        }
    }

    send(section(
        templates,
        template::END,
        json!({ "written": written, "failed": failed }),
    )?)
    .await;
    Ok(())
}

/// Splits an incrementally received body into top-level JSON values.
///
/// A top-level array yields its items. Decoding stops for good at the first
/// syntax error.
#[derive(Default)]
struct ElementDecoder {
    pending: Vec<u8>,
    stopped: bool,
}

impl ElementDecoder {
    /// Append `chunk` and return every value it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Values left once the body has ended. A truncated value is an error.
    fn finish(&mut self) -> Vec<Value> {
        self.drain(true)
    }

    fn stopped(&self) -> bool {
        self.stopped
    }

    fn drain(&mut self, at_end: bool) -> Vec<Value> {
        let mut out = Vec::new();
        if self.stopped {
            return out;
        }

        let mut values = serde_json::Deserializer::from_slice(&self.pending).into_iter::<Value>();
        loop {
            match values.next() {
                None => break,
                Some(Ok(Value::Array(items))) => out.extend(items),
                Some(Ok(v)) => out.push(v),
                // incomplete value, wait for more input
                Some(Err(e)) if e.is_eof() && !at_end => break,
                Some(Err(e)) => {
                    warn!("stopping at malformed JSON: {e}");
                    self.stopped = true;
                    break;
                }
            }
        }
        let consumed = values.byte_offset();
        self.pending.drain(..consumed);
        out
    }
}
