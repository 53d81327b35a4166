//! Form provisioning: one descriptor per request.
//!
//! Fields come from the query string and from an urlencoded body. The body
//! wins for single-valued fields; every `header` value from either source is
//! kept.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;

use super::{remote_addr, Endpoint};
use crate::error::plain_error;
use crate::site::{parse_checkbox, RawDescriptor};

const URLENCODED: &str = "application/x-www-form-urlencoded";

/// `ANY <route>`: provision the submitted descriptor.
pub async fn provision(State(endpoint): State<Arc<Endpoint>>, req: Request) -> Response {
    let remote = remote_addr(&req);
    let urlencoded = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(true, |ct| ct.starts_with(URLENCODED));
    let query = req.uri().query().unwrap_or_default().to_string();

    let body = if urlencoded {
        match axum::body::to_bytes(req.into_body(), endpoint.max_body).await {
            Ok(b) => b,
            Err(e) => {
                return plain_error(
                    axum::http::StatusCode::PAYLOAD_TOO_LARGE,
                    &format!("unable to read request body - {e}"),
                )
            }
        }
    } else {
        bytes::Bytes::new()
    };

    let raw = parse_form(query.as_bytes(), &body);
    let site = match endpoint.provisioner.provision(raw).await {
        Ok(site) => site,
        Err(e) => return endpoint.reject(remote, e),
    };
    match endpoint.provisioner.render_response(std::slice::from_ref(&site)) {
        Ok(text) => endpoint.ok(text),
        Err(e) => endpoint.reject(remote, e),
    }
}

/// Merge urlencoded `query` and `body` into a descriptor.
pub fn parse_form(query: &[u8], body: &[u8]) -> RawDescriptor {
    let mut raw = RawDescriptor::default();
    for (key, value) in form_urlencoded::parse(query).chain(form_urlencoded::parse(body)) {
        match key.as_ref() {
            "host" => raw.host = value.into_owned(),
            "ip" => raw.ip = value.into_owned(),
            "port" => raw.port = value.trim().parse().ok(),
            "tls" => raw.tls = parse_checkbox(&value),
            "header" => raw.blocked_headers.push(value.into_owned()),
            _ => {}
        }
    }
    raw
}
