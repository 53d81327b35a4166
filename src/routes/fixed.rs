//! Static response route.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};

/// A file read once at startup.
pub struct StaticFile {
    body: Bytes,
    content_type: String,
}

impl StaticFile {
    pub fn new(body: Bytes, content_type: String) -> Self {
        Self { body, content_type }
    }
}

/// `ANY <route>`: the file's bytes, verbatim.
pub async fn serve(State(file): State<Arc<StaticFile>>) -> Response {
    (
        [(CONTENT_TYPE, file.content_type.clone())],
        file.body.clone(),
    )
        .into_response()
}
