//! Error types for provisioning, proxying and configuration.
//!
//! Every error renders as a single human-readable line. Provisioning errors
//! carry their HTTP status: validation failures are `412 Precondition Failed`,
//! everything past validation is `500 Internal Server Error`.

use std::fmt;
use std::io;
use std::path::PathBuf;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::replacer::ReplaceError;

/// Failures while validating a descriptor or writing its config file.
#[derive(Debug)]
pub enum ProvisionError {
    /// The request carried no hostname.
    NoHostname,
    /// The request carried no IP address.
    NoIp,
    /// The hostname has fewer than two labels or a non-alphanumeric label.
    BadHost(String),
    /// The IP address does not parse.
    BadIp(String),
    /// The IP address falls outside every allowed range.
    BlockedIp(String),
    /// No free label was found within the attempt budget.
    NameExhausted { attempts: usize },
    /// The config directory refused file creation.
    FilePermission { path: PathBuf, source: io::Error },
    /// Any other failure creating or writing the config file.
    FileUnexpected { path: PathBuf, source: io::Error },
    /// The config file was written but could not be flushed to disk.
    FileClose { path: PathBuf, source: io::Error },
    /// Rendering failed and the half-written file could not be removed.
    FileCleanup { path: PathBuf, source: io::Error },
    /// A template failed to render.
    TemplateRender(minijinja::Error),
    /// Redirect discovery did not complete. Recovered locally.
    Discovery { url: String, reason: String },
}

impl ProvisionError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        if self.is_rejection() {
            StatusCode::PRECONDITION_FAILED
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    /// Returns `true` for errors caused by the request contents rather than
    /// the server.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NoHostname | Self::NoIp | Self::BadHost(_) | Self::BadIp(_) | Self::BlockedIp(_)
        )
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHostname => write!(f, "no provided hostname"),
            Self::NoIp => write!(f, "no provided IP"),
            Self::BadHost(host) => write!(f, "bad hostname provided [{host}]"),
            Self::BadIp(ip) => write!(f, "bad IP provided [{ip}]"),
            Self::BlockedIp(ip) => write!(f, "IP address provided - [{ip}] - was not allowed"),
            Self::NameExhausted { attempts } => write!(
                f,
                "was not given a new random domain after {attempts} attempts"
            ),
            Self::FilePermission { path, source } => write!(
                f,
                "permission denied to create file [{}] - {source}",
                path.display()
            ),
            Self::FileUnexpected { path, source } => {
                write!(f, "unknown error with file [{}] - {source}", path.display())
            }
            Self::FileClose { path, source } => {
                write!(f, "failed to close the file [{}] - {source}", path.display())
            }
            Self::FileCleanup { path, source } => {
                write!(f, "failed to remove file [{}] - {source}", path.display())
            }
            Self::TemplateRender(e) => write!(f, "failed to render template - {e}"),
            Self::Discovery { url, reason } => {
                write!(f, "unable to trace out domain {url} - {reason}")
            }
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FilePermission { source, .. }
            | Self::FileUnexpected { source, .. }
            | Self::FileClose { source, .. }
            | Self::FileCleanup { source, .. } => Some(source),
            Self::TemplateRender(e) => Some(e),
            _ => None,
        }
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        plain_error(self.status(), &self.to_string())
    }
}

/// Failures on the proxy data plane.
#[derive(Debug)]
pub enum ProxyError {
    /// The inbound request could not be turned into an outbound one.
    BadRequest(String),
    /// The pinned backend could not be reached.
    Dial(hyper_util::client::legacy::Error),
    /// The backend was reached but the exchange failed.
    Upstream(hyper_util::client::legacy::Error),
    /// The body rewriter refused its configuration.
    Rewrite(ReplaceError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dial(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) | Self::Rewrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        if e.is_connect() {
            Self::Dial(e)
        } else {
            Self::Upstream(e)
        }
    }
}

impl From<ReplaceError> for ProxyError {
    fn from(e: ReplaceError) -> Self {
        Self::Rewrite(e)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(reason) => write!(f, "unable to build backend request - {reason}"),
            Self::Dial(e) => write!(f, "unable to reach backend - {}", chain(e)),
            Self::Upstream(e) => write!(f, "backend request failed - {}", chain(e)),
            Self::Rewrite(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial(e) | Self::Upstream(e) => Some(e),
            Self::Rewrite(e) => Some(e),
            Self::BadRequest(_) => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        plain_error(self.status(), &self.to_string())
    }
}

/// Failures while loading configuration. All of them are fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Template { path: PathBuf, reason: String },
    IpFile { path: PathBuf, source: io::Error },
    Handler { route: String, reason: String },
    Proxy(String),
    Tracer(reqwest::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "error reading config file {} - {source}", path.display())
            }
            Self::Parse { path, source } => write!(
                f,
                "unable to decode config file {} - {}",
                path.display(),
                source.message()
            ),
            Self::Template { path, reason } => {
                write!(f, "bad template at {} - {reason}", path.display())
            }
            Self::IpFile { path, source } => {
                write!(f, "bad ip file - {} - {source}", path.display())
            }
            Self::Handler { route, reason } => {
                write!(f, "bad handler config for route [{route}] - {reason}")
            }
            Self::Proxy(reason) => write!(f, "bad proxy config - {reason}"),
            Self::Tracer(e) => write!(f, "unable to build redirect tracer - {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::IpFile { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Tracer(e) => Some(e),
            _ => None,
        }
    }
}

/// A `text/plain` error body: one line, newline-terminated.
pub fn plain_error(status: StatusCode, message: &str) -> Response {
    let line = message.replace(['\r', '\n'], " ");
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{line}\n"),
    )
        .into_response()
}

/// Flatten an error and its sources onto one line.
fn chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut next = e.source();
    while let Some(cause) = next {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        next = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> io::Error {
        io::Error::other("fake error")
    }

    #[test]
    fn test_messages() {
        let path = PathBuf::from("/tmp/testfile");
        let cases: Vec<(ProvisionError, &str)> = vec![
            (
                ProvisionError::FileClose {
                    path: path.clone(),
                    source: fake(),
                },
                "failed to close the file [/tmp/testfile] - fake error",
            ),
            (
                ProvisionError::FileCleanup {
                    path: path.clone(),
                    source: fake(),
                },
                "failed to remove file [/tmp/testfile] - fake error",
            ),
            (
                ProvisionError::FilePermission {
                    path: path.clone(),
                    source: fake(),
                },
                "permission denied to create file [/tmp/testfile] - fake error",
            ),
            (
                ProvisionError::FileUnexpected {
                    path,
                    source: fake(),
                },
                "unknown error with file [/tmp/testfile] - fake error",
            ),
            (
                ProvisionError::BadHost("sub.do;main.com".into()),
                "bad hostname provided [sub.do;main.com]",
            ),
            (
                ProvisionError::BadIp("127.1".into()),
                "bad IP provided [127.1]",
            ),
            (ProvisionError::NoIp, "no provided IP"),
            (ProvisionError::NoHostname, "no provided hostname"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(
            ProvisionError::BlockedIp("8.8.8.8".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(ProvisionError::NoHostname.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            ProvisionError::NameExhausted { attempts: 3 }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(!ProvisionError::FileUnexpected {
            path: PathBuf::new(),
            source: fake()
        }
        .is_rejection());
    }

    #[tokio::test]
    async fn test_response_is_single_line() {
        let resp = plain_error(StatusCode::BAD_GATEWAY, "first\nsecond");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"first second\n");
    }
}
