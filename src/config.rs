//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HOSTMIRROR_LISTEN` (comma separated),
//!    `HOSTMIRROR_BASE_DOMAIN`, `HOSTMIRROR_CONF_PATH`
//! 2. **Config file**: path via `--config <path>`, or `hostmirror.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = ["0.0.0.0:8080"]
//! max_body_bytes = 1048576
//!
//! [logging]
//! level = "info"
//!
//! # Inherited by every [[handler]] unless overridden there
//! [defaults]
//! base_domain = "proxy.example.com"
//! conf_path = "/etc/hostmirror/sites"
//! conf_ext = ".conf"
//! conf_template = "site.conf.j2"
//! res_template = "response.j2"
//! exclude = ["www", "mail"]
//! subdomain_len = 8
//! ip_file = "/etc/hostmirror/allowed.cidr"
//! redirect_trace = false
//! max_attempts = 1000
//!
//! [[handler]]
//! kind = "form"                # form | json | static
//! route = "/"
//!
//! [[handler]]
//! kind = "json"
//! route = "/api/stream"
//! start_template = "start.j2"  # all four enable streaming output
//! body_template = "body.j2"
//! end_template = "end.j2"
//! error_template = "error.j2"
//!
//! [[handler]]
//! kind = "static"
//! route = "/index.html"
//! res_file = "index.html"
//!
//! # Optional, omit entirely to disable `hostmirror proxy`
//! [proxy]
//! listen = "0.0.0.0:8081"
//! external_host = "abcdefgh.proxy.example.com"
//! internal_host = "backend.internal.example"
//! ip = "10.0.0.5"
//! port = 80
//! buffer_size = 1048576
//! connect_timeout_ms = 10000
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::allocate::{DEFAULT_LABEL_LEN, DEFAULT_MAX_ATTEMPTS};
use crate::dialer::ProxyTarget;
use crate::error::ConfigError;
use crate::proxy::RewriteProxy;
use crate::replacer::DEFAULT_BUFFER_SIZE;
use crate::template::{self, Templates};
use crate::validate::IpAllowList;

const DEFAULT_CONFIG_FILE: &str = "hostmirror.toml";

/// Content type of rendered responses when the template name says nothing.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Handler settings inherited by every `[[handler]]`.
    #[serde(default)]
    pub defaults: HandlerSettings,
    #[serde(default, rename = "handler")]
    pub handlers: Vec<HandlerSection>,
    /// Optional rewriting proxy for `hostmirror proxy`.
    pub proxy: Option<ProxySection>,
}

/// Provisioning server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket addresses to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Largest accepted provisioning request body (default 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// What a provisioning route does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Form or query string submission of a single descriptor.
    Form,
    /// JSON array of descriptors, optionally answered as a stream.
    Json,
    /// A fixed file returned verbatim.
    Static,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Form => "form",
            Self::Json => "json",
            Self::Static => "static",
        })
    }
}

/// Per-handler settings. Every key is optional; unset keys fall back to
/// `[defaults]` and then to compiled defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerSettings {
    pub base_domain: Option<String>,
    pub conf_path: Option<PathBuf>,
    pub conf_ext: Option<String>,
    pub conf_template: Option<PathBuf>,
    pub res_template: Option<PathBuf>,
    pub res_file: Option<PathBuf>,
    pub exclude: Option<Vec<String>>,
    pub subdomain_len: Option<usize>,
    pub ip_file: Option<PathBuf>,
    pub redirect_trace: Option<bool>,
    pub max_attempts: Option<usize>,
    pub start_template: Option<PathBuf>,
    pub body_template: Option<PathBuf>,
    pub end_template: Option<PathBuf>,
    pub error_template: Option<PathBuf>,
}

impl HandlerSettings {
    /// `self` with every unset key taken from `base`.
    #[must_use]
    pub fn or(self, base: &HandlerSettings) -> HandlerSettings {
        HandlerSettings {
            base_domain: self.base_domain.or_else(|| base.base_domain.clone()),
            conf_path: self.conf_path.or_else(|| base.conf_path.clone()),
            conf_ext: self.conf_ext.or_else(|| base.conf_ext.clone()),
            conf_template: self.conf_template.or_else(|| base.conf_template.clone()),
            res_template: self.res_template.or_else(|| base.res_template.clone()),
            res_file: self.res_file.or_else(|| base.res_file.clone()),
            exclude: self.exclude.or_else(|| base.exclude.clone()),
            subdomain_len: self.subdomain_len.or(base.subdomain_len),
            ip_file: self.ip_file.or_else(|| base.ip_file.clone()),
            redirect_trace: self.redirect_trace.or(base.redirect_trace),
            max_attempts: self.max_attempts.or(base.max_attempts),
            start_template: self.start_template.or_else(|| base.start_template.clone()),
            body_template: self.body_template.or_else(|| base.body_template.clone()),
            end_template: self.end_template.or_else(|| base.end_template.clone()),
            error_template: self.error_template.or_else(|| base.error_template.clone()),
        }
    }
}

/// One `[[handler]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerSection {
    pub kind: HandlerKind,
    pub route: String,
    #[serde(flatten)]
    pub settings: HandlerSettings,
}

/// The rewriting reverse proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Socket address to bind (default `0.0.0.0:8081`).
    #[serde(default = "default_proxy_listen")]
    pub listen: String,
    /// Hostname clients use to reach the backend.
    pub external_host: String,
    /// Hostname the backend expects.
    pub internal_host: String,
    /// Pinned backend address. Never resolved from either hostname.
    pub ip: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Body rewriting buffer in bytes (default 1 MiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// TCP connect timeout in milliseconds, 0 for none (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// A fully resolved handler, ready to be mounted.
pub struct HandlerConfig {
    pub kind: HandlerKind,
    pub route: String,
    pub base_domain: String,
    pub conf_path: PathBuf,
    pub conf_ext: String,
    pub subdomain_len: usize,
    pub exclude: Vec<String>,
    pub max_attempts: usize,
    /// Site, response and (for streaming JSON) section templates.
    pub templates: Arc<Templates>,
    /// Content type of rendered responses, guessed from `res_template`.
    pub res_content_type: String,
    pub ip_allow_list: IpAllowList,
    pub redirect_trace: bool,
    /// Body and content type of a static handler.
    pub static_file: Option<(Bytes, String)>,
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:8080".to_string()]
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_proxy_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_proxy_port() -> u16 {
    80
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `hostmirror.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Env var overrides, read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("HOSTMIRROR_LISTEN") {
            self.server.listen = listen
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(domain) = var("HOSTMIRROR_BASE_DOMAIN") {
            self.defaults.base_domain = Some(domain);
        }
        if let Some(dir) = var("HOSTMIRROR_CONF_PATH") {
            self.defaults.conf_path = Some(PathBuf::from(dir));
        }
    }

    /// Resolve every `[[handler]]` against `[defaults]`, loading templates,
    /// allow-lists and static files.
    pub fn handlers(&self) -> Result<Vec<HandlerConfig>, ConfigError> {
        self.handlers
            .iter()
            .map(|section| section.resolve(&self.defaults))
            .collect()
    }
}

impl HandlerSection {
    fn resolve(&self, defaults: &HandlerSettings) -> Result<HandlerConfig, ConfigError> {
        let route = self.route.clone();
        let fail = |reason: String| ConfigError::Handler {
            route: route.clone(),
            reason,
        };
        if !route.starts_with('/') {
            return Err(fail("route must start with '/'".into()));
        }

        let s = self.settings.clone().or(defaults);
        let mut templates = Templates::new();
        let mut static_file = None;

        match self.kind {
            HandlerKind::Static => {
                let path = s.res_file.clone().ok_or_else(|| fail("missing res_file".into()))?;
                let body = std::fs::read(&path).map_err(|e| {
                    fail(format!("unable to read res_file {} - {e}", path.display()))
                })?;
                let content_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string();
                static_file = Some((Bytes::from(body), content_type));
            }
            HandlerKind::Form | HandlerKind::Json => {
                let conf = s
                    .conf_template
                    .as_deref()
                    .ok_or_else(|| fail("missing conf_template".into()))?;
                templates.load(template::SITE, conf)?;

                let sections = [
                    (template::START, &s.start_template),
                    (template::BODY, &s.body_template),
                    (template::END, &s.end_template),
                    (template::ERROR, &s.error_template),
                ];
                let given = sections.iter().filter(|(_, p)| p.is_some()).count();
                let streaming = self.kind == HandlerKind::Json && given == sections.len();
                if self.kind == HandlerKind::Json && given != 0 && !streaming {
                    return Err(fail(
                        "streaming needs all of start_template, body_template, end_template and error_template".into(),
                    ));
                }
                if streaming {
                    for (name, path) in sections {
                        if let Some(path) = path {
                            templates.load(name, path)?;
                        }
                    }
                } else {
                    let res = s
                        .res_template
                        .as_deref()
                        .ok_or_else(|| fail("missing res_template".into()))?;
                    templates.load(template::RESPONSE, res)?;
                }

                if s.base_domain.as_deref().map_or(true, |d| d.trim_matches('.').is_empty()) {
                    return Err(fail("missing base_domain".into()));
                }
            }
        }

        let ip_allow_list = match &s.ip_file {
            Some(path) => IpAllowList::from_file(path)?,
            None => IpAllowList::default(),
        };

        Ok(HandlerConfig {
            kind: self.kind,
            route: self.route.clone(),
            base_domain: s.base_domain.unwrap_or_default(),
            conf_path: s.conf_path.unwrap_or_else(|| PathBuf::from(".")),
            conf_ext: s.conf_ext.unwrap_or_default(),
            subdomain_len: s.subdomain_len.unwrap_or(DEFAULT_LABEL_LEN),
            exclude: s.exclude.unwrap_or_default(),
            max_attempts: s.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            templates: Arc::new(templates),
            res_content_type: s
                .res_template
                .as_deref()
                .and_then(|p| {
                    mime_guess::from_path(p)
                        .first()
                        .or_else(|| mime_guess::from_path(p.with_extension("")).first())
                })
                .map_or_else(|| DEFAULT_CONTENT_TYPE.to_string(), |m| m.to_string()),
            ip_allow_list,
            redirect_trace: s.redirect_trace.unwrap_or(false),
            static_file,
        })
    }
}

impl ProxySection {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Build the proxy; its backend connections close when `shutdown` fires.
    pub fn build(&self, shutdown: CancellationToken) -> Result<RewriteProxy, ConfigError> {
        if self.external_host.is_empty() || self.internal_host.is_empty() {
            return Err(ConfigError::Proxy(
                "external_host and internal_host are required".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Proxy("port must be non-zero".into()));
        }
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ConfigError::Proxy(format!("bad ip [{}]", self.ip)))?;

        let proxy = RewriteProxy::new(
            self.external_host.clone(),
            self.internal_host.clone(),
            ProxyTarget::new(ip, self.port),
            self.buffer_size,
        )
        .map_err(|e| ConfigError::Proxy(e.to_string()))?;
        Ok(proxy
            .connect_timeout(self.connect_timeout())
            .shutdown_on(shutdown))
    }
}
