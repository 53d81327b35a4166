//! Provisioning routes.
//!
//! Each configured handler becomes one route. Its [`HandlerKind`] is resolved
//! here, once, into the axum handler that serves it:
//!
//! | Kind     | Handler                      | Body                              |
//! |----------|------------------------------|-----------------------------------|
//! | `form`   | [`form::provision`]          | query string and/or urlencoded    |
//! | `json`   | [`json::provision`]          | JSON array of descriptors         |
//! | `json`   | [`json::provision_stream`]   | same, with streaming templates    |
//! | `static` | [`fixed::serve`]             | ignored                           |

pub mod fixed;
pub mod form;
pub mod json;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::Router;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::allocate::Allocator;
use crate::config::{HandlerConfig, HandlerKind};
use crate::error::{ConfigError, ProvisionError};
use crate::site::{RawDescriptor, SiteDescriptor};
use crate::template::{self, Templates};
use crate::validate::Validator;

/// Validates descriptors and reserves a config file for each.
pub struct Provisioner {
    validator: Validator,
    allocator: Allocator,
    templates: Arc<Templates>,
}

impl Provisioner {
    pub fn new(validator: Validator, allocator: Allocator, templates: Arc<Templates>) -> Self {
        Self {
            validator,
            allocator,
            templates,
        }
    }

    pub fn from_config(cfg: &HandlerConfig) -> Result<Self, ConfigError> {
        let mut validator = Validator::new(cfg.ip_allow_list.clone());
        if cfg.redirect_trace {
            validator = validator.with_redirect_trace()?;
        }
        let allocator = Allocator::new(
            cfg.base_domain.clone(),
            cfg.conf_path.clone(),
            Arc::clone(&cfg.templates),
        )
        .with_label_len(cfg.subdomain_len)
        .with_exclude(cfg.exclude.iter().cloned())
        .with_extension(&cfg.conf_ext)
        .with_max_attempts(cfg.max_attempts);
        Ok(Self::new(validator, allocator, Arc::clone(&cfg.templates)))
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Validate `raw`, then allocate a label and write its config file.
    /// Nothing is written for a descriptor that fails validation.
    pub async fn provision(&self, raw: RawDescriptor) -> Result<SiteDescriptor, ProvisionError> {
        let site = self.validator.validate(raw).await?;
        self.allocator.allocate_and_write(site).await
    }

    /// Render the response template over the provisioned sites.
    ///
    /// The template sees `sites`, plus `site` and `ext_host` for the first
    /// entry. `ExtHost` is an alias of `ext_host`.
    pub fn render_response(&self, sites: &[SiteDescriptor]) -> Result<String, ProvisionError> {
        let first = sites.first();
        let ext_host = first.map(|s| s.ext_host.as_str());
        let ctx = json!({
            "sites": sites,
            "site": first,
            "ext_host": ext_host,
            "ExtHost": ext_host,
        });
        self.templates
            .render(template::RESPONSE, ctx)
            .map_err(ProvisionError::TemplateRender)
    }
}

/// State shared by the requests of one provisioning route.
pub struct Endpoint {
    pub route: String,
    pub provisioner: Provisioner,
    pub content_type: String,
    pub max_body: usize,
}

impl Endpoint {
    /// Log a failed request and turn it into its response.
    pub fn reject(&self, remote: Option<SocketAddr>, err: ProvisionError) -> Response {
        if err.is_rejection() {
            warn!(route = %self.route, remote = ?remote, "rejected: {err}");
        } else {
            error!(route = %self.route, remote = ?remote, "provisioning failed: {err}");
        }
        err.into_response()
    }

    /// A 200 response carrying rendered output.
    pub fn ok(&self, body: impl Into<axum::body::Body>) -> Response {
        ([(CONTENT_TYPE, self.content_type.clone())], body.into()).into_response()
    }
}

/// Remote address recorded by `into_make_service_with_connect_info`, if any.
pub fn remote_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Mount every handler on one router.
///
/// Fails on a duplicate route or a handler that cannot be built.
pub fn build_router(handlers: Vec<HandlerConfig>, max_body: usize) -> Result<Router, ConfigError> {
    let mut seen = HashSet::new();
    let mut app = Router::new();

    for cfg in handlers {
        if !seen.insert(cfg.route.clone()) {
            return Err(ConfigError::Handler {
                route: cfg.route,
                reason: "route configured twice".into(),
            });
        }
        info!(route = %cfg.route, kind = %cfg.kind, "mounting handler");

        let route = cfg.route.clone();
        let router = match cfg.kind {
            HandlerKind::Static => {
                let file = cfg.static_file.clone().ok_or_else(|| ConfigError::Handler {
                    route: route.clone(),
                    reason: "static handler without a response file".into(),
                })?;
                Router::new()
                    .route(&route, any(fixed::serve))
                    .with_state(Arc::new(fixed::StaticFile::new(file.0, file.1)))
            }
            HandlerKind::Form => Router::new()
                .route(&route, any(form::provision))
                .with_state(endpoint(&cfg, max_body)?),
            HandlerKind::Json if cfg.templates.is_streaming() => Router::new()
                .route(&route, post(json::provision_stream))
                .with_state(endpoint(&cfg, max_body)?),
            HandlerKind::Json => Router::new()
                .route(&route, post(json::provision))
                .with_state(endpoint(&cfg, max_body)?),
        };
        app = app.merge(router);
    }

    Ok(app
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http()))
}

fn endpoint(cfg: &HandlerConfig, max_body: usize) -> Result<Arc<Endpoint>, ConfigError> {
    Ok(Arc::new(Endpoint {
        route: cfg.route.clone(),
        provisioner: Provisioner::from_config(cfg)?,
        content_type: cfg.res_content_type.clone(),
        max_body,
    }))
}
