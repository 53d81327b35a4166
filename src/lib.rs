#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! hostmirror library: random-subdomain provisioning and a hostname-rewriting
//! reverse proxy.
//!
//! - `validate`: descriptor validation, IP allow-lists, redirect discovery
//! - `allocate`: label allocation and config file writing
//! - `routes`: provisioning HTTP handlers
//! - `replacer`: streaming byte substitution
//! - `dialer`: pinned-address connector
//! - `proxy`: the rewriting reverse proxy
//! - `config`: configuration loading

pub mod allocate;
pub mod config;
pub mod dialer;
pub mod error;
pub mod proxy;
pub mod replacer;
pub mod routes;
pub mod site;
pub mod template;
pub mod validate;

pub use allocate::Allocator;
pub use config::Config;
pub use dialer::{DialContext, ProxyTarget, StaticDialer};
pub use error::{ConfigError, ProvisionError, ProxyError};
pub use proxy::RewriteProxy;
pub use replacer::{ReplaceError, Replacer};
pub use routes::Provisioner;
pub use site::{RawDescriptor, SiteDescriptor};
pub use validate::{IpAllowList, Validator};
