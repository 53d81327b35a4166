//! Named templates for site config files and provisioning responses.
//!
//! Templates use minijinja syntax and are rendered against serialized
//! [`crate::site::SiteDescriptor`] values, so a site config template looks like
//!
//! ```text
//! {{ int_host }} {{ int_ip }} {{ int_port }} {{ encrypted }} {% for h in strip_headers %}{{ h }} {% endfor %}
//! ```

use std::path::Path;

use minijinja::value::ValueKind;
use minijinja::{Environment, Error, Output, State, Value};
use serde::Serialize;

use crate::error::ConfigError;

/// Template rendered into each allocated config file.
pub const SITE: &str = "site";
/// Template rendered as the provisioning response.
pub const RESPONSE: &str = "response";
/// Streaming JSON response sections.
pub const START: &str = "start";
pub const BODY: &str = "body";
pub const END: &str = "end";
pub const ERROR: &str = "error";

/// A set of compiled templates addressed by name.
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_formatter(format_value);
        Self { env }
    }

    /// Compile `source` under `name`, replacing any previous template.
    pub fn add(&mut self, name: &str, source: impl Into<String>) -> Result<(), minijinja::Error> {
        self.env
            .add_template_owned(name.to_string(), source.into())
    }

    /// Read and compile the template file at `path` under `name`.
    pub fn load(&mut self, name: &str, path: &Path) -> Result<(), ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Template {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.add(name, source).map_err(|e| ConfigError::Template {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// True when all four streaming sections are present.
    pub fn is_streaming(&self) -> bool {
        [START, BODY, END, ERROR].iter().all(|name| self.has(name))
    }

    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(ctx)
    }
}

/// Booleans print as `true`/`false`; everything else as minijinja would.
fn format_value(out: &mut Output, state: &State, value: &Value) -> Result<(), Error> {
    if value.kind() == ValueKind::Bool {
        out.write_str(if value.is_true() { "true" } else { "false" })?;
        return Ok(());
    }
    minijinja::escape_formatter(out, state, value)
}

impl Default for Templates {
    fn default() -> Self {
        Self::new()
    }
}
