//! Random subdomain allocation and config file writing.
//!
//! A label is reserved by creating `<conf_dir>/<label>.<base_domain><ext>`
//! with exclusive-create semantics. There is no in-process lock: if two
//! allocations draw the same label, exactly one create succeeds and the
//! other redraws.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::error::ProvisionError;
use crate::site::SiteDescriptor;
use crate::template::{self, Templates};

/// Letters labels are drawn from.
pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";
pub const DEFAULT_LABEL_LEN: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;

/// Draws free labels under one base domain and writes a rendered config
/// file for each.
pub struct Allocator {
    alphabet: Vec<char>,
    label_len: usize,
    base_domain: String,
    exclude: HashSet<String>,
    conf_dir: PathBuf,
    conf_ext: String,
    templates: Arc<Templates>,
    max_attempts: usize,
}

impl Allocator {
    /// `templates` must contain [`template::SITE`].
    pub fn new(
        base_domain: impl Into<String>,
        conf_dir: impl Into<PathBuf>,
        templates: Arc<Templates>,
    ) -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.chars().collect(),
            label_len: DEFAULT_LABEL_LEN,
            base_domain: base_domain.into().trim_matches('.').to_string(),
            exclude: HashSet::new(),
            conf_dir: conf_dir.into(),
            conf_ext: String::new(),
            templates,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Characters labels are drawn from. An empty alphabet keeps the default.
    #[must_use]
    pub fn with_alphabet(mut self, alphabet: &str) -> Self {
        if !alphabet.is_empty() {
            self.alphabet = alphabet.chars().collect();
        }
        self
    }

    #[must_use]
    pub fn with_label_len(mut self, len: usize) -> Self {
        self.label_len = len.max(1);
        self
    }

    /// Reserved names. Entries may be bare labels or full hostnames.
    #[must_use]
    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// File extension, with or without a leading dot.
    #[must_use]
    pub fn with_extension(mut self, ext: &str) -> Self {
        let ext = ext.trim_start_matches('.');
        self.conf_ext = if ext.is_empty() {
            String::new()
        } else {
            format!(".{ext}")
        };
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// A random label. Not checked against the exclusion set.
    pub fn draw_label(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.label_len)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())])
            .collect()
    }

    pub fn is_excluded(&self, label: &str) -> bool {
        self.exclude.contains(label) || self.exclude.contains(&self.hostname(label))
    }

    pub fn hostname(&self, label: &str) -> String {
        format!("{label}.{}", self.base_domain)
    }

    /// Config file path for an external hostname.
    pub fn path_for(&self, hostname: &str) -> PathBuf {
        self.conf_dir.join(format!("{hostname}{}", self.conf_ext))
    }

    /// Reserve a free label, render `site` into its config file and return
    /// the descriptor with `ext_host` filled in.
    pub async fn allocate_and_write(
        &self,
        mut site: SiteDescriptor,
    ) -> Result<SiteDescriptor, ProvisionError> {
        for _ in 0..self.max_attempts {
            let label = self.draw_label();
            if self.is_excluded(&label) {
                debug!(label, "drew excluded label, redrawing");
                continue;
            }

            let hostname = self.hostname(&label);
            let path = self.path_for(&hostname);
            let file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "config file exists, redrawing");
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    return Err(ProvisionError::FilePermission { path, source: e });
                }
                Err(e) => return Err(ProvisionError::FileUnexpected { path, source: e }),
            };

            site.ext_host = hostname;
            self.write(file, &path, &site).await?;
            info!(ext_host = %site.ext_host, path = %path.display(), "allocated site");
            return Ok(site);
        }

        Err(ProvisionError::NameExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn write(
        &self,
        mut file: fs::File,
        path: &Path,
        site: &SiteDescriptor,
    ) -> Result<(), ProvisionError> {
        let rendered = match self.templates.render(template::SITE, site) {
            Ok(text) => text,
            Err(e) => {
                drop(file);
                remove_orphan(path).await?;
                return Err(ProvisionError::TemplateRender(e));
            }
        };

        if let Err(e) = file.write_all(rendered.as_bytes()).await {
            drop(file);
            remove_orphan(path).await?;
            return Err(ProvisionError::FileUnexpected {
                path: path.to_path_buf(),
                source: e,
            });
        }

        let close = async {
            file.flush().await?;
            file.sync_all().await
        };
        close.await.map_err(|e| ProvisionError::FileClose {
                path: path.to_path_buf(),
                source: e,
            })
    }
}

async fn remove_orphan(path: &Path) -> Result<(), ProvisionError> {
    fs::remove_file(path).await.map_err(|e| {
        error!(path = %path.display(), "orphaned config file: {e}");
        ProvisionError::FileCleanup {
            path: path.to_path_buf(),
            source: e,
        }
    })
}
