//! Descriptor validation: hostname syntax, IP allow-listing, port bounds and
//! optional redirect discovery.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::error::{ConfigError, ProvisionError};
use crate::site::{RawDescriptor, SiteDescriptor};

/// Separator between hostname labels.
pub const DOMAIN_SEP: char = '.';

/// Comment prefixes recognised in IP allow-list files.
const COMMENT_PREFIXES: [&str; 3] = ["#", "//", ";"];

/// How long redirect discovery may take before the declared values win.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered set of CIDR ranges a backend IP must fall into.
///
/// An empty list allows every address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAllowList(Vec<IpNet>);

impl IpAllowList {
    pub fn new(ranges: Vec<IpNet>) -> Self {
        Self(ranges)
    }

    /// Parse one CIDR per line. Blank lines and comments are ignored;
    /// malformed lines are skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut ranges = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || COMMENT_PREFIXES.iter().any(|p| line.starts_with(p)) {
                continue;
            }
            match line.parse::<IpNet>() {
                Ok(net) => ranges.push(net),
                Err(e) => warn!(line = lineno + 1, "skipping bad CIDR {line:?}: {e}"),
            }
        }
        Self(ranges)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::IpFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.0.iter().any(|net| net.contains(&ip))
    }
}

impl FromIterator<IpNet> for IpAllowList {
    fn from_iter<T: IntoIterator<Item = IpNet>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Validates and canonicalizes submitted descriptors for one handler.
pub struct Validator {
    allow_list: IpAllowList,
    label_char: fn(&char) -> bool,
    tracer: Option<reqwest::Client>,
}

impl Validator {
    pub fn new(allow_list: IpAllowList) -> Self {
        Self {
            allow_list,
            label_char: char::is_ascii_alphanumeric,
            tracer: None,
        }
    }

    /// Follow redirects from the declared backend and record where they end.
    ///
    /// Certificate checks are disabled for this probe only: backends at this
    /// stage often serve self-signed or mismatched certificates.
    pub fn with_redirect_trace(mut self) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(ConfigError::Tracer)?;
        self.tracer = Some(client);
        Ok(self)
    }

    /// Replace the per-character label rule (ASCII alphanumerics by default).
    #[must_use]
    pub fn with_label_rule(mut self, rule: fn(&char) -> bool) -> Self {
        self.label_char = rule;
        self
    }

    pub fn traces_redirects(&self) -> bool {
        self.tracer.is_some()
    }

    /// Canonical form of a hostname, or `None` if it is unusable.
    ///
    /// Outer separators are trimmed and empty labels dropped; the result must
    /// have at least two labels, each made only of allowed characters.
    pub fn valid_host(&self, host: &str) -> Option<String> {
        let labels: Vec<&str> = host
            .trim_matches(DOMAIN_SEP)
            .split(DOMAIN_SEP)
            .filter(|label| !label.is_empty())
            .collect();
        if labels.len() < 2 {
            return None;
        }
        if labels
            .iter()
            .any(|label| !label.chars().all(|c| (self.label_char)(&c)))
        {
            return None;
        }
        Some(labels.join("."))
    }

    /// Parse an IP literal and check it against the allow-list.
    pub fn valid_ip(&self, ip: &str) -> Result<IpAddr, ProvisionError> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| ProvisionError::BadIp(ip.to_string()))?;
        let addr = addr.to_canonical();
        if !self.allow_list.is_empty() && !self.allow_list.contains(addr) {
            return Err(ProvisionError::BlockedIp(addr.to_string()));
        }
        Ok(addr)
    }

    /// Turn a submitted descriptor into a complete [`SiteDescriptor`] with an
    /// empty `ext_host`.
    pub async fn validate(&self, raw: RawDescriptor) -> Result<SiteDescriptor, ProvisionError> {
        if raw.host.trim().is_empty() {
            return Err(ProvisionError::NoHostname);
        }
        if raw.ip.trim().is_empty() {
            return Err(ProvisionError::NoIp);
        }

        let int_host = self
            .valid_host(&raw.host)
            .ok_or_else(|| ProvisionError::BadHost(raw.host.clone()))?;
        let ip = self.valid_ip(&raw.ip)?;

        let mut site = SiteDescriptor {
            ext_host: String::new(),
            int_host,
            int_ip: ip.to_string(),
            int_port: raw.port_or_default(),
            encrypted: raw.tls,
            strip_headers: raw.blocked_headers,
        };

        if self.tracer.is_some() {
            match self
                .discover(&site.int_host, site.int_port, site.encrypted)
                .await
            {
                Ok((host, port, tls)) => {
                    debug!(
                        from = %site.int_host,
                        to = %host,
                        port,
                        tls,
                        "redirect discovery resolved backend"
                    );
                    site.int_host = host;
                    site.int_port = port;
                    site.encrypted = tls;
                }
                Err(e) => warn!("{e}, keeping declared backend"),
            }
        }

        Ok(site)
    }

    /// Issue a HEAD request to the declared backend and report the host,
    /// port and TLS state of wherever the redirect chain ended.
    pub async fn discover(
        &self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<(String, u16, bool), ProvisionError> {
        let url = probe_url(host, port, tls);
        let Some(tracer) = &self.tracer else {
            return Err(ProvisionError::Discovery {
                url,
                reason: "redirect tracing is disabled".into(),
            });
        };

        let resp = tracer
            .head(&url)
            .send()
            .await
            .map_err(|e| ProvisionError::Discovery {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let last = resp.url();
        let Some(final_host) = last.host_str() else {
            return Err(ProvisionError::Discovery {
                url,
                reason: "final URL has no host".into(),
            });
        };
        let final_tls = last.scheme() == "https";
        let final_port = last
            .port_or_known_default()
            .unwrap_or(if final_tls { 443 } else { 80 });

        Ok((final_host.to_string(), final_port, final_tls))
    }
}

/// The URL a discovery probe starts from. Default ports are left implicit.
fn probe_url(host: &str, port: u16, tls: bool) -> String {
    match (tls, port) {
        (true, 443) => format!("https://{host}/"),
        (true, p) => format!("https://{host}:{p}/"),
        (false, 80) => format!("http://{host}/"),
        (false, p) => format!("http://{host}:{p}/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Redirect;
    use axum::routing::any;
    use axum::Router;
    use tokio::net::TcpListener;

    fn raw(host: &str, ip: &str, port: Option<i64>) -> RawDescriptor {
        RawDescriptor {
            host: host.into(),
            ip: ip.into(),
            port,
            tls: true,
            blocked_headers: vec!["a".into(), "b".into(), "c".into()],
        }
    }

    fn allow_list() -> IpAllowList {
        IpAllowList::parse("127.0.0.0/8\n10.0.0.0/8\n192.168.0.0/16\n")
    }

    #[test]
    fn test_valid_host() {
        let v = Validator::new(IpAllowList::default());
        let cases = [
            ("domain.com", Some("domain.com")),
            ("sub.domain.com", Some("sub.domain.com")),
            (".domain.com", Some("domain.com")),
            (".sub.domain.com", Some("sub.domain.com")),
            ("domain.com.", Some("domain.com")),
            (".sub.domain.com.", Some("sub.domain.com")),
            ("sub...domain.com", Some("sub.domain.com")),
            ("...sub.domain.com...", Some("sub.domain.com")),
            ("com", None),
            ("...com..", None),
            ("sub.do_main.com", None),
            ("sub.do;main.com", None),
            ("sub.domain.c-m", None),
        ];
        for (input, expected) in cases {
            assert_eq!(v.valid_host(input).as_deref(), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_custom_label_rule() {
        let v = Validator::new(IpAllowList::default())
            .with_label_rule(|c| c.is_ascii_alphanumeric() || *c == '-');
        assert_eq!(v.valid_host("my-app.example.com").as_deref(), Some("my-app.example.com"));
    }

    #[test]
    fn test_allow_list_membership() {
        let list = allow_list();
        assert_eq!(list.len(), 3);
        let cases = [
            ("127.0.0.1", true),
            ("128.0.0.1", false),
            ("192.168.255.1", true),
            ("192.169.0.1", false),
            ("10.200.3.4", true),
            ("::ffff:10.1.1.1", true),
        ];
        for (ip, allowed) in cases {
            assert_eq!(list.contains(ip.parse().unwrap()), allowed, "ip {ip}");
        }
    }

    #[test]
    fn test_allow_list_parse_skips_comments_and_junk() {
        let list = IpAllowList::parse(
            "# internal ranges\n// legacy\n; old\n\n10.0.0.0/8\nnot-a-cidr\n  fd00::/8  \n",
        );
        assert_eq!(list.len(), 2);
        assert!(list.contains("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_from_missing_file() {
        let err = IpAllowList::from_file(Path::new("/nonexistent/allow.cidr")).unwrap_err();
        assert!(matches!(err, ConfigError::IpFile { .. }));
    }

    #[tokio::test]
    async fn test_validate() {
        let v = Validator::new(IpAllowList::default());
        let site = v
            .validate(raw("domain.com", "127.0.0.1", Some(80)))
            .await
            .unwrap();
        assert_eq!(
            site,
            SiteDescriptor {
                ext_host: String::new(),
                int_host: "domain.com".into(),
                int_ip: "127.0.0.1".into(),
                int_port: 80,
                encrypted: true,
                strip_headers: vec!["a".into(), "b".into(), "c".into()],
            }
        );

        let err = v.validate(raw("com", "127.0.0.1", Some(80))).await.unwrap_err();
        assert_eq!(err.to_string(), "bad hostname provided [com]");

        let err = v
            .validate(raw("domain.com", "127.1", Some(80)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad IP provided [127.1]");

        let site = v
            .validate(raw("domain.com", "::1", Some(70000)))
            .await
            .unwrap();
        assert_eq!(site.int_port, 80);
        assert_eq!(site.int_ip, "::1");
    }

    #[tokio::test]
    async fn test_validate_missing_fields() {
        let v = Validator::new(IpAllowList::default());
        assert!(matches!(
            v.validate(raw("", "127.0.0.1", None)).await,
            Err(ProvisionError::NoHostname)
        ));
        assert!(matches!(
            v.validate(raw("domain.com", " ", None)).await,
            Err(ProvisionError::NoIp)
        ));
    }

    #[tokio::test]
    async fn test_validate_blocked_ip() {
        let v = Validator::new(allow_list());
        assert!(v.validate(raw("a.com", "192.168.1.1", None)).await.is_ok());
        let err = v
            .validate(raw("a.com", "8.8.8.8", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BlockedIp(ref ip) if ip == "8.8.8.8"));
        assert_eq!(err.status(), axum::http::StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("a.com", 443, true), "https://a.com/");
        assert_eq!(probe_url("a.com", 8443, true), "https://a.com:8443/");
        assert_eq!(probe_url("a.com", 80, false), "http://a.com/");
        assert_eq!(probe_url("a.com", 8080, false), "http://a.com:8080/");
    }

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_redirect_discovery_follows_chain() {
        let landing = serve(Router::new().route("/landing", any(|| async { "ok" }))).await;
        let target = format!("http://127.0.0.1:{landing}/landing");
        let start = serve(Router::new().route(
            "/",
            any(move || {
                let target = target.clone();
                async move { Redirect::temporary(&target) }
            }),
        ))
        .await;

        let v = Validator::new(IpAllowList::default())
            .with_redirect_trace()
            .unwrap();
        let mut input = raw("127.0.0.1", "127.0.0.1", Some(i64::from(start)));
        input.tls = false;
        let site = v.validate(input).await.unwrap();
        assert_eq!(site.int_host, "127.0.0.1");
        assert_eq!(site.int_port, landing);
        assert!(!site.encrypted);
    }

    #[tokio::test]
    async fn test_redirect_discovery_failure_keeps_declared() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().port();
        drop(listener);

        let v = Validator::new(IpAllowList::default())
            .with_redirect_trace()
            .unwrap();
        let mut input = raw("127.0.0.1", "127.0.0.1", Some(i64::from(dead)));
        input.tls = false;
        let site = v.validate(input).await.unwrap();
        assert_eq!(site.int_port, dead);
        assert!(!site.encrypted);

        assert!(matches!(
            v.discover("127.0.0.1", dead, false).await,
            Err(ProvisionError::Discovery { .. })
        ));
    }
}
