//! Proxy selection from `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY`, and the
//! CONNECT handshake used to tunnel TLS through an HTTP proxy.

use anyhow::{bail, Context as _, Result};
use hyper::Uri;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on the proxy's CONNECT response head.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// An HTTP proxy to dial instead of the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Parses a proxy URL. A value without a scheme is taken as `http://`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let with_scheme = if value.contains("://") {
            value.to_string()
        } else {
            format!("http://{}", value)
        };
        let uri: Uri = with_scheme
            .parse()
            .with_context(|| format!("invalid proxy URL {:?}", value))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => bail!("unsupported proxy scheme {:?} in {:?}", other, value),
            None => bail!("invalid proxy URL {:?}", value),
        }
        let host = uri
            .host()
            .with_context(|| format!("proxy URL {:?} has no host", value))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(80),
        })
    }
}

/// One `NO_PROXY` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Exclusion {
    Any,
    Ip { ip: IpAddr, port: Option<u16> },
    /// `suffix` always starts with a dot; `exact` also matches the bare domain.
    Domain { suffix: String, exact: bool, port: Option<u16> },
}

impl Exclusion {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return None;
        }
        if entry == "*" {
            return Some(Exclusion::Any);
        }
        if let Ok(ip) = entry.trim_start_matches('[').trim_end_matches(']').parse() {
            return Some(Exclusion::Ip { ip, port: None });
        }
        if let Ok(addr) = entry.parse::<std::net::SocketAddr>() {
            return Some(Exclusion::Ip {
                ip: addr.ip(),
                port: Some(addr.port()),
            });
        }

        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (entry.clone(), None),
            },
            None => (entry.clone(), None),
        };
        let host = host.strip_prefix('*').unwrap_or(&host);
        let (suffix, exact) = match host.strip_prefix('.') {
            Some(_) => (host.to_string(), false),
            None => (format!(".{}", host), true),
        };
        Some(Exclusion::Domain {
            suffix,
            exact,
            port,
        })
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>, port: u16) -> bool {
        match self {
            Exclusion::Any => true,
            Exclusion::Ip { ip: want, port: p } => {
                ip == Some(*want) && p.map_or(true, |p| p == port)
            }
            Exclusion::Domain {
                suffix,
                exact,
                port: p,
            } => {
                if p.map_or(false, |p| p != port) {
                    return false;
                }
                host.ends_with(suffix.as_str()) || (*exact && host == &suffix[1..])
            }
        }
    }
}

/// Per-scheme proxies plus the hosts that bypass them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    exclusions: Vec<Exclusion>,
}

impl ProxyConfig {
    /// Reads the process environment. Upper-case names win over lower-case.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|v| !v.trim().is_empty())
        };

        let mut config = Self::default();
        if let Some(value) = var("HTTP_PROXY", "http_proxy") {
            config.http = Some(ProxyEndpoint::parse(&value).context("HTTP_PROXY")?);
        }
        if let Some(value) = var("HTTPS_PROXY", "https_proxy") {
            config.https = Some(ProxyEndpoint::parse(&value).context("HTTPS_PROXY")?);
        }
        if let Some(value) = var("NO_PROXY", "no_proxy") {
            config = config.no_proxy(&value);
        }
        Ok(config)
    }

    pub fn http(mut self, endpoint: ProxyEndpoint) -> Self {
        self.http = Some(endpoint);
        self
    }

    pub fn https(mut self, endpoint: ProxyEndpoint) -> Self {
        self.https = Some(endpoint);
        self
    }

    /// Adds comma-separated `NO_PROXY` entries.
    pub fn no_proxy(mut self, list: &str) -> Self {
        self.exclusions.extend(list.split(',').filter_map(Exclusion::parse));
        self
    }

    /// Picks the proxy for a request, if any. `localhost` and loopback
    /// addresses are always reached directly.
    pub fn route(&self, secure: bool, host: &str, port: u16) -> Option<&ProxyEndpoint> {
        let endpoint = if secure {
            self.https.as_ref()
        } else {
            self.http.as_ref()
        }?;

        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let ip = host.parse::<IpAddr>().ok();
        if host == "localhost" || ip.map_or(false, |ip| ip.is_loopback()) {
            return None;
        }
        if self.exclusions.iter().any(|e| e.matches(&host, ip, port)) {
            return None;
        }
        Some(endpoint)
    }
}

/// Asks the proxy on `stream` to open a tunnel to `authority` (`host:port`).
/// On return the stream carries raw bytes to the origin.
pub async fn connect_tunnel<S>(stream: &mut S, authority: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n",
        authority = authority
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time, so nothing after the response head is consumed.
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            bail!("proxy CONNECT response exceeds {} bytes", MAX_CONNECT_RESPONSE);
        }
        let byte = stream
            .read_u8()
            .await
            .context("proxy closed the connection during CONNECT")?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        bail!("proxy refused CONNECT to {}: {}", authority, status_line);
    }
    debug!(authority, "proxy tunnel established");
    Ok(())
}
