use crate::config::Config;
use crate::proxy::{connect_tunnel, ProxyConfig};
use anyhow::{Context as _, Result};
use hyper::body::Bytes;
use hyper::client::conn;
use hyper::header::{ACCEPT, HOST, LOCATION, USER_AGENT};
use hyper::{Body, HeaderMap, Request, StatusCode, Uri};
use modcipher_net::{BoxedStream, Dialer, NativeProvider, TlsProvider};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const USER_AGENT_VALUE: &str = concat!("modcipher/", env!("CARGO_PKG_VERSION"));

/// Redirects followed before a GET gives up.
pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("URL has no host: {0}")]
    MissingHost(String),
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// The URL that produced this response, after redirects.
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    fn redirect_location(&self) -> Option<&str> {
        match self.status {
            StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT => {}
            _ => return None,
        }
        self.headers.get(LOCATION)?.to_str().ok()
    }
}

/// Issues HTTP/1.1 GETs, one freshly dialed, decorated connection per
/// request, following redirects.
pub struct Fetcher {
    dialer: Dialer,
    tls: Arc<dyn TlsProvider>,
    proxy: ProxyConfig,
}

impl Fetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let dialer = Dialer::new(Arc::new(config.preferences.clone()))
            .connect_timeout(config.connect_timeout);
        let tls = NativeProvider::new(config.roots)?
            .handshake_timeout(config.tls_handshake_timeout);
        Ok(Self::with_provider(dialer, Arc::new(tls)).proxy(config.proxy.clone()))
    }

    pub fn with_provider(dialer: Dialer, tls: Arc<dyn TlsProvider>) -> Self {
        Self {
            dialer,
            tls,
            proxy: ProxyConfig::default(),
        }
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let mut uri: Uri = url.parse().with_context(|| format!("invalid URL {:?}", url))?;
        let mut redirects = 0;
        loop {
            let response = self.get_once(&uri).await?;
            let location = match response.redirect_location() {
                Some(location) => location,
                None => return Ok(response),
            };
            if redirects == MAX_REDIRECTS {
                return Err(FetchError::TooManyRedirects(MAX_REDIRECTS).into());
            }
            redirects += 1;

            let next = resolve(&uri, location)?;
            info!(from = %uri, to = %next, status = %response.status, "following redirect");
            uri = next;
        }
    }

    async fn get_once(&self, uri: &Uri) -> Result<Response> {
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => return Err(FetchError::UnsupportedScheme(other.unwrap_or("").to_string()).into()),
        };
        let host = uri
            .host()
            .ok_or_else(|| FetchError::MissingHost(uri.to_string()))?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        // IPv6 literals keep their brackets in the URI.
        let dial_host = host.trim_start_matches('[').trim_end_matches(']');

        let proxy = self.proxy.route(secure, dial_host, port);
        let mut conn = match proxy {
            Some(endpoint) => {
                debug!(proxy = %endpoint.host, proxy_port = endpoint.port, "dialing through proxy");
                self.dialer.connect(&endpoint.host, endpoint.port).await?
            }
            None => self.dialer.connect(dial_host, port).await?,
        };
        let stream: BoxedStream = if secure {
            if proxy.is_some() {
                connect_tunnel(&mut conn, &format!("{}:{}", host, port)).await?;
            }
            self.tls.handshake(dial_host, Box::new(conn)).await?
        } else {
            Box::new(conn)
        };

        let (mut sender, connection) = conn::handshake(stream)
            .await
            .context("HTTP/1.1 handshake failed")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP connection driver error: {}", e);
            }
        });

        let authority = match uri.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        // A plain-HTTP proxy expects the absolute URL as the request target.
        let target = match (proxy, secure) {
            (Some(_), false) => uri.to_string(),
            _ => uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string(),
        };
        let request = Request::get(target)
            .header(HOST, authority)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(ACCEPT, "*/*")
            .body(Body::empty())?;

        let response = sender.send_request(request).await.context("GET failed")?;
        let status = response.status();
        info!(url = %uri, %status, "response");

        let (parts, body) = response.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .context("failed to read response body")?;
        Ok(Response {
            status,
            url: uri.clone(),
            headers: parts.headers,
            body,
        })
    }
}

/// Resolves a `Location` value against the URL that returned it.
fn resolve(base: &Uri, location: &str) -> Result<Uri> {
    let location = location.split('#').next().unwrap_or_default().trim();
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();

    let absolute = if location.contains("://") {
        location.to_string()
    } else if location.starts_with("//") {
        format!("{}:{}", scheme, location)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else if location.starts_with('?') {
        format!("{}://{}{}{}", scheme, authority, base.path(), location)
    } else {
        let path = base.path();
        let dir = path.rfind('/').map_or("/", |i| &path[..=i]);
        format!("{}://{}{}{}", scheme, authority, dir, location)
    };
    absolute
        .parse()
        .with_context(|| format!("invalid redirect location {:?}", location))
}

/// Pretty-prints a JSON object with two-space indentation; any other body is
/// returned as text.
pub fn render(body: &[u8]) -> String {
    match serde_json::from_slice::<Map<String, Value>>(body) {
        Ok(object) => serde_json::to_string_pretty(&object)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_objects_are_pretty_printed() {
        let out = render(br#"{"tls":{"ciphers":["TLS_AES_128_GCM_SHA256"]},"ok":true}"#);
        assert_eq!(
            out,
            "{\n  \"ok\": true,\n  \"tls\": {\n    \"ciphers\": [\n      \"TLS_AES_128_GCM_SHA256\"\n    ]\n  }\n}"
        );
    }

    fn resolved(base: &str, location: &str) -> String {
        resolve(&base.parse().unwrap(), location).unwrap().to_string()
    }

    #[test]
    fn redirect_locations_resolve_against_the_request_url() {
        let base = "https://example.com:8443/a/b?q=1";
        assert_eq!(resolved(base, "http://other.test/x"), "http://other.test/x");
        assert_eq!(resolved(base, "//cdn.test/y"), "https://cdn.test/y");
        assert_eq!(resolved(base, "/final"), "https://example.com:8443/final");
        assert_eq!(resolved(base, "c?d=2"), "https://example.com:8443/a/c?d=2");
        assert_eq!(resolved(base, "?page=2"), "https://example.com:8443/a/b?page=2");
        assert_eq!(resolved(base, "/frag#top"), "https://example.com:8443/frag");
        assert_eq!(resolved("http://example.com", "next"), "http://example.com/next");
    }

    #[test]
    fn non_object_bodies_are_returned_verbatim() {
        assert_eq!(render(b"[1, 2, 3]"), "[1, 2, 3]");
        assert_eq!(render(b"<html></html>"), "<html></html>");
        assert_eq!(render(b""), "");
    }
}
