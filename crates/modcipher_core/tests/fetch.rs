// End-to-end GETs against a local HTTP server

use async_trait::async_trait;
use modcipher_core::fetch::{render, FetchError, Fetcher, MAX_REDIRECTS};
use modcipher_core::proxy::{ProxyConfig, ProxyEndpoint};
use modcipher_net::{locate, BoxedStream, CipherSuite, Dialer, Preferences, TlsProvider};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Stands in for TLS: records the server name and hands the stream back.
#[derive(Default)]
struct RecordingProvider {
    domains: Mutex<Vec<String>>,
}

#[async_trait]
impl TlsProvider for RecordingProvider {
    async fn handshake(&self, domain: &str, stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        self.domains.lock().unwrap().push(domain.to_string());
        Ok(stream)
    }
}

/// Writes a bare ClientHello offering `suites`, then hands the stream back
/// without completing any TLS.
struct HelloProvider {
    suites: Vec<u16>,
}

#[async_trait]
impl TlsProvider for HelloProvider {
    async fn handshake(&self, _domain: &str, mut stream: BoxedStream) -> anyhow::Result<BoxedStream> {
        stream.write_all(&client_hello(&self.suites)).await?;
        stream.flush().await?;
        Ok(stream)
    }
}

fn client_hello(suites: &[u16]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // session id
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for suite in suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.extend_from_slice(&[1, 0]); // null compression

    let mut handshake = vec![1];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend(body);

    let mut record = vec![22, 3, 1];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend(handshake);
    record
}

/// Reads one request head.
async fn read_head(socket: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        request.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(request).unwrap()
}

fn response(status: &str, headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        headers,
        body.len(),
        body
    )
}

/// Serves one request with `body`, returning the raw request head.
async fn serve_once(listener: TcpListener, body: &'static str) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let request = read_head(&mut socket).await;
    let reply = response("200 OK", "Content-Type: application/json\r\n", body);
    socket.write_all(reply.as_bytes()).await.unwrap();
    socket.shutdown().await.unwrap();
    request
}

/// Answers successive connections with `replies`, returning each request head.
async fn serve_sequence(listener: TcpListener, replies: Vec<String>) -> Vec<String> {
    let mut requests = Vec::new();
    for reply in replies {
        let (mut socket, _) = listener.accept().await.unwrap();
        requests.push(read_head(&mut socket).await);
        socket.write_all(reply.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    }
    requests
}

fn local_proxy(port: u16) -> ProxyEndpoint {
    ProxyEndpoint {
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn fetcher(provider: Arc<dyn TlsProvider>) -> Fetcher {
    let preferences: Preferences = [(CipherSuite(0x1303), 1)].into_iter().collect();
    Fetcher::with_provider(Dialer::new(Arc::new(preferences)), provider)
}

#[tokio::test]
async fn plain_http_get_returns_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_once(listener, r#"{"hello":"world"}"#));

    let provider = Arc::new(RecordingProvider::default());
    let response = fetcher(provider.clone())
        .get(&format!("http://127.0.0.1:{}/json?x=1", port))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(render(&response.body), "{\n  \"hello\": \"world\"\n}");
    assert!(provider.domains.lock().unwrap().is_empty());

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /json?x=1 HTTP/1.1\r\n"));
    assert!(request.to_ascii_lowercase().contains(&format!("host: 127.0.0.1:{}", port)));
}

#[tokio::test]
async fn https_urls_go_through_the_tls_provider() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_once(listener, "plain text"));

    let provider = Arc::new(RecordingProvider::default());
    let response = fetcher(provider.clone())
        .get(&format!("https://127.0.0.1:{}/", port))
        .await
        .unwrap();

    assert_eq!(render(&response.body), "plain text");
    assert_eq!(*provider.domains.lock().unwrap(), vec!["127.0.0.1".to_string()]);
    server.await.unwrap();
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let err = fetcher(Arc::new(RecordingProvider::default()))
        .get("ftp://example.com/file")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::UnsupportedScheme(scheme)) if scheme == "ftp"
    ));
}

#[tokio::test]
async fn connection_refused_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = fetcher(Arc::new(RecordingProvider::default()))
        .get(&format!("http://127.0.0.1:{}/", port))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn redirects_are_followed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_sequence(
        listener,
        vec![
            response("302 Found", "Location: /final\r\n", ""),
            response("200 OK", "Content-Type: application/json\r\n", "{}"),
        ],
    ));

    let response = fetcher(Arc::new(RecordingProvider::default()))
        .get(&format!("http://127.0.0.1:{}/start", port))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.url.path(), "/final");
    assert_eq!(render(&response.body), "{}");

    let requests = server.await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].starts_with("GET /start HTTP/1.1\r\n"));
    assert!(requests[1].starts_with("GET /final HTTP/1.1\r\n"));
}

#[tokio::test]
async fn redirect_without_location_is_returned() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(serve_sequence(
        listener,
        vec![response("302 Found", "", "moved")],
    ));

    let response = fetcher(Arc::new(RecordingProvider::default()))
        .get(&format!("http://127.0.0.1:{}/start", port))
        .await
        .unwrap();
    assert_eq!(response.status, 302);
    assert_eq!(render(&response.body), "moved");
    server.await.unwrap();
}

#[tokio::test]
async fn redirect_loops_stop_after_the_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let replies = vec![response("301 Moved Permanently", "Location: /loop\r\n", ""); MAX_REDIRECTS + 1];
    let server = tokio::spawn(serve_sequence(listener, replies));

    let err = fetcher(Arc::new(RecordingProvider::default()))
        .get(&format!("http://127.0.0.1:{}/loop", port))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::TooManyRedirects(MAX_REDIRECTS))
    ));
    assert_eq!(server.await.unwrap().len(), MAX_REDIRECTS + 1);
}

#[tokio::test]
async fn https_tunnels_through_connect_proxy_with_rewritten_hello() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let connect = read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let mut record = vec![0u8; 5];
        socket.read_exact(&mut record).await.unwrap();
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        record.resize(5 + len, 0);
        socket.read_exact(&mut record[5..]).await.unwrap();

        let request = read_head(&mut socket).await;
        socket
            .write_all(response("200 OK", "", "tunneled").as_bytes())
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
        (connect, record, request)
    });

    let provider = Arc::new(HelloProvider {
        suites: vec![0x1301, 0x1302, 0x1303],
    });
    let response = fetcher(provider)
        .proxy(ProxyConfig::default().https(local_proxy(port)))
        .get("https://example.test/tls")
        .await
        .unwrap();
    assert_eq!(render(&response.body), "tunneled");

    let (connect, record, request) = proxy.await.unwrap();
    assert!(connect.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"), "{}", connect);
    assert!(connect.contains("Host: example.test:443\r\n"));
    let hello = locate(&record).expect("ClientHello reaches the proxy");
    assert_eq!(
        hello.cipher_suites,
        vec![CipherSuite(0x1303), CipherSuite(0x1301), CipherSuite(0x1302)]
    );
    assert!(request.starts_with("GET /tls HTTP/1.1\r\n"));
}

#[tokio::test]
async fn refused_connect_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = tokio::spawn(serve_sequence(
        listener,
        vec!["HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n".to_string()],
    ));

    let provider = Arc::new(RecordingProvider::default());
    let err = fetcher(provider.clone())
        .proxy(ProxyConfig::default().https(local_proxy(port)))
        .get("https://example.test/")
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("403"));
    assert!(provider.domains.lock().unwrap().is_empty());
    proxy.await.unwrap();
}

#[tokio::test]
async fn plain_http_through_proxy_uses_absolute_form() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = tokio::spawn(serve_once(listener, r#"{"via":"proxy"}"#));

    let response = fetcher(Arc::new(RecordingProvider::default()))
        .proxy(ProxyConfig::default().http(local_proxy(port)))
        .get("http://example.test/plain?x=1")
        .await
        .unwrap();
    assert_eq!(render(&response.body), "{\n  \"via\": \"proxy\"\n}");

    let request = proxy.await.unwrap();
    assert!(request.starts_with("GET http://example.test/plain?x=1 HTTP/1.1\r\n"), "{}", request);
    assert!(request.to_ascii_lowercase().contains("host: example.test\r\n"));
}
