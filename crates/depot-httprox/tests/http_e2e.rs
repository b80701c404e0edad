//! End-to-end tests: a real proxy on a random port, real stores on disk, and
//! a `TestServer` standing in for the upstream origin.

use depot_httprox::{HttproxConfig, MitmConfig, ProxyHandle, ProxyServer, TrackingType, UserPass};
use depot_model::{ArtifactStore, ChangeSummary, StoreKey, GENERIC_PKG_KEY};
use depot_remote::{HttpFetcher, SiteConfig, TestServer};
use depot_store::{
    ContentAccess, FileContentManager, FileStoreRegistry, MemoryNotFoundCache, StoreLayout,
    StoreRegistry, TransferFlags,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Proxy {
    _dir: tempfile::TempDir,
    registry: Arc<FileStoreRegistry>,
    content: Arc<FileContentManager>,
    handle: ProxyHandle,
}

impl Proxy {
    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }
}

async fn start_proxy(config: HttproxConfig) -> Proxy {
    let dir = tempfile::tempdir().unwrap();
    start_proxy_in(dir, config).await
}

async fn start_proxy_in(dir: tempfile::TempDir, config: HttproxConfig) -> Proxy {
    let layout = StoreLayout::new(dir.path().join("store"));
    layout.initialize().unwrap();
    let registry = Arc::new(FileStoreRegistry::open(layout.clone()).unwrap());
    let content = Arc::new(
        FileContentManager::new(layout, registry.clone(), Arc::new(MemoryNotFoundCache::new()))
            .with_fetcher(Arc::new(HttpFetcher::new(SiteConfig::default().with_timeout(5)))),
    );
    let server = ProxyServer::builder(config, registry.clone(), content.clone())
        .build()
        .unwrap();
    let handle = server.spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    Proxy {
        _dir: dir,
        registry,
        content,
        handle,
    }
}

/// Send `request` in two writes and read until the proxy closes.
async fn exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (head, tail) = request.split_at(request.len() / 2);
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(tail.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(response).unwrap()
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap()
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

fn get(url: &str, credentials: Option<&UserPass>) -> String {
    let auth = credentials
        .map(|up| format!("Proxy-Authorization: {}\r\n", up.to_basic()))
        .unwrap_or_default();
    format!("GET {url} HTTP/1.1\r\nHost: upstream\r\n{auth}\r\n")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secured_proxy_challenges_anonymous_requests() {
    let config = HttproxConfig {
        secured: true,
        users: BTreeMap::from([("alice".to_owned(), "s3cret".to_owned())]),
        ..HttproxConfig::default()
    };
    let proxy = start_proxy(config).await;

    let response = exchange(proxy.addr(), &get("http://127.0.0.1:9/a.txt", None)).await;
    assert_eq!(status_of(&response), 407);
    assert!(response.contains("Proxy-Authenticate: Basic realm=\"httprox\""));

    let wrong = UserPass::new("alice", "nope");
    let response = exchange(proxy.addr(), &get("http://127.0.0.1:9/a.txt", Some(&wrong))).await;
    assert_eq!(status_of(&response), 407);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_methods_are_rejected() {
    let proxy = start_proxy(HttproxConfig::default()).await;
    let response = exchange(
        proxy.addr(),
        "PUT http://127.0.0.1:9/a.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&response), 405);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn options_lists_allowed_methods() {
    let proxy = start_proxy(HttproxConfig::default()).await;
    let response = exchange(proxy.addr(), "OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("Allow: GET,HEAD,OPTIONS"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_without_mitm_is_a_bad_request() {
    let proxy = start_proxy(HttproxConfig::default()).await;
    let response = exchange(
        proxy.addr(),
        "CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n",
    )
    .await;
    assert_eq!(status_of(&response), 400);
    assert!(body_of(&response).contains("MITM is disabled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_is_a_bad_request() {
    let proxy = start_proxy(HttproxConfig::default()).await;
    let response = exchange(proxy.addr(), "NOT A REQUEST\r\n\r\n").await;
    assert_eq!(status_of(&response), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_creates_remote_and_serves_upstream_content() {
    let upstream = TestServer::start();
    upstream.put_file("lib/a.txt", b"hello from upstream");
    let proxy = start_proxy(HttproxConfig::default()).await;

    let url = format!("{}/lib/a.txt", upstream.url);
    let response = exchange(proxy.addr(), &get(&url, None)).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "hello from upstream");

    let key = StoreKey::remote(GENERIC_PKG_KEY, format!("httprox_127-0-0-1_{}", upstream.port));
    let remote = proxy.registry.get(&key).unwrap().expect("remote store created");
    assert_eq!(remote.remote_url(), Some(format!("{}/", upstream.url).as_str()));
    assert_eq!(remote.metadata("origin"), Some("httprox"));

    // Second request is served from the cache.
    let response = exchange(proxy.addr(), &get(&url, None)).await;
    assert_eq!(body_of(&response), "hello from upstream");
    let gets = upstream
        .received()
        .into_iter()
        .filter(|r| r.method == "GET")
        .count();
    assert_eq!(gets, 1);
    assert_eq!(proxy.registry.list().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn head_returns_headers_only() {
    let upstream = TestServer::start();
    upstream.put_file("a.bin", b"0123456789");
    let proxy = start_proxy(HttproxConfig::default()).await;

    let url = format!("{}/a.bin", upstream.url);
    let response = exchange(proxy.addr(), &format!("HEAD {url} HTTP/1.1\r\nHost: x\r\n\r\n")).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("Content-Length: 10"));
    assert_eq!(body_of(&response), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_upstream_path_is_not_found() {
    let upstream = TestServer::start();
    let proxy = start_proxy(HttproxConfig::default()).await;
    let url = format!("{}/missing.txt", upstream.url);
    let response = exchange(proxy.addr(), &get(&url, None)).await;
    assert_eq!(status_of(&response), 404);
    assert!(body_of(&response).contains("missing.txt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_origin_is_a_bad_gateway() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let proxy = start_proxy(HttproxConfig::default()).await;
    let url = format!("http://127.0.0.1:{port}/pkg/a.txt");
    let response = exchange(proxy.addr(), &get(&url, None)).await;
    assert_eq!(status_of(&response), 502);
    assert!(body_of(&response).contains("upstream fetch failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracked_user_gets_hosted_remote_group() {
    let upstream = TestServer::start();
    upstream.put_file("a.txt", b"tracked");
    let config = HttproxConfig {
        tracking: TrackingType::Suffix,
        users: BTreeMap::from([("build-7+tracking".to_owned(), "pw".to_owned())]),
        ..HttproxConfig::default()
    };
    let proxy = start_proxy(config).await;

    let user = UserPass::new("build-7+tracking", "pw");
    let url = format!("{}/a.txt", upstream.url);
    let response = exchange(proxy.addr(), &get(&url, Some(&user))).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "tracked");

    let port = upstream.port;
    let group = proxy
        .registry
        .get(&StoreKey::group(GENERIC_PKG_KEY, format!("g-127-0-0-1-{port}-build-7")))
        .unwrap()
        .expect("group created");
    assert_eq!(group.metadata("tracking-id"), Some("build-7"));
    assert_eq!(
        group.constituents(),
        &[
            StoreKey::hosted(GENERIC_PKG_KEY, format!("h-127-0-0-1-{port}-build-7")),
            StoreKey::remote(GENERIC_PKG_KEY, format!("r-127-0-0-1-{port}-build-7")),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_is_intercepted_and_served_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let ca_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "depot e2e CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = params.self_signed(&ca_key).unwrap();
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    std::fs::write(&cert_path, ca_cert.pem()).unwrap();
    std::fs::write(&key_path, ca_key.serialize_pem()).unwrap();

    let mut mitm = MitmConfig::new(&cert_path, &key_path);
    mitm.connect_backoff_ms = 10;
    let config = HttproxConfig {
        mitm: Some(mitm),
        ..HttproxConfig::default()
    };
    let proxy = start_proxy_in(dir, config).await;

    let remote = ArtifactStore::remote(
        StoreKey::remote(GENERIC_PKG_KEY, "httprox_example-test_443"),
        "https://example.test:443/",
    )
    .with_metadata("origin", "httprox");
    proxy
        .registry
        .save(remote.clone(), &ChangeSummary::system("seed"))
        .unwrap();
    proxy
        .content
        .store(&remote, "pkg/a.txt", &mut &b"secret bytes"[..], TransferFlags::default())
        .unwrap();

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    stream
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();
    let established = b"HTTP/1.1 200 OK\r\n\r\n";
    let mut head = vec![0u8; established.len()];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head, established);

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_cert.der().clone()).unwrap();
    let client = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client));
    let name = rustls::pki_types::ServerName::try_from("example.test").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();

    tls.write_all(b"GET /pkg/a.txt?x=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), tls.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "secret bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_accepting() {
    let proxy = start_proxy(HttproxConfig::default()).await;
    let addr = proxy.addr();
    proxy.handle.shutdown().await;
    let attempt = tokio::time::timeout(Duration::from_secs(2), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"OPTIONS * HTTP/1.1\r\n\r\n").await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;
    assert!(!matches!(attempt, Ok(Ok(ref buf)) if !buf.is_empty()));
}
