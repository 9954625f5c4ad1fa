//! Smart-HTTP transport over a real listener: routing, status mapping and
//! streamed git responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use git_gateway::http::{router, HttpState};
use git_gateway::pktline::pack::{data_band, PackHeader};
use git_gateway::pktline::{decode_bytes, encode_all, Packet};
use git_gateway::sidecar::{LocalSocketTransport, SidecarOperations};
use git_gateway::storage::StorageResolver;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{fixture, gateway, require_git, Fixture, REPO, STORAGE};

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(fx: &Fixture) -> Server {
    let gateway = Arc::new(gateway(&fx.storage, 4));
    let resolver = Arc::new(StorageResolver::new(vec![git_gateway::config::StorageConfig {
        name: STORAGE.into(),
        path: fx.storage.clone(),
    }]));
    let transport = Arc::new(LocalSocketTransport::new(
        format!("git-gateway-http-test-{}.sock", uuid::Uuid::new_v4()),
        Duration::from_secs(1),
    ));
    let shutdown = CancellationToken::new();
    let state = Arc::new(HttpState {
        gateway,
        operations: Arc::new(SidecarOperations::new(resolver, transport)),
        shutdown: shutdown.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ct = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { ct.cancelled().await })
            .await
            .unwrap();
    });
    Server { addr, shutdown }
}

struct Reply {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

async fn send(server: &Server, method: &str, target: &str, extra: &[(&str, &str)], body: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut request = format!(
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .expect("response within timeout")
        .unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let rest = &raw[split + 4..];
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let headers = head.to_ascii_lowercase();
    let body = if headers.contains("transfer-encoding: chunked") {
        dechunk(rest)
    } else {
        rest.to_vec()
    };
    Reply {
        status,
        headers,
        body,
    }
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = raw.windows(2).position(|w| w == b"\r\n").unwrap();
        let size_field = std::str::from_utf8(&raw[..line_end]).unwrap();
        let size = usize::from_str_radix(size_field.split(';').next().unwrap().trim(), 16).unwrap();
        raw = &raw[line_end + 2..];
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

#[tokio::test]
async fn health_answers_ok() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(&server, "GET", "/health", &[], b"").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"ok");
}

#[tokio::test]
async fn info_refs_streams_the_advertisement() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(
        &server,
        "GET",
        &format!("/{STORAGE}/{REPO}/info/refs?service=git-upload-pack"),
        &[],
        b"",
    )
    .await;

    assert_eq!(reply.status, 200);
    assert!(reply
        .headers
        .contains("content-type: application/x-git-upload-pack-advertisement"));
    assert!(reply.headers.contains("cache-control: no-cache"));
    assert!(reply.body.starts_with(b"001e# service=git-upload-pack\n0000"));
    let text = String::from_utf8_lossy(&reply.body);
    assert!(text.contains("refs/heads/main"), "{text}");
}

#[tokio::test]
async fn unknown_service_is_bad_request() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(
        &server,
        "GET",
        &format!("/{STORAGE}/{REPO}/info/refs?service=git-archive"),
        &[],
        b"",
    )
    .await;
    assert_eq!(reply.status, 400);

    let reply = send(&server, "GET", &format!("/{STORAGE}/{REPO}/info/refs"), &[], b"").await;
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn unknown_repository_is_bad_request() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(
        &server,
        "GET",
        "/fake/path/info/refs?service=git-upload-pack",
        &[],
        b"",
    )
    .await;
    assert_eq!(reply.status, 400);
    assert!(String::from_utf8_lossy(&reply.body).contains("unresolvable repository"));
}

#[tokio::test]
async fn push_without_identity_is_bad_request() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(
        &server,
        "POST",
        &format!("/{STORAGE}/{REPO}/git-receive-pack"),
        &[("Content-Type", "application/x-git-receive-pack-request")],
        b"0000",
    )
    .await;
    assert_eq!(reply.status, 400);
    assert!(String::from_utf8_lossy(&reply.body).contains("gl_id"));
}

#[tokio::test]
async fn upload_pack_post_streams_a_pack() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let request = encode_all(&[
        Packet::data(format!("want {} side-band-64k ofs-delta\n", fx.second)),
        Packet::Flush,
        Packet::data("done\n"),
    ])
    .unwrap();
    let reply = send(
        &server,
        "POST",
        &format!("/{STORAGE}/{REPO}/git-upload-pack"),
        &[("Content-Type", "application/x-git-upload-pack-request")],
        &request,
    )
    .await;

    assert_eq!(reply.status, 200);
    assert!(reply
        .headers
        .contains("content-type: application/x-git-upload-pack-result"));
    let pack = data_band(&decode_bytes(&reply.body).unwrap());
    let header = PackHeader::parse(&pack).unwrap();
    assert_eq!(header.version, 2);
    assert!(header.entries >= 3);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(&server, "POST", &format!("/{STORAGE}/{REPO}/git-archive"), &[], b"").await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn linguist_color_falls_back_to_hash() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let reply = send(&server, "GET", "/linguist/colors/NoSuchLanguage", &[], b"").await;
    assert_eq!(reply.status, 200);
    let json: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(json["language"], "NoSuchLanguage");
    let color = json["color"].as_str().unwrap();
    assert!(color.starts_with('#') && color.len() == 7, "{color}");
}

#[tokio::test]
async fn branch_creation_validates_before_contacting_the_sidecar() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let body = serde_json::json!({ "branch_name": "feature", "start_point": fx.first }).to_string();
    let reply = send(
        &server,
        "POST",
        &format!("/{STORAGE}/{REPO}/branches"),
        &[("Content-Type", "application/json")],
        body.as_bytes(),
    )
    .await;
    assert_eq!(reply.status, 400);
    assert!(String::from_utf8_lossy(&reply.body).contains("empty user"));

    let reply = send(
        &server,
        "POST",
        &format!("/{STORAGE}/{REPO}/branches"),
        &[("Content-Type", "application/json")],
        b"{not json",
    )
    .await;
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn unreachable_sidecar_is_internal_error() {
    require_git!();
    let fx = fixture();
    let server = start(&fx).await;

    let body = serde_json::json!({
        "branch_name": "feature",
        "start_point": fx.first,
        "user": { "name": "Jane", "email": "jane@example.com", "gl_id": "user-1" }
    })
    .to_string();
    let reply = send(
        &server,
        "POST",
        &format!("/{STORAGE}/{REPO}/branches"),
        &[("Content-Type", "application/json")],
        body.as_bytes(),
    )
    .await;
    assert_eq!(reply.status, 500);
}
