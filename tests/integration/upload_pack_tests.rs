//! `git upload-pack` end to end: reference advertisement, fetch
//! negotiation returning a pack, and shallow negotiation.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use bytes::Bytes;
use git_gateway::gateway::{Service, UploadPack};
use git_gateway::models::call::StreamRequest;
use git_gateway::models::repository::RepositoryRef;
use git_gateway::pktline::pack::{data_band, PackHeader};
use git_gateway::pktline::{decode_bytes, encode_all, Packet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{collect, fixture, gateway, git, messages, require_git, run_call, REPO, STORAGE};

const CAPABILITIES: &str = "multi_ack_detailed no-done side-band-64k thin-pack include-tag \
                            ofs-delta deepen-since deepen-not agent=git/2.12.2";

fn header() -> StreamRequest {
    StreamRequest::header(RepositoryRef::new(STORAGE, REPO))
}

#[tokio::test]
async fn fetch_returns_a_pack_on_the_data_band() {
    require_git!();
    let fx = fixture();
    let gateway = gateway(&fx.storage, 4);

    let request = encode_all(&[
        Packet::data(format!("want {} {CAPABILITIES}\n", fx.second)),
        Packet::Flush,
        Packet::data(format!("have {}\n", fx.first)),
        Packet::Flush,
    ])
    .unwrap();

    let (result, output) = run_call(
        &gateway,
        &UploadPack,
        messages(vec![header(), StreamRequest::data(request)]),
        CancellationToken::new(),
    )
    .await;
    result.unwrap();

    let packets = decode_bytes(&output).unwrap();
    assert_eq!(packets.last(), Some(&Packet::Flush));
    let pack = data_band(&packets);
    let header = PackHeader::parse(&pack).unwrap();
    assert_eq!(header.version, 2);
    assert!(header.entries > 0);
    assert_eq!(gateway.runner().active(), 0);
}

#[tokio::test]
async fn clone_pack_is_complete() {
    require_git!();
    let fx = fixture();
    let gateway = gateway(&fx.storage, 4);

    let request = encode_all(&[
        Packet::data(format!("want {} side-band-64k ofs-delta\n", fx.second)),
        Packet::Flush,
        Packet::data("done\n"),
    ])
    .unwrap();

    // Request body split at an arbitrary point inside a packet.
    let (left, right) = request.split_at(7);
    let (result, output) = run_call(
        &gateway,
        &UploadPack,
        messages(vec![
            header(),
            StreamRequest::data(Bytes::copy_from_slice(left)),
            StreamRequest::data(Bytes::copy_from_slice(right)),
        ]),
        CancellationToken::new(),
    )
    .await;
    result.unwrap();

    let pack = data_band(&decode_bytes(&output).unwrap());
    let local = fx.root.path().join("local.git");
    git(fx.root.path(), &["init", "-q", "--bare", local.to_str().unwrap()]);
    index_pack(&local, &pack);
    git(&local, &["cat-file", "-e", &format!("{}^{{tree}}", fx.second)]);
    git(&local, &["cat-file", "-e", &fx.first]);
}

fn index_pack(repo: &Path, pack: &[u8]) {
    let mut child = Command::new("git")
        .args(["index-pack", "--stdin"])
        .current_dir(repo)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(pack).unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[tokio::test]
async fn deepen_request_answers_with_shallow_lines() {
    require_git!();
    let fx = fixture();
    let gateway = gateway(&fx.storage, 4);

    let request = format!(
        "00a4want {} {CAPABILITIES}\n000cdeepen 10000",
        fx.second
    );

    let (result, output) = run_call(
        &gateway,
        &UploadPack,
        messages(vec![header(), StreamRequest::data(request)]),
        CancellationToken::new(),
    )
    .await;

    result.unwrap();
    assert_eq!(
        String::from_utf8(output).unwrap(),
        format!("0034shallow {}0000", fx.second)
    );
}

#[tokio::test]
async fn info_refs_starts_with_service_preamble() {
    require_git!();
    let fx = fixture();
    let gateway = gateway(&fx.storage, 4);

    let (tx, rx) = mpsc::channel(16);
    let collector = tokio::spawn(collect(rx));
    gateway
        .info_refs(
            Service::UploadPack,
            RepositoryRef::new(STORAGE, REPO),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let output = collector.await.unwrap();

    assert!(output.starts_with(b"001e# service=git-upload-pack\n0000"));
    let packets = decode_bytes(&output).unwrap();
    assert_eq!(packets.last(), Some(&Packet::Flush));
    let advertised = packets
        .iter()
        .map(|packet| String::from_utf8_lossy(packet.payload()).into_owned())
        .collect::<Vec<_>>();
    assert!(
        advertised
            .iter()
            .any(|line| line.starts_with(&fx.second) && line.contains("refs/heads/main")),
        "{advertised:?}"
    );
}

#[tokio::test]
async fn info_refs_for_unknown_repository_sends_nothing() {
    require_git!();
    let fx = fixture();
    let gateway = gateway(&fx.storage, 4);

    let (tx, rx) = mpsc::channel(16);
    let collector = tokio::spawn(collect(rx));
    let err = gateway
        .info_refs(
            Service::UploadPack,
            RepositoryRef::new(STORAGE, "missing.git"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, git_gateway::AppError::InvalidArgument(_)), "{err}");
    assert!(collector.await.unwrap().is_empty());
    assert_eq!(gateway.runner().spawned_total(), 0);
}
