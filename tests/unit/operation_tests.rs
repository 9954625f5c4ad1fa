#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

use git_gateway::bridge::FirstMessageValidator as _;
use git_gateway::gateway::operation::{ALTERNATES_ENV, UPLOAD_PACK_SHALLOW_EXIT};
use git_gateway::gateway::{
    service_preamble, AdvertiseRefs, GitOperation, Invocation, ReceivePack, Service, UploadPack,
};
use git_gateway::models::call::StreamRequest;
use git_gateway::models::repository::RepositoryRef;
use git_gateway::process::ProcessExit;
use git_gateway::AppError;
use tokio_util::sync::CancellationToken;

fn exit(code: i32) -> ProcessExit {
    ProcessExit {
        status: ExitStatus::from_raw(code << 8),
        stderr_tail: format!("exit {code}"),
    }
}

fn invocation<'a>(header: &'a StreamRequest, repo: &'a Path) -> Invocation<'a> {
    Invocation {
        git_bin: "git",
        repo_path: repo,
        header,
        env_allowlist: &[],
        cancel: CancellationToken::new(),
        deadline: None,
    }
}

#[test]
fn header_without_repository_is_rejected() {
    let err = UploadPack
        .validate_header(&StreamRequest::default())
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));
}

#[test]
fn header_with_payload_is_rejected() {
    let mut header = StreamRequest::header(RepositoryRef::new("default", "a.git"));
    header.data = "0000".into();
    assert!(matches!(
        UploadPack.validate_header(&header),
        Err(AppError::InvalidArgument(_))
    ));
}

#[test]
fn receive_pack_requires_gl_id() {
    let header = StreamRequest::header(RepositoryRef::new("default", "a.git"));
    assert!(matches!(
        ReceivePack.validate_header(&header),
        Err(AppError::InvalidArgument(_))
    ));
    assert!(ReceivePack.validate_header(&header.clone().with_gl_id("")).is_err());
    assert!(ReceivePack
        .validate_header(&header.with_gl_id("user-123"))
        .is_ok());
}

#[test]
fn upload_pack_uses_stateless_rpc() {
    let header = StreamRequest::header(RepositoryRef::new("default", "a.git"));
    let repo = Path::new("/srv/repos/a.git");
    let spec = UploadPack.build_spec(&invocation(&header, repo));

    assert_eq!(spec.program, "git");
    assert_eq!(spec.args, ["upload-pack", "--stateless-rpc", "/srv/repos/a.git"]);
    assert_eq!(spec.current_dir, repo);
    assert_eq!(spec.env_value(ALTERNATES_ENV), None);
}

#[test]
fn alternates_are_joined_onto_repository() {
    let repo_ref = RepositoryRef::new("default", "a.git")
        .with_alternates(vec!["objects/pool".into(), "shared/objects".into()]);
    let header = StreamRequest::header(repo_ref);
    assert!(UploadPack.validate_header(&header).is_ok());
    let spec = UploadPack.build_spec(&invocation(&header, Path::new("/srv/repos/a.git")));

    assert_eq!(
        spec.env_value(ALTERNATES_ENV),
        Some("/srv/repos/a.git/objects/pool:/srv/repos/a.git/shared/objects")
    );
}

#[test]
fn alternates_must_stay_inside_the_repository() {
    for bad in ["/srv/other/objects", "../shared/objects", "objects/../../x", "a:b", "", "obj\0ects"] {
        let header = StreamRequest::header(
            RepositoryRef::new("default", "a.git").with_alternates(vec![bad.into()]),
        );
        assert!(
            matches!(UploadPack.validate_header(&header), Err(AppError::InvalidArgument(_))),
            "{bad:?} accepted"
        );
    }
}

#[test]
fn receive_pack_exports_identity() {
    let mut header =
        StreamRequest::header(RepositoryRef::new("default", "a.git")).with_gl_id("user-7");
    header.gl_repository = Some("project-7".into());
    let spec = ReceivePack.build_spec(&invocation(&header, Path::new("/srv/a.git")));

    assert_eq!(spec.args[0], "receive-pack");
    assert_eq!(spec.env_value("GL_ID"), Some("user-7"));
    assert_eq!(spec.env_value("GL_REPOSITORY"), Some("project-7"));
}

#[test]
fn advertise_refs_adds_flag() {
    let header = StreamRequest::header(RepositoryRef::new("default", "a.git"));
    let op = AdvertiseRefs {
        service: Service::ReceivePack,
    };
    let spec = op.build_spec(&invocation(&header, Path::new("/srv/a.git")));
    assert_eq!(
        spec.args,
        ["receive-pack", "--stateless-rpc", "--advertise-refs", "/srv/a.git"]
    );
}

#[test]
fn upload_pack_treats_shallow_exit_as_success() {
    assert!(UploadPack.map_exit(exit(0)).is_ok());
    assert!(UploadPack.map_exit(exit(UPLOAD_PACK_SHALLOW_EXIT)).is_ok());

    match UploadPack.map_exit(exit(1)) {
        Err(AppError::ProcessExit { code, stderr }) => {
            assert_eq!(code, Some(1));
            assert_eq!(stderr, "exit 1");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn receive_pack_only_accepts_zero() {
    assert!(ReceivePack.map_exit(exit(0)).is_ok());
    assert!(ReceivePack.map_exit(exit(128)).is_err());
}

#[test]
fn first_message_shape_depends_on_operation() {
    assert!(UploadPack.validator().validate(b"0032want").is_ok());
    assert!(matches!(
        UploadPack.validator().validate(b"GET / HTTP/1.1"),
        Err(AppError::InvalidArgument(_))
    ));
    let advertise = AdvertiseRefs {
        service: Service::UploadPack,
    };
    assert!(advertise.validator().validate(b"anything").is_ok());
}

#[test]
fn preamble_announces_service() {
    let preamble = service_preamble(Service::UploadPack).unwrap();
    assert_eq!(&preamble[..], b"001e# service=git-upload-pack\n0000");
}
