mod common;

use std::fs;

use common::{artifact_bytes, artifact_path, host, Fault, Fixture, RegistryBuilder};
use yarn_models::{
    core::events::LifecycleState,
    models::{CancellationToken, DownloadError, ModelError},
};

const SIZE: usize = 200_000;

#[test]
fn client_error_fails_without_retry() {
    let fx = Fixture::new();
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &artifact_bytes(SIZE, 1)));
    let path = artifact_path("phi", "1.0.0");
    fx.server.script(&path, [Fault::Status(404)]);
    let manager = fx.manager();

    let error = manager
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap_err();
    match error.kind() {
        ModelError::Download(DownloadError::ClientError { status, url }) => {
            assert_eq!(*status, 404);
            assert!(url.ends_with(&path));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fx.server.hits(&path).len(), 1);
    assert!(manager.list_installed().unwrap().is_empty());
    assert!(fx.events.states("phi").contains(&LifecycleState::Failed {
        reason: error.kind().to_string(),
        retryable: false,
    }));
}

#[test]
fn server_errors_and_throttling_are_retried() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 2);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let path = artifact_path("phi", "1.0.0");
    fx.server
        .script(&path, [Fault::Status(503), Fault::Status(429)]);

    let installed = fx
        .manager()
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    assert_eq!(fx.server.hits(&path).len(), 3);
}

#[test]
fn retries_are_bounded() {
    let fx = Fixture::new();
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &artifact_bytes(SIZE, 1)));
    let path = artifact_path("phi", "1.0.0");
    fx.server.script(&path, [Fault::Status(502); 6]);

    let error = fx
        .manager()
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ModelError::Download(DownloadError::Transient { attempts: 4, .. })
    ));
    assert_eq!(fx.server.hits(&path).len(), 4);
}

#[test]
fn interrupted_transfer_resumes_to_identical_bytes() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 3);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let path = artifact_path("phi", "1.0.0");
    fx.server.script(&path, [Fault::Truncate(70_000)]);

    let installed = fx
        .manager()
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    assert_eq!(
        fx.server.hits(&path),
        vec![None, Some("bytes=70000-".to_string())]
    );
}

#[test]
fn resume_falls_back_to_full_download_without_range_support() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 4);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let path = artifact_path("phi", "1.0.0");
    fx.server.without_ranges(&path);
    fx.server.script(&path, [Fault::Truncate(50_000)]);

    let installed = fx
        .manager()
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    assert_eq!(fx.server.hits(&path).len(), 2);
}

#[test]
fn partial_left_by_earlier_run_is_resumed() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 5);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let manager = fx.manager();
    let staging = fx.models_dir().join("staging/phi-1.0.0.part");
    fs::write(&staging, &bytes[..120_000]).unwrap();

    let installed = manager
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    let path = artifact_path("phi", "1.0.0");
    assert_eq!(
        fx.server.hits(&path),
        vec![Some("bytes=120000-".to_string())]
    );
    assert!(!staging.exists());
}

#[test]
fn misaligned_partial_response_restarts_from_zero() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 10);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let manager = fx.manager();
    fs::write(
        fx.models_dir().join("staging/phi-1.0.0.part"),
        &bytes[..120_000],
    )
    .unwrap();
    let path = artifact_path("phi", "1.0.0");
    fx.server.script(&path, [Fault::RangeFrom(100_000)]);

    let installed = manager
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    assert_eq!(
        fx.server.hits(&path),
        vec![Some("bytes=120000-".to_string()), None]
    );
}

#[test]
fn corrupt_partial_is_caught_by_checksum_and_discarded() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 6);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let manager = fx.manager();
    let staging = fx.models_dir().join("staging/phi-1.0.0.part");
    fs::write(&staging, artifact_bytes(10_000, 99)).unwrap();
    let cancel = CancellationToken::new();

    let error = manager.install("phi", None, &host(), &cancel).unwrap_err();
    assert!(matches!(error.kind(), ModelError::ChecksumMismatch { .. }));
    assert!(!staging.exists());
    assert!(fx.events.states("phi").contains(&LifecycleState::Failed {
        reason: error.kind().to_string(),
        retryable: true,
    }));

    let installed = manager.install("phi", None, &host(), &cancel).unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
}

#[test]
fn oversized_partial_restarts_from_zero() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 7);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let manager = fx.manager();
    fs::write(
        fx.models_dir().join("staging/phi-1.0.0.part"),
        artifact_bytes(SIZE + 10, 7),
    )
    .unwrap();

    let installed = manager
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
    assert_eq!(fx.server.hits(&artifact_path("phi", "1.0.0")), vec![None]);
}

#[test]
fn cancellation_keeps_partial_for_later_resume() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 8);
    fx.publish(&RegistryBuilder::new().release(&fx.server, "phi", "1.0.0", &bytes));
    let manager = fx.manager();
    let staging = fx.models_dir().join("staging/phi-1.0.0.part");
    fs::write(&staging, &bytes[..40_000]).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = manager.install("phi", None, &host(), &cancel).unwrap_err();
    match error.kind() {
        ModelError::Download(download) => {
            assert!(matches!(
                download,
                DownloadError::Cancelled {
                    bytes_on_disk: 40_000
                }
            ));
            assert!(download.is_retryable());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fs::metadata(&staging).unwrap().len(), 40_000);
    assert!(manager.list_installed().unwrap().is_empty());

    let installed = manager
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap();
    assert_eq!(fs::read(&installed.file_path).unwrap(), bytes);
}

#[test]
fn registry_size_mismatch_discards_download() {
    let fx = Fixture::new();
    let bytes = artifact_bytes(SIZE, 9);
    fx.publish(&RegistryBuilder::new().release_with(
        &fx.server,
        "phi",
        "1.0.0",
        &bytes,
        |entry| entry["size_bytes"] = serde_json::json!(SIZE - 1),
    ));

    let error = fx
        .manager()
        .install("phi", None, &host(), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ModelError::Download(DownloadError::SizeMismatch { .. })
    ));
    assert!(!fx.models_dir().join("staging/phi-1.0.0.part").exists());
}
