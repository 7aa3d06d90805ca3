//! End-to-end scenarios against a drive rooted in a temporary directory.

use std::thread;
use std::time::Duration;

use filedrive_core::config::QuotaLimits;
use filedrive_core::{Caller, Drive, DriveConfig, DriveError};
use tempfile::TempDir;

const FAST: u64 = 1 << 30;

fn open_drive(dir: &TempDir) -> Drive {
    let mut config = DriveConfig::ephemeral(dir.path().join("root"));
    config.metadata_path = Some(dir.path().join("meta"));
    Drive::open(config).unwrap()
}

fn provision(drive: &Drive, user: &str, space_limit: u64) -> Caller {
    drive
        .provision_user(
            &Caller::admin("root"),
            user,
            Some(QuotaLimits {
                space_limit,
                upload_speed_limit: FAST,
                download_speed_limit: FAST,
            }),
        )
        .unwrap();
    Caller::user(user)
}

fn upload(drive: &Drive, caller: &Caller, path: &str, data: &[u8]) -> String {
    drive.create_upload(caller, path, data.len() as u64).unwrap();
    drive
        .upload_chunk(caller, path, data, 0)
        .unwrap()
        .final_path
        .unwrap()
}

fn read_all(drive: &Drive, caller: &Caller, path: &str) -> Vec<u8> {
    let mut stream = drive.open_download(caller, path).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read_chunk(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    stream.close();
    out
}

#[test]
fn quota_fills_up_and_drains() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    for i in 0..10 {
        upload(&drive, &alice, &format!("alice/files/f{}", i), &[i as u8; 100]);
    }
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 1000);

    let err = drive.create_upload(&alice, "alice/files/f10", 100).unwrap_err();
    assert!(matches!(err, DriveError::QuotaExceeded { used: 1000, requested: 100, .. }));
    assert!(err.is_retryable());
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 1000);
    assert!(drive.list_uploads(&alice).unwrap().is_empty());

    for i in 0..10 {
        assert_eq!(drive.delete(&alice, &format!("alice/files/f{}", i)).unwrap(), 100);
    }
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 0);
}

#[test]
fn chunk_at_wrong_offset_is_rejected() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    drive.create_upload(&alice, "alice/files/a/b", 10).unwrap();
    let err = drive
        .upload_chunk(&alice, "alice/files/a/b", b"12345", 5)
        .unwrap_err();
    assert!(matches!(err, DriveError::OffsetMismatch { expected: 0, got: 5 }));
    assert!(!err.is_retryable());
    assert_eq!(drive.upload_status(&alice, "alice/files/a/b").unwrap().uploaded, 0);

    drive.upload_chunk(&alice, "alice/files/a/b", b"01234", 0).unwrap();
    let done = drive
        .upload_chunk(&alice, "alice/files/a/b", b"56789", 5)
        .unwrap();
    assert_eq!(done.final_path.as_deref(), Some("alice/files/a/b"));
    assert_eq!(read_all(&drive, &alice, "alice/files/a/b"), b"0123456789");
}

#[test]
fn duplicate_targets_get_numbered_siblings() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    assert_eq!(upload(&drive, &alice, "alice/files/report.pdf", b"v0"), "alice/files/report.pdf");
    assert_eq!(upload(&drive, &alice, "alice/files/report.pdf", b"v1"), "alice/files/report_1.pdf");
    assert_eq!(upload(&drive, &alice, "alice/files/report.pdf", b"v2"), "alice/files/report_2.pdf");

    assert_eq!(read_all(&drive, &alice, "alice/files/report_2.pdf"), b"v2");
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 6);
}

#[test]
fn cancelled_upload_returns_its_reservation() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    drive.create_upload(&alice, "alice/files/big", 800).unwrap();
    drive.upload_chunk(&alice, "alice/files/big", &[0u8; 300], 0).unwrap();
    assert_eq!(drive.quota(&alice, "alice").unwrap().uploads_in_flight, 1);
    assert!(!drive.can_reserve(&alice, 300).unwrap());

    drive.cancel_upload(&alice, "alice/files/big").unwrap();
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 0);
    assert!(matches!(
        drive.upload_status(&alice, "alice/files/big"),
        Err(DriveError::NotFound(_))
    ));
}

#[test]
fn share_round_trip() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);
    upload(&drive, &alice, "alice/files/photos/cat.jpg", b"meow");

    let id = drive.add_sharing(&alice, "alice/files/photos").unwrap();
    assert_eq!(id.len(), 7);
    assert_eq!(drive.add_sharing(&alice, "alice/files/photos").unwrap(), id);
    assert_eq!(drive.resolve_share(&id).unwrap(), "alice/files/photos");

    let visitor = Caller::visitor();
    let shared = drive.resolve_share(&id).unwrap();
    assert_eq!(read_all(&drive, &visitor, &format!("{}/cat.jpg", shared)), b"meow");

    drive.del_sharing(&alice, "alice/files/photos").unwrap();
    assert!(matches!(drive.resolve_share(&id), Err(DriveError::NotFound(_))));
    assert!(matches!(
        drive.del_sharing(&alice, "alice/files/photos"),
        Err(DriveError::NotFound(_))
    ));
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let drive = open_drive(&dir);
        let alice = provision(&drive, "alice", 1000);
        upload(&drive, &alice, "alice/files/pub/a", &[7u8; 40]);
        drive.create_upload(&alice, "alice/files/pending", 60).unwrap();
        let id = drive.add_sharing(&alice, "alice/files/pub").unwrap();
        drive.close().unwrap();
        id
    };

    let drive = open_drive(&dir);
    let alice = Caller::user("alice");
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 100);
    assert_eq!(drive.resolve_share(&id).unwrap(), "alice/files/pub");
    assert_eq!(drive.recalculate(&alice, "alice").unwrap(), 100);

    let done = drive
        .upload_chunk(&alice, "alice/files/pending", &[1u8; 60], 0)
        .unwrap();
    assert!(done.is_complete());
}

#[test]
fn concurrent_writers_never_interleave() {
    const WRITERS: usize = 8;
    const CHUNK: usize = 512;

    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1 << 20);
    let target = "alice/files/stress.bin";
    drive
        .create_upload(&alice, target, (WRITERS * CHUNK) as u64)
        .unwrap();

    thread::scope(|s| {
        for i in 0..WRITERS {
            let drive = &drive;
            let alice = &alice;
            s.spawn(move || {
                let chunk = vec![i as u8; CHUNK];
                let offset = (i * CHUNK) as u64;
                loop {
                    match drive.upload_chunk(alice, target, &chunk, offset) {
                        Ok(_) => break,
                        Err(DriveError::LockContention(_)) | Err(DriveError::OffsetMismatch { .. }) => {
                            thread::yield_now()
                        }
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                }
            });
        }
    });

    let expected: Vec<u8> = (0..WRITERS).flat_map(|i| vec![i as u8; CHUNK]).collect();
    assert_eq!(read_all(&drive, &alice, target), expected);
    assert!(drive.list_uploads(&alice).unwrap().is_empty());
}

#[test]
fn other_users_and_visitors_are_kept_out() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);
    let bob = provision(&drive, "bob", 1000);
    upload(&drive, &alice, "alice/files/diary.txt", b"dear diary");

    for result in [
        drive.stat(&bob, "alice/files/diary.txt").map(|_| ()),
        drive.delete(&bob, "alice/files/diary.txt").map(|_| ()),
        drive.create_upload(&bob, "alice/files/x", 1).map(|_| ()),
        drive.stat(&Caller::visitor(), "alice/files/diary.txt").map(|_| ()),
        drive.mkdir(&Caller::visitor(), "alice/files/d"),
        drive.add_sharing(&bob, "alice/files").map(|_| ()),
    ] {
        assert!(matches!(result, Err(DriveError::PermissionDenied(_))));
    }

    assert!(matches!(
        drive.stat(&alice, "alice/files/../../../etc/passwd"),
        Err(DriveError::InvalidPath(_))
    ));
    assert!(matches!(
        drive.create_upload(&alice, "alice/.uploadings/x", 1),
        Err(DriveError::PermissionDenied(_))
    ));
}

#[test]
fn download_budget_throttles_then_refills() {
    let dir = TempDir::new().unwrap();
    let mut config = DriveConfig::ephemeral(dir.path().join("root"));
    config.limiter.cycle_millis = 50;
    let drive = Drive::open(config).unwrap();
    drive
        .provision_user(
            &Caller::admin("root"),
            "dave",
            Some(QuotaLimits {
                space_limit: 1000,
                upload_speed_limit: 1000,
                download_speed_limit: 10,
            }),
        )
        .unwrap();
    let dave = Caller::user("dave");
    upload(&drive, &dave, "dave/files/f", &[9u8; 20]);

    let mut stream = drive.open_download(&dave, "dave/files/f").unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(stream.read_chunk(&mut buf).unwrap(), 10);
    let err = stream.read_chunk(&mut buf).unwrap_err();
    assert!(matches!(err, DriveError::RateLimited(_)));
    assert!(err.is_retryable());

    thread::sleep(Duration::from_millis(120));
    assert_eq!(stream.read_chunk(&mut buf).unwrap(), 10);
    assert_eq!(stream.remaining(), 0);
    stream.close();
}

#[test]
fn missing_paths_map_to_not_found() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    match drive.stat(&alice, "alice/files/nope") {
        Err(DriveError::NotFound(path)) => assert_eq!(path, "alice/files/nope"),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(matches!(
        drive.open_download(&alice, "alice/files/nope"),
        Err(DriveError::NotFound(_))
    ));
    assert!(matches!(
        drive.delete(&alice, "alice/files/nope"),
        Err(DriveError::NotFound(_))
    ));
}

#[test]
fn upload_finishes_after_its_directory_is_deleted() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);

    drive.create_upload(&alice, "alice/files/dir/f", 4).unwrap();
    drive.upload_chunk(&alice, "alice/files/dir/f", b"ab", 0).unwrap();
    drive.delete(&alice, "alice/files/dir").unwrap();
    assert_eq!(drive.quota(&alice, "alice").unwrap().used_space, 4);

    let done = drive.upload_chunk(&alice, "alice/files/dir/f", b"cd", 2).unwrap();
    assert_eq!(done.final_path.as_deref(), Some("alice/files/dir/f"));
    assert_eq!(read_all(&drive, &alice, "alice/files/dir/f"), b"abcd");
    assert_eq!(drive.recalculate(&alice, "alice").unwrap(), 4);
}

#[test]
fn users_cannot_refund_their_own_quota() {
    let dir = TempDir::new().unwrap();
    let drive = open_drive(&dir);
    let alice = provision(&drive, "alice", 1000);
    upload(&drive, &alice, "alice/files/full", &[0u8; 1000]);

    assert!(matches!(
        drive.release(&alice, "alice", 1000),
        Err(DriveError::PermissionDenied(_))
    ));
    assert!(matches!(
        drive.create_upload(&alice, "alice/files/more", 1000),
        Err(DriveError::QuotaExceeded { .. })
    ));
}
