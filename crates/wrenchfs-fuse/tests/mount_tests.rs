//! End-to-end tests through a real FUSE mount.
//!
//! Run: `cargo nextest run -p wrenchfs-fuse --features fuse-tests mount_tests`

#![cfg(all(unix, feature = "fuse-tests"))]

mod common;

#[allow(unused_imports)]
use common::*;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::sync::Arc;
use std::thread;
use wrenchfs_core::credential::SECRET_CREDENTIAL;
use wrenchfs_fuse::MountConfig;

// =============================================================================
// Root selection
// =============================================================================

#[test]
fn test_benign_greeting() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    assert_eq!(mount.read("greeting").unwrap(), GREETING);
    assert_eq!(
        mount.list("/").unwrap(),
        vec!["greeting", "photos", "shopping.txt"]
    );
}

#[test]
fn test_secret_root_is_isolated() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::with_credential(
        SECRET_CREDENTIAL,
        MountConfig::default()
    ));

    assert_eq!(mount.list("/").unwrap(), vec!["launch_codes.txt"]);
    assert!(!mount.exists("greeting"));
}

// =============================================================================
// Reads and writes
// =============================================================================

#[test]
fn test_partial_read_at_offset() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let mut file = File::open(mount.path("greeting")).unwrap();
    file.seek(SeekFrom::Start(7)).unwrap();
    let mut buf = [0u8; 5];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"World");
}

#[test]
fn test_write_reaches_backing_file() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    mount.write("notes.txt", b"remember the milk").unwrap();
    assert_eq!(
        fs::read(mount.benign_backing("notes.txt")).unwrap(),
        b"remember the milk"
    );
    assert!(!mount.secret_backing("notes.txt").exists());
}

#[test]
fn test_overwrite_in_place() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let file = OpenOptions::new()
        .write(true)
        .open(mount.path("greeting"))
        .unwrap();
    file.write_all_at(b"J", 0).unwrap();
    drop(file);

    assert_eq!(mount.read("greeting").unwrap(), b"Jello, World!\n");
}

#[test]
fn test_truncate_through_mount() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let file = OpenOptions::new()
        .write(true)
        .open(mount.path("shopping.txt"))
        .unwrap();
    file.set_len(5).unwrap();
    drop(file);

    assert_eq!(mount.read("shopping.txt").unwrap(), b"milk\n");
}

#[test]
fn test_append() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let mut file = OpenOptions::new()
        .append(true)
        .open(mount.path("shopping.txt"))
        .unwrap();
    file.write_all(b"bread\n").unwrap();
    drop(file);

    assert_eq!(mount.read("shopping.txt").unwrap(), b"milk\neggs\nbread\n");
}

// =============================================================================
// Namespace operations
// =============================================================================

#[test]
fn test_mkdir_rename_rmdir() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    mount.mkdir("albums").unwrap();
    mount.write("albums/one.txt", b"1").unwrap();
    mount.rename("albums", "archive").unwrap();

    assert!(!mount.exists("albums"));
    assert_eq!(mount.read("archive/one.txt").unwrap(), b"1");
    assert!(mount.benign_backing("archive/one.txt").exists());

    mount.remove("archive/one.txt").unwrap();
    mount.rmdir("archive").unwrap();
    assert!(!mount.benign_backing("archive").exists());
}

#[test]
fn test_rmdir_non_empty_is_enotempty() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    mount.write("photos/dog.jpg", b"woof").unwrap();
    let err = mount.rmdir("photos").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
}

#[test]
fn test_symlink_and_readlink() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    std::os::unix::fs::symlink("greeting", mount.path("hello")).unwrap();
    assert!(mount.symlink_metadata("hello").unwrap().file_type().is_symlink());
    assert_eq!(
        fs::read_link(mount.path("hello")).unwrap(),
        std::path::PathBuf::from("greeting")
    );
    assert_eq!(mount.read("hello").unwrap(), GREETING);
}

#[test]
fn test_chmod() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    fs::set_permissions(mount.path("greeting"), fs::Permissions::from_mode(0o600)).unwrap();
    let mode = fs::metadata(mount.benign_backing("greeting"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_missing_file_is_enoent() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let err = File::open(mount.path("nope")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

// =============================================================================
// Read-only mounts
// =============================================================================

#[test]
fn test_read_only_mount_rejects_writes() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::with_credential(
        wrenchfs_core::credential::BENIGN_CREDENTIAL,
        MountConfig::default().read_only(true)
    ));

    assert_eq!(mount.read("greeting").unwrap(), GREETING);
    let err = mount.write("new.txt", b"x").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));
    assert!(!mount.benign_backing("new.txt").exists());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_readers_one_descriptor() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    mount.write("big.bin", &data).unwrap();

    let file = Arc::new(File::open(mount.path("big.bin")).unwrap());
    let data = Arc::new(data);
    let chunk = 128 * 1024;

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let file = Arc::clone(&file);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                let offset = i * chunk;
                let mut buf = vec![0u8; chunk];
                file.read_exact_at(&mut buf, offset as u64).unwrap();
                assert_eq!(&buf[..], &data[offset..offset + chunk]);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_data_survives_unmount() {
    skip_if_no_fuse!();
    let mount = require_mount!(TestMount::benign());

    let mut file = File::create(mount.path("pending.txt")).unwrap();
    file.write_all(b"flushed").unwrap();
    drop(file);

    let backing = mount.benign_backing("pending.txt");
    let _base = mount.unmount();

    assert_eq!(fs::read(backing).unwrap(), b"flushed");
}
