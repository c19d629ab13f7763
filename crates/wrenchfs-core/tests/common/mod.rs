//! Shared fixtures for session integration tests.
//!
//! Builds a base directory holding the two backing roots with distinct
//! content, so tests can tell which root a session is serving.

// Not every test file uses every helper
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use wrenchfs_core::credential::{BENIGN_CREDENTIAL, BENIGN_DIR, SECRET_CREDENTIAL, SECRET_DIR};
use wrenchfs_core::{PassthroughSession, RootTable};

/// Literal content of `greeting` in the benign root (14 bytes).
pub const GREETING: &[u8] = b"Hello, World!\n";

/// A base directory with populated `benign/` and `secret/` roots.
pub struct Roots {
    dir: TempDir,
}

impl Roots {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("create temp dir");

        let benign = dir.path().join(BENIGN_DIR);
        fs::create_dir_all(benign.join("photos")).unwrap();
        fs::write(benign.join("greeting"), GREETING).unwrap();
        fs::write(benign.join("shopping.txt"), b"milk\neggs\n").unwrap();
        fs::write(benign.join("photos/cat.jpg"), [0xFFu8, 0xD8, 0xFF, 0xE0]).unwrap();

        let secret = dir.path().join(SECRET_DIR);
        fs::create_dir_all(secret.join("plans")).unwrap();
        fs::write(secret.join("launch_codes.txt"), b"00000000\n").unwrap();
        fs::write(secret.join("plans/world_domination.md"), b"# Step 1\n").unwrap();

        // Sibling of the roots; must never be reachable from either
        fs::write(dir.path().join("shadow"), b"outside both roots").unwrap();

        Self { dir }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn table(&self) -> RootTable {
        RootTable::new(self.base())
    }

    pub fn benign_path(&self) -> PathBuf {
        self.base().join(BENIGN_DIR)
    }

    pub fn secret_path(&self) -> PathBuf {
        self.base().join(SECRET_DIR)
    }

    pub fn mount(&self, credential: &str) -> PassthroughSession {
        let root = self.table().resolve(credential).expect("resolve credential");
        PassthroughSession::new(root)
    }

    pub fn benign(&self) -> PassthroughSession {
        self.mount(BENIGN_CREDENTIAL)
    }

    pub fn secret(&self) -> PassthroughSession {
        self.mount(SECRET_CREDENTIAL)
    }
}

/// Routes session logs to the test writer; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sorted entry names of a virtual directory, `.` and `..` included.
pub fn list(session: &PassthroughSession, path: &str) -> Vec<String> {
    let mut names: Vec<String> = session
        .readdir(path)
        .expect("readdir")
        .map(|e| e.expect("dir entry").name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Deterministic, non-repeating-per-block content.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let block = (i / 4096) as u32;
            ((i as u32).wrapping_mul(31) ^ block.wrapping_mul(2_654_435_761)) as u8
        })
        .collect()
}
