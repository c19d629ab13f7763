//! wrenchmount - Mount a credential-selected directory as a FUSE filesystem.
//!
//! Usage: wrenchmount <MOUNT> [--roots <dir>] [--password <credential>]
//!
//! The credential picks which subdirectory of `--roots` backs the mount.
//! An unrecognized credential exits with an error before anything is mounted.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wrenchfs_core::{PassthroughSession, RootTable};
use wrenchfs_fuse::MountConfig;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "wrenchmount")]
#[command(about = "Mount a credential-selected directory as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// Directory holding the backing roots
    #[arg(long, default_value = ".")]
    roots: PathBuf,

    /// Credential (if not provided, will prompt)
    #[arg(short, long, env = "WRENCHFS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    run(cli)
}

fn run(mut cli: Cli) -> Result<()> {
    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let root = {
        let credential = get_credential(&mut cli)?;
        RootTable::new(&cli.roots)
            .resolve(&credential)
            .inspect_err(|e| error!(error = %e, "Mount failed"))
            .context("Failed to select backing root")?
    };

    let config = MountConfig::default()
        .read_only(cli.read_only)
        .allow_other(cli.allow_other);
    let session = PassthroughSession::new(root);

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!(mount = %cli.mount.display(), "Mounting filesystem (press Ctrl+C to unmount)");
    let handle = wrenchfs_fuse::mount(session, &cli.mount, config)
        .inspect_err(|e| error!(error = %e, "Mount failed"))
        .context("Failed to mount filesystem")?;
    info!("Filesystem mounted at {}", handle.mountpoint().display());

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount();
    info!("Filesystem unmounted");
    Ok(())
}

/// Takes the credential from the CLI or environment, or prompts for it.
fn get_credential(cli: &mut Cli) -> Result<Zeroizing<String>> {
    match cli.password.take() {
        Some(credential) => Ok(Zeroizing::new(credential)),
        None => Ok(Zeroizing::new(
            rpassword::prompt_password("Password: ").context("Failed to read password")?,
        )),
    }
}
