//! gpgfs daemon and tooling.
//!
//! `gpgfsd mount` adapts an SSH private key into an OpenPGP entity,
//! decrypts the whole source tree into sealed memory, publishes it as a
//! read-only FUSE mount, and blocks until SIGINT/SIGTERM.  The `key` and
//! `message` subcommands are one-shot front-ends to the same adapter and
//! codec.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use gpgfs_core::config::{Config, KeyFormat};
use gpgfs_pgp::{KeyKind, KeyUserId};

#[derive(Parser)]
#[command(name = "gpgfsd")]
#[command(about = "Serve a tree of OpenPGP-encrypted files as a read-only filesystem")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gpgfs.toml")]
    config: PathBuf,

    /// Log filter, e.g. "debug" or "gpgfs_fuse=debug" (overrides RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the decrypted view of the source tree at the target
    Mount {
        /// Directory holding the *.gpg tree (overrides config)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Mount point (overrides config)
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Key tooling
    #[command(subcommand)]
    Key(KeyCommand),

    /// Message tooling
    #[command(subcommand)]
    Message(MessageCommand),
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Convert an SSH private key into an armored OpenPGP key
    Convert {
        /// Which half of the key to emit
        #[arg(short = 't', long = "type", value_enum, default_value = "public")]
        kind: OutputKind,

        /// Key file, or '-' for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file, or '-' for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum MessageCommand {
    /// Encrypt a message to the (converted) key
    Encrypt {
        /// SSH private key path
        #[arg(short, long)]
        key: PathBuf,

        /// Message file, or '-' for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file, or '-' for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Decrypt a message with the key
    Decrypt {
        /// SSH private key path
        #[arg(short, long)]
        key: PathBuf,

        /// Message file, or '-' for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file, or '-' for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputKind {
    Public,
    Private,
}

impl From<OutputKind> for KeyKind {
    fn from(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Public => KeyKind::Public,
            OutputKind::Private => KeyKind::Private,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Mount { source, target } => run_mount(&cli.config, source, target).await,
        Command::Key(KeyCommand::Convert { kind, input, output }) => {
            key_convert(kind, &input, &output)
        }
        Command::Message(MessageCommand::Encrypt { key, input, output }) => {
            message_encrypt(&key, &input, &output)
        }
        Command::Message(MessageCommand::Decrypt { key, input, output }) => {
            message_decrypt(&key, &input, &output)
        }
    }
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {level:?}"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run_mount(
    config_path: &Path,
    source: Option<PathBuf>,
    target: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path)?;

    gpgfs_core::bootstrap::secure_bootstrap();

    let source = source
        .or(config.mount.source)
        .context("no source directory configured")?;
    let target = target
        .or(config.mount.target)
        .context("no mount target configured")?;
    let key_path = config.key.path.context("no private key path configured")?;

    // Both endpoints must exist; resolve to absolute form before use.
    let source = source
        .canonicalize()
        .with_context(|| format!("stat source directory {source:?}"))?;
    let target = target
        .canonicalize()
        .with_context(|| format!("stat mount target {target:?}"))?;

    let uid = KeyUserId::default_for_host()
        .context("failed to resolve the hostname for the key identity")?;
    let pem = std::fs::read(&key_path)
        .with_context(|| format!("read private key {key_path:?}"))?;
    // `new_key_enclave` wipes the PEM bytes before returning.
    let key = gpgfs_pgp::new_key_enclave(config.key.format, &uid, KeyKind::Private, pem)
        .context("failed to adapt the private key")?;

    let tree = gpgfs_fuse::preload(&key, &source).context("preload failed")?;
    info!(files = tree.file_count(), "preload complete");

    let handle = gpgfs_fuse::mount(
        gpgfs_fuse::GpgFs::new(tree),
        &target,
        config.mount.allow_other,
    )?;
    info!(source = %source.display(), target = %target.display(), "gpgfs mounted");

    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!("systemd readiness notification not sent: {err}");
    }

    shutdown_signal().await;
    info!("received shutdown signal, unmounting");
    drop(handle);
    Ok(())
}

fn key_convert(kind: OutputKind, input: &Path, output: &Path) -> Result<()> {
    let uid = KeyUserId::default_for_host()?;
    let mut pem = read_input(input)?;
    let converted = gpgfs_pgp::convert_key(&uid, kind.into(), &pem);
    gpgfs_core::wipe(&mut pem);
    write_output(output, &converted?)
}

fn message_encrypt(key_path: &Path, input: &Path, output: &Path) -> Result<()> {
    let key_buf = load_key_buffer(key_path)?;
    let mut plaintext = read_input(input)?;
    let ciphertext = gpgfs_pgp::codec::encrypt(&key_buf, &plaintext);
    gpgfs_core::wipe(&mut plaintext);
    key_buf.destroy();
    write_output(output, &ciphertext?)
}

fn message_decrypt(key_path: &Path, input: &Path, output: &Path) -> Result<()> {
    let key_buf = load_key_buffer(key_path)?;
    let ciphertext = read_input(input)?;
    let plaintext = gpgfs_pgp::codec::decrypt(&key_buf, &ciphertext);
    key_buf.destroy();
    let mut plaintext = plaintext?;
    let result = write_output(output, &plaintext);
    gpgfs_core::wipe(&mut plaintext);
    result
}

/// Read an SSH private key and open the adapted OpenPGP key into a locked
/// buffer for a one-shot codec operation.
fn load_key_buffer(key_path: &Path) -> Result<gpgfs_core::LockedBuffer> {
    let uid = KeyUserId::default_for_host()?;
    let pem = std::fs::read(key_path)
        .with_context(|| format!("read private key {key_path:?}"))?;
    let key = gpgfs_pgp::new_key_enclave(KeyFormat::Ssh, &uid, KeyKind::Private, pem)
        .context("failed to adapt the private key")?;
    Ok(key.open()?)
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {path:?}"))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {path:?}"))?;
    Ok(config)
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("read stdin")?;
        Ok(buf)
    } else {
        std::fs::read(path).with_context(|| format!("read {path:?}"))
    }
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if path == Path::new("-") {
        std::io::stdout().write_all(bytes).context("write stdout")
    } else {
        std::fs::write(path, bytes).with_context(|| format!("write {path:?}"))
    }
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!("failed to register SIGTERM handler: {err}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
