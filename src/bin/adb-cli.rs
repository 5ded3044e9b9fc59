use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use adb_core::connection;
use adb_core::mux::StreamMux;
use adb_core::service::ServiceClient;
use adb_core::signer::Signer;
use adb_core::transport::{usb::UsbTransport, Transport};
use adb_core::util::config;
use adb_core::util::logging::{init_logger, LogVerbosity};

#[derive(Debug, Parser)]
#[command(name = "adb-cli", version, about = "Thin ADB host client built on adb_core")]
struct Cli {
    /// Connect over TCP to host:port instead of USB
    #[arg(long, global = true)]
    tcp: Option<String>,

    /// USB device index among matching ADB interfaces, used when --tcp is absent
    #[arg(long, default_value_t = 0, global = true)]
    usb_device_index: usize,

    /// Overall deadline for the operation, in seconds
    #[arg(long, default_value_t = 10, global = true)]
    timeout_secs: u64,

    /// Verbose logging
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List devices known to a local adb server (host:devices[-l])
    Devices {
        #[arg(long)]
        long: bool,
    },
    /// host:connect:HOST:PORT
    Connect { host_port: String },
    /// host:disconnect:HOST:PORT
    Disconnect { host_port: String },
    /// Run a shell command and print its output
    Shell { cmd: String },
    /// Push a local file to a remote path
    Push {
        src: PathBuf,
        dst: String,
        #[arg(long, default_value_t = 0o644)]
        mode: u32,
    },
    /// Pull a remote file to a local path
    Pull { src: String, dst: PathBuf },
    /// Stat a remote path
    Stat { path: String },
    /// List a remote directory
    Ls { path: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(match cli.verbose {
        0 => LogVerbosity::Normal,
        1 => LogVerbosity::Verbose,
        _ => LogVerbosity::Debug,
    });

    let deadline = Duration::from_secs(cli.timeout_secs);

    let mut transport = match &cli.tcp {
        Some(addr) => Transport::Tcp(
            adb_core::transport::tcp::TcpTransport::connect(addr)
                .with_context(|| format!("connecting to {addr}"))?,
        ),
        None => Transport::Usb(UsbTransport::open(cli.usb_device_index).context("opening USB ADB interface")?),
    };

    let signer = config::load_or_generate_signer("adb-cli@host").context("loading/generating ADB signing key")?;
    let signers: Vec<std::sync::Arc<dyn Signer>> = vec![signer.into_arc()];
    let session = connection::handshake(&mut transport, &signers, &["shell_v2", "cmd"], deadline)
        .context("ADB handshake failed")?;
    log::info!("connected: {} (max_payload={:#x})", session.system_identity, session.max_payload);

    let mux = StreamMux::start(transport, session);
    let client = ServiceClient::new(mux);

    match cli.command {
        Commands::Devices { long } => {
            for d in client.list_devices(long, deadline).context("host:devices")? {
                if d.extra.is_empty() {
                    println!("{}\t{}", d.serial, d.state);
                } else {
                    let extra: Vec<String> = d.extra.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                    println!("{}\t{}\t{}", d.serial, d.state, extra.join("\t"));
                }
            }
        }
        Commands::Connect { host_port } => {
            client.host_connect(&host_port, deadline).context("host:connect")?;
            println!("connected to {host_port}");
        }
        Commands::Disconnect { host_port } => {
            client.host_disconnect(&host_port, deadline).context("host:disconnect")?;
            println!("disconnected {host_port}");
        }
        Commands::Shell { cmd } => {
            let output = client.shell(&cmd, deadline).context("shell")?;
            print!("{}", String::from_utf8_lossy(&output));
        }
        Commands::Push { src, dst, mode } => {
            client.push_file(&src, &dst, mode, deadline).context("push")?;
            println!("pushed {} -> {}", src.display(), dst);
        }
        Commands::Pull { src, dst } => {
            client.pull_file(&src, &dst, deadline).context("pull")?;
            println!("pulled {} -> {}", src, dst.display());
        }
        Commands::Stat { path } => {
            let st = client.stat(&path, deadline).context("stat")?;
            println!("mode={:o} size={} mtime={}", st.mode, st.size, st.mtime);
        }
        Commands::Ls { path } => {
            for entry in client.list(&path, deadline).context("list")? {
                println!("{:o}\t{}\t{}\t{}", entry.mode, entry.size, entry.mtime, entry.name);
            }
        }
    }

    Ok(())
}
