//! Two-process demo: the client sends a clear command to a server process it
//! spawns, waits for the response, then tells the server to terminate.
//!
//! Run with: `RUST_LOG=debug cargo run --features demo --bin bridge_demo`

use cmdbridge::{
    Bridge, BridgeConfig, CancelToken, CommandFilter, CommandId, Flags, Module, Role,
    RunningFlag, StaticOptions, MODULE_CHANNEL_CONFIG,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLEAR: CommandId = CommandId::user(1);
const BASE: &str = "demo-";

fn config(dir: &Path, role: Role) -> BridgeConfig {
    let config = BridgeConfig::symmetric(MODULE_CHANNEL_CONFIG).with_segment_dir(dir);
    match role {
        Role::Client => config,
        Role::Server => config.mirrored(),
    }
}

fn run_client() -> Result<(), Box<dyn Error>> {
    let dir: PathBuf = std::env::temp_dir().join(format!("cmdbridge-demo-{}", process::id()));
    std::fs::create_dir_all(&dir)?;

    let options = Arc::new(StaticOptions::new(Duration::from_secs(5), true));
    let bridge = Bridge::<Module>::init(
        BASE,
        Role::Client,
        config(&dir, Role::Client),
        options,
        RunningFlag::new(true),
    )?;

    let mut server = process::Command::new(std::env::current_exe()?)
        .arg("server")
        .arg(&dir)
        .spawn()?;
    info!(pid = server.id(), "server spawned");

    let sequence = bridge.issue(CLEAR, 0, Flags::EXPECTS_RESPONSE, |cmd| {
        cmd.send_data(0xFF00_00FF)?;
        cmd.send_blob(b"color")?;
        Ok(cmd.sequence())
    })?;

    let filter = CommandFilter::command(CommandId::RESPONSE).with_handle(sequence);
    match bridge.optional_response(filter, None)? {
        Some(status) => info!(sequence, status, "clear acknowledged"),
        None => info!(sequence, "clear sent without acknowledgement"),
    }

    bridge.issue(CommandId::TERMINATE, 0, Flags::NONE, |_| Ok(()))?;
    let status = server.wait()?;
    info!(%status, "server exited");

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

fn run_server(dir: &Path) -> Result<(), Box<dyn Error>> {
    let options = Arc::new(StaticOptions::new(Duration::from_secs(5), true));
    let bridge = Bridge::<Module>::init(
        BASE,
        Role::Server,
        config(dir, Role::Server),
        options,
        RunningFlag::new(true),
    )?;
    let cancel = CancelToken::new();

    loop {
        let header =
            bridge.wait_for_command_and_discard(CommandFilter::ANY, Duration::from_secs(10), &cancel)?;
        match header.command {
            CLEAR => {
                let color = bridge.get_data()?;
                let tag = bridge.get_blob()?;
                info!(color, tag = %String::from_utf8_lossy(&tag), "clear received");
                if header.flags.contains(Flags::EXPECTS_RESPONSE) {
                    bridge.issue(CommandId::RESPONSE, header.sequence, Flags::NONE, |cmd| {
                        cmd.send_data(1)
                    })?;
                }
            }
            CommandId::TERMINATE => {
                info!("terminate received");
                return Ok(());
            }
            other => info!(command = %other, "ignoring command"),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("server") => match args.get(2) {
            Some(dir) => run_server(Path::new(dir)),
            None => Err("usage: bridge_demo server <segment-dir>".into()),
        },
        _ => run_client(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "demo failed");
        process::exit(1);
    }
}
