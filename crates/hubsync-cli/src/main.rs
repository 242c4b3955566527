//! hubsync command-line bridge.
//!
//! Streams normalized device events, pulls snapshots, writes IOs and
//! inspects the mapping table.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use hubsync_cloud::{
    CloudClient, EventSynchronizer, RequestSigner, SignedStreamAuth, SnapshotDegree, SyncConfig,
    WsConnector,
};
use hubsync_commands::{Command as IoCommand, CommandDispatcher, DispatcherConfig, SpeedTier};
use hubsync_core::{logging::init_tracing, BridgeConfig, Diagnostics};
use hubsync_devices::{
    Device, DeviceEventBus, DeviceModelBuilder, DeviceStore, MappingRegistry, SharedRegistry,
};

/// hubsync - smart-home cloud bridge
#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ./hubsync.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the push stream and print device events as JSON lines
    Run,

    /// Fetch the full device tree once and print it
    Snapshot {
        /// Detail level, 0 (identity) to 3 (everything)
        #[arg(short, long)]
        degree: Option<u8>,
    },

    /// Write one IO
    Set {
        /// Hub identifier
        hub: String,
        /// Device identifier
        device: String,
        /// IO key, e.g. L1 or P1
        io: String,
        /// `on`, `off` or an integer raw value
        value: IoValue,
        /// Speed tier: normal, fast or extreme
        #[arg(short, long)]
        tier: Option<SpeedTier>,
    },

    /// Print the mapping table, or one device type's entries
    Mappings {
        /// Device type identifier, e.g. SL_SC_THL
        device_type: Option<String>,
    },
}

/// Value accepted by `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoValue {
    On,
    Off,
    Raw(i64),
}

impl FromStr for IoValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(IoValue::On),
            "off" => Ok(IoValue::Off),
            other => other
                .parse::<i64>()
                .map(IoValue::Raw)
                .map_err(|_| format!("expected on, off or an integer, got '{}'", s)),
        }
    }
}

impl IoValue {
    fn into_command(self, hub: &str, device: &str, io: &str) -> IoCommand {
        match self {
            IoValue::On => IoCommand::turn_on(hub, device, io),
            IoValue::Off => IoCommand::turn_off(hub, device, io),
            IoValue::Raw(v) => IoCommand::set_value(hub, device, io, v),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = BridgeConfig::load(args.config.as_deref()).context("loading configuration")?;
    let registry = registry_from_config(&config)?;

    match args.command {
        Command::Mappings { device_type } => {
            print_mappings(&registry.current(), device_type.as_deref())
        }
        Command::Snapshot { degree } => {
            config.validate(true)?;
            snapshot(&config, registry, degree).await
        }
        Command::Set {
            hub,
            device,
            io,
            value,
            tier,
        } => {
            config.validate(true)?;
            set(&config, registry, value.into_command(&hub, &device, &io), tier).await
        }
        Command::Run => {
            config.validate(true)?;
            run(&config, registry).await
        }
    }
}

/// Built-in table with configured overrides published on top.
fn registry_from_config(config: &BridgeConfig) -> Result<Arc<SharedRegistry>> {
    let shared = Arc::new(SharedRegistry::default());
    if !config.mapping.overrides.is_empty() {
        let next = shared
            .current()
            .with_overrides(&config.mapping.overrides)
            .context("applying mapping overrides")?;
        shared.swap(next);
    }
    Ok(shared)
}

fn print_mappings(registry: &MappingRegistry, device_type: Option<&str>) -> Result<()> {
    match device_type {
        Some(type_id) => {
            let Some(mapping) = registry.device_type(type_id) else {
                bail!("unknown device type '{}'", type_id);
            };
            println!("{}", serde_json::to_string_pretty(mapping)?);
        }
        None => {
            for id in registry.type_ids() {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

fn new_store(registry: Arc<SharedRegistry>) -> Arc<DeviceStore> {
    Arc::new(DeviceStore::new(DeviceModelBuilder::new(registry)))
}

async fn snapshot(config: &BridgeConfig, registry: Arc<SharedRegistry>, degree: Option<u8>) -> Result<()> {
    let client = CloudClient::from_config(config)?;
    let degree = match degree {
        Some(d) => SnapshotDegree::try_from(d)?,
        None => client.config().degree,
    };
    let raw = client.fetch_snapshot(degree).await?;

    let store = new_store(registry);
    let (hubs, devices) = store.replace_all(&raw);
    info!(category = "sync", hubs, devices, "Snapshot fetched");

    let devices = store.devices();
    let view: Vec<&Device> = devices.iter().map(|d| d.as_ref()).collect();
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn set(
    config: &BridgeConfig,
    registry: Arc<SharedRegistry>,
    command: IoCommand,
    tier: Option<SpeedTier>,
) -> Result<()> {
    let client = Arc::new(CloudClient::from_config(config)?);
    let dispatch_config = DispatcherConfig::from_config(&config.dispatch, config.api.max_in_flight)?;
    let tier = tier.unwrap_or(dispatch_config.default_tier);

    let dispatcher = CommandDispatcher::builder(client)
        .config(dispatch_config)
        .store(new_store(registry))
        .build();

    let hub_id = command.hub_id.clone();
    let outcome = dispatcher.dispatch(&hub_id, vec![command], tier).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_success() {
        bail!("{} command(s) failed", outcome.failed().len());
    }
    Ok(())
}

async fn run(config: &BridgeConfig, registry: Arc<SharedRegistry>) -> Result<()> {
    let diagnostics = Diagnostics::new();
    let events = DeviceEventBus::with_name("devices");
    let store = new_store(registry);
    let client = Arc::new(CloudClient::from_config(config)?);

    let signer = RequestSigner::for_account(&config.account, config.api.signature_tolerance_secs);
    let auth = Arc::new(SignedStreamAuth::new(config.account.clone(), signer));
    let connector = Arc::new(WsConnector::new(Duration::from_secs(config.api.timeout_secs)));

    let handle = EventSynchronizer::new(
        SyncConfig::from_config(config),
        connector,
        auth,
        client,
        Arc::clone(&store),
    )
    .events(events.clone())
    .diagnostics(Arc::clone(&diagnostics))
    .spawn();

    info!(category = "sync", url = %config.stream_url(), "Bridge running, Ctrl-C to stop");
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some((event, _meta)) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(category = "sync", "Interrupted, shutting down");
                break;
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(category = "sync", error = %e, "Synchronizer stopped with error");
    }
    let (hubs, online) = store.hub_counts();
    diagnostics.set_hub_counts(hubs, online);
    eprintln!("{}", serde_json::to_string_pretty(&diagnostics.snapshot())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_value_parsing() {
        assert_eq!("on".parse::<IoValue>(), Ok(IoValue::On));
        assert_eq!("OFF".parse::<IoValue>(), Ok(IoValue::Off));
        assert_eq!("2147483648".parse::<IoValue>(), Ok(IoValue::Raw(2_147_483_648)));
        assert!("dim".parse::<IoValue>().is_err());
    }

    #[test]
    fn test_io_value_builds_command() {
        let cmd = IoValue::Raw(40).into_command("A1", "d1", "P1");
        assert_eq!(cmd.hub_id, "A1");
        assert_eq!(cmd.raw_val, 40);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["hubsync", "set", "A1", "d1", "L1", "on", "--tier", "fast"])
            .unwrap();
        match args.command {
            Command::Set { tier, value, .. } => {
                assert_eq!(tier, Some(SpeedTier::Fast));
                assert_eq!(value, IoValue::On);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
