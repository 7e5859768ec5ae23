use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use chrono::Utc;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use env_logger::{Builder, Env};
use log::{error, info, warn};
use tokio::{signal, task, time};

use conntrack_snapshot::{
    AddressList, EntryFilter, Gauge, MapScope, MapSetConfig, Snapshot, SystemClock, list_entries,
    maps::{self, CtMap},
};

const EXIT_UNAVAILABLE: i32 = 2;

#[derive(Parser)]
#[command(name = "conntrack-snapshot")]
#[command(about = "Conntrack table snapshot agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the conntrack maps this host exposes
    Maps(MapArgs),
    /// Take one snapshot and print its entries
    Dump(DumpCommand),
    /// Take a snapshot every interval until interrupted
    Watch(WatchCommand),
}

#[derive(Args, Clone)]
struct MapArgs {
    /// bpffs mount point
    #[arg(long, value_name = "DIR", default_value = maps::DEFAULT_MAP_ROOT)]
    map_root: PathBuf,
    /// Directory of the datapath maps below the mount point
    #[arg(long, value_name = "DIR", default_value = maps::DEFAULT_MAP_PREFIX)]
    map_prefix: PathBuf,
    /// Capacity of the TCP conntrack table
    #[arg(long, value_name = "COUNT", default_value_t = maps::DEFAULT_TCP_MAX_ENTRIES)]
    tcp_max_entries: u32,
    /// Capacity of the conntrack table for every other protocol
    #[arg(long, value_name = "COUNT", default_value_t = maps::DEFAULT_ANY_MAX_ENTRIES)]
    any_max_entries: u32,
    /// Read the per-endpoint tables of this endpoint instead of the global ones
    #[arg(long, value_name = "ID")]
    endpoint: Option<u16>,
}

#[derive(Args, Clone)]
struct FilterArgs {
    /// Keep only this protocol (number or tcp/udp/icmp); repeatable
    #[arg(long = "proto", value_name = "PROTO", value_parser = parse_proto)]
    protocols: Vec<u8>,
    /// Keep only flows with an endpoint inside one of these CIDRs (one per line)
    #[arg(long, value_name = "FILE")]
    address_list: Option<PathBuf>,
    /// Drop flows whose lifetime already passed
    #[arg(long, action = ArgAction::SetTrue)]
    exclude_expired: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Args)]
struct DumpCommand {
    #[command(flatten)]
    maps: MapArgs,
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Seconds before the snapshot is abandoned
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Args)]
struct WatchCommand {
    #[command(flatten)]
    maps: MapArgs,
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Seconds between snapshots
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,
    /// Seconds before a snapshot is abandoned
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    init_logger();

    match run().await {
        Ok(code) => exit(code),
        Err(err) => {
            error!("conntrack-snapshot error: {err:?}");
            exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Maps(args)) => show_maps(&map_config(&args)?),
        Some(Commands::Dump(cmd)) => dump(cmd).await,
        Some(Commands::Watch(cmd)) => watch(cmd).await,
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(0)
        }
    }
}

fn map_config(args: &MapArgs) -> Result<MapSetConfig> {
    ensure!(
        args.tcp_max_entries > 0,
        "tcp map size must be greater than zero"
    );
    ensure!(
        args.any_max_entries > 0,
        "any map size must be greater than zero"
    );
    Ok(MapSetConfig {
        map_root: args.map_root.clone(),
        map_prefix: args.map_prefix.clone(),
        tcp_max_entries: args.tcp_max_entries,
        any_max_entries: args.any_max_entries,
        scope: args.endpoint.map_or(MapScope::Global, MapScope::Endpoint),
    })
}

fn base_filter(args: &FilterArgs) -> Result<EntryFilter> {
    let addresses = AddressList::from_option(args.address_list.as_deref(), "address list")?;
    Ok(EntryFilter::new()
        .with_protocols(args.protocols.iter().copied())
        .with_addresses(addresses))
}

fn parse_proto(value: &str) -> Result<u8> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(libc::IPPROTO_TCP as u8),
        "udp" => Ok(libc::IPPROTO_UDP as u8),
        "icmp" => Ok(libc::IPPROTO_ICMP as u8),
        other => {
            let proto: u8 = other
                .parse()
                .with_context(|| format!("unknown protocol '{value}'"))?;
            ensure!(proto != 0, "protocol 0 never appears in a snapshot");
            Ok(proto)
        }
    }
}

fn show_maps(config: &MapSetConfig) -> Result<i32> {
    let dir = config.map_dir();
    if !maps::bpf_maps_exist(&config.map_root, &config.map_prefix) {
        println!("conntrack maps unavailable: {} not found", dir.display());
        return Ok(EXIT_UNAVAILABLE);
    }
    for map in maps::ct_maps(config) {
        let present = if map.path().exists() { "present" } else { "missing" };
        println!(
            "{} max_entries: {} {present}",
            map.path().display(),
            map.max_entries()
        );
    }
    Ok(0)
}

async fn dump(cmd: DumpCommand) -> Result<i32> {
    let config = map_config(&cmd.maps)?;
    let filter = base_filter(&cmd.filter)?;
    ensure!(cmd.timeout_secs > 0, "timeout must be greater than zero");

    let filter = with_expiry(filter, cmd.filter.exclude_expired);
    let gauge = Arc::new(Gauge::new());
    let deadline = Duration::from_secs(cmd.timeout_secs);
    let Some(snapshot) = take_snapshot(config.clone(), filter, gauge, deadline).await? else {
        warn!(
            "conntrack maps unavailable: {} not found",
            config.map_dir().display()
        );
        return Ok(EXIT_UNAVAILABLE);
    };

    print_snapshot(&snapshot, cmd.format)?;
    info!(
        "{} entries, {} scanned",
        snapshot.entries.len(),
        snapshot.scanned
    );
    Ok(0)
}

async fn watch(cmd: WatchCommand) -> Result<i32> {
    let config = map_config(&cmd.maps)?;
    let filter = base_filter(&cmd.filter)?;
    ensure!(cmd.interval_secs > 0, "interval must be greater than zero");
    ensure!(cmd.timeout_secs > 0, "timeout must be greater than zero");

    let gauge = Arc::new(Gauge::new());
    let deadline = Duration::from_secs(cmd.timeout_secs);
    let mut ticker = watch_ticker(Duration::from_secs(cmd.interval_secs));
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to wait for ctrl-c")?;
                info!("Received shutdown signal, stopping");
                break;
            }
            _ = ticker.tick() => {
                let filter = with_expiry(filter.clone(), cmd.filter.exclude_expired);
                match take_snapshot(config.clone(), filter, gauge.clone(), deadline).await {
                    Ok(Some(snapshot)) => {
                        print_snapshot(&snapshot, cmd.format)?;
                        info!(
                            "{} entries, conntrack entries gauge: {}",
                            snapshot.entries.len(),
                            gauge.conntrack_entries()
                        );
                    }
                    Ok(None) => warn!(
                        "conntrack maps unavailable: {} not found",
                        config.map_dir().display()
                    ),
                    Err(err) => error!("{err:?}"),
                }
            }
        }
    }

    Ok(0)
}

/// Ticks are skipped, not replayed, while a slow snapshot holds up the loop.
fn watch_ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    ticker
}

fn with_expiry(filter: EntryFilter, exclude_expired: bool) -> EntryFilter {
    if exclude_expired {
        filter.excluding_expired_at(Utc::now())
    } else {
        filter
    }
}

/// Resolves the map set and reads it on the blocking pool, bounded by `deadline`.
///
/// `Ok(None)` means the host exposes no conntrack maps.
async fn take_snapshot(
    config: MapSetConfig,
    filter: EntryFilter,
    gauge: Arc<Gauge>,
    deadline: Duration,
) -> Result<Option<Snapshot>> {
    let task = task::spawn_blocking(move || {
        let Some(map_set) = maps::resolve(&config) else {
            return Ok(None);
        };
        list_entries(&map_set, |entry| filter.matches(entry), SystemClock, gauge).map(Some)
    });

    let joined = time::timeout(deadline, task)
        .await
        .map_err(|_| anyhow!("snapshot did not finish within {deadline:?}"))?;
    let snapshot = joined
        .map_err(|err| anyhow!("snapshot task panicked: {err}"))?
        .context("conntrack snapshot failed")?;
    Ok(snapshot)
}

fn print_snapshot(snapshot: &Snapshot, format: OutputFormat) -> Result<()> {
    for entry in &snapshot.entries {
        match format {
            OutputFormat::Text => println!("{entry}"),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string(entry).context("failed to encode entry")?
            ),
        }
    }
    Ok(())
}
