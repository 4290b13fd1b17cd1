//! Skylink CLI - vehicle communication links for ground stations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::broadcast;

use skylink::cli::{format_bytes, Cli, Commands, ConfigArgs, MonitorArgs, OutputFormat};
use skylink::config::{init_logging, Config, LoggingConfig};
use skylink::error::Result;
use skylink::link::{ConnectOutcome, Link, LinkEvent};
use skylink::manager::{FrameSink, LinkManager, ManagerEvent, RoutedFrame};
use skylink::types::{LinkId, VehicleId};
use skylink::VERSION;

const DEFAULT_CONFIG_FILE: &str = "skylink.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
        Config::load(DEFAULT_CONFIG_FILE)?
    } else {
        Config::default()
    };

    // Command line level wins over the file
    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..config.logging.clone()
    };
    init_logging(&log_config)?;

    // Dispatch command
    match cli.command {
        Commands::Monitor(args) => run_monitor(args, config, cli.format).await,
        Commands::Links => run_links(&config, cli.format),
        Commands::Config(args) => run_config(args),
    }
}

/// Counts routed frames per (link, vehicle).
#[derive(Default)]
struct FrameCounter {
    total: AtomicU64,
    per_vehicle: Mutex<BTreeMap<(String, u8), u64>>,
    names: Mutex<HashMap<LinkId, String>>,
}

impl FrameCounter {
    fn name_link(&self, link: &Link) {
        self.names.lock().insert(link.id(), link.name().to_string());
    }
}

impl FrameSink for FrameCounter {
    fn on_frame(&self, frame: &RoutedFrame) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let name = self
            .names
            .lock()
            .get(&frame.link)
            .cloned()
            .unwrap_or_else(|| frame.link.to_string());
        *self
            .per_vehicle
            .lock()
            .entry((name, frame.frame.system_id))
            .or_insert(0) += 1;
    }
}

/// Connect the configured links and print their events until Ctrl-C.
async fn run_monitor(args: MonitorArgs, config: Config, format: OutputFormat) -> Result<()> {
    let json = format == OutputFormat::Json;
    if !json {
        println!("{}", "╔══════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║     SKYLINK MONITOR                      ║".bright_cyan());
        println!(
            "{}",
            format!("║     Version {VERSION:<29}║").bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════╝".bright_cyan());
        println!();
    }

    let manager = Arc::new(LinkManager::new(config.manager.clone()));
    manager.start()?;

    let counter = Arc::new(FrameCounter::default());
    manager.register_sink(Arc::clone(&counter) as Arc<dyn FrameSink>);
    let mut manager_events = manager.subscribe();

    let selected = config
        .links
        .into_iter()
        .filter(|link| args.links.is_empty() || args.links.contains(&link.name));

    for link_config in selected {
        let name = link_config.name.clone();
        match manager.create_link(link_config) {
            Ok(link) => {
                counter.name_link(&link);
                tokio::spawn(print_link_events(Arc::clone(&link), json));
            }
            Err(e) => eprintln!("{} {}: {}", "✗".red(), name, e),
        }
    }

    if manager.link_count() == 0 {
        eprintln!("{} No links configured", "✗".red());
        return Ok(());
    }

    for link in manager.links() {
        match link.connect().await {
            Ok(ConnectOutcome::Connected) => {}
            Ok(ConnectOutcome::AlreadyActive(state)) => {
                tracing::debug!(link = %link.name(), state = %state, "Link already active");
            }
            // Reported through the link's CommunicationError event
            Err(e) => tracing::debug!(link = %link.name(), error = %e, "Connect failed"),
        }
    }

    let stats_period = if args.stats_interval == 0 {
        None
    } else {
        Some(Duration::from_secs(args.stats_interval))
    };
    let mut stats_tick = tokio::time::interval(stats_period.unwrap_or(Duration::from_secs(3600)));
    stats_tick.tick().await;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,

            _ = stats_tick.tick(), if stats_period.is_some() => {
                print_stats(&manager, &counter, json);
            }

            event = manager_events.recv() => match event {
                Ok(ManagerEvent::Frame(frame)) => {
                    if !args.no_attach && !frame.auxiliary {
                        attach_new_vehicle(&manager, &frame);
                    }
                    if args.frames {
                        print_frame(&frame, json);
                    }
                }
                Ok(ManagerEvent::LinkRemoved(id)) => {
                    tracing::info!(id = %id, "Link removed");
                }
                Ok(ManagerEvent::LinkCreated(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Monitor lagged behind frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if !json {
        println!();
        println!("{} Shutting down...", "→".yellow());
    }
    print_stats(&manager, &counter, json);
    manager.shutdown().await;

    Ok(())
}

fn attach_new_vehicle(manager: &LinkManager, frame: &RoutedFrame) {
    let Some(link) = manager.link(frame.link) else {
        return;
    };
    let vehicle = VehicleId(frame.frame.system_id);
    if link.vehicles().contains(&vehicle) {
        return;
    }
    let references = link.attach_vehicle(vehicle);
    tracing::debug!(link = %link.name(), vehicle = %vehicle, references, "Attached new vehicle");
}

async fn print_link_events(link: Arc<Link>, json: bool) {
    let mut events = link.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            let value = match &event {
                LinkEvent::Connected => serde_json::json!({ "link": link.name(), "event": "connected", "channel": link.channel_or_unset().as_u8() }),
                LinkEvent::Disconnected => serde_json::json!({ "link": link.name(), "event": "disconnected" }),
                LinkEvent::CommunicationError { title, message } => serde_json::json!({ "link": link.name(), "event": "error", "title": title, "message": message }),
                LinkEvent::VehicleLinkLost(v) => serde_json::json!({ "link": link.name(), "event": "vehicle_lost", "vehicle": v.0 }),
                LinkEvent::VehicleLinkRegained(v) => serde_json::json!({ "link": link.name(), "event": "vehicle_regained", "vehicle": v.0 }),
                LinkEvent::TeardownRequested => serde_json::json!({ "link": link.name(), "event": "teardown_requested" }),
                LinkEvent::BytesReceived { .. } | LinkEvent::BytesSent { .. } => continue,
            };
            println!("{value}");
            continue;
        }

        match event {
            LinkEvent::Connected => println!(
                "{} {} connected on channel {}",
                "✓".green(),
                link.name().bright_white(),
                link.channel_or_unset()
            ),
            LinkEvent::Disconnected => {
                println!("{} {} disconnected", "○".yellow(), link.name().bright_white());
            }
            LinkEvent::CommunicationError { title, message } => println!(
                "{} {} {}: {}",
                "✗".red(),
                link.name().bright_white(),
                title.red(),
                message
            ),
            LinkEvent::VehicleLinkLost(vehicle) => println!(
                "{} {} lost vehicle {}",
                "!".red().bold(),
                link.name().bright_white(),
                vehicle
            ),
            LinkEvent::VehicleLinkRegained(vehicle) => println!(
                "{} {} regained vehicle {}",
                "✓".green(),
                link.name().bright_white(),
                vehicle
            ),
            LinkEvent::TeardownRequested => {
                println!("{} {} has no vehicles left", "→".yellow(), link.name().bright_white());
            }
            LinkEvent::BytesReceived { .. } | LinkEvent::BytesSent { .. } => {}
        }
    }
}

fn print_frame(frame: &RoutedFrame, json: bool) {
    if json {
        let value = serde_json::json!({
            "event": "frame",
            "link": frame.link.to_string(),
            "channel": frame.channel.as_u8(),
            "auxiliary": frame.auxiliary,
            "system_id": frame.frame.system_id,
            "component_id": frame.frame.component_id,
            "sequence": frame.frame.sequence,
            "message_id": frame.frame.message_id,
            "len": frame.frame.len(),
        });
        println!("{value}");
    } else {
        println!(
            "  {} ch {} sys {:>3} comp {:>3} seq {:>3} msg {:>5} ({} bytes)",
            "·".dimmed(),
            frame.channel,
            frame.frame.system_id,
            frame.frame.component_id,
            frame.frame.sequence,
            frame.frame.message_id,
            frame.frame.len()
        );
    }
}

fn print_stats(manager: &LinkManager, counter: &FrameCounter, json: bool) {
    if json {
        let links: Vec<_> = manager
            .links()
            .iter()
            .map(|link| {
                let stats = link.stats();
                serde_json::json!({
                    "link": link.name(),
                    "state": link.state().to_string(),
                    "bytes_received": stats.bytes_received,
                    "bytes_sent": stats.bytes_sent,
                    "frames": stats.frames_attributed,
                })
            })
            .collect();
        let value = serde_json::json!({
            "event": "stats",
            "frames": counter.total.load(Ordering::Relaxed),
            "links": links,
            "channels_free": manager.allocator().available(),
        });
        println!("{value}");
        return;
    }

    println!();
    println!("{}", "Links:".bright_white().bold());
    for link in manager.links() {
        let stats = link.stats();
        let state = link.state().to_string();
        let state = if link.is_connected() { state.green() } else { state.yellow() };
        println!(
            "  {:<20} {:<14} rx {:>10}  tx {:>10}  frames {}",
            link.name(),
            state,
            format_bytes(stats.bytes_received),
            format_bytes(stats.bytes_sent),
            stats.frames_attributed
        );
    }

    let per_vehicle = counter.per_vehicle.lock().clone();
    if !per_vehicle.is_empty() {
        println!("{}", "Vehicles:".bright_white().bold());
        for ((link, system_id), frames) in per_vehicle {
            println!("  {link:<20} sys {system_id:>3}  frames {frames}");
        }
    }
    println!(
        "  {} {}/{} channels free",
        "Pool:".bright_white(),
        manager.allocator().available(),
        manager.allocator().capacity()
    );
}

/// List configured links.
fn run_links(config: &Config, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        let text = serde_json::to_string_pretty(&config.links)
            .map_err(|e| skylink::Error::Internal(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    if config.links.is_empty() {
        println!("{} No links configured", "○".yellow());
        return Ok(());
    }

    println!("{}", "Configured links:".bright_white().bold());
    for link in &config.links {
        let mut flags = Vec::new();
        if link.persistent {
            flags.push("persistent");
        }
        if link.auxiliary {
            flags.push("auxiliary");
        }
        println!(
            "  {:<20} {:<32} {}",
            link.name.bright_white(),
            link.transport.to_string(),
            flags.join(", ").dimmed()
        );
    }
    Ok(())
}

/// Print or write the example configuration.
fn run_config(args: ConfigArgs) -> Result<()> {
    let output = Config::example().to_toml()?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}
