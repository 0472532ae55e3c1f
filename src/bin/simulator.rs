//! mixnode simulator
//!
//! Runs a whole overlay in one process, one thread per node, then pings every
//! node from the first one and reports election, convergence and round trips.

use mixnode::events::{init_file_logging, init_logging};
use mixnode::fabric::FaultInjector;
use mixnode::packet::PingKind;
use mixnode::sim::{SimulationSettings, ThreadedSimulation, TopologySpec};
use mixnode::{Address, Packet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for the simulation run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub topology: String,
    pub topology_file: Option<PathBuf>,
    pub num_nodes: usize,
    pub seed: u64,
    pub duration_ms: u64,
    pub drop_rate: f64,
    pub kill_root: bool,
    pub json: bool,
    pub log_dir: Option<String>,
    pub settings: SimulationSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            topology: "ring".to_string(),
            topology_file: None,
            num_nodes: 8,
            seed: 42,
            duration_ms: 2000,
            drop_rate: 0.0,
            kill_root: false,
            json: false,
            log_dir: None,
            settings: SimulationSettings::default(),
        }
    }
}

fn build_topology(config: &RunConfig) -> Result<TopologySpec, Box<dyn std::error::Error>> {
    if let Some(path) = &config.topology_file {
        return Ok(TopologySpec::load(path)?);
    }
    let n = config.num_nodes.max(1);
    let spec = match config.topology.as_str() {
        "line" => TopologySpec::line(n),
        "star" => TopologySpec::star(n),
        "grid" => {
            let side = (n as f64).sqrt().ceil() as usize;
            TopologySpec::grid(side, side)
        }
        "random" | "er" => TopologySpec::random(n, 3.0 / n as f64, config.seed),
        _ => TopologySpec::ring(n),
    };
    Ok(spec)
}

/// Ping every target from `source` and wait for the replies
fn ping_all(
    sim: &ThreadedSimulation,
    source: Address,
    targets: &[Address],
    wait: Duration,
) -> usize {
    let Some(user) = sim.user(source) else {
        return 0;
    };
    for &target in targets {
        if let Err(e) = user.send(Packet::new_ping(target)) {
            eprintln!("failed to send ping to {}: {}", target, e);
        }
    }

    let deadline = Instant::now() + wait;
    let mut replies = 0;
    while replies < targets.len() && Instant::now() < deadline {
        if let Ok(Some(Packet::Ping { ping, .. })) = user.receive_timeout(Duration::from_millis(10)) {
            if ping.kind == PingKind::Reply {
                replies += 1;
            }
        }
    }
    replies
}

fn print_usage() {
    println!("Usage: simulator [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -t, --topology TYPE     Topology: line, ring, star, grid, random (default: ring)");
    println!("  -f, --topology-file F   Load the topology from a JSON file");
    println!("  -n, --nodes NUM         Number of nodes (default: 8)");
    println!("      --seed NUM          Random seed (default: 42)");
    println!("  -d, --duration MS       Time to wait for ping replies (default: 2000)");
    println!("  -m, --mixing NUM        Mixing factor (default: 1)");
    println!("  -r, --random-routing    Enable random detours");
    println!("      --hello MS          Root heartbeat interval (default: 100)");
    println!("      --reelection MS     Reelection timeout (default: 500)");
    println!("      --lsa-refresh MS    Link-state re-advertisement interval (default: off,");
    println!("                          reelection interval with --kill-root)");
    println!("      --drop-rate P       Link packet loss probability (default: 0)");
    println!("      --kill-root         Crash the elected root before pinging");
    println!("      --json              Print the report as JSON");
    println!("      --log-dir DIR       Write JSON logs to DIR instead of stdout");
    println!("  -h, --help              Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RunConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--topology" | "-t" => {
                if let Some(v) = value {
                    config.topology = v.clone();
                    i += 1;
                }
            }
            "--topology-file" | "-f" => {
                if let Some(v) = value {
                    config.topology_file = Some(PathBuf::from(v));
                    i += 1;
                }
            }
            "--nodes" | "-n" => {
                if let Some(v) = value {
                    config.num_nodes = v.parse().unwrap_or(8);
                    i += 1;
                }
            }
            "--seed" => {
                if let Some(v) = value {
                    config.seed = v.parse().unwrap_or(42);
                    i += 1;
                }
            }
            "--duration" | "-d" => {
                if let Some(v) = value {
                    config.duration_ms = v.parse().unwrap_or(2000);
                    i += 1;
                }
            }
            "--mixing" | "-m" => {
                if let Some(v) = value {
                    config.settings.mixing_factor = v.parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--hello" => {
                if let Some(v) = value {
                    config.settings.hello_interval_ms = v.parse().unwrap_or(100);
                    i += 1;
                }
            }
            "--reelection" => {
                if let Some(v) = value {
                    config.settings.reelection_interval_ms = v.parse().unwrap_or(500);
                    i += 1;
                }
            }
            "--lsa-refresh" => {
                if let Some(v) = value {
                    config.settings.link_state_refresh_ms = v.parse().ok();
                    i += 1;
                }
            }
            "--drop-rate" => {
                if let Some(v) = value {
                    config.drop_rate = v.parse().unwrap_or(0.0);
                    i += 1;
                }
            }
            "--log-dir" => {
                if let Some(v) = value {
                    config.log_dir = Some(v.clone());
                    i += 1;
                }
            }
            "--random-routing" | "-r" => config.settings.random_routing = true,
            "--kill-root" => config.kill_root = true,
            "--json" => config.json = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => eprintln!("ignoring unknown argument {}", other),
        }
        i += 1;
    }
    config.settings.seed = config.seed;
    if config.kill_root && config.settings.link_state_refresh_ms.is_none() {
        // survivors must re-advertise for routes around the dead root
        config.settings.link_state_refresh_ms = Some(config.settings.reelection_interval_ms);
    }

    let _guard = match &config.log_dir {
        Some(dir) => Some(init_file_logging(dir, 7)?),
        None => {
            if !config.json {
                init_logging(false);
            }
            None
        }
    };

    let spec = build_topology(&config)?;
    spec.validate()?;

    if !config.json {
        println!("mixnode simulator");
        println!("=================\n");
        println!("Configuration:");
        println!("  Topology:  {}", config.topology_file.as_ref().map_or(config.topology.clone(), |p| p.display().to_string()));
        println!("  Nodes:     {}", spec.nodes.len());
        println!("  Links:     {}", spec.links.len());
        println!("  Mixing:    {}", config.settings.mixing_factor);
        println!("  Random:    {}", if config.settings.random_routing { "yes" } else { "no" });
        println!("  Drop rate: {}", config.drop_rate);
        match config.settings.link_state_refresh_ms {
            Some(ms) => println!("  LSA refresh: {} ms", ms),
            None => println!("  LSA refresh: off"),
        }
        println!("  Seed:      {}", config.seed);
        println!();
    }

    let faults = Arc::new(FaultInjector::with_drop_rate(config.drop_rate, config.seed));
    let sim = ThreadedSimulation::start(&spec, &config.settings, Arc::clone(&faults))?;
    std::thread::sleep(config.settings.settle_time());

    let mut live: Vec<Address> = spec.nodes.clone();
    live.sort();
    if config.kill_root {
        if let Some(root) = live.first().copied() {
            sim.kill(root);
            live.remove(0);
            if !config.json {
                println!("Killed root {}, waiting for reelection...", root);
            }
            std::thread::sleep(config.settings.recovery_time());
        }
    }

    let replies = match live.split_first() {
        Some((&source, targets)) => {
            let replies = ping_all(&sim, source, targets, Duration::from_millis(config.duration_ms));
            if !config.json {
                println!("Ping replies at {}: {}/{}", source, replies, targets.len());
                println!();
            }
            replies
        }
        None => 0,
    };

    let report = sim.finish_report()?;
    if config.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
        let stats = faults.stats();
        println!();
        println!("Fault injection: {} dropped, {} blackholed", stats.packets_dropped, stats.packets_blackholed);
        println!("Replies received: {}", replies);
    }
    Ok(())
}
