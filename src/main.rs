use anyhow::{Context, Result};
use clap::Parser;
use sniffer::backends::socket_mapper::detect_socket_mappers;
use sniffer::{AddressResolver, Options, Sniffer, Stat};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// Format bytes as human-readable string (e.g., "1.5 MB", "500 KB")
fn human_readable(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes >= GB {
        format!("{:.1} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes / KB)
    } else {
        format!("{:.0} B", bytes)
    }
}

/// sniffer - see which processes are using the network
#[derive(Parser, Debug)]
#[command(name = "sniffer")]
#[command(version)]
#[command(about = "Per-process network bandwidth monitor", long_about = None)]
struct Args {
    /// JSON options file; command line flags override its values
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the effective options to PATH and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    /// Capture filter expression (e.g. "tcp port 443")
    #[arg(short, long, value_name = "EXPR")]
    filter: Option<String>,

    /// Refresh interval in seconds
    #[arg(short, long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Interface name prefix to monitor (repeatable)
    #[arg(short, long = "device", value_name = "PREFIX")]
    devices: Vec<String>,

    /// Only attribute sockets of this PID (repeatable)
    #[arg(short, long = "pid", value_name = "PID")]
    pids: Vec<i32>,

    /// Don't resolve remote addresses
    #[arg(long)]
    no_dns: bool,

    /// Open interfaces in promiscuous mode
    #[arg(long)]
    promiscuous: bool,

    /// Socket mapper backend to use
    #[arg(long, value_name = "BACKEND")]
    socket_mapper: Option<String>,

    /// Group output by process instead of by connection
    #[arg(long)]
    processes: bool,

    /// Rows to print per tick
    #[arg(short = 'n', long, default_value_t = 10)]
    top: usize,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,
}

impl Args {
    fn options(&self) -> Result<Options> {
        let mut options = match &self.config {
            Some(path) => Options::load(path)?,
            None => Options::default(),
        };

        if let Some(filter) = &self.filter {
            options.bpf_filter = filter.clone();
        }
        if let Some(interval) = self.interval {
            options.interval_secs = interval;
        }
        if !self.devices.is_empty() {
            options.devices_prefix = self.devices.clone();
        }
        if !self.pids.is_empty() {
            options.pids = self.pids.clone();
        }
        if self.no_dns {
            options.disable_dns_resolve = true;
        }
        if self.promiscuous {
            options.promiscuous = true;
        }
        if self.socket_mapper.is_some() {
            options.socket_mapper = self.socket_mapper.clone();
        }

        options.validate()?;
        Ok(options)
    }
}

fn print_available_backends() {
    println!("sniffer v{} - Available Backends\n", env!("CARGO_PKG_VERSION"));

    println!("Socket Mappers:");
    let mappers = detect_socket_mappers();
    if mappers.is_empty() {
        println!("  (none compiled in)");
    } else {
        for mapper in mappers {
            let status = if mapper.available {
                "available"
            } else {
                "unavailable"
            };
            println!(
                "  {:20} [priority: {:?}] {}",
                mapper.name, mapper.priority, status
            );
        }
    }
}

fn print_connections(stat: &Stat, sniffer: &Sniffer, resolver: &AddressResolver, top: usize) {
    let mut connections: Vec<_> = stat.connections.iter().collect();
    connections.sort_by(|a, b| b.counters.total_bytes().cmp(&a.counters.total_bytes()));

    for conn in connections.into_iter().take(top) {
        let rate = sniffer.aggregator().connection_rate(&conn.key);
        let remote = resolver.lookup(conn.key.remote_addr);
        println!(
            "  {:>7} {:<16} {:<5} {:>6} -> {}:{}  up {:>10}/s  down {:>10}/s",
            conn.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            conn.process_name,
            conn.key.protocol,
            conn.key.local_port,
            remote.display(conn.key.remote_addr),
            conn.key.remote_port,
            human_readable(rate.sent_per_sec),
            human_readable(rate.received_per_sec),
        );
    }
}

fn print_processes(stat: &Stat, sniffer: &Sniffer, top: usize) {
    for usage in stat.by_process().into_iter().take(top) {
        let rate = sniffer.aggregator().process_rate(usage.pid);
        println!(
            "  {:>7} {:<16} {:>4} conns  up {:>10}/s  down {:>10}/s",
            usage.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            usage.process_name,
            usage.connections,
            human_readable(rate.sent_per_sec),
            human_readable(rate.received_per_sec),
        );
    }
}

fn print_stat(stat: &Stat, sniffer: &Sniffer, args: &Args) {
    let total = sniffer.aggregator().total_rate();
    println!(
        "[{}] total up {}/s down {}/s, {} connections, {} open sockets",
        stat.utilization.drained_at.format("%H:%M:%S"),
        human_readable(total.sent_per_sec),
        human_readable(total.received_per_sec),
        stat.connections.len(),
        stat.open_sockets.len()
    );

    if args.processes {
        print_processes(stat, sniffer, args.top);
    } else {
        print_connections(stat, sniffer, sniffer.resolver(), args.top);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let options = args.options()?;
    if let Some(path) = &args.save_config {
        options.save(path)?;
        println!("Saved options to {}", path.display());
        return Ok(());
    }

    let sniffer = Arc::new(Sniffer::new(options).context("Failed to start sniffer")?);
    println!(
        "Monitoring {} (socket mapper: {}, filter: {:?}). Press Ctrl+C to stop.\n",
        sniffer.interfaces().join(", "),
        sniffer.socket_mapper_name(),
        sniffer.options().bpf_filter
    );

    let mut stats = Arc::clone(&sniffer).spawn();
    loop {
        tokio::select! {
            stat = stats.recv() => match stat {
                Some(stat) => print_stat(&stat, &sniffer, &args),
                None => break,
            },
            _ = signal::ctrl_c() => {
                println!("\nReceived Ctrl+C, shutting down...");
                break;
            }
        }
    }

    // Capture threads block on reads, so close off the async runtime
    let closing = Arc::clone(&sniffer);
    tokio::task::spawn_blocking(move || closing.close()).await?;
    Ok(())
}
