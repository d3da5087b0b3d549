//! Load test tool for the GCA ingest path. Generates properly
//! Ed25519-signed `EquipmentReport` datagrams for a pool of synthetic
//! devices and fires them at the server's UDP port at a configurable
//! rate, the way the backend's own load generator drives its HTTP
//! ingest endpoint.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use gca_core::keys::KeyPair;
use gca_core::timeslot::Timeslot;
use gca_core::wire::report::EquipmentReport;
use rand::Rng;

#[derive(Parser)]
#[command(name = "gca-loadtest")]
#[command(about = "Load test tool for the GCA ingest server")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server HTTP port, used only for the startup health check
    #[arg(long, default_value_t = 35000)]
    http_port: u16,

    /// Server UDP ingest port
    #[arg(long, default_value_t = 35030)]
    udp_port: u16,

    /// Reports per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct synthetic devices (each gets its own keypair
    /// and ShortID, starting at `short_id_start`)
    #[arg(long, default_value_t = 10)]
    devices: usize,

    /// First ShortID handed to the synthetic device pool. None of these
    /// devices are registered with the server's authorization store, so
    /// every report is expected to be dropped as unknown equipment --
    /// this tool measures ingest-path throughput, not acceptance.
    #[arg(long, default_value_t = 1)]
    short_id_start: u32,
}

struct Counters {
    sent: AtomicU64,
    send_error: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Counters {
            sent: AtomicU64::new(0),
            send_error: AtomicU64::new(0),
        }
    }
}

fn main() {
    let args = Args::parse();

    println!("=== GCA Ingest Load Test ===");
    println!("Target:   {}:{} (udp)", args.host, args.udp_port);
    println!("Rate:     {} reports/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Devices:  {}", args.devices);
    println!();

    let devices: Vec<(u32, KeyPair)> = (0..args.devices)
        .map(|i| (args.short_id_start + i as u32, KeyPair::generate()))
        .collect();
    println!("Generated {} device keypairs", devices.len());

    let health_url = format!("http://{}:{}/api/v1/equipment", args.host, args.http_port);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {}", e);
            std::process::exit(1);
        }
    }

    let socket = UdpSocket::bind(("0.0.0.0", 0)).expect("failed to bind local udp socket");
    let target = (args.host.as_str(), args.udp_port);

    let counters = Arc::new(Counters::new());
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("\nSending...\n");
    let start = Instant::now();

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;
    let base_slot = gca_core::timeslot::now();

    while Instant::now() < deadline {
        let (short_id, key) = &devices[(tick as usize) % devices.len()];
        let slot = Timeslot(base_slot.0.wrapping_add((tick % 4032) as u32));
        let power_output = rng.gen_range(2..50_000u64);
        let report = EquipmentReport::new_signed(*short_id, slot.0, power_output, key);

        counters.sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = socket.send_to(&report.to_bytes(), target) {
            counters.send_error.fetch_add(1, Ordering::Relaxed);
            if tick < 5 {
                eprintln!("send failed: {e}");
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} errors={} ({:.0} pkt/s)",
                elapsed,
                sent,
                counters.send_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target_elapsed = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual_elapsed = start.elapsed();
        if actual_elapsed < target_elapsed {
            std::thread::sleep(target_elapsed - actual_elapsed);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {}", sent);
    println!("Send errors:  {}", counters.send_error.load(Ordering::Relaxed));
    println!("Throughput:   {:.1} pkt/s", sent as f64 / elapsed.as_secs_f64());
}
