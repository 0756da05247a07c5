//! Improv Wi-Fi Serial provisioning tool
//!
//! Detects an Improv device on a serial port, prints its info and visible
//! networks, and optionally sends Wi-Fi credentials.
//!
//! Usage:
//!   cargo run --example provision --features serial -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: /dev/ttyUSB0)
//!   --baud RATE       Baud rate (default: 115200)
//!   --timeout MS      Detection timeout in ms (default: 1000)
//!   --ssid SSID       Network to join; skips provisioning when absent
//!   --password PASS   Network password (default: empty)
//!   --legacy          Use the payload-only checksum of older firmware
//!   --no-scan         Do not list networks
//!
//! Set RUST_LOG=improv_core=debug to see every frame.

use anyhow::{Context, Result};
use improv_core::protocol::{
    serial::open_port, ChecksumScheme, Connection, ConnectionConfig, DEFAULT_BAUD_RATE,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("improv_core=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name = "/dev/ttyUSB0".to_string();
    let mut baud_rate = DEFAULT_BAUD_RATE;
    let mut timeout_ms = 1000u64;
    let mut ssid: Option<String> = None;
    let mut password = String::new();
    let mut legacy = false;
    let mut scan = true;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_name = args[i].clone();
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    baud_rate = args[i].parse().unwrap_or(DEFAULT_BAUD_RATE);
                }
            }
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    timeout_ms = args[i].parse().unwrap_or(1000);
                }
            }
            "--ssid" => {
                i += 1;
                if i < args.len() {
                    ssid = Some(args[i].clone());
                }
            }
            "--password" => {
                i += 1;
                if i < args.len() {
                    password = args[i].clone();
                }
            }
            "--legacy" => legacy = true,
            "--no-scan" => scan = false,
            "--help" | "-h" => {
                println!("Usage: provision [--port PORT] [--baud RATE] [--timeout MS] [--ssid SSID] [--password PASS] [--legacy] [--no-scan]");
                return Ok(());
            }
            other if !other.starts_with('-') => port_name = other.to_string(),
            other => eprintln!("Ignoring unknown option {other}"),
        }
        i += 1;
    }

    let transport = open_port(&port_name, Some(baud_rate))
        .with_context(|| format!("failed to open {port_name}"))?;

    let config = ConnectionConfig {
        handshake_timeout_ms: timeout_ms,
        checksum: if legacy {
            ChecksumScheme::Payload
        } else {
            ChecksumScheme::Frame
        },
        label: port_name.clone(),
        ..ConnectionConfig::default()
    };
    let mut session = Connection::new(transport, config);

    let info = session
        .initialize(None)
        .await
        .context("device did not answer")?;
    println!("Firmware : {} {}", info.firmware, info.version);
    println!("Chip     : {}", info.chip_family);
    println!("Name     : {}", info.name);
    if let Some(state) = session.device_state() {
        println!("State    : {state}");
    }
    if let Some(url) = session.next_url() {
        println!("URL      : {url}");
    }

    if scan {
        match session.scan().await {
            Ok(networks) => {
                println!("\n{} networks:", networks.len());
                for network in networks {
                    let lock = if network.secured { "locked" } else { "open" };
                    println!("  {:>4} dBm  {:<6}  {}", network.rssi, lock, network.name);
                }
            }
            Err(err) => println!("\nScan unavailable ({err}); enter the SSID manually"),
        }
    }

    if let Some(ssid) = ssid {
        println!("\nProvisioning {ssid}...");
        let url = session
            .provision(&ssid, &password, Some(Duration::from_secs(30)))
            .await
            .context("provisioning failed")?;
        match url {
            Some(url) => println!("Provisioned, continue at {url}"),
            None => println!("Provisioned"),
        }
    }

    session.close().await;
    Ok(())
}
