/*
 * Apollo Port Probe
 *
 * Scans the system's serial ports for a Dolphin Apollo synthesizer by
 * sending an index-counter query and checking the response shape. Safe to
 * point at unknown ports: the query is a read-only command and junk on a
 * non-Apollo device is simply ignored.
 *
 * Do not run this while a driver instance is using the port; on most
 * platforms the open will fail with a busy error, on some it will steal
 * bytes from the active session.
 *
 * Usage:
 *   apollo-probe            scan every enumerated port
 *   apollo-probe /dev/ttyS0 probe one specific port
 */

use std::env;
use std::time::Duration;

use anyhow::bail;
use log::info;

use apollo_synth::connection::detect_index_commands;
use apollo_synth::settings::DEFAULT_BAUD_RATE;
use apollo_synth::transport::SerialOpener;
use apollo_synth::PortOpener;

const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opener = SerialOpener;
    let ports: Vec<String> = match env::args().nth(1) {
        Some(port) => vec![port],
        None => opener.available_ports(),
    };

    if ports.is_empty() {
        bail!("No serial ports found.");
    }

    let mut found = false;
    for port in &ports {
        info!("Probing {port} at {DEFAULT_BAUD_RATE} baud...");
        match opener.open(port, DEFAULT_BAUD_RATE, OPEN_TIMEOUT) {
            Ok(mut transport) => match detect_index_commands(transport.as_mut()) {
                Some(commands) => {
                    println!(
                        "{port}: Apollo detected ({} indexing)",
                        String::from_utf8_lossy(commands.query)
                    );
                    found = true;
                }
                None => println!("{port}: no response"),
            },
            Err(err) => println!("{port}: could not open ({err})"),
        }
    }

    if !found {
        bail!("No Apollo found on {} port(s).", ports.len());
    }
    Ok(())
}
