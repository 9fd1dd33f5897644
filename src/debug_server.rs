//! TCP debug console for exercising the bridge without Zwift or BLE
//! hardware.
//!
//! Listens on a TCP port (default 8828) and accepts line-based text commands
//! with hex-encoded binary payloads, driving the same mirror and gear
//! controller the real transports use.
//!
//! Usage from dev machine:
//!   nc bridge-host 8828
//!
//! Commands:
//!   state           human-readable bike + drivetrain state
//!   services        list registered GATT services
//!   gear            current gear and ratio
//!   shift u|d       shift up / down
//!   grade <bp>      set the base gradient (0.01% units)
//!   cp <hex>        write to the FTMS control point, show response hex
//!   sub             subscribe to 1 Hz indoor bike data (hex lines)
//!   help            list commands
//!   quit            disconnect

use std::sync::Arc;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::ftms::FtmsService;
use crate::gears::Gears;
use crate::mirror::GattMirror;
use crate::trainer::BikeState;

/// Run the TCP debug console.
pub async fn run(
    mirror: Arc<GattMirror>,
    gears: Arc<Gears>,
    ftms: Arc<FtmsService>,
    state: Arc<Mutex<BikeState>>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug console listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Debug client connected from {}", addr);

        let mirror = mirror.clone();
        let gears = gears.clone();
        let ftms = ftms.clone();
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, mirror, gears, ftms, state).await {
                info!("Debug client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    mirror: Arc<GattMirror>,
    gears: Arc<Gears>,
    ftms: Arc<FtmsService>,
    state: Arc<Mutex<BikeState>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"kickr-debug> connected. type 'help' for commands.\n")
        .await?;

    loop {
        writer.write_all(b"kickr-debug> ").await?;

        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_lowercase();
                if line.is_empty() {
                    continue;
                }

                let response = match line.split_once(' ') {
                    Some(("cp", hex)) => handle_cp(hex.trim(), &ftms),
                    Some(("grade", bp)) => handle_grade(bp.trim(), &gears),
                    Some(("shift", dir)) => handle_shift(dir.trim(), &gears),
                    _ => match line.as_str() {
                        "help" => HELP_TEXT.to_string(),
                        "state" => handle_state(&gears, &state).await,
                        "gear" => handle_gear(&gears),
                        "services" => handle_services(&mirror),
                        "sub" => {
                            handle_subscribe(&state, &mut writer).await?;
                            continue; // subscribe handles its own output
                        }
                        "quit" | "exit" => return Ok(()),
                        _ => format!("unknown command: '{}'. type 'help'.", line),
                    },
                };

                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            None => return Ok(()), // EOF
        }
    }
}

async fn handle_state(gears: &Arc<Gears>, state: &Arc<Mutex<BikeState>>) -> String {
    let snap = gears.snapshot();
    let s = state.lock().await.clone();
    format!(
        "gear:      {} of 24 (ratio {}.{:02})\n\
         base:      {:.2}%\n\
         effective: {:.2}%\n\
         control:   {}\n\
         power:     {} W  cadence: {} rpm  hr: {} bpm\n\
         shifter:   {}  trainer-io: {}",
        snap.gear,
        snap.ratio_hundredths / 100,
        snap.ratio_hundredths % 100,
        snap.base_gradient_bp as f64 / 100.0,
        snap.effective_gradient_bp as f64 / 100.0,
        if snap.enabled { "enabled" } else { "disabled" },
        s.power_watts,
        s.cadence_rpm,
        s.heart_rate_bpm,
        s.shifter_position,
        if s.connected { "connected" } else { "disconnected" },
    )
}

fn handle_gear(gears: &Arc<Gears>) -> String {
    let snap = gears.snapshot();
    format!(
        "gear {} ratio {}.{:02}",
        snap.gear,
        snap.ratio_hundredths / 100,
        snap.ratio_hundredths % 100
    )
}

fn handle_shift(direction: &str, gears: &Arc<Gears>) -> String {
    match direction {
        "u" | "up" => gears.shift_up(),
        "d" | "down" => gears.shift_down(),
        _ => return "usage: shift u|d".to_string(),
    }
    handle_gear(gears)
}

fn handle_grade(bp: &str, gears: &Arc<Gears>) -> String {
    match bp.parse::<i32>() {
        Ok(bp) => {
            gears.set_base_gradient(bp);
            let snap = gears.snapshot();
            format!(
                "base {:.2}% -> effective {:.2}%",
                snap.base_gradient_bp as f64 / 100.0,
                snap.effective_gradient_bp as f64 / 100.0
            )
        }
        Err(_) => "usage: grade <signed 0.01% units, e.g. 500 for 5.00%>".to_string(),
    }
}

fn handle_cp(hex: &str, ftms: &Arc<FtmsService>) -> String {
    match hex_decode(hex) {
        Ok(bytes) if bytes.is_empty() => "error: empty control point data".to_string(),
        Ok(bytes) => {
            let response = ftms.execute(&bytes);
            format!("resp {}", hex_encode(&response))
        }
        Err(e) => format!("error: {}", e),
    }
}

fn handle_services(mirror: &Arc<GattMirror>) -> String {
    let mut out = String::new();
    for service in mirror.services() {
        out.push_str(&format!("{}\n", service));
        for (uuid, props) in mirror.characteristics(&service).unwrap_or_default() {
            out.push_str(&format!("  {} props 0x{:02x}\n", uuid, props.bits()));
        }
    }
    out.pop();
    out
}

async fn handle_subscribe(
    state: &Arc<Mutex<BikeState>>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    writer
        .write_all(b"subscribed to indoor bike data at 1 Hz. ctrl-c to stop.\n")
        .await?;

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;

        let s = state.lock().await;
        let data = s.encode_indoor_bike_data();
        let line = format!(
            "data {} | {}W {}rpm\n",
            hex_encode(&data),
            s.power_watts,
            s.cadence_rpm,
        );
        drop(s);

        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }

    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let hex = hex.replace(' ', "");
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
        })
        .collect()
}

const HELP_TEXT: &str = "\
commands:
  state           show bike + drivetrain state (human-readable)
  services        list registered GATT services and characteristics
  gear            show current gear and ratio
  shift u|d       shift up / down
  grade <bp>      set base gradient in 0.01% units
  cp <hex>        write to FTMS control point (0x2AD9), show response
  sub             subscribe to 1 Hz indoor bike data stream
  help            this message
  quit            disconnect

control point examples:
  cp 00                request control
  cp 03 1e00           set target inclination 3.0% (30 = 0x001e LE)
  cp 11 0000 f401 2132 sim params: grade 5.00% (500 = 0x01f4 LE)
  cp 07                start or resume
  cp 08 01             stop

all values are little-endian hex, matching raw GATT writes.";
