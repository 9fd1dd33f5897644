//! Async Unix socket client for the trainer-io driver process.
//!
//! Connects to the Unix domain socket, sends JSON commands, and receives
//! JSON event lines. Maintains shared state with current power, cadence,
//! heart rate, and the physical shifter position.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

use crate::gears::{Gears, Trainer};
use crate::protocol;

/// Shared bike state, updated continuously by the socket reader.
#[derive(Debug, Clone, Default)]
pub struct BikeState {
    /// Rider power in watts.
    pub power_watts: i16,
    /// Cadence in rpm.
    pub cadence_rpm: u16,
    /// Heart rate in BPM. 0 when no monitor is paired.
    pub heart_rate_bpm: u8,
    /// Raw shifter position counter from the handlebar hardware.
    pub shifter_position: i32,
    /// Whether we have an active connection to trainer-io.
    pub connected: bool,
}

impl BikeState {
    /// Encode current state as FTMS Indoor Bike Data (0x2AD2) bytes.
    /// Speed is derived from power since the trainer has no speed sensor.
    pub fn encode_indoor_bike_data(&self) -> Vec<u8> {
        let speed = protocol::speed_kmh_hundredths_from_power(self.power_watts);
        let heart_rate = (self.heart_rate_bpm > 0).then_some(self.heart_rate_bpm);
        protocol::encode_indoor_bike_data(speed, self.cadence_rpm, 0, self.power_watts, heart_rate)
    }
}

/// Incline sink that forwards to trainer-io. Commands are fire-and-forget
/// one-shot connections so the caller never blocks on socket I/O.
pub struct TrainerIo {
    socket_path: String,
}

impl TrainerIo {
    pub fn new(socket_path: String) -> Self {
        TrainerIo { socket_path }
    }
}

impl Trainer for TrainerIo {
    fn set_target_incline(&self, bp: i32) {
        let path = self.socket_path.clone();
        tokio::spawn(async move {
            if let Err(e) = send_incline(&path, bp).await {
                error!("Failed to send incline {} bp: {}", bp, e);
            }
        });
    }
}

/// Run the trainer socket client. Connects, reads state, auto-reconnects.
/// Updates shared state continuously. Runs until cancelled.
pub async fn run(
    state: Arc<Mutex<BikeState>>,
    socket_path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut backoff = Duration::from_secs(1);

    loop {
        match connect_and_run(&state, socket_path).await {
            Ok(()) => {
                info!("Trainer connection closed cleanly");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                warn!("Trainer connection error: {}", e);
            }
        }

        {
            let mut s = state.lock().await;
            s.connected = false;
        }

        info!("Reconnecting to trainer-io in {:?}...", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

/// Connect to the socket and run the read/heartbeat loop until disconnection.
async fn connect_and_run(
    state: &Arc<Mutex<BikeState>>,
    socket_path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{\"cmd\":\"status\"}\n").await?;
    info!("Connected to trainer-io at {}", socket_path);

    {
        let mut s = state.lock().await;
        s.connected = true;
    }

    let mut heartbeat = interval(Duration::from_secs(1));
    // The status request above counts as the first heartbeat; swallow the
    // interval's immediate tick so we don't send two back to back
    heartbeat.tick().await;

    loop {
        tokio::select! {
            line_result = lines.next_line() => {
                match line_result {
                    Ok(Some(line)) => handle_line(state, &line).await,
                    Ok(None) => {
                        info!("Trainer socket EOF");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = writer.write_all(b"{\"cmd\":\"heartbeat\"}\n").await {
                    return Err(e.into());
                }
            }
        }
    }
}

async fn handle_line(state: &Arc<Mutex<BikeState>>, line: &str) {
    let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
        debug!("Unparseable trainer-io line: {}", line);
        return;
    };
    let msg_type = msg.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "status" => {
            let power = msg.get("power").and_then(|v| v.as_i64()).unwrap_or(0) as i16;
            let cadence = msg.get("cadence").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
            let heart_rate = msg.get("heart_rate").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
            let shifter = msg
                .get("shifter")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;

            let mut s = state.lock().await;
            s.power_watts = power;
            s.cadence_rpm = cadence;
            s.heart_rate_bpm = heart_rate;
            s.shifter_position = shifter;

            debug!(
                "Status: power={}W cadence={}rpm shifter={}",
                power, cadence, shifter
            );
        }
        _ => {
            debug!("Unknown trainer-io message type: {}", msg_type);
        }
    }
}

/// Poll the shifter position out of the shared state and feed the gear
/// controller. Runs until cancelled.
pub async fn run_shifter_poll(
    state: Arc<Mutex<BikeState>>,
    gears: Arc<Gears>,
    poll_interval: Duration,
) {
    let mut ticker = interval(poll_interval);
    loop {
        ticker.tick().await;
        let position = state.lock().await.shifter_position;
        gears.poll_shifter(position);
    }
}

/// Send an incline command to trainer-io, signed 0.01% units.
/// Opens a short-lived connection, sends the command, and closes.
pub async fn send_incline(
    socket_path: &str,
    bp: i32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cmd = format!("{{\"cmd\":\"incline\",\"value\":{}}}\n", bp);
    send_oneshot(socket_path, &cmd).await
}

/// Open a short-lived connection, send one command line, then close.
async fn send_oneshot(
    socket_path: &str,
    cmd: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        error!("Failed to connect to trainer-io at {}: {}", socket_path, e);
        e
    })?;
    stream.write_all(cmd.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_indoor_bike_data_idle() {
        let state = BikeState::default();
        let data = state.encode_indoor_bike_data();
        assert_eq!(data.len(), 10); // no heart rate byte
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 0); // speed
    }

    #[test]
    fn test_encode_indoor_bike_data_riding() {
        let state = BikeState {
            power_watts: 250,
            cadence_rpm: 92,
            heart_rate_bpm: 148,
            shifter_position: 3,
            connected: true,
        };
        let data = state.encode_indoor_bike_data();
        assert_eq!(data.len(), 11);
        assert_eq!(u16::from_le_bytes([data[4], data[5]]), 184); // 0.5 rpm units
        assert_eq!(i16::from_le_bytes([data[8], data[9]]), 250);
        assert_eq!(data[10], 148);
        // Power-derived speed is plausible for 250 W
        let speed = u16::from_le_bytes([data[2], data[3]]);
        assert!(speed > 1500 && speed < 2800, "speed {speed}");
    }

    #[tokio::test]
    async fn test_handle_status_line() {
        let state = Arc::new(Mutex::new(BikeState::default()));
        handle_line(
            &state,
            r#"{"type":"status","power":210,"cadence":88,"heart_rate":140,"shifter":5}"#,
        )
        .await;
        let s = state.lock().await;
        assert_eq!(s.power_watts, 210);
        assert_eq!(s.cadence_rpm, 88);
        assert_eq!(s.heart_rate_bpm, 140);
        assert_eq!(s.shifter_position, 5);
    }

    #[tokio::test]
    async fn test_handle_garbage_lines() {
        let state = Arc::new(Mutex::new(BikeState::default()));
        handle_line(&state, "not json").await;
        handle_line(&state, r#"{"type":"kv","hmph":35}"#).await;
        handle_line(&state, "{}").await;
        let s = state.lock().await;
        assert_eq!(s.power_watts, 0);
        assert_eq!(s.shifter_position, 0);
    }

    #[tokio::test]
    async fn test_status_with_negative_shifter() {
        let state = Arc::new(Mutex::new(BikeState::default()));
        handle_line(&state, r#"{"type":"status","shifter":-3}"#).await;
        assert_eq!(state.lock().await.shifter_position, -3);
    }
}
