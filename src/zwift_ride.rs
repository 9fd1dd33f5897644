//! Zwift Ride service: RideOn handshake, Sync RX command dispatch, and the
//! post-handshake keep-alive stream.
//!
//! Writes arrive on Sync RX, synchronous responses and the handshake /
//! keep-alive go out on Sync TX, asynchronous events (gear status) on
//! Async TX.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::gears::Gears;
use crate::mirror::{CharacteristicSpec, GattMirror, Props, WriteHandler};
use crate::protocol::{
    ZWIFT_ASYNC_TX_UUID, ZWIFT_RIDE_SERVICE_UUID, ZWIFT_SYNC_RX_UUID, ZWIFT_SYNC_TX_UUID,
};

/// The 6-byte ASCII handshake initiator.
pub const RIDE_ON: &[u8; 6] = b"RideOn";

/// Signature appended to our handshake response.
const RIDE_ON_SIGNATURE: [u8; 2] = [0x01, 0x03];

// Sync RX opcodes
const OP_GET: u8 = 0x08;
const OP_RESET: u8 = 0x22;
const OP_VENDOR_MESSAGE: u8 = 0x32;
const OP_LOG_LEVEL_SET: u8 = 0x41;

// Sync TX response forms
const RESP_STATUS: u8 = 0x12;
const RESP_GET: u8 = 0x3C;
const STATUS_SUCCESS: u8 = 0x00;

/// Keep-alive period after a completed handshake.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

// Opaque keep-alive blob replayed verbatim from a device capture.
// TODO: confirm against a live Zwift session whether the content matters or
// only the cadence does.
const KEEPALIVE_PAYLOAD: [u8; 37] = [
    0x2A, 0x08, 0x03, 0x12, 0x24, 0x08, 0x00, 0x10, //
    0x00, 0x18, 0x00, 0x20, 0x00, 0x28, 0x00, 0x30, //
    0x00, 0x38, 0x00, 0x40, 0x00, 0x48, 0x00, 0x50, //
    0x00, 0x58, 0x00, 0x60, 0x00, 0x68, 0x00, 0x70, //
    0x00, 0x78, 0x00, 0x80, 0x01,
];

pub struct ZwiftRide {
    mirror: Arc<GattMirror>,
    gears: Arc<Gears>,
    handshake_complete: AtomicBool,
}

impl ZwiftRide {
    pub fn new(mirror: Arc<GattMirror>, gears: Arc<Gears>) -> Arc<Self> {
        Arc::new(ZwiftRide {
            mirror,
            gears,
            handshake_complete: AtomicBool::new(false),
        })
    }

    /// Register the Zwift Ride service with the Sync RX write handler
    /// installed.
    pub fn register(self: &Arc<Self>) {
        self.mirror.register_service(
            ZWIFT_RIDE_SERVICE_UUID,
            vec![
                CharacteristicSpec::new(ZWIFT_SYNC_RX_UUID, Props::WRITE)
                    .on_write(self.write_handler()),
                CharacteristicSpec::new(ZWIFT_ASYNC_TX_UUID, Props::NOTIFY),
                CharacteristicSpec::new(ZWIFT_SYNC_TX_UUID, Props::NOTIFY),
            ],
        );
    }

    pub fn write_handler(self: &Arc<Self>) -> WriteHandler {
        let this = Arc::clone(self);
        Arc::new(move |data: &[u8]| this.process_write(data))
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::SeqCst)
    }

    fn process_write(&self, data: &[u8]) {
        if data == RIDE_ON {
            let mut response = Vec::with_capacity(8);
            response.extend_from_slice(RIDE_ON);
            response.extend_from_slice(&RIDE_ON_SIGNATURE);
            self.mirror.notify(&ZWIFT_SYNC_TX_UUID, &response);
            self.handshake_complete.store(true, Ordering::SeqCst);
            info!("RideOn handshake complete");
            return;
        }

        let Some(&opcode) = data.first() else {
            debug!("Empty Sync RX write");
            return;
        };

        match opcode {
            OP_GET => {
                let id = match data.len() {
                    0 | 1 => 0u16,
                    2 => data[1] as u16,
                    _ => u16::from_le_bytes([data[1], data[2]]),
                };
                debug!("GET object 0x{:04X}", id);
                let [lo, hi] = id.to_le_bytes();
                self.mirror.notify(&ZWIFT_SYNC_TX_UUID, &[RESP_GET, lo, hi]);
            }
            OP_RESET => {
                self.gears.reset();
                self.status_reply();
            }
            OP_LOG_LEVEL_SET => {
                let level = data.get(1).copied().unwrap_or(0);
                info!("Ride log level set to {}", level);
                self.status_reply();
            }
            OP_VENDOR_MESSAGE => {
                debug!("Vendor message, {} bytes", data.len());
                self.status_reply();
            }
            other => {
                debug!("Unhandled Sync RX opcode 0x{:02X}, replying success", other);
                self.status_reply();
            }
        }
    }

    fn status_reply(&self) {
        self.mirror
            .notify(&ZWIFT_SYNC_TX_UUID, &[RESP_STATUS, STATUS_SUCCESS]);
    }

    /// Emit the keep-alive blob on Sync TX every `interval` while the
    /// handshake is complete and someone is subscribed. Losing the last
    /// Sync TX subscriber drops the handshake back to idle. Never returns.
    pub async fn run_keepalive(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if !self.handshake_complete() {
                continue;
            }
            if self.mirror.subscriber_count(&ZWIFT_SYNC_TX_UUID) == 0 {
                debug!("No Sync TX subscribers, handshake back to idle");
                self.handshake_complete.store(false, Ordering::SeqCst);
                continue;
            }
            self.mirror.notify(&ZWIFT_SYNC_TX_UUID, &KEEPALIVE_PAYLOAD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gears::Trainer;
    use tokio::sync::mpsc;

    struct NullTrainer;

    impl Trainer for NullTrainer {
        fn set_target_incline(&self, _bp: i32) {}
    }

    fn setup() -> (Arc<GattMirror>, Arc<Gears>, Arc<ZwiftRide>) {
        let mirror = Arc::new(GattMirror::new());
        let gears = Arc::new(Gears::new(mirror.clone(), Arc::new(NullTrainer)));
        let ride = ZwiftRide::new(mirror.clone(), gears.clone());
        ride.register();
        (mirror, gears, ride)
    }

    fn subscribe_sync_tx(mirror: &Arc<GattMirror>) -> mpsc::Receiver<crate::mirror::Notification> {
        let (tx, rx) = mpsc::channel(16);
        let id = mirror.attach(tx);
        mirror.subscribe(id, &ZWIFT_SYNC_TX_UUID).unwrap();
        rx
    }

    #[test]
    fn test_registered_characteristics() {
        let (mirror, _gears, _ride) = setup();
        let chars = mirror.characteristics(&ZWIFT_RIDE_SERVICE_UUID).unwrap();
        assert_eq!(chars.len(), 3);
        assert_eq!(chars[0], (ZWIFT_SYNC_RX_UUID, Props::WRITE));
        assert_eq!(chars[1], (ZWIFT_ASYNC_TX_UUID, Props::NOTIFY));
        assert_eq!(chars[2], (ZWIFT_SYNC_TX_UUID, Props::NOTIFY));
    }

    #[test]
    fn test_ride_on_handshake() {
        let (mirror, _gears, ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        assert!(!ride.handshake_complete());
        mirror.write(&ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();
        assert!(ride.handshake_complete());

        let n = rx.try_recv().unwrap();
        assert_eq!(n.uuid, ZWIFT_SYNC_TX_UUID);
        assert_eq!(n.value, vec![0x52, 0x69, 0x64, 0x65, 0x4F, 0x6E, 0x01, 0x03]);
    }

    #[test]
    fn test_ride_on_must_match_exactly() {
        let (mirror, _gears, ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, b"RideOnX").unwrap();
        assert!(!ride.handshake_complete());
        // Treated as an unknown opcode: permissive status success
        assert_eq!(rx.try_recv().unwrap().value, vec![0x12, 0x00]);
    }

    #[test]
    fn test_get_one_byte_id() {
        let (mirror, _gears, _ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, &[0x08, 0x42]).unwrap();
        assert_eq!(rx.try_recv().unwrap().value, vec![0x3C, 0x42, 0x00]);
    }

    #[test]
    fn test_get_two_byte_id_little_endian() {
        let (mirror, _gears, _ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror
            .write(&ZWIFT_SYNC_RX_UUID, &[0x08, 0x34, 0x12])
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().value, vec![0x3C, 0x34, 0x12]);
    }

    #[test]
    fn test_reset_opcode_resets_gears() {
        let (mirror, gears, _ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        gears.set_base_gradient(800);
        gears.shift_up();
        mirror.write(&ZWIFT_SYNC_RX_UUID, &[0x22]).unwrap();

        let snap = gears.snapshot();
        assert_eq!(snap.gear, crate::gears::DEFAULT_GEAR + 1);
        assert_eq!(snap.base_gradient_bp, 0);
        assert_eq!(rx.try_recv().unwrap().value, vec![0x12, 0x00]);
    }

    #[test]
    fn test_log_level_and_vendor_reply_success() {
        let (mirror, _gears, _ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, &[0x41, 0x02]).unwrap();
        assert_eq!(rx.try_recv().unwrap().value, vec![0x12, 0x00]);

        mirror
            .write(&ZWIFT_SYNC_RX_UUID, &[0x32, 0xDE, 0xAD])
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().value, vec![0x12, 0x00]);
    }

    #[test]
    fn test_unknown_opcode_is_permissive() {
        let (mirror, _gears, _ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, &[0x7F]).unwrap();
        assert_eq!(rx.try_recv().unwrap().value, vec![0x12, 0x00]);
    }

    #[test]
    fn test_empty_write_is_ignored() {
        let (mirror, _gears, ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, &[]).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!ride.handshake_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_cadence_after_handshake() {
        let (mirror, _gears, ride) = setup();
        let mut rx = subscribe_sync_tx(&mirror);

        mirror.write(&ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();
        let _handshake = rx.recv().await.unwrap();

        tokio::spawn(ride.clone().run_keepalive(KEEPALIVE_INTERVAL));

        // In an 11 second window at least two keep-alives must appear.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let mut keepalives = 0;
        while let Ok(n) = rx.try_recv() {
            if n.value.len() == 37 {
                keepalives += 1;
            }
        }
        assert!(keepalives >= 2, "got {keepalives} keep-alives in 11 s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_without_subscribers() {
        let (mirror, _gears, ride) = setup();
        {
            let mut rx = subscribe_sync_tx(&mirror);
            mirror.write(&ZWIFT_SYNC_RX_UUID, RIDE_ON).unwrap();
            let _ = rx.recv().await;
            // Receiver dropped here, but the subscription entry remains
        }
        // Simulate the session teardown clearing subscriptions
        let sync_tx = ZWIFT_SYNC_TX_UUID;
        for id in 1..10 {
            let _ = mirror.unsubscribe(id, &sync_tx);
        }

        tokio::spawn(ride.clone().run_keepalive(KEEPALIVE_INTERVAL));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!ride.handshake_complete(), "handshake should reset to idle");
    }
}
