use std::sync::Arc;
use std::time::Duration;

use kickr_bridge::gears::{self, Gears};
use kickr_bridge::mirror::{CharacteristicSpec, GattMirror, Props};
use kickr_bridge::protocol::{
    CSC_FEATURE_UUID, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_FEATURE_UUID,
    CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID, DEVICE_INFORMATION_SERVICE_UUID,
    FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
    MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID, SENSOR_LOCATION_UUID, SERIAL_NUMBER_UUID,
    ZWIFT_RIDE_SERVICE_UUID,
};
use kickr_bridge::trainer::{BikeState, TrainerIo};
use kickr_bridge::zwift_ride::{ZwiftRide, KEEPALIVE_INTERVAL};
use kickr_bridge::{ble_service, config, debug_server, ftms, mdns, server, trainer};
use tokio::sync::Mutex;

const DEFAULT_SOCKET: &str = "/tmp/trainer_io.sock";
const DEFAULT_CONFIG: &str = "kickr_bridge.json";
const DEFAULT_DEBUG_PORT: u16 = 8828;

const APPLY_TICK: Duration = Duration::from_millis(100);
const SHIFTER_POLL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    env_logger::init();

    let (socket_path, config_path, debug_port) = parse_args();
    log::info!(
        "KICKR bridge starting, socket: {}, config: {}, debug port: {}",
        socket_path,
        config_path,
        debug_port
    );

    // Identity: saved config wins, otherwise derive from the adapter MAC.
    let identity = match config::load(&config_path) {
        Some(identity) => identity,
        None => {
            let mac = match ble_service::adapter_mac().await {
                Ok(mac) => mac,
                Err(e) => {
                    log::warn!("No BLE adapter address ({}), using placeholder MAC", e);
                    "00:00:00:00:00:00".to_string()
                }
            };
            let identity = config::derive(&mac);
            config::save(&config_path, &identity);
            identity
        }
    };

    // Wire the core: mirror, trainer sink, gear controller, services.
    let mirror = Arc::new(GattMirror::new());
    let bike_state = Arc::new(Mutex::new(BikeState::default()));
    let trainer_io: Arc<TrainerIo> = Arc::new(TrainerIo::new(socket_path.clone()));
    let gears = Arc::new(Gears::new(mirror.clone(), trainer_io));

    let ride = ZwiftRide::new(mirror.clone(), gears.clone());
    ride.register();
    let ftms_service = ftms::FtmsService::new(mirror.clone(), gears.clone());
    ftms_service.register();
    register_broadcast_services(&mirror, &identity);

    // Discovery answers this curated, stable set.
    mirror.set_advertised_services(vec![
        CYCLING_POWER_SERVICE_UUID,
        CSC_SERVICE_UUID,
        HEART_RATE_SERVICE_UUID,
        FTMS_SERVICE_UUID,
        ZWIFT_RIDE_SERVICE_UUID,
    ]);

    // mDNS face. TCP still serves without it, so failures only warn.
    let advertiser = match mdns::MdnsAdvertiser::new(
        &identity.instance_name(),
        &identity.mac_address,
        &identity.serial_number,
        server::TNP_PORT,
    ) {
        Ok(advertiser) => {
            for short in ["1818", "1816", "180D", "1826", "FC82"] {
                if let Err(e) = advertiser.add_service_uuid(short) {
                    log::warn!("Failed to publish service UUID {}: {}", short, e);
                }
            }
            Some(advertiser)
        }
        Err(e) => {
            log::error!("mDNS advertiser failed to start: {}", e);
            None
        }
    };

    tokio::spawn(ride.clone().run_keepalive(KEEPALIVE_INTERVAL));
    tokio::spawn(gears::run_apply_timer(gears.clone(), APPLY_TICK));
    tokio::spawn(trainer::run_shifter_poll(
        bike_state.clone(),
        gears.clone(),
        SHIFTER_POLL,
    ));
    tokio::spawn(ftms::run_broadcast(mirror.clone(), bike_state.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = server::run(mirror.clone(), server::TNP_PORT, server::MAX_CLIENTS) => {
            if let Err(e) = result {
                log::error!("TNP server exited with error: {}", e);
            }
        }
        result = trainer::run(bike_state.clone(), &socket_path) => {
            if let Err(e) = result {
                log::error!("Trainer task exited with error: {}", e);
            }
        }
        result = ble_service::run(mirror.clone(), identity.device_name.clone()) => {
            if let Err(e) = result {
                log::error!("BLE peripheral exited with error: {}", e);
            }
        }
        result = debug_server::run(
            mirror.clone(),
            gears.clone(),
            ftms_service.clone(),
            bike_state.clone(),
            debug_port,
        ) => {
            if let Err(e) = result {
                log::error!("Debug console exited with error: {}", e);
            }
        }
    }

    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    log::info!("KICKR bridge shutting down");
}

/// The broadcast services the original device also exposes, so TNP and BLE
/// discovery both see a complete bike.
fn register_broadcast_services(mirror: &GattMirror, identity: &config::BridgeConfig) {
    mirror.register_service(
        CYCLING_POWER_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(CYCLING_POWER_MEASUREMENT_UUID, Props::NOTIFY),
            CharacteristicSpec::new(CYCLING_POWER_FEATURE_UUID, Props::READ)
                .with_value(vec![0x00; 4]),
            // Sensor location: rear wheel
            CharacteristicSpec::new(SENSOR_LOCATION_UUID, Props::READ).with_value(vec![0x0C]),
        ],
    );
    mirror.register_service(
        CSC_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(CSC_MEASUREMENT_UUID, Props::NOTIFY),
            // Wheel and crank revolution data supported
            CharacteristicSpec::new(CSC_FEATURE_UUID, Props::READ).with_value(vec![0x03, 0x00]),
        ],
    );
    mirror.register_service(
        HEART_RATE_SERVICE_UUID,
        vec![CharacteristicSpec::new(
            HEART_RATE_MEASUREMENT_UUID,
            Props::NOTIFY,
        )],
    );
    mirror.register_service(
        DEVICE_INFORMATION_SERVICE_UUID,
        vec![
            CharacteristicSpec::new(MANUFACTURER_NAME_UUID, Props::READ)
                .with_value(b"Wahoo Fitness".to_vec()),
            CharacteristicSpec::new(MODEL_NUMBER_UUID, Props::READ)
                .with_value(identity.device_name.clone().into_bytes()),
            CharacteristicSpec::new(SERIAL_NUMBER_UUID, Props::READ)
                .with_value(identity.serial_number.clone().into_bytes()),
        ],
    );
}

fn parse_args() -> (String, String, u16) {
    let args: Vec<String> = std::env::args().collect();
    let mut socket_path = DEFAULT_SOCKET.to_string();
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut debug_port = DEFAULT_DEBUG_PORT;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                if let Some(path) = args.get(i + 1) {
                    socket_path = path.clone();
                    i += 1;
                }
            }
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    config_path = path.clone();
                    i += 1;
                }
            }
            "--debug-port" => {
                if let Some(port) = args.get(i + 1) {
                    debug_port = port.parse().unwrap_or(DEFAULT_DEBUG_PORT);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    (socket_path, config_path, debug_port)
}
