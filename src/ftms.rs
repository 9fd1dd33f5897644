//! FTMS (Fitness Machine Service) face of the bridge.
//!
//! Registers the FTMS characteristics on the mirror and owns the Control
//! Point write handler. Incline-shaped procedures (Set Target Inclination,
//! Set Indoor Bike Simulation Parameters) emit a base-gradient event into
//! the gear controller; the controller owns the trainer apply path and never
//! calls back in here.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::gears::Gears;
use crate::mirror::{CharacteristicSpec, GattMirror, Props, WriteHandler};
use crate::protocol::{
    self, status, training, ControlCommand, FTMS_CONTROL_POINT_UUID, FTMS_FEATURE_UUID,
    FTMS_MACHINE_STATUS_UUID, FTMS_SERVICE_UUID, INCLINATION_RANGE_UUID, INDOOR_BIKE_DATA_UUID,
    POWER_RANGE_UUID, RESISTANCE_RANGE_UUID, TRAINING_STATUS_UUID,
};
use crate::trainer::BikeState;

// Spin down reply params: target speed low 8.00 km/h, high 24.00 km/h.
const SPIN_DOWN_PARAMS: [u8; 4] = [0x20, 0x03, 0x60, 0x09];

pub struct FtmsService {
    mirror: Arc<GattMirror>,
    gears: Arc<Gears>,
}

impl FtmsService {
    pub fn new(mirror: Arc<GattMirror>, gears: Arc<Gears>) -> Arc<Self> {
        Arc::new(FtmsService { mirror, gears })
    }

    /// Register the FTMS service tree.
    pub fn register(self: &Arc<Self>) {
        self.mirror.register_service(
            FTMS_SERVICE_UUID,
            vec![
                CharacteristicSpec::new(FTMS_FEATURE_UUID, Props::READ)
                    .with_value(protocol::encode_feature().to_vec()),
                CharacteristicSpec::new(INDOOR_BIKE_DATA_UUID, Props::NOTIFY),
                CharacteristicSpec::new(TRAINING_STATUS_UUID, Props::READ | Props::NOTIFY)
                    .with_value(vec![0x00, training::IDLE]),
                CharacteristicSpec::new(
                    FTMS_CONTROL_POINT_UUID,
                    Props::WRITE | Props::INDICATE,
                )
                .on_write(self.control_point_handler()),
                CharacteristicSpec::new(FTMS_MACHINE_STATUS_UUID, Props::NOTIFY)
                    .with_value(vec![status::STOPPED_OR_PAUSED_BY_USER, 0x01]),
                // Readable as the supported inclination range; also accepts
                // direct simulation-parameter writes from clients that skip
                // the control point.
                CharacteristicSpec::new(INCLINATION_RANGE_UUID, Props::READ | Props::WRITE)
                    .with_value(protocol::encode_inclination_range().to_vec())
                    .on_write(self.simulation_handler()),
                CharacteristicSpec::new(RESISTANCE_RANGE_UUID, Props::READ)
                    .with_value(protocol::encode_resistance_range().to_vec()),
                CharacteristicSpec::new(POWER_RANGE_UUID, Props::READ)
                    .with_value(protocol::encode_power_range().to_vec()),
            ],
        );
    }

    fn control_point_handler(self: &Arc<Self>) -> WriteHandler {
        let this = Arc::clone(self);
        Arc::new(move |data: &[u8]| {
            let response = this.execute(data);
            this.mirror.notify(&FTMS_CONTROL_POINT_UUID, &response);
        })
    }

    fn simulation_handler(self: &Arc<Self>) -> WriteHandler {
        let this = Arc::clone(self);
        Arc::new(move |data: &[u8]| {
            match protocol::parse_simulation_parameters(data) {
                Some(params) => this.gears.set_base_gradient(params.grade_bp as i32),
                None => warn!("Malformed simulation parameters: {:02X?}", data),
            }
        })
    }

    /// Execute one Control Point procedure and return the response
    /// indication bytes. Shared by the GATT write handler and the debug
    /// console, same code path regardless of transport.
    pub fn execute(&self, data: &[u8]) -> Vec<u8> {
        let Some(cmd) = protocol::parse_control_point(data) else {
            let opcode = data.first().copied().unwrap_or(0);
            warn!("Unsupported control point opcode 0x{:02X}", opcode);
            return protocol::encode_control_response(opcode, protocol::RESULT_NOT_SUPPORTED);
        };

        let (opcode, result) = self.dispatch(&cmd);
        let mut response = protocol::encode_control_response(opcode, result);
        if matches!(cmd, ControlCommand::SpinDownControl(_)) && result == protocol::RESULT_SUCCESS
        {
            response.extend_from_slice(&SPIN_DOWN_PARAMS);
        }

        if result == protocol::RESULT_SUCCESS {
            if let Some(machine_status) = machine_status_for(&cmd) {
                self.notify_if_changed(&FTMS_MACHINE_STATUS_UUID, &machine_status);
            }
            if let Some(training_status) = training_status_for(&cmd) {
                self.notify_if_changed(&TRAINING_STATUS_UUID, &training_status);
            }
        }

        response
    }

    fn dispatch(&self, cmd: &ControlCommand) -> (u8, u8) {
        match cmd {
            ControlCommand::RequestControl => {
                info!("FTMS: client requested control");
                (protocol::OP_REQUEST_CONTROL, protocol::RESULT_SUCCESS)
            }
            ControlCommand::Reset => {
                info!("FTMS: reset");
                self.gears.reset();
                (protocol::OP_RESET, protocol::RESULT_SUCCESS)
            }
            ControlCommand::SetTargetInclination(tenths) => {
                // FTMS carries 0.1% units; the controller works in 0.01%.
                let bp = *tenths as i32 * 10;
                info!("FTMS: target inclination {:.1}%", *tenths as f64 / 10.0);
                self.gears.set_base_gradient(bp);
                (protocol::OP_SET_TARGET_INCLINATION, protocol::RESULT_SUCCESS)
            }
            ControlCommand::SetTargetResistance(level) => {
                if (1..=100).contains(level) {
                    info!("FTMS: target resistance {}", level);
                    (protocol::OP_SET_TARGET_RESISTANCE, protocol::RESULT_SUCCESS)
                } else {
                    warn!("FTMS: resistance {} out of range", level);
                    (
                        protocol::OP_SET_TARGET_RESISTANCE,
                        protocol::RESULT_INVALID_PARAM,
                    )
                }
            }
            ControlCommand::SetTargetPower(watts) => {
                // No power feedback loop behind the incline-only trainer
                // contract, so ERG mode is declined.
                debug!("FTMS: ERG target {} W declined", watts);
                (protocol::OP_SET_TARGET_POWER, protocol::RESULT_NOT_SUPPORTED)
            }
            ControlCommand::StartOrResume => {
                info!("FTMS: start training");
                (protocol::OP_START_OR_RESUME, protocol::RESULT_SUCCESS)
            }
            ControlCommand::StopOrPause(param) => {
                info!("FTMS: stop/pause (param={})", param);
                (protocol::OP_STOP_OR_PAUSE, protocol::RESULT_SUCCESS)
            }
            ControlCommand::SetSimulationParameters(params) => {
                info!(
                    "FTMS: sim grade {:.2}% (wind {} mm/s)",
                    params.grade_bp as f64 / 100.0,
                    params.wind_speed
                );
                self.gears.set_base_gradient(params.grade_bp as i32);
                (protocol::OP_SET_SIM_PARAMS, protocol::RESULT_SUCCESS)
            }
            ControlCommand::SpinDownControl(param) => {
                info!("FTMS: spin down requested (param={})", param);
                (protocol::OP_SPIN_DOWN_CONTROL, protocol::RESULT_SUCCESS)
            }
            ControlCommand::SetTargetedCadence(half_rpm) => {
                info!("FTMS: targeted cadence {:.1} rpm", *half_rpm as f64 / 2.0);
                (
                    protocol::OP_SET_TARGETED_CADENCE,
                    protocol::RESULT_SUCCESS,
                )
            }
        }
    }

    fn notify_if_changed(&self, uuid: &uuid::Uuid, value: &[u8]) {
        if self.mirror.value(uuid).as_deref() != Ok(value) {
            self.mirror.notify(uuid, value);
        }
    }
}

/// Machine Status notification for a procedure, if FTMS defines one.
fn machine_status_for(cmd: &ControlCommand) -> Option<Vec<u8>> {
    match cmd {
        ControlCommand::Reset => Some(vec![status::RESET]),
        ControlCommand::SetTargetInclination(tenths) => {
            let mut buf = vec![status::TARGET_INCLINE_CHANGED];
            buf.extend_from_slice(&tenths.to_le_bytes());
            Some(buf)
        }
        ControlCommand::SetTargetResistance(level) => {
            let mut buf = vec![status::TARGET_RESISTANCE_CHANGED];
            buf.extend_from_slice(&level.to_le_bytes());
            Some(buf)
        }
        ControlCommand::StartOrResume => Some(vec![status::STARTED_OR_RESUMED_BY_USER]),
        ControlCommand::StopOrPause(param) => {
            Some(vec![status::STOPPED_OR_PAUSED_BY_USER, *param])
        }
        ControlCommand::SetSimulationParameters(params) => {
            let mut buf = vec![status::SIM_PARAMS_CHANGED];
            buf.extend_from_slice(&params.wind_speed.to_le_bytes());
            buf.extend_from_slice(&params.grade_bp.to_le_bytes());
            buf.push(params.crr);
            buf.push(params.cw);
            Some(buf)
        }
        ControlCommand::SpinDownControl(_) => Some(vec![status::SPIN_DOWN_STATUS, 0x01]),
        ControlCommand::SetTargetedCadence(half_rpm) => {
            let mut buf = vec![status::TARGETED_CADENCE_CHANGED];
            buf.extend_from_slice(&half_rpm.to_le_bytes());
            Some(buf)
        }
        _ => None,
    }
}

/// Training Status notification for a procedure, if it changes the mode.
fn training_status_for(cmd: &ControlCommand) -> Option<Vec<u8>> {
    let value = match cmd {
        ControlCommand::Reset => training::IDLE,
        ControlCommand::SetTargetInclination(_) => training::MANUAL_MODE,
        ControlCommand::SetSimulationParameters(_) => training::MANUAL_MODE,
        ControlCommand::SetTargetResistance(_) => training::MANUAL_MODE,
        ControlCommand::StartOrResume => training::WARMING_UP,
        ControlCommand::StopOrPause(_) => training::IDLE,
        ControlCommand::SpinDownControl(_) => training::OTHER,
        _ => return None,
    };
    Some(vec![0x00, value])
}

/// Re-broadcast live ride data at 1 Hz: Indoor Bike Data, Cycling Power
/// Measurement, and Heart Rate when a monitor is reporting. Never returns.
pub async fn run_broadcast(mirror: Arc<GattMirror>, state: Arc<Mutex<BikeState>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let (bike_data, power, heart_rate) = {
            let s = state.lock().await;
            (
                s.encode_indoor_bike_data(),
                protocol::encode_power_measurement(s.power_watts),
                (s.heart_rate_bpm > 0).then(|| protocol::encode_heart_rate(s.heart_rate_bpm)),
            )
        };
        mirror.notify(&INDOOR_BIKE_DATA_UUID, &bike_data);
        mirror.notify(&protocol::CYCLING_POWER_MEASUREMENT_UUID, &power);
        if let Some(hr) = heart_rate {
            mirror.notify(&protocol::HEART_RATE_MEASUREMENT_UUID, &hr);
        }
    }
}
