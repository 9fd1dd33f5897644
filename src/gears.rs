//! Virtual drivetrain: shifter input becomes gear changes, gear changes
//! modulate the gradient sent to the trainer.
//!
//! The controller owns the gear state and the trainer's incline setpoint.
//! The base gradient arrives from the FTMS side (simulation parameter or
//! target-inclination writes); the effective gradient is
//! `clamp(base * ratio(gear), -20.00%, +20.00%)` in 0.01% units, computed
//! with integer arithmetic on ratio hundredths.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::mirror::GattMirror;
use crate::protocol::ZWIFT_ASYNC_TX_UUID;

pub const NUM_GEARS: usize = 24;

/// Middle gear (0-indexed), i.e. gear 12 of 24.
pub const DEFAULT_GEAR: usize = 11;

/// Trainer gradient limit, 0.01% units (+-20.00%).
pub const GRADIENT_LIMIT_BP: i32 = 2000;

/// Minimum spacing between trainer incline commands.
pub const APPLY_DEBOUNCE: Duration = Duration::from_millis(100);

// Gear ratio table in hundredths: 24 gears from easiest (0.50) to hardest
// (1.65). The ratio multiplies the base gradient to simulate gear changes.
const GEAR_RATIO_HUNDREDTHS: [u16; NUM_GEARS] = [
    50, 55, 60, 65, 70, 75, 80, 85, // gears 1-8 (easy)
    90, 95, 100, 105, 110, 115, 120, 125, // gears 9-16 (medium)
    130, 135, 140, 145, 150, 155, 160, 165, // gears 17-24 (hard)
];

/// Sink for the composed incline. The production implementation forwards to
/// trainer-io; tests record the calls.
pub trait Trainer: Send + Sync {
    /// `bp` is signed 0.01% units, already clamped to +-2000.
    fn set_target_incline(&self, bp: i32);
}

struct GearState {
    current_gear: usize,
    last_shifter_position: Option<i32>,
    base_gradient_bp: i32,
    effective_gradient_bp: i32,
    enabled: bool,
    pending_apply: bool,
    last_apply: Option<Instant>,
}

/// Read-only view for logging and the debug console.
#[derive(Debug, Clone, Copy)]
pub struct GearSnapshot {
    /// 1-indexed gear number.
    pub gear: usize,
    pub ratio_hundredths: u16,
    pub base_gradient_bp: i32,
    pub effective_gradient_bp: i32,
    pub enabled: bool,
}

pub struct Gears {
    state: Mutex<GearState>,
    mirror: Arc<GattMirror>,
    trainer: Arc<dyn Trainer>,
}

impl Gears {
    pub fn new(mirror: Arc<GattMirror>, trainer: Arc<dyn Trainer>) -> Self {
        Gears {
            state: Mutex::new(GearState {
                current_gear: DEFAULT_GEAR,
                last_shifter_position: None,
                base_gradient_bp: 0,
                effective_gradient_bp: 0,
                enabled: true,
                pending_apply: false,
                last_apply: None,
            }),
            mirror,
            trainer,
        }
    }

    /// New base gradient from the FTMS side, 0.01% units. The base is stored
    /// unclamped; only the composed product is limited.
    pub fn set_base_gradient(&self, bp: i32) {
        let mut st = self.lock();
        st.base_gradient_bp = bp;
        self.recompute(&mut st);
        self.apply(&mut st);
        debug!(
            "Base gradient {} bp, effective {} bp (gear {})",
            bp,
            st.effective_gradient_bp,
            st.current_gear + 1
        );
    }

    /// Periodic shifter sample. The first sample only seeds the reference
    /// position; afterwards the delta sign picks the shift direction.
    pub fn poll_shifter(&self, position: i32) {
        let last = {
            let mut st = self.lock();
            match st.last_shifter_position {
                None => {
                    st.last_shifter_position = Some(position);
                    return;
                }
                Some(last) => {
                    st.last_shifter_position = Some(position);
                    last
                }
            }
        };
        if position > last {
            self.shift_up();
        } else if position < last {
            self.shift_down();
        }
    }

    pub fn shift_up(&self) {
        let mut st = self.lock();
        if st.current_gear + 1 >= NUM_GEARS {
            debug!("Already in highest gear");
            return;
        }
        st.current_gear += 1;
        self.after_shift(&mut st, "up");
    }

    pub fn shift_down(&self) {
        let mut st = self.lock();
        if st.current_gear == 0 {
            debug!("Already in lowest gear");
            return;
        }
        st.current_gear -= 1;
        self.after_shift(&mut st, "down");
    }

    /// Reset to the default gear with a zeroed gradient (Sync RX opcode
    /// 0x22 and FTMS Reset both land here).
    pub fn reset(&self) {
        let mut st = self.lock();
        st.current_gear = DEFAULT_GEAR;
        st.base_gradient_bp = 0;
        st.effective_gradient_bp = 0;
        self.apply(&mut st);
        info!("Drivetrain reset to gear {}", DEFAULT_GEAR + 1);
    }

    /// Take over the trainer incline setpoint, applying the current state.
    pub fn enable(&self) {
        let mut st = self.lock();
        st.enabled = true;
        self.apply(&mut st);
    }

    /// Release the trainer incline setpoint.
    pub fn disable(&self) {
        let mut st = self.lock();
        st.enabled = false;
        st.pending_apply = false;
    }

    /// Flush an apply that was skipped inside the debounce window. Driven by
    /// a periodic task.
    pub fn tick(&self) {
        let mut st = self.lock();
        if st.pending_apply {
            self.apply(&mut st);
        }
    }

    pub fn snapshot(&self) -> GearSnapshot {
        let st = self.lock();
        GearSnapshot {
            gear: st.current_gear + 1,
            ratio_hundredths: GEAR_RATIO_HUNDREDTHS[st.current_gear],
            base_gradient_bp: st.base_gradient_bp,
            effective_gradient_bp: st.effective_gradient_bp,
            enabled: st.enabled,
        }
    }

    fn after_shift(&self, st: &mut MutexGuard<'_, GearState>, direction: &str) {
        self.recompute(st);
        self.apply(st);
        let gear = st.current_gear;
        let ratio = GEAR_RATIO_HUNDREDTHS[gear];
        info!(
            "Shifted {} to gear {} (ratio {}.{:02})",
            direction,
            gear + 1,
            ratio / 100,
            ratio % 100
        );
        // Gear status feedback for subscribed apps: 1-indexed gear number
        // and the ratio in hundredths.
        self.mirror
            .notify(&ZWIFT_ASYNC_TX_UUID, &[(gear + 1) as u8, ratio as u8]);
    }

    fn recompute(&self, st: &mut MutexGuard<'_, GearState>) {
        st.effective_gradient_bp =
            compose_gradient(st.base_gradient_bp, GEAR_RATIO_HUNDREDTHS[st.current_gear]);
    }

    fn apply(&self, st: &mut MutexGuard<'_, GearState>) {
        if !st.enabled {
            st.pending_apply = false;
            return;
        }
        let now = Instant::now();
        if let Some(last) = st.last_apply {
            if now.duration_since(last) < APPLY_DEBOUNCE {
                st.pending_apply = true;
                return;
            }
        }
        self.trainer.set_target_incline(st.effective_gradient_bp);
        st.last_apply = Some(now);
        st.pending_apply = false;
    }

    fn lock(&self) -> MutexGuard<'_, GearState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `clamp(round(base * ratio / 100), +-2000)`, rounding half away from zero.
fn compose_gradient(base_bp: i32, ratio_hundredths: u16) -> i32 {
    let product = base_bp as i64 * ratio_hundredths as i64;
    let rounded = if product >= 0 {
        (product + 50) / 100
    } else {
        (product - 50) / 100
    };
    rounded.clamp(-(GRADIENT_LIMIT_BP as i64), GRADIENT_LIMIT_BP as i64) as i32
}

/// Drive the debounce flush. Never returns.
pub async fn run_apply_timer(gears: Arc<Gears>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        gears.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{CharacteristicSpec, Props};
    use crate::protocol::ZWIFT_RIDE_SERVICE_UUID;
    use std::thread::sleep;
    use tokio::sync::mpsc;

    struct RecordingTrainer {
        calls: Mutex<Vec<i32>>,
    }

    impl RecordingTrainer {
        fn new() -> Arc<Self> {
            Arc::new(RecordingTrainer {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<i32> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Trainer for RecordingTrainer {
        fn set_target_incline(&self, bp: i32) {
            self.calls.lock().unwrap().push(bp);
        }
    }

    fn setup() -> (Arc<GattMirror>, Arc<RecordingTrainer>, Gears) {
        let mirror = Arc::new(GattMirror::new());
        mirror.register_service(
            ZWIFT_RIDE_SERVICE_UUID,
            vec![CharacteristicSpec::new(ZWIFT_ASYNC_TX_UUID, Props::NOTIFY)],
        );
        let trainer = RecordingTrainer::new();
        let gears = Gears::new(mirror.clone(), trainer.clone());
        (mirror, trainer, gears)
    }

    #[test]
    fn test_ratio_table_monotonic_and_bounds() {
        assert_eq!(GEAR_RATIO_HUNDREDTHS[0], 50);
        assert_eq!(GEAR_RATIO_HUNDREDTHS[NUM_GEARS - 1], 165);
        for pair in GEAR_RATIO_HUNDREDTHS.windows(2) {
            assert!(pair[1] >= pair[0], "ratios must be non-decreasing");
            assert_eq!(pair[1] - pair[0], 5);
        }
        assert_eq!(GEAR_RATIO_HUNDREDTHS[DEFAULT_GEAR], 105);
    }

    #[test]
    fn test_compose_gradient_exact() {
        assert_eq!(compose_gradient(500, 110), 550);
        assert_eq!(compose_gradient(500, 115), 575);
        assert_eq!(compose_gradient(0, 165), 0);
        assert_eq!(compose_gradient(-400, 50), -200);
    }

    #[test]
    fn test_compose_gradient_rounds_half_away_from_zero() {
        // 333 * 1.05 = 349.65 -> 350
        assert_eq!(compose_gradient(333, 105), 350);
        // -333 * 1.05 = -349.65 -> -350
        assert_eq!(compose_gradient(-333, 105), -350);
        // 101 * 0.50 = 50.5 -> 51
        assert_eq!(compose_gradient(101, 50), 51);
    }

    #[test]
    fn test_compose_gradient_clamps_product_only() {
        assert_eq!(compose_gradient(2000, 165), 2000);
        assert_eq!(compose_gradient(-2000, 165), -2000);
        assert_eq!(compose_gradient(5000, 50), 2000); // 25.00% clamped
        assert_eq!(compose_gradient(i32::MAX / 200, 165), 2000); // no overflow
    }

    #[test]
    fn test_clamp_holds_for_all_gears() {
        for gear in 0..NUM_GEARS {
            for base in [-30000, -2000, -1, 0, 1, 555, 2000, 30000] {
                let eff = compose_gradient(base, GEAR_RATIO_HUNDREDTHS[gear]);
                assert!(eff.abs() <= GRADIENT_LIMIT_BP);
            }
        }
    }

    #[test]
    fn test_first_poll_only_seeds_position() {
        let (_mirror, trainer, gears) = setup();
        gears.poll_shifter(5);
        assert_eq!(gears.snapshot().gear, DEFAULT_GEAR + 1);
        assert!(trainer.calls().is_empty());
    }

    #[test]
    fn test_equal_position_is_noop() {
        let (_mirror, trainer, gears) = setup();
        gears.poll_shifter(5);
        gears.poll_shifter(5);
        assert_eq!(gears.snapshot().gear, DEFAULT_GEAR + 1);
        assert!(trainer.calls().is_empty());
    }

    #[test]
    fn test_shift_to_incline_scenario() {
        // Gear 12 (ratio 1.05), base 5.00%: two upshifts give 5.50% then
        // 5.75% and two gear status notifications.
        let (mirror, trainer, gears) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let id = mirror.attach(tx);
        mirror.subscribe(id, &ZWIFT_ASYNC_TX_UUID).unwrap();

        gears.set_base_gradient(500);
        assert_eq!(trainer.calls(), vec![525]); // 5.00% * 1.05

        gears.poll_shifter(0);
        sleep(APPLY_DEBOUNCE + Duration::from_millis(20));
        gears.poll_shifter(1);
        sleep(APPLY_DEBOUNCE + Duration::from_millis(20));
        gears.poll_shifter(3);

        let snap = gears.snapshot();
        assert_eq!(snap.gear, 14);
        assert_eq!(snap.ratio_hundredths, 115);
        assert_eq!(snap.effective_gradient_bp, 575);
        assert_eq!(trainer.calls(), vec![525, 550, 575]);

        assert_eq!(rx.try_recv().unwrap().value, vec![13, 110]);
        assert_eq!(rx.try_recv().unwrap().value, vec![14, 115]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clamping_scenario() {
        // Base 20.00%, top gear (1.65): clamped to 20.00%.
        let (_mirror, trainer, gears) = setup();
        for _ in 0..NUM_GEARS {
            gears.shift_up();
        }
        assert_eq!(gears.snapshot().gear, NUM_GEARS);

        sleep(APPLY_DEBOUNCE + Duration::from_millis(20));
        gears.set_base_gradient(2000);
        assert_eq!(gears.snapshot().effective_gradient_bp, 2000);
        assert_eq!(trainer.calls().last(), Some(&2000));
    }

    #[test]
    fn test_no_wraparound_at_boundaries() {
        let (_mirror, _trainer, gears) = setup();
        for _ in 0..40 {
            gears.shift_up();
        }
        assert_eq!(gears.snapshot().gear, NUM_GEARS);
        for _ in 0..80 {
            gears.shift_down();
        }
        assert_eq!(gears.snapshot().gear, 1);
    }

    #[test]
    fn test_debounced_apply_carries_forward() {
        let (_mirror, trainer, gears) = setup();
        gears.set_base_gradient(1000); // applies immediately
        gears.shift_up(); // inside the window: skipped, pending
        assert_eq!(trainer.calls().len(), 1);

        sleep(APPLY_DEBOUNCE + Duration::from_millis(20));
        gears.tick();
        let calls = trainer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], compose_gradient(1000, 110));
    }

    #[test]
    fn test_disable_stops_trainer_updates() {
        let (_mirror, trainer, gears) = setup();
        gears.disable();
        gears.set_base_gradient(1000);
        gears.shift_up();
        assert!(trainer.calls().is_empty());

        // Re-enabling applies the composed gradient
        gears.enable();
        assert_eq!(trainer.calls(), vec![compose_gradient(1000, 110)]);
    }

    #[test]
    fn test_reset_restores_default_gear_and_zero_gradient() {
        let (_mirror, trainer, gears) = setup();
        gears.set_base_gradient(1500);
        gears.shift_up();
        sleep(APPLY_DEBOUNCE + Duration::from_millis(20));
        gears.reset();

        let snap = gears.snapshot();
        assert_eq!(snap.gear, DEFAULT_GEAR + 1);
        assert_eq!(snap.base_gradient_bp, 0);
        assert_eq!(snap.effective_gradient_bp, 0);
        assert_eq!(trainer.calls().last(), Some(&0));
    }

    #[test]
    fn test_effective_non_decreasing_in_gear_for_positive_base() {
        let mut prev = i32::MIN;
        for gear in 0..NUM_GEARS {
            let eff = compose_gradient(700, GEAR_RATIO_HUNDREDTHS[gear]);
            assert!(eff >= prev);
            prev = eff;
        }
    }
}
