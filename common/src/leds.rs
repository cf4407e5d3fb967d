use crate::hal::IndicatorPin;

pub const PROVISIONING_BLINK_INTERVAL_MS: u64 = 500;

struct Indicator<O: IndicatorPin> {
    pin: O,
    lit: Option<bool>,
}

impl<O: IndicatorPin> Indicator<O> {
    fn new(pin: O) -> Self {
        Self { pin, lit: None }
    }

    fn set(&mut self, asserted: bool) {
        if self.lit == Some(asserted) {
            return;
        }
        self.pin.set_asserted(asserted);
        self.lit = Some(asserted);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Pulse {
    started_ms: Option<u64>,
}

impl Pulse {
    fn start(&mut self, now_ms: u64) {
        self.started_ms = Some(now_ms);
    }

    /// Clears the pulse once `duration_ms` has passed; true while it still runs.
    fn running(&mut self, now_ms: u64, duration_ms: u64) -> bool {
        match self.started_ms {
            Some(start) if now_ms.saturating_sub(start) >= duration_ms => {
                self.started_ms = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Activity output (pulses only) and status output (fault pulse, then
/// provisioning blink, then network-ready level).
pub struct LedSubsystem<O: IndicatorPin> {
    activity: Indicator<O>,
    status: Indicator<O>,
    activity_pulse_ms: u64,
    fault_pulse_ms: u64,
    activity_pulse: Pulse,
    fault_pulse: Pulse,
    blinking: bool,
    blink_lit: bool,
    blink_toggled_ms: u64,
}

impl<O: IndicatorPin> LedSubsystem<O> {
    pub fn new(activity: O, status: O, activity_pulse_ms: u64, fault_pulse_ms: u64) -> Self {
        Self {
            activity: Indicator::new(activity),
            status: Indicator::new(status),
            activity_pulse_ms,
            fault_pulse_ms,
            activity_pulse: Pulse::default(),
            fault_pulse: Pulse::default(),
            blinking: false,
            blink_lit: false,
            blink_toggled_ms: 0,
        }
    }

    /// Power-on state: activity dark, status lit until the first tick.
    pub fn begin(&mut self) {
        self.activity.set(false);
        self.status.set(true);
        self.blinking = false;
        self.blink_lit = false;
        self.blink_toggled_ms = 0;
    }

    pub fn request_user_pulse(&mut self, now_ms: u64) {
        self.activity.set(true);
        self.activity_pulse.start(now_ms);
    }

    pub fn request_err_pulse(&mut self, now_ms: u64) {
        self.status.set(true);
        self.fault_pulse.start(now_ms);
    }

    pub fn set_err_blinking(&mut self, enabled: bool, now_ms: u64) {
        if self.blinking == enabled {
            return;
        }
        self.blinking = enabled;
        self.blink_toggled_ms = now_ms;
        self.blink_lit = enabled;
        self.status.set(enabled);
    }

    pub fn is_blinking(&self) -> bool {
        self.blinking
    }

    pub fn tick(&mut self, now_ms: u64, network_ready: bool) {
        if !self.activity_pulse.running(now_ms, self.activity_pulse_ms) {
            self.activity.set(false);
        }

        if self.fault_pulse.running(now_ms, self.fault_pulse_ms) {
            return;
        }

        if self.blinking {
            if now_ms.saturating_sub(self.blink_toggled_ms) >= PROVISIONING_BLINK_INTERVAL_MS {
                self.blink_toggled_ms = now_ms;
                self.blink_lit = !self.blink_lit;
            }
            self.status.set(self.blink_lit);
        } else {
            self.status.set(network_ready);
        }
    }
}
