/// Lost event accounting of a single probe.
///
/// The kernel reports events it had to drop. They are summed in a cumulative
/// counter, and every `period` poll iterations the counter is due to be
/// published as a telemetry event. A period `<= 0` disables the accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostEventTelemetry {
    period: i64,
    timer: i64,
    count: u64,
}

impl LostEventTelemetry {
    pub fn new(period: i64) -> Self {
        Self {
            period,
            timer: period,
            count: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.period > 0
    }

    pub fn record_lost(&mut self, lost: u64) {
        self.count = self.count.saturating_add(lost);
    }

    /// Advance the countdown by one poll iteration.
    ///
    /// Returns the cumulative lost count when a telemetry event is due.
    pub fn tick(&mut self) -> Option<u64> {
        if !self.enabled() {
            return None;
        }
        self.timer -= 1;
        if self.timer == 0 {
            self.timer = self.period;
            Some(self.count)
        } else {
            None
        }
    }

    pub fn timer(&self) -> i64 {
        self.timer
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
