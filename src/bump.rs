/// Default refractory window after a confirmed bump, ms
pub const DEFAULT_REFRACTORY_MS: u64 = 8_000;

/// Two successive readings closer than this are treated as the noise floor
const NOISE_FLOOR_DELTA: f64 = 0.05;

/// Above-threshold readings required before a detection is possible
const MIN_CONSECUTIVE_ABOVE: u32 = 2;

/// A new event inside the refractory window must beat the previous bump's
/// magnitude by this much to override the suppression
const OVERRIDE_MARGIN: f64 = 4.0;

/// Stateful threshold detector with hysteresis and refractory suppression.
///
/// Operates on one corrected magnitude at a time. `detect` before
/// `initialize` is a programming error and panics.
#[derive(Debug)]
pub struct BumpDetector {
    threshold: f64,
    refractory_period_ms: u64,
    last_spike_timestamp_ms: Option<u64>,
    last_spike_magnitude: Option<f64>,
    consecutive_above: u32,
    previous_magnitude: Option<f64>,
    initialized: bool,
}

impl BumpDetector {
    pub fn new() -> Self {
        Self {
            threshold: 0.0,
            refractory_period_ms: DEFAULT_REFRACTORY_MS,
            last_spike_timestamp_ms: None,
            last_spike_magnitude: None,
            consecutive_above: 0,
            previous_magnitude: None,
            initialized: false,
        }
    }

    pub fn initialize(&mut self, threshold: f64, refractory_period_ms: u64) {
        self.threshold = threshold;
        self.refractory_period_ms = refractory_period_ms;
        self.last_spike_timestamp_ms = None;
        self.last_spike_magnitude = None;
        self.consecutive_above = 0;
        self.previous_magnitude = None;
        self.initialized = true;
    }

    /// Clear transient state without changing threshold or refractory period.
    pub fn reset(&mut self) {
        self.last_spike_timestamp_ms = None;
        self.last_spike_magnitude = None;
        self.consecutive_above = 0;
        self.previous_magnitude = None;
    }

    pub fn last_spike_timestamp(&self) -> Option<u64> {
        self.last_spike_timestamp_ms
    }

    /// Returns true iff this reading confirms a new bump.
    pub fn detect(&mut self, magnitude: f64, timestamp_ms: u64) -> bool {
        if !self.initialized {
            panic!("BumpDetector::detect called before initialize");
        }

        let previous = self.previous_magnitude.replace(magnitude);

        let near_identical = previous
            .map(|p| (magnitude - p).abs() < NOISE_FLOOR_DELTA)
            .unwrap_or(false);
        if magnitude <= self.threshold || near_identical {
            self.consecutive_above = 0;
            return false;
        }

        self.consecutive_above += 1;
        if self.consecutive_above < MIN_CONSECUTIVE_ABOVE {
            return false;
        }

        let confirmed = match self.last_spike_timestamp_ms {
            None => true,
            Some(last) if timestamp_ms.saturating_sub(last) >= self.refractory_period_ms => true,
            // Inside the refractory window only a markedly stronger event
            // overrides the suppression.
            Some(_) => magnitude > self.last_spike_magnitude.unwrap_or(f64::INFINITY) + OVERRIDE_MARGIN,
        };

        if confirmed {
            self.last_spike_timestamp_ms = Some(timestamp_ms);
            self.last_spike_magnitude = Some(magnitude);
        }
        confirmed
    }
}

impl Default for BumpDetector {
    fn default() -> Self {
        Self::new()
    }
}
