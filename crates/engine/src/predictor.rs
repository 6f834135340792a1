use std::collections::HashMap;
use std::sync::Mutex;

/// Exponentially-weighted demand estimator per runtime. `record` counts
/// arrivals; `tick` folds the interval's count into the moving average
/// and returns the current estimates. The prewarm control loop reads it
/// on a fixed interval; prediction stays a pluggable strategy behind this
/// type, not a hard requirement.
pub(crate) struct DemandEstimator {
    alpha: f64,
    state: Mutex<HashMap<String, RuntimeDemand>>,
}

#[derive(Default)]
struct RuntimeDemand {
    since_tick: u64,
    ewma: f64,
}

impl DemandEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, runtime: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.entry(runtime.to_string()).or_default().since_tick += 1;
        }
    }

    /// Advance one interval and return per-runtime demand estimates
    /// (requests per interval). Runtimes whose estimate decayed to noise
    /// are dropped so the map stays bounded.
    pub fn tick(&self) -> HashMap<String, f64> {
        let mut estimates = HashMap::new();
        let Ok(mut state) = self.state.lock() else {
            return estimates;
        };
        state.retain(|runtime, demand| {
            let count = std::mem::take(&mut demand.since_tick) as f64;
            demand.ewma = self.alpha * count + (1.0 - self.alpha) * demand.ewma;
            if demand.ewma < 0.01 {
                return false;
            }
            estimates.insert(runtime.clone(), demand.ewma);
            true
        });
        estimates
    }
}
