//! Stand-in compression used when no real engine is available.

use std::time::Duration;

use rand::Rng;

use super::progress::ProgressReporter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationProfile {
    /// Interval between progress increments.
    pub tick: Duration,
    /// Fraction of the source kept as the "compressed" result.
    pub size_ratio: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            size_ratio: 0.7,
        }
    }
}

impl SimulationProfile {
    /// Length of the simulated result for a source of `len` bytes.
    pub fn result_len(&self, len: usize) -> usize {
        let ratio = self.size_ratio.clamp(0.0, 1.0);
        ((len as f64) * ratio).floor() as usize
    }
}

/// Advances progress by a random 1-6% per tick until complete, then returns
/// a truncated copy of the source.
pub async fn simulate(source: &[u8], profile: &SimulationProfile, progress: &dyn ProgressReporter) -> Vec<u8> {
    let mut percent = 0.0f64;
    loop {
        tokio::time::sleep(profile.tick).await;
        // ThreadRng is not Send; keep it out of the await above.
        let step: f64 = rand::rng().random_range(1.0..6.0);
        percent = (percent + step).min(100.0);
        progress.report(percent.floor() as u8);
        if percent >= 100.0 {
            break;
        }
    }
    source[..profile.result_len(source.len())].to_vec()
}
