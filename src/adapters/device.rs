//! Simulated device services.

use log::info;

use crate::app::ports::DevicePort;

/// xorshift-backed [`DevicePort`] that records poll-rate changes and resets.
#[derive(Debug, Clone)]
pub struct SimDevice {
    rng: u32,
    /// When set, `random_u16` always returns this value.
    fixed_random: Option<u16>,
    poll_rates: Vec<u32>,
    resets: u32,
}

impl SimDevice {
    pub fn new(seed: u32) -> Self {
        Self {
            rng: seed.max(1),
            fixed_random: None,
            poll_rates: Vec::new(),
            resets: 0,
        }
    }

    pub fn with_fixed_random(value: u16) -> Self {
        Self {
            fixed_random: Some(value),
            ..Self::new(1)
        }
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn poll_rate(&self) -> Option<u32> {
        self.poll_rates.last().copied()
    }

    pub fn poll_rate_history(&self) -> &[u32] {
        &self.poll_rates
    }
}

impl DevicePort for SimDevice {
    fn random_u16(&mut self) -> u16 {
        if let Some(v) = self.fixed_random {
            return v;
        }
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        (x >> 16) as u16
    }

    fn set_poll_rate(&mut self, period_ms: u32) {
        self.poll_rates.push(period_ms);
    }

    fn system_reset(&mut self) {
        self.resets += 1;
        info!("SimDevice: system reset #{}", self.resets);
    }
}
