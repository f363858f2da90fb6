use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-context counters, accumulated only while `Settings::debug` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub number_of_operations: u64,
    pub nano_seconds_data_copy: u64,
    pub nano_seconds_program_build: u64,
    pub nano_seconds_calculation: u64,
    pub number_of_program_builds: u64,
}

impl DebugInfo {
    pub fn add_operations(&mut self, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.number_of_operations = self.number_of_operations.saturating_add(count);
    }

    pub fn add_data_copy(&mut self, duration: Duration) {
        self.nano_seconds_data_copy = self.nano_seconds_data_copy.saturating_add(nanos(duration));
    }

    pub fn add_program_build(&mut self, duration: Duration) {
        self.nano_seconds_program_build = self
            .nano_seconds_program_build
            .saturating_add(nanos(duration));
        self.number_of_program_builds = self.number_of_program_builds.saturating_add(1);
    }

    pub fn add_calculation(&mut self, duration: Duration) {
        self.nano_seconds_calculation = self
            .nano_seconds_calculation
            .saturating_add(nanos(duration));
    }
}

fn nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}
