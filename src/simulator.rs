//! Synthetic telemetry source.
//!
//! Generates readings for a fleet of virtual machines. The last machine of the
//! fleet runs in failure mode: its degradation factor grows every tick and
//! drags temperature, vibration and current up and rpm down.

use crate::config::SimulatorConfig;
use crate::telemetry::Reading;
use crate::transport::{topics, Channel, ChannelError};
use bytes::Bytes;
use chrono::{DateTime, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BASE_TEMPERATURE: f64 = 65.0;
const BASE_VIBRATION: f64 = 2.0;
const BASE_CURRENT: f64 = 10.0;
const BASE_PRESSURE: f64 = 6.0;
const BASE_RPM: f64 = 1500.0;

/// Degradation stops growing here so readings stay physically plausible.
const MAX_DEGRADATION: f64 = 3.0;

pub struct VirtualMachine {
    machine_id: String,
    failure_mode: bool,
    runtime_hours: f64,
    cycle: u64,
    degradation: f64,
}

impl VirtualMachine {
    pub fn new(machine_id: impl Into<String>, failure_mode: bool) -> Self {
        Self {
            machine_id: machine_id.into(),
            failure_mode,
            runtime_hours: 0.0,
            cycle: 0,
            degradation: 0.0,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn failure_mode(&self) -> bool {
        self.failure_mode
    }

    pub fn degradation(&self) -> f64 {
        self.degradation
    }

    /// Produce the next reading and advance the machine by one tick.
    pub fn next_reading(&mut self, now: DateTime<Utc>, rng: &mut StdRng) -> Reading {
        let load = 1.0 + 0.2 * (2.0 * PI * now.hour() as f64 / 24.0).sin();

        if self.failure_mode {
            self.degradation =
                (self.degradation + rng.gen_range(0.001..0.005)).min(MAX_DEGRADATION);
        }
        let d = self.degradation;

        let temperature = BASE_TEMPERATURE * load + d * 15.0 + gauss(rng, 2.0);
        let wobble = 0.5 * (self.cycle as f64 * 0.1).sin();
        let vibration = (BASE_VIBRATION + d * 3.0 + gauss(rng, 0.3) + wobble).max(0.0);
        let current = BASE_CURRENT * load + d * 5.0 + gauss(rng, 0.5);
        let pressure = BASE_PRESSURE + gauss(rng, 0.2);
        let rpm = BASE_RPM + gauss(rng, 50.0) - d * 100.0;

        self.cycle += 1;
        self.runtime_hours += 0.001;

        let mut reading = Reading::new(
            self.machine_id.clone(),
            now,
            round2(temperature),
            round2(vibration),
            round2(current),
            round2(pressure),
            rpm.round(),
        );
        reading.runtime_hours = Some(round2(self.runtime_hours));
        reading.degradation_level = Some((d * 1000.0).round() / 10.0);
        reading
    }
}

/// A fleet of virtual machines sharing one random source.
pub struct Simulator {
    machines: Vec<VirtualMachine>,
    rng: StdRng,
}

impl Simulator {
    /// `count` machines named `MACHINE_001...`; the last one degrades.
    pub fn new(count: usize, seed: Option<u64>) -> Self {
        let machines = (0..count)
            .map(|i| VirtualMachine::new(format!("MACHINE_{:03}", i + 1), i + 1 == count))
            .collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { machines, rng }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(config.machines, config.seed)
    }

    pub fn machines(&self) -> &[VirtualMachine] {
        &self.machines
    }

    /// One reading per machine.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Reading> {
        let rng = &mut self.rng;
        self.machines.iter_mut().map(|m| m.next_reading(now, rng)).collect()
    }

    /// Generate one tick and publish each reading on its machine's sensor topic.
    pub async fn publish_tick(
        &mut self,
        channel: &dyn Channel,
        namespace: &str,
    ) -> Result<usize, ChannelError> {
        let readings = self.tick(Utc::now());
        for reading in &readings {
            let payload = serde_json::to_vec(reading)
                .map_err(|e| ChannelError::Publish(e.to_string()))?;
            channel
                .publish(&topics::sensors(namespace, &reading.machine_id), Bytes::from(payload))
                .await?;
        }
        Ok(readings.len())
    }
}

/// Publish a tick every `interval` until the task is aborted.
pub fn spawn(
    mut simulator: Simulator,
    channel: Arc<dyn Channel>,
    namespace: String,
    interval: Duration,
) -> JoinHandle<()> {
    for m in simulator.machines().iter().filter(|m| m.failure_mode()) {
        info!(machine = %m.machine_id(), "simulated machine in degradation mode");
    }
    info!(machines = simulator.machines().len(), ?interval, "telemetry simulator started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            match simulator.publish_tick(channel.as_ref(), &namespace).await {
                Ok(n) => {
                    ticks += 1;
                    debug!(tick = ticks, readings = n, "simulated readings published");
                }
                Err(e) => warn!(error = %e, "failed to publish simulated readings"),
            }
        }
    })
}

/// Standard normal sample scaled by `sigma` (Box-Muller).
fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
