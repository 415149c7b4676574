//! Periodic state reporting.
//!
//! The `Reporter` builds a small state document every `interval` seconds and
//! hands it to a [`StateSink`], normally the [`Device`]. Reports are sent
//! whether or not the device is connected; the device queues them while
//! offline and flushes the queue on reconnect.

use std::sync::Arc;

use devicelink_mqtt::{Device, DeviceError};
use serde_json::{json, Map, Value};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::config::report::ReportConfig;

/// Destination of state reports.
pub trait StateSink: Send + Sync {
    fn send_state(&self, state: &Value) -> Result<(), DeviceError>;
}

impl StateSink for Device {
    fn send_state(&self, state: &Value) -> Result<(), DeviceError> {
        Device::send_state(self, state)
    }
}

pub struct Reporter {
    sink: Arc<dyn StateSink>,
    config: ReportConfig,
    started: Instant,
    sequence: u64,
}

impl Reporter {
    pub fn new(sink: Arc<dyn StateSink>, config: ReportConfig) -> Self {
        Self {
            sink,
            config,
            started: Instant::now(),
            sequence: 0,
        }
    }

    /// Reports immediately, then once per interval, until the sink is gone.
    pub async fn run(mut self) {
        let period = Duration::from_secs(self.config.interval);
        info!("State reporting started (interval: {}s)", self.config.interval);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let state = self.next_state().await;
            match self.sink.send_state(&state) {
                Ok(()) => debug!("State report #{} queued", self.sequence),
                Err(DeviceError::KernelStopped) => {
                    error!("Device stopped, state reporting ends");
                    return;
                }
                Err(e) => error!("State report #{} failed: {}", self.sequence, e),
            }
        }
    }

    async fn next_state(&mut self) -> Value {
        self.sequence += 1;

        let mut state = Map::new();
        state.insert("sequence".into(), json!(self.sequence));
        if self.config.uptime {
            state.insert("uptime".into(), json!(self.started.elapsed().as_secs()));
        }
        if self.config.load_average {
            if let Some(load) = read_load_average().await {
                state.insert("load".into(), json!(load));
            }
        }
        for (key, value) in &self.config.attributes {
            state.insert(key.clone(), value.clone());
        }
        Value::Object(state)
    }
}

/// 1, 5 and 15 minute load averages from `/proc/loadavg`.
#[cfg(target_os = "linux")]
async fn read_load_average() -> Option<[f64; 3]> {
    match tokio::fs::read_to_string("/proc/loadavg").await {
        Ok(content) => parse_load_average(&content),
        Err(e) => {
            trace!("Could not read /proc/loadavg: {}", e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn read_load_average() -> Option<[f64; 3]> {
    None
}

fn parse_load_average(content: &str) -> Option<[f64; 3]> {
    let mut fields = content.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}
