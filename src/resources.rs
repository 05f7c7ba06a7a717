//! System resource sampling.
//!
//! One task samples CPU and memory on a fixed cadence and publishes the
//! latest values for the streaming admission checks. Under sustained
//! saturation it sheds load by tearing down a handful of streaming sessions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Settings;
use crate::streaming::StreamingSupervisor;

/// CPU level at which shedding kicks in (together with memory).
const SHED_THRESHOLD: f32 = 90.0;
/// CPU level at which an in-progress shed stops early.
const SHED_RELIEF: f32 = 70.0;
/// Sessions removed per shed pass at most.
const SHED_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

pub struct ResourceMonitor {
    settings: Arc<Settings>,
    latest: Mutex<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            latest: Mutex::new(ResourceSample::default()),
        })
    }

    /// Most recent sample; zeros until the first sampling pass completes.
    pub fn latest(&self) -> ResourceSample {
        *self.latest.lock()
    }

    /// Run the sampling loop forever. Shedding goes through the streaming
    /// supervisor so session accounting stays in one place.
    pub async fn run(self: Arc<Self>, streaming: Arc<StreamingSupervisor>) {
        info!(
            interval_secs = self.settings.resource_check_interval.as_secs(),
            "Resource monitor started"
        );
        let mut sys = System::new();

        loop {
            let sample = sample_system(&mut sys).await;
            *self.latest.lock() = sample;

            if sample.cpu_percent > SHED_THRESHOLD && sample.memory_percent > SHED_THRESHOLD {
                warn!(
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    "System resources critical"
                );
                self.shed_load(&streaming, &mut sys).await;
            }

            sleep(self.settings.resource_check_interval).await;
        }
    }

    async fn shed_load(&self, streaming: &Arc<StreamingSupervisor>, sys: &mut System) {
        let candidates = streaming.active_camera_ids();
        if candidates.len() <= SHED_LIMIT {
            return;
        }
        warn!(
            active = candidates.len(),
            "Shedding streaming sessions to relieve load"
        );

        for camera_id in candidates.into_iter().take(SHED_LIMIT) {
            info!(camera = camera_id, "Stopping stream under resource pressure");
            if let Err(e) = streaming.stop_stream(&camera_id).await {
                warn!(camera = camera_id, error = %e, "Shed stop failed");
            }
            sleep(Duration::from_secs(5)).await;

            let sample = sample_system(sys).await;
            *self.latest.lock() = sample;
            if sample.cpu_percent < SHED_RELIEF {
                info!(cpu = sample.cpu_percent, "System resources recovered");
                break;
            }
        }
    }
}

/// Two CPU refreshes one second apart give a meaningful usage figure.
async fn sample_system(sys: &mut System) -> ResourceSample {
    sys.refresh_cpu_usage();
    sleep(Duration::from_secs(1)).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total = sys.total_memory();
    let memory_percent = if total > 0 {
        (sys.used_memory() as f64 / total as f64 * 100.0) as f32
    } else {
        0.0
    };
    ResourceSample {
        cpu_percent: sys.global_cpu_usage(),
        memory_percent,
    }
}
