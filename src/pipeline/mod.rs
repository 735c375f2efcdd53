pub mod filter;
pub mod sample;

pub use filter::{decode_raw, FilterPipeline, FilterState, Reading};
pub use sample::{epoch_seconds, AdminSnapshot, ConnectionInfo, Sample, SampleOrigin};

use chrono::Utc;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::link::LinkState;
use crate::metrics::MetricsCollector;
use crate::settings::SettingsStore;

/// Turns payloads into complete [`Sample`]s for one source.
///
/// The live connection and the demo generator each build their own
/// instance so their filter state never mixes.
pub struct SamplePipeline {
    filter: FilterPipeline,
    settings: Arc<SettingsStore>,
    link: LinkState,
    metrics: MetricsCollector,
    origin: SampleOrigin,
}

impl SamplePipeline {
    pub fn new(
        settings: Arc<SettingsStore>,
        link: LinkState,
        metrics: MetricsCollector,
        origin: SampleOrigin,
    ) -> Self {
        Self {
            filter: FilterPipeline::new(settings.clone()),
            settings,
            link,
            metrics,
            origin,
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }

    pub async fn process(&mut self, raw_bytes: &[u8]) -> EngineResult<Sample> {
        let reading = self.filter.process_bytes(raw_bytes)?;
        Ok(self.assemble(reading).await)
    }

    pub async fn process_value(&mut self, raw: f64) -> EngineResult<Sample> {
        let reading = self.filter.process_value(raw)?;
        Ok(self.assemble(reading).await)
    }

    async fn assemble(&self, reading: Reading) -> Sample {
        let connection_settings = self.settings.connection();
        let mut connection = self.link.snapshot();
        let is_demo_data = self.origin == SampleOrigin::Demo;
        if is_demo_data {
            connection.connected = false;
        }

        let admin = AdminSnapshot {
            connection_info: ConnectionInfo {
                host: connection_settings.host.clone(),
                port: connection_settings.port,
                buffer_size: connection_settings.buffer_size,
            },
            system_stats: self.metrics.sample_system_stats().await,
        };

        log::debug!(
            "Processed sample: raw={:.2}, calibrated={:.2}, filtered={:.2}",
            reading.raw_value,
            reading.calibrated_value,
            reading.filtered_value
        );

        Sample {
            timestamp: Utc::now(),
            raw_value: reading.raw_value,
            calibrated_value: reading.calibrated_value,
            filtered_value: reading.filtered_value,
            calibration: reading.calibration,
            connection,
            connection_settings,
            admin,
            is_demo_data,
        }
    }
}
