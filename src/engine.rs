use std::sync::Arc;

use tokio::sync::Notify;

use crate::hub::{BroadcastHub, PublishReport};
use crate::link::LinkState;
use crate::metrics::MetricsCollector;
use crate::pipeline::Sample;
use crate::settings::SettingsStore;

/// Shared handles injected into the link, the supervisor and every client
/// session. Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct Engine {
    pub settings: Arc<SettingsStore>,
    pub link: LinkState,
    pub hub: BroadcastHub,
    pub metrics: MetricsCollector,
    reconnect: Arc<Notify>,
}

impl Engine {
    pub fn new(settings: SettingsStore, hub: BroadcastHub) -> Self {
        Self {
            settings: Arc::new(settings),
            link: LinkState::new(),
            hub,
            metrics: MetricsCollector::new(),
            reconnect: Arc::new(Notify::new()),
        }
    }

    /// Asks the link to drop whatever it is doing (streaming, waiting or
    /// generating demo data) and reconnect with a fresh retry budget.
    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub(crate) async fn reconnect_requested(&self) {
        self.reconnect.notified().await;
    }

    pub async fn publish(&self, sample: Sample) -> PublishReport {
        let is_demo = sample.is_demo_data;
        let report = self.hub.publish(sample);
        self.metrics.record_published(is_demo).await;
        report
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(SettingsStore::default(), BroadcastHub::default())
    }
}
