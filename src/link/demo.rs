use rand::Rng;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::pipeline::{SampleOrigin, SamplePipeline};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const DEMO_TICK: Duration = Duration::from_secs(1);

const START_VALUE: f64 = 50.0;
const MIN_VALUE: f64 = 10.0;
const MAX_VALUE: f64 = 100.0;
const NOISE_LEVEL: f64 = 5.0;
const FIRST_LEG_TICKS: u32 = 10;

/// Bounded random walk with alternating trend legs.
pub struct RandomWalk<R> {
    rng: R,
    value: f64,
    trend_direction: f64,
    trend_duration: u32,
    max_trend_duration: u32,
}

impl<R: Rng> RandomWalk<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            value: START_VALUE,
            trend_direction: 1.0,
            trend_duration: 0,
            max_trend_duration: FIRST_LEG_TICKS,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn trend_direction(&self) -> f64 {
        self.trend_direction
    }

    pub fn next_value(&mut self) -> f64 {
        self.trend_duration += 1;
        if self.trend_duration >= self.max_trend_duration {
            self.trend_direction = -self.trend_direction;
            self.trend_duration = 0;
            self.max_trend_duration = self.rng.gen_range(5..=15);
        }

        let trend = self.trend_direction * self.rng.gen_range(0.5..2.0);
        let noise = self.rng.gen_range(-NOISE_LEVEL..NOISE_LEVEL);
        self.value = (self.value + trend + noise).clamp(MIN_VALUE, MAX_VALUE);
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoExit {
    Cancelled,
    ReconnectRequested,
}

/// Publishes one synthetic sample per tick until cancelled or until an
/// operator asks for a reconnect. Uses its own pipeline, so it never
/// continues the live stream's filter state.
pub async fn run_demo<R: Rng + Send>(
    engine: &Engine,
    cancel: &CancellationToken,
    rng: R,
) -> DemoExit {
    log_info!("Starting demo data generation");
    engine.link.enter_demo();

    let mut pipeline = SamplePipeline::new(
        engine.settings.clone(),
        engine.link.clone(),
        engine.metrics.clone(),
        SampleOrigin::Demo,
    );
    let mut walk = RandomWalk::new(rng);

    let mut ticker = time::interval_at(Instant::now() + DEMO_TICK, DEMO_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log_info!("Demo data generation cancelled");
                return DemoExit::Cancelled;
            }
            _ = engine.reconnect_requested() => {
                log_info!("Reconnect requested, leaving demo mode");
                return DemoExit::ReconnectRequested;
            }
            _ = ticker.tick() => {
                let raw = walk.next_value();
                match pipeline.process_value(raw).await {
                    Ok(sample) => {
                        log_debug!(
                            "Generated demo data: raw={:.2}, filtered={:.2}",
                            sample.raw_value,
                            sample.filtered_value
                        );
                        engine.publish(sample).await;
                    }
                    Err(err) => {
                        log_warn!("Dropping demo sample: {err}");
                        engine.metrics.record_dropped().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use uuid::Uuid;

    #[test]
    fn walk_stays_in_bounds() {
        let mut walk = RandomWalk::new(StdRng::seed_from_u64(7));
        for _ in 0..10_000 {
            let v = walk.next_value();
            assert!((MIN_VALUE..=MAX_VALUE).contains(&v));
        }
    }

    #[test]
    fn first_leg_reverses_after_ten_ticks() {
        let mut walk = RandomWalk::new(StdRng::seed_from_u64(1));
        for _ in 0..9 {
            walk.next_value();
            assert_eq!(walk.trend_direction(), 1.0);
        }
        walk.next_value();
        assert_eq!(walk.trend_direction(), -1.0);
    }

    #[test]
    fn steps_are_bounded_by_trend_plus_noise() {
        let mut walk = RandomWalk::new(StdRng::seed_from_u64(99));
        let mut previous = walk.value();
        for _ in 0..1_000 {
            let next = walk.next_value();
            assert!((next - previous).abs() <= 2.0 + NOISE_LEVEL);
            previous = next;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_demo_samples_every_tick_until_cancelled() {
        let engine = Engine::default();
        let mut sub = engine.hub.subscribe(Uuid::new_v4());
        let cancel = CancellationToken::new();

        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_demo(&engine, &cancel, StdRng::seed_from_u64(3)).await })
        };

        let started = Instant::now();
        let first = sub.recv().await.unwrap();
        assert!(first.is_demo_data);
        assert!(!first.connection.connected);
        assert_eq!(first.filtered_value, first.calibrated_value);
        assert!(started.elapsed() >= DEMO_TICK);

        let second = sub.recv().await.unwrap();
        assert!(second.is_demo_data);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), DemoExit::Cancelled);
        assert!(engine.link.snapshot().is_demo());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_request_ends_demo() {
        let engine = Engine::default();
        let cancel = CancellationToken::new();
        engine.request_reconnect();
        let exit = run_demo(&engine, &cancel, StdRng::seed_from_u64(3)).await;
        assert_eq!(exit, DemoExit::ReconnectRequested);
    }
}
