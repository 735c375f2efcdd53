use std::future::Future;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

use super::manager::ConnectionManager;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const MAX_BACKOFF_SECS: f64 = 60.0;
const RELAUNCH_DELAY: Duration = Duration::from_secs(1);

/// `min(2^failures + jitter, 60)` seconds.
pub fn backoff_delay(consecutive_failures: u32, jitter: f64) -> Duration {
    let exponent = consecutive_failures.min(16) as i32;
    let secs = (2f64.powi(exponent) + jitter).min(MAX_BACKOFF_SECS);
    Duration::from_secs_f64(secs)
}

/// Start/stop handle for the supervised connection task.
pub struct Supervisor {
    engine: Engine,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Supervisor {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            handle: None,
            cancel_token: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            bail!("supervisor already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(supervise(self.engine.clone(), cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn request_reconnect(&self) {
        self.engine.request_reconnect();
    }

    /// Cancels the active attempt (or demo generator) and waits for the
    /// socket to be released.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("supervisor task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

pub async fn supervise(engine: Engine, cancel: CancellationToken) {
    supervise_with(engine, cancel, |engine, token| async move {
        ConnectionManager::new(engine, token).run().await
    })
    .await
}

/// Relaunches whatever `launch` builds until `cancel` fires. Each run is
/// spawned as its own task so a panic is observed here as a failed join.
pub async fn supervise_with<F, Fut>(engine: Engine, cancel: CancellationToken, mut launch: F)
where
    F: FnMut(Engine, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    log_info!("Starting instrument supervisor");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let run = tokio::spawn(launch(engine.clone(), cancel.child_token()));
        let outcome = run.await;

        if cancel.is_cancelled() {
            break;
        }

        let delay = match outcome {
            Ok(Ok(())) => {
                log_info!("Connection manager exited, relaunching");
                RELAUNCH_DELAY
            }
            Ok(Err(err)) => {
                log_error!("Connection manager failed: {err:#}");
                schedule_restart(&engine)
            }
            Err(join_err) => {
                log_error!("Connection manager crashed: {join_err}");
                schedule_restart(&engine)
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
    }

    engine.link.mark_idle();
    log_info!("Instrument supervisor stopped");
}

fn schedule_restart(engine: &Engine) -> Duration {
    let failures = engine.link.supervisor_failures();
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    let delay = backoff_delay(failures, jitter);
    let attempt = engine.link.record_supervisor_failure();
    log_warn!(
        "Retrying in {:.1} seconds (attempt {attempt})",
        delay.as_secs_f64()
    );
    delay
}
