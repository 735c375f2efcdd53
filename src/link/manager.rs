use anyhow::Result;
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{self, Duration},
};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::{SampleOrigin, SamplePipeline};
use crate::settings::ConnectionSettings;

use super::demo::{run_demo, DemoExit};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const HEARTBEAT: &[u8] = &[0x00];

/// Why a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    PeerClosed,
    HeartbeatFailed(String),
    ReadFailed(String),
    ReconnectRequested,
    Cancelled,
}

/// What to do after a failed attempt or a closed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ReconnectNow,
    RetryAfter(Duration),
    Demo,
}

/// Retry while fewer than `retry_attempts` consecutive attempts have
/// failed; after that the link falls back to demo data.
pub fn decide(attempts: u32, settings: &ConnectionSettings, reconnect_advised: bool) -> Decision {
    if reconnect_advised {
        Decision::ReconnectNow
    } else if attempts < settings.retry_attempts {
        Decision::RetryAfter(settings.reconnect_delay())
    } else {
        Decision::Demo
    }
}

/// Owns the instrument socket: connect, stream, heartbeat, retry and the
/// demo fallback once retries run out.
pub struct ConnectionManager {
    engine: Engine,
    cancel: CancellationToken,
    live: SamplePipeline,
}

impl ConnectionManager {
    pub fn new(engine: Engine, cancel: CancellationToken) -> Self {
        let live = SamplePipeline::new(
            engine.settings.clone(),
            engine.link.clone(),
            engine.metrics.clone(),
            SampleOrigin::Live,
        );
        Self {
            engine,
            cancel,
            live,
        }
    }

    /// Runs until cancelled. Connection failures are handled here and never
    /// surface as errors; an `Err` means something unexpected went wrong.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let settings = self.engine.settings.connection();
            settings.validate()?;

            match self.connect(&settings).await {
                Ok(Some(socket)) => {
                    let end = self.stream(socket, &settings).await;
                    log_info!("Socket closed ({end:?})");
                    match end {
                        StreamEnd::Cancelled => return Ok(()),
                        StreamEnd::PeerClosed => {
                            log_warn!("Received empty data, instrument closed the connection");
                            self.engine.link.mark_closing(None);
                        }
                        StreamEnd::HeartbeatFailed(err) => {
                            log_error!("Connection lost during heartbeat: {err}");
                            self.engine.link.mark_closing(Some(err));
                        }
                        StreamEnd::ReadFailed(err) => {
                            log_error!("Error while receiving data: {err}");
                            self.engine.link.mark_closing(Some(err));
                        }
                        StreamEnd::ReconnectRequested => {
                            self.engine.link.mark_closing(None);
                            self.restart_budget();
                            continue;
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    log_error!("Connection error: {err}");
                    self.engine.link.mark_failed(err.to_string());
                }
            }

            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let attempts = self.engine.link.snapshot().reconnect_attempts;
            let settings = self.engine.settings.connection();
            let advised = self.engine.settings.take_reconnect_advised();

            match decide(attempts, &settings, advised) {
                Decision::ReconnectNow => {
                    log_info!(
                        "Endpoint changed to {}, reconnecting immediately",
                        settings.address()
                    );
                    self.engine.link.reset_attempts();
                }
                Decision::RetryAfter(delay) => {
                    log_info!(
                        "Reconnecting in {}s (attempt {} of {})",
                        delay.as_secs(),
                        attempts,
                        settings.retry_attempts
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = self.engine.reconnect_requested() => self.restart_budget(),
                        _ = time::sleep(delay) => {}
                    }
                }
                Decision::Demo => {
                    log_warn!(
                        "Max reconnection attempts reached ({}), switching to demo data",
                        settings.retry_attempts
                    );
                    let exit = run_demo(&self.engine, &self.cancel, StdRng::from_entropy()).await;
                    match exit {
                        DemoExit::Cancelled => return Ok(()),
                        DemoExit::ReconnectRequested => {
                            self.restart_budget();
                            self.live.reset();
                        }
                    }
                }
            }
        }
    }

    /// A manual reconnect supersedes any pending endpoint-change advice.
    fn restart_budget(&self) {
        self.engine.settings.take_reconnect_advised();
        self.engine.link.reset_attempts();
    }

    /// `Ok(None)` means the attempt was cancelled.
    async fn connect(&self, settings: &ConnectionSettings) -> EngineResult<Option<TcpStream>> {
        let attempt = self.engine.link.begin_attempt();
        log_info!(
            "Connecting to instrument at {} (attempt {attempt})",
            settings.address()
        );

        let connecting = time::timeout(
            settings.timeout(),
            TcpStream::connect((settings.host.as_str(), settings.port)),
        );

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            result = connecting => result,
        };

        match result {
            Ok(Ok(socket)) => {
                if let Err(err) = socket.set_nodelay(true) {
                    log_debug!("Could not set TCP_NODELAY: {err}");
                }
                self.engine.link.mark_streaming(Utc::now());
                log_info!("Successfully connected to instrument at {}", settings.address());
                Ok(Some(socket))
            }
            Ok(Err(err)) => Err(EngineError::from(err)),
            Err(_) => Err(EngineError::TransientNetwork(format!(
                "Connection timeout after {} seconds",
                settings.timeout_seconds
            ))),
        }
    }

    /// Consumes the socket; it is closed when this returns.
    async fn stream(&mut self, mut socket: TcpStream, settings: &ConnectionSettings) -> StreamEnd {
        let mut buffer = vec![0u8; settings.buffer_size];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                _ = self.engine.reconnect_requested() => return StreamEnd::ReconnectRequested,
                read = time::timeout(settings.timeout(), socket.read(&mut buffer)) => read,
            };

            match read {
                Ok(Ok(0)) => return StreamEnd::PeerClosed,
                Ok(Ok(n)) => self.handle_payload(&buffer[..n]).await,
                Ok(Err(err)) => return StreamEnd::ReadFailed(err.to_string()),
                Err(_) => {
                    log_warn!("Timeout while receiving data, sending heartbeat");
                    let sent = time::timeout(settings.timeout(), socket.write_all(HEARTBEAT)).await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return StreamEnd::HeartbeatFailed(err.to_string()),
                        Err(_) => return StreamEnd::HeartbeatFailed("heartbeat timed out".into()),
                    }
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        match self.live.process(payload).await {
            Ok(sample) => {
                let report = self.engine.publish(sample).await;
                log_debug!(
                    "Sample published to {} subscribers ({} dropped)",
                    report.delivered,
                    report.dropped
                );
            }
            Err(err) => {
                log_warn!("Dropping sample: {err}");
                self.engine.metrics.record_dropped().await;
            }
        }
    }
}
