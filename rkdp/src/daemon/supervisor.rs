use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::plugins::{Plugin, PluginFactory};

use super::events::{Signal, SupervisorEvent, socket_created};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    NeedsStart,
    Running,
    ShuttingDown,
}

/// Exponential hold-off between failed serve attempts.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
    not_before: Option<Instant>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max: max.max(min),
            current: None,
            not_before: None,
        }
    }

    /// Record a failed attempt and return the hold-off before the next one.
    pub fn failure(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        self.not_before = Some(Instant::now() + next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.not_before = None;
    }

    /// Time left before another attempt is allowed, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.not_before
            .map(|t| t.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

/// Keeps exactly one device plugin registered with the kubelet.
///
/// The plugin is rebuilt from scratch whenever the kubelet socket is created
/// again (kubelet restart) or on SIGHUP, and stopped for good on SIGINT,
/// SIGTERM or SIGQUIT. A failed serve is retried on the next event, no sooner
/// than the backoff allows.
pub struct Supervisor<F> {
    factory: F,
    kubelet_socket: PathBuf,
    active: Option<Box<dyn Plugin>>,
    state: MachineState,
    backoff: Backoff,
}

impl<F: PluginFactory> Supervisor<F> {
    pub fn new(config: &Config, factory: F) -> Self {
        Supervisor {
            factory,
            kubelet_socket: config.kubelet_socket(),
            active: None,
            state: MachineState::NeedsStart,
            backoff: Backoff::new(config.retry_min, config.retry_max),
        }
    }

    /// Drive the state machine until a terminate signal arrives or every
    /// event source is gone. Fails only if a plugin cannot be built.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<SupervisorEvent>,
    ) -> anyhow::Result<()> {
        loop {
            if self.state == MachineState::NeedsStart {
                if let Some(wait) = self.backoff.remaining() {
                    debug!("Holding off the next start for {wait:?}");
                    match tokio::time::timeout(wait, events.recv()).await {
                        Ok(Some(event)) => {
                            self.handle(event).await;
                            if self.state == MachineState::ShuttingDown {
                                break;
                            }
                            continue;
                        }
                        Ok(None) => {
                            self.shutdown().await;
                            break;
                        }
                        Err(_) => {}
                    }
                }
                self.try_start().await?;
            }

            match events.recv().await {
                Some(event) => self.handle(event).await,
                None => {
                    warn!("All event sources closed, shutting down.");
                    self.shutdown().await;
                }
            }
            if self.state == MachineState::ShuttingDown {
                break;
            }
        }
        Ok(())
    }

    async fn try_start(&mut self) -> anyhow::Result<()> {
        self.stop_active().await;

        let mut plugin = self
            .factory
            .build()
            .await
            .context("failed to build device plugin")?;
        match plugin.serve().await {
            Ok(()) => {
                self.active = Some(plugin);
                self.state = MachineState::Running;
                self.backoff.reset();
            }
            Err(e) => {
                let wait = self.backoff.failure();
                error!(
                    "Could not contact kubelet, retrying on the next event after {wait:?}. \
                     Did you enable the device plugin feature gate? {e}"
                );
            }
        }
        Ok(())
    }

    async fn handle(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Fs(event) => {
                if socket_created(&event, &self.kubelet_socket) {
                    info!("inotify: {:?} created, restarting.", self.kubelet_socket);
                    self.restart().await;
                }
            }
            SupervisorEvent::FsError(e) => warn!("inotify: {e}"),
            SupervisorEvent::Signal(Signal::Reload) => {
                info!("Received SIGHUP, restarting.");
                self.restart().await;
            }
            SupervisorEvent::Signal(Signal::Terminate(name)) => {
                info!("Received signal \"{name}\", shutting down.");
                self.shutdown().await;
            }
        }
    }

    async fn restart(&mut self) {
        self.stop_active().await;
        self.state = MachineState::NeedsStart;
    }

    async fn shutdown(&mut self) {
        self.stop_active().await;
        self.state = MachineState::ShuttingDown;
    }

    /// Stop and drop the active plugin. Cleanup errors are only logged.
    async fn stop_active(&mut self) {
        if let Some(mut plugin) = self.active.take()
            && let Err(e) = plugin.stop().await
        {
            warn!("Failed to stop device plugin: {e}");
        }
    }
}
