use std::path::Path;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::error::PluginError;

/// Everything the supervisor reacts to.
#[derive(Debug)]
pub enum SupervisorEvent {
    Fs(notify::Event),
    FsError(notify::Error),
    Signal(Signal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGHUP
    Reload,
    /// SIGINT, SIGTERM or SIGQUIT, carrying the signal name.
    Terminate(&'static str),
}

/// True if `event` reports the creation of `socket`.
pub fn socket_created(event: &notify::Event, socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == socket)
}

/// Watch `dir` (not recursively) and forward its events to `tx`.
///
/// The watcher stops when the returned value is dropped.
pub fn watch_plugin_dir(
    dir: &Path,
    tx: UnboundedSender<SupervisorEvent>,
) -> Result<RecommendedWatcher, PluginError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => SupervisorEvent::Fs(event),
            Err(e) => SupervisorEvent::FsError(e),
        };
        // the receiver is gone once the supervisor exits
        let _ = tx.send(event);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Forward SIGHUP, SIGINT, SIGTERM and SIGQUIT to `tx` until it closes.
pub fn forward_signals(
    tx: UnboundedSender<SupervisorEvent>,
) -> Result<JoinHandle<()>, PluginError> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                _ = hangup.recv() => Signal::Reload,
                _ = interrupt.recv() => Signal::Terminate("SIGINT"),
                _ = terminate.recv() => Signal::Terminate("SIGTERM"),
                _ = quit.recv() => Signal::Terminate("SIGQUIT"),
            };
            if tx.send(SupervisorEvent::Signal(sig)).is_err() {
                break;
            }
        }
    }))
}
