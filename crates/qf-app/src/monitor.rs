//! Background polling of remote calculations.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::manager::{LifecycleManager, PollReport};

enum MonitorCommand {
    /// Scheduled cycle; the report is discarded.
    PollDue,
    PollNow(oneshot::Sender<PollReport>),
    Shutdown,
}

/// Drives `LifecycleManager::poll_remote_once` every poll interval, and
/// immediately after a remote submission.
///
/// Cycles never overlap: a single task runs them in order.
pub struct Monitor {
    commands: mpsc::Sender<MonitorCommand>,
    ticker: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl Monitor {
    /// Must be called inside a tokio runtime.
    pub fn spawn(manager: LifecycleManager) -> Self {
        let (commands, rx) = mpsc::channel(8);
        let ticker = tokio::spawn(tick(manager.clone(), commands.clone()));
        let poller = tokio::spawn(run_poller(manager, rx));
        Self {
            commands,
            ticker,
            poller,
        }
    }

    /// Run one cycle now and wait for its report.
    pub async fn poll_now(&self) -> AppResult<PollReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::PollNow(tx))
            .await
            .map_err(|_| AppError::MonitorStopped)?;
        rx.await.map_err(|_| AppError::MonitorStopped)
    }

    /// Let the in-flight cycle finish, then stop both tasks.
    pub async fn shutdown(self) {
        self.ticker.abort();
        if self.commands.send(MonitorCommand::Shutdown).await.is_ok() {
            let _ = self.poller.await;
        }
        info!("monitor stopped");
    }
}

async fn tick(manager: LifecycleManager, commands: mpsc::Sender<MonitorCommand>) {
    let mut ticks = interval(manager.config().poll_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = manager.poll_wakeup().notified() => {}
        }
        // A full queue already holds a pending cycle.
        if let Err(mpsc::error::TrySendError::Closed(_)) = commands.try_send(MonitorCommand::PollDue) {
            break;
        }
    }
}

async fn run_poller(manager: LifecycleManager, mut commands: mpsc::Receiver<MonitorCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            MonitorCommand::PollDue => {
                manager.poll_remote_once().await;
            }
            MonitorCommand::PollNow(reply) => {
                let report = manager.poll_remote_once().await;
                let _ = reply.send(report);
            }
            MonitorCommand::Shutdown => break,
        }
    }
    debug!("poller exiting");
}
