//! Periodic tick source.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcasts a tick on a fixed period, plus on demand.
pub struct Heartbeat {
    tx: broadcast::Sender<()>,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            period,
            task: Mutex::new(None),
        }
    }

    /// Begin ticking. The first periodic tick happens one full period from
    /// now; callers wanting an immediate tick use `tick_now`.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let tx = self.tx.clone();
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if tx.send(()).is_err() {
                    // Nobody is listening any more.
                    break;
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Fire one tick immediately.
    pub fn tick_now(&self) {
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
