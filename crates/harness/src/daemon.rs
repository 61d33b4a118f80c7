//! Polling loop shared by the background daemons.
//!
//! A daemon only implements [`Daemon::tick`]. The supervisor calls it at a fixed interval, logs
//! failed ticks and keeps going until shutdown is requested through a `watch` flag. The flag is
//! checked before every tick and interrupts the sleep between ticks; a tick in flight is allowed
//! to finish.

use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use tokio::{sync::watch, task::JoinHandle};

/// A background job driven by [`supervise`].
pub trait Daemon: Send + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Run one iteration. Errors are logged by the supervisor and the loop continues.
    fn tick(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Drive `daemon` until `shutdown` turns `true` or its sender is dropped. Returns the daemon so
/// its final state can be inspected.
pub async fn supervise<D: Daemon>(
    mut daemon: D,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> D {
    tracing::info!(daemon = D::NAME, interval = ?interval, "Daemon started");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        if let Err(e) = daemon.tick().await {
            tracing::warn!(daemon = D::NAME, error = %format!("{e:#}"), "Daemon tick failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(daemon = D::NAME, "Daemon stopped");
    daemon
}

/// A daemon running in its own task.
#[derive(Debug)]
pub struct DaemonHandle<D> {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<D>,
}

impl<D: Daemon> DaemonHandle<D> {
    pub fn spawn(daemon: D, interval: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(daemon, interval, rx));
        Self { shutdown, task }
    }

    /// Request shutdown without waiting for it.
    pub fn request_stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait for the current tick to finish.
    pub async fn stop(self) -> Result<D> {
        self.request_stop();
        self.task
            .await
            .with_context(|| format!("{} task panicked", D::NAME))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct Counter {
        ticks: Arc<AtomicUsize>,
        fail_every_other: bool,
    }

    impl Daemon for Counter {
        const NAME: &'static str = "counter";

        async fn tick(&mut self) -> Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && n % 2 == 0 {
                anyhow::bail!("tick {n} failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_ticks_do_not_stop_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = DaemonHandle::spawn(
            Counter {
                ticks: ticks.clone(),
                fail_every_other: true,
            },
            Duration::from_millis(1),
        );

        while ticks.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.stop().await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = DaemonHandle::spawn(
            Counter {
                ticks: ticks.clone(),
                fail_every_other: false,
            },
            Duration::from_secs(3600),
        );

        while ticks.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let daemon = tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should not wait for the interval")
            .unwrap();
        assert_eq!(daemon.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_tick_after_early_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(true);

        supervise(
            Counter {
                ticks: ticks.clone(),
                fail_every_other: false,
            },
            Duration::from_millis(1),
            rx,
        )
        .await;

        drop(tx);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
