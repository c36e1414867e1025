//! Cooperative shutdown.
//!
//! The processor never cancels an in-flight upstream call; it stops dispatching new
//! items once the signal fires, lets the window's running items finish, then saves
//! the checkpoint and caches.

use tokio::sync::watch;

/// Fires the paired [`ShutdownSignal`]s.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cloneable, awaitable shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A trigger/signal pair driven by the caller.
    pub fn manual() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender makes `changed()` error, which `cancelled` treats as pending.
        drop(tx);
        ShutdownSignal { rx }
    }

    /// A signal that fires on Ctrl+C or SIGTERM. Must be called inside a runtime.
    pub fn from_os_signals() -> Self {
        let (trigger, signal) = Self::manual();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            trigger.trigger();
        });
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Pending forever for [`ShutdownSignal::never`].
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_os_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, finishing in-flight items"),
        _ = terminate => tracing::info!("received SIGTERM, finishing in-flight items"),
    }
}
