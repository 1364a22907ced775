//! Supervisor (C7): owns process lifetime — wiring storage/transport/pool,
//! startup sequencing, and shutdown.
//!
//! Grounded on `main()`'s setup/teardown order: write the pidfile, unlink any
//! stale unix socket, build the VM pool, connect to the controller, announce
//! `SlaveHello`, run until a shutdown signal arrives, then unlink the socket
//! and remove the pidfile again on the way out.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::control::ControlLoop;
use crate::pool::InterpreterPool;
use crate::storage::{NullStorage, RemoteStorage, Storage};
use crate::transport::{ChannelTransport, Transport};
use crate::types::{SlaveSettings, StartupError};

/// Top-level worker process: the supervisor's view of everything that needs
/// to start up together and shut down together.
pub struct Worker {
    settings: SlaveSettings,
}

impl Worker {
    pub fn new(settings: SlaveSettings) -> Self {
        Worker { settings }
    }

    /// Run the worker until a shutdown signal (SIGINT/SIGTERM) arrives.
    pub async fn run(self) -> Result<(), StartupError> {
        let pid_file = "./pid";
        write_pidfile(pid_file);

        let unix_socket_path = format!("/tmp/slave_{}.sock", std::process::id());

        let storage: Arc<dyn Storage> = if self.settings.storage_addr.is_empty() {
            Arc::new(NullStorage)
        } else {
            Arc::new(RemoteStorage::new(self.settings.storage_addr.clone()))
        };

        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (dg_tx, dg_rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tcp_tx, dg_tx));

        let pool = InterpreterPool::init(
            self.settings.pool_size,
            &self.settings.script_entry,
            Arc::clone(&storage),
            Arc::clone(&transport),
        );
        tracing::info!(size = pool.size(), "vm pool ready");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let control_task = tokio::spawn(
            ControlLoop {
                settings: self.settings.clone(),
                pool,
                storage,
                transport,
                unix_socket_path: unix_socket_path.clone(),
            }
            .run(tcp_rx, dg_rx, shutdown_rx),
        );

        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        let _ = control_task.await;

        tracing::info!("disposing vm pool");
        pool.dispose();

        let _ = std::fs::remove_file(&unix_socket_path);
        remove_pidfile(pid_file);
        tracing::info!("worker exited");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn write_pidfile(path: &str) {
    if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
        tracing::warn!(path, error = %e, "failed to write pidfile");
    }
}

fn remove_pidfile(path: &str) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_new_retains_settings() {
        let settings = SlaveSettings { pool_size: 7, ..Default::default() };
        let worker = Worker::new(settings);
        assert_eq!(worker.settings.pool_size, 7);
    }
}
