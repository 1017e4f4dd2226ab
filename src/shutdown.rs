//! Node shutdown on Ctrl-C or SIGTERM.
//!
//! Network servers are stopped first so neighbors see their links close
//! while the process is still healthy. Background tasks are cancelled next
//! and joined against one shared deadline; whatever is still running then
//! is aborted and reported by name.

use crate::network::server::NetServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub servers_stopped: usize,
    /// names of tasks aborted after the join deadline
    pub aborted: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

pub struct ShutdownManager {
    token: CancellationToken,
    servers: Vec<Arc<NetServer>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    join_timeout: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_join_timeout(JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(join_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            servers: Vec::new(),
            tasks: Vec::new(),
            join_timeout,
        }
    }

    /// Token handed to tasks that should stop with the node.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn add_server(&mut self, server: Arc<NetServer>) {
        self.servers.push(server);
    }

    pub fn register_task(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Block until the process is asked to terminate, then shut down.
    pub async fn wait_for_shutdown(self) -> ShutdownReport {
        match termination_signal().await {
            Ok(signal) => info!("🛑 {} received, shutting down", signal),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        self.shutdown().await
    }

    pub async fn shutdown(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for server in &self.servers {
            server.stop().await;
            report.servers_stopped += 1;
        }

        self.token.cancel();
        let deadline = Instant::now() + self.join_timeout;
        for (name, mut handle) in self.tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("⏱️  task {} did not stop in time, aborting", name);
                handle.abort();
                report.aborted.push(name);
            }
        }

        if report.is_clean() {
            info!(
                "✓ Shutdown complete, {} server(s) stopped",
                report.servers_stopped
            );
        }
        report
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::NetServerOptions;
    use crate::protocols::handlers::OnlyHeartbeatHandler;
    use crate::protocols::heartbeat::HeartbeatParams;
    use crate::protocols::P2P;
    use crate::scenario::{HarnessContext, TestParams};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_servers_stop_before_tasks_are_joined() {
        let ctx = HarnessContext::new(TestParams::default());
        let handler = Arc::new(OnlyHeartbeatHandler::new(HeartbeatParams::default()));
        let a = ctx
            .new_virtual_server("10.9.0.1:20338", handler.clone(), NetServerOptions::default())
            .unwrap();
        let b = ctx
            .new_virtual_server("10.9.0.2:20338", handler, NetServerOptions::default())
            .unwrap();
        a.start().await;
        b.start().await;
        b.connect_and_return_peer("10.9.0.1:20338").await.unwrap();

        let mut manager = ShutdownManager::new();
        let token = manager.token();
        let watched = a.clone();
        let closed_first = Arc::new(AtomicBool::new(false));
        let seen = closed_first.clone();
        manager.register_task(
            "watcher",
            tokio::spawn(async move {
                token.cancelled().await;
                seen.store(watched.is_closed(), Ordering::SeqCst);
            }),
        );
        manager.add_server(a.clone());

        let report = manager.shutdown().await;
        assert_eq!(report.servers_stopped, 1);
        assert!(report.is_clean());
        assert!(closed_first.load(Ordering::SeqCst));
        assert!(a.is_closed());
        assert!(!b.is_closed());
        ctx.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_aborted_and_named() {
        let mut manager = ShutdownManager::with_join_timeout(Duration::from_secs(2));
        let token = manager.token();
        manager.register_task("ticker", tokio::spawn(async move { token.cancelled().await }));
        manager.register_task(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );

        let report = manager.shutdown().await;
        assert_eq!(report.aborted, vec!["stuck"]);
        assert!(!report.is_clean());
    }
}
