// Task server: accepts control connections and runs each on its own task

use super::connection::{ServerContext, TaskConnection};
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub struct TaskServer {
    listener: TcpListener,
    context: ServerContext,
}

impl TaskServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, context: ServerContext) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for every open
    /// connection to wind down.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "Task server listening"),
            Err(e) => warn!("Task server listening on unknown address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept task connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer, "Failed to set TCP_NODELAY: {}", e);
            }

            let connection = TaskConnection::new(stream, peer.to_string(), self.context.clone());
            let cancel = shutdown.child_token();
            tracker.spawn(async move {
                if let Err(e) = connection.run(cancel).await {
                    warn!(%peer, "Task connection ended with error: {}", e);
                }
            });
        }

        tracker.close();
        info!(open = tracker.len(), "Task server stopping, waiting for connections");
        tracker.wait().await;
        info!("Task server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::ExperimentConfig;
    use crate::data_log::DataLog;
    use crate::jobs::PoolRegistry;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn context() -> ServerContext {
        ServerContext {
            bus: EventBus::new(),
            pools: Arc::new(PoolRegistry::new()),
            data_log: DataLog::disabled(),
            base_config: Arc::new(ExperimentConfig::default()),
        }
    }

    #[tokio::test]
    async fn test_serves_concurrent_connections_and_shuts_down() {
        let server = TaskServer::bind("127.0.0.1:0", context()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let mut clients = Vec::new();
        for _ in 0..2 {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(b"{\"type\":\"HEARTBEAT\"}\n").await.unwrap();
            let mut lines = BufReader::new(read_half).lines();
            let reply = lines.next_line().await.unwrap().unwrap();
            assert!(reply.contains("HEARTBEAT_OK"));
            clients.push((lines, write_half));
        }

        shutdown.cancel();
        handle.await.unwrap();

        // Open connections were closed by the shutdown
        for (mut lines, _write_half) in clients {
            assert!(lines.next_line().await.unwrap().is_none());
        }
    }
}
