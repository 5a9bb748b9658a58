#![allow(dead_code)]

use ndarray::Array2;
use nicls_server::acquisition::{Frame, FrameCodec};
use nicls_server::bus::EventBus;
use nicls_server::config::ExperimentConfig;
use nicls_server::data_log::DataLog;
use nicls_server::jobs::PoolRegistry;
use nicls_server::protocol::{ServerContext, TaskServer};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(20);

/// Write a model file with `features` zero coefficients
pub fn write_model(dir: &Path, features: usize) -> PathBuf {
    let path = dir.join("model.json");
    let model = json!({
        "coef_": [vec![0.0; features]],
        "intercept_": [0.0],
        "classes_": [0, 1],
    });
    std::fs::write(&path, model.to_string()).unwrap();
    path
}

/// Synthetic amplifier: accepts one connection and streams encoded frames
pub struct DummyDevice {
    pub addr: SocketAddr,
    pub task: JoinHandle<u64>,
}

impl DummyDevice {
    /// Send `frames` frames of zeros, then keep the socket open until the
    /// reader hangs up
    pub async fn start(config: &ExperimentConfig, frames: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let codec = FrameCodec::from_config(config);
        let packet = codec
            .encode(&Frame::new(Array2::zeros((config.channels, config.datarate))))
            .unwrap();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sent = 0;
            for _ in 0..frames {
                if stream.write_all(&packet).await.is_err() {
                    break;
                }
                sent += 1;
            }
            let mut sink = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut sink).await;
            sent
        });

        Self { addr, task }
    }
}

/// Line client standing in for the task process
pub struct TaskClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TaskClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn send(&mut self, kind: &str, data: Value) {
        let message = json!({"type": kind, "time": 0.0, "data": data});
        self.send_raw(&message.to_string()).await;
    }

    /// Next message, or None once the server closed the connection
    pub async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the server")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Skip messages until one of type `kind` arrives
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await.expect("connection closed");
            if message["type"] == kind {
                return message;
            }
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(base_config: ExperimentConfig, data_log: DataLog) -> Self {
        let context = ServerContext {
            bus: EventBus::new(),
            pools: Arc::new(PoolRegistry::new()),
            data_log,
            base_config: Arc::new(base_config),
        };
        let server = TaskServer::bind("127.0.0.1:0", context).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}
