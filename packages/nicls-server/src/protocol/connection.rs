// Control connection state machine
//
// One task process per connection. Lines are parsed and handled strictly in
// order; responses and classifier results share one outbound queue drained
// by a writer task, so a slow socket never stalls frame processing.

use super::message::{read_line, MessageType, ProtocolError, TaskMessage};
use crate::acquisition::{AcquisitionReader, StreamError};
use crate::bus::{EventBus, SubscriptionId};
use crate::classifier::model::{LogisticModel, ModelError};
use crate::classifier::{Classifier, ClassifierTopic};
use crate::config::{ConfigError, ExperimentConfig};
use crate::data_log::DataLog;
use crate::jobs::PoolRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Process-wide collaborators shared by every connection
#[derive(Clone)]
pub struct ServerContext {
    pub bus: EventBus,
    pub pools: Arc<PoolRegistry>,
    pub data_log: DataLog,
    /// Defaults that CONFIGURE payloads are overlaid on
    pub base_config: Arc<ExperimentConfig>,
}

#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl SetupError {
    fn response(&self) -> MessageType {
        match self {
            SetupError::Config(ConfigError::AlreadyConfigured)
            | SetupError::Config(ConfigError::PoolAlreadyInitialized)
            | SetupError::Stream(_) => MessageType::ErrorInConfiguration,
            SetupError::Config(_) | SetupError::Model(_) => MessageType::ErrorInConfigFile,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

// Everything created by a successful CONFIGURE
struct Session {
    config: Arc<ExperimentConfig>,
    classifier: Classifier,
    results: SubscriptionId,
    reader_cancel: CancellationToken,
    reader_task: JoinHandle<()>,
}

pub struct TaskConnection<S> {
    stream: S,
    peer: String,
    context: ServerContext,
}

impl<S> TaskConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>, context: ServerContext) -> Self {
        Self {
            stream,
            peer: peer.into(),
            context,
        }
    }

    /// Serve the connection until the task disconnects, a fatal error
    /// occurs or `cancel` fires. Every resource the session created is
    /// released before this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProtocolError> {
        let TaskConnection {
            stream,
            peer,
            context,
        } = self;
        info!(%peer, "Task connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half);
        let (tx, rx) = mpsc::unbounded_channel::<TaskMessage>();
        let writer = tokio::spawn(write_messages(
            write_half,
            rx,
            context.data_log.clone(),
            peer.clone(),
        ));

        let mut handler = Handler {
            context,
            peer: peer.clone(),
            tx,
            session: None,
        };

        let outcome = loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(%peer, "Closing task connection for shutdown");
                    break Ok(());
                }
                line = read_line(&mut lines) => line,
            };

            match line {
                Ok(Some(line)) => {
                    if handler.handle_line(&line).await == Flow::Close {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    info!(%peer, "Task disconnected");
                    break Ok(());
                }
                Err(e) => {
                    error!(%peer, "Control connection failed: {}", e);
                    break Err(e);
                }
            }
        };

        handler.teardown().await;
        drop(handler);
        if let Err(e) = writer.await {
            error!(%peer, "Writer task failed: {}", e);
        }
        info!(%peer, "Task connection closed");
        outcome
    }
}

async fn write_messages<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<TaskMessage>,
    data_log: DataLog,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = message.to_line();
        let sent = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = sent {
            warn!(%peer, kind = %message.kind, "Failed to send message: {}", e);
            break;
        }
        debug!(%peer, kind = %message.kind, "Sent message");
        data_log.sent(&message);
    }
    if let Err(e) = writer.shutdown().await {
        debug!(%peer, "Socket shutdown failed: {}", e);
    }
}

struct Handler {
    context: ServerContext,
    peer: String,
    tx: mpsc::UnboundedSender<TaskMessage>,
    session: Option<Session>,
}

impl Handler {
    fn reply(&self, message: TaskMessage) {
        if self.tx.send(message).is_err() {
            debug!(peer = %self.peer, "Writer closed, response dropped");
        }
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        if line.trim().is_empty() {
            return Flow::Continue;
        }

        let message = match TaskMessage::from_line(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer, "Rejected message: {}", e);
                self.reply(TaskMessage::error(e));
                return Flow::Continue;
            }
        };

        debug!(peer = %self.peer, kind = %message.kind, "Received message");
        self.context.data_log.received(&message);
        self.handle(message).await
    }

    async fn handle(&mut self, message: TaskMessage) -> Flow {
        match message.kind {
            MessageType::Connected => {
                self.reply(TaskMessage::new(MessageType::ConnectedOk));
                Flow::Continue
            }
            MessageType::Heartbeat => {
                self.reply(TaskMessage::new(MessageType::HeartbeatOk));
                Flow::Continue
            }
            MessageType::Configure => self.configure(&message.data).await,
            MessageType::ClassifierOn
            | MessageType::ClassifierOff
            | MessageType::Encoding
            | MessageType::ReadOnlyState => self.control(&message),
            other => {
                warn!(peer = %self.peer, kind = %other, "Unexpected message from task");
                self.reply(TaskMessage::error(format!(
                    "{} is not accepted from a task",
                    other
                )));
                Flow::Continue
            }
        }
    }

    async fn configure(&mut self, overrides: &Map<String, Value>) -> Flow {
        match self.start_session(overrides).await {
            Ok(session) => {
                let data = match serde_json::to_value(session.config.as_ref()) {
                    Ok(Value::Object(data)) => data,
                    _ => Map::new(),
                };
                info!(
                    peer = %self.peer,
                    channels = session.config.channels,
                    samplerate = session.config.samplerate,
                    "Session configured"
                );
                self.session = Some(session);
                self.reply(TaskMessage::with_data(MessageType::ConfigureOk, data));
                Flow::Continue
            }
            Err(e) => {
                error!(peer = %self.peer, "Configuration failed: {}", e);
                self.reply(TaskMessage::failure(e.response(), &e));
                Flow::Close
            }
        }
    }

    async fn start_session(&self, overrides: &Map<String, Value>) -> Result<Session, SetupError> {
        if self.session.is_some() {
            return Err(ConfigError::AlreadyConfigured.into());
        }

        let config = self.context.base_config.with_overrides(overrides)?;
        config.validate()?;
        let model_path = config
            .model_path
            .as_ref()
            .ok_or(ConfigError::MissingValue("model_path"))?;
        let model = LogisticModel::load(model_path)?;
        model.check_features(config.feature_count())?;

        let pool = match self.context.pools.get() {
            Some(pool) => pool,
            None => self.context.pools.initialize(config.workers)?,
        };
        if pool.size() != config.workers {
            warn!(
                peer = %self.peer,
                requested = config.workers,
                workers = pool.size(),
                "Worker pool already running with a different size"
            );
        }

        let config = Arc::new(config);
        let bus = self.context.bus.clone();
        let reader = AcquisitionReader::new(&config, bus.clone());
        let stream = reader.connect().await?;

        let classifier = Classifier::new(
            Arc::clone(&config),
            Arc::new(model),
            pool,
            bus.clone(),
            reader.id(),
        );

        let results_tx = self.tx.clone();
        let results = bus.subscribe::<ClassifierTopic, _>(classifier.id(), move |result| {
            // Connection already gone; the result has nowhere to go
            let _ = results_tx.send(TaskMessage::classifier_result(result));
            Ok(())
        });

        let reader_cancel = CancellationToken::new();
        let token = reader_cancel.clone();
        let status_tx = self.tx.clone();
        let peer = self.peer.clone();
        let reader_task = tokio::spawn(async move {
            match reader.run(stream, token).await {
                Ok(frames) => info!(%peer, frames, "Acquisition reader finished"),
                Err(e) => {
                    let _ = status_tx.send(TaskMessage::error(format!(
                        "Acquisition stream failed: {}",
                        e
                    )));
                }
            }
        });

        Ok(Session {
            config,
            classifier,
            results,
            reader_cancel,
            reader_task,
        })
    }

    fn control(&self, message: &TaskMessage) -> Flow {
        let Some(session) = &self.session else {
            warn!(peer = %self.peer, kind = %message.kind, "Command before CONFIGURE");
            self.reply(TaskMessage::error(format!(
                "{} requires a configured session",
                message.kind
            )));
            return Flow::Continue;
        };
        let classifier = &session.classifier;

        match message.kind {
            MessageType::ClassifierOn => classifier.enable(),
            MessageType::ClassifierOff => classifier.disable(),
            MessageType::Encoding => match message.flag("enable") {
                Ok(enable) => classifier.set_encoding(enable.unwrap_or(true)),
                Err(e) => {
                    warn!(peer = %self.peer, "Rejected ENCODING: {}", e);
                    self.reply(TaskMessage::error(e));
                }
            },
            MessageType::ReadOnlyState => {
                let enable = match message.flag("enable") {
                    Ok(Some(enable)) => enable,
                    Ok(None) => {
                        self.reply(TaskMessage::error(ProtocolError::InvalidField {
                            field: "enable",
                            reason: "required".to_string(),
                        }));
                        return Flow::Continue;
                    }
                    Err(e) => {
                        warn!(peer = %self.peer, "Rejected READ_ONLY_STATE: {}", e);
                        self.reply(TaskMessage::error(e));
                        return Flow::Continue;
                    }
                };

                if let Err(e) = classifier.set_read_only(enable) {
                    error!(peer = %self.peer, "Baseline finalization failed: {}", e);
                    self.reply(TaskMessage::error(e));
                    return Flow::Close;
                }
            }
            _ => {}
        }
        Flow::Continue
    }

    async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        self.context.bus.unsubscribe(session.results);
        session.reader_cancel.cancel();
        if let Err(e) = session.reader_task.await {
            error!(peer = %self.peer, "Acquisition reader task failed: {}", e);
        }
        session.classifier.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream};

    fn context(base: ExperimentConfig) -> ServerContext {
        ServerContext {
            bus: EventBus::new(),
            pools: Arc::new(PoolRegistry::new()),
            data_log: DataLog::disabled(),
            base_config: Arc::new(base),
        }
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Option<Value> {
            self.lines
                .next_line()
                .await
                .unwrap()
                .map(|line| serde_json::from_str(&line).unwrap())
        }
    }

    fn start(
        context: ServerContext,
    ) -> (Client, JoinHandle<Result<(), ProtocolError>>, CancellationToken) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(TaskConnection::new(server, "test", context).run(cancel.clone()));
        let (read_half, writer) = tokio::io::split(client);
        (
            Client {
                lines: BufReader::new(read_half).lines(),
                writer,
            },
            task,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_handshake_and_heartbeat() {
        let (mut client, task, _cancel) = start(context(ExperimentConfig::default()));

        client.send(r#"{"type": "CONNECTED", "time": 1.0, "data": {}}"#).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["type"], "CONNECTED_OK");
        assert!(reply["data"].as_object().unwrap().is_empty());

        client.send(r#"{"type": "HEARTBEAT"}"#).await;
        assert_eq!(client.recv().await.unwrap()["type"], "HEARTBEAT_OK");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_lines_get_error_and_connection_survives() {
        let (mut client, task, _cancel) = start(context(ExperimentConfig::default()));

        client.send("{oops").await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["type"], "ERROR");
        assert!(reply["data"]["error"].as_str().unwrap().contains("Malformed"));

        client.send(r#"{"type": "SELF_DESTRUCT"}"#).await;
        assert_eq!(client.recv().await.unwrap()["type"], "ERROR");

        client.send(r#"{"type": "CLASSIFIER_ON"}"#).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["type"], "ERROR");
        assert!(reply["data"]["error"]
            .as_str()
            .unwrap()
            .contains("requires a configured session"));

        client.send(r#"{"type": "HEARTBEAT"}"#).await;
        assert_eq!(client.recv().await.unwrap()["type"], "HEARTBEAT_OK");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_configuration_closes_connection() {
        let (mut client, task, _cancel) = start(context(ExperimentConfig::default()));

        // Defaults carry no model path
        client.send(r#"{"type": "CONFIGURE", "data": {"channels": 4}}"#).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply["type"], "ERROR_IN_CONFIG_FILE");
        assert!(reply["data"]["error"].as_str().unwrap().contains("model_path"));

        assert!(client.recv().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_amplifier_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.json");
        let base = ExperimentConfig {
            channels: 2,
            freq_count: 3,
            model_path: Some(model_path.clone()),
            ..Default::default()
        };
        std::fs::write(
            &model_path,
            json!({"coef_": [vec![0.0; 6]], "intercept_": [0.0]}).to_string(),
        )
        .unwrap();

        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut client, task, _cancel) = start(context(base));
        client
            .send(&json!({"type": "CONFIGURE", "data": {"biosemi_port": port}}).to_string())
            .await;
        assert_eq!(client.recv().await.unwrap()["type"], "ERROR_IN_CONFIGURATION");
        assert!(client.recv().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_idle_connection() {
        let (mut client, task, cancel) = start(context(ExperimentConfig::default()));
        client.send(r#"{"type": "CONNECTED"}"#).await;
        assert_eq!(client.recv().await.unwrap()["type"], "CONNECTED_OK");

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(client.recv().await.is_none());
    }

    #[test]
    fn test_setup_error_mapping() {
        assert_eq!(
            SetupError::from(ConfigError::AlreadyConfigured).response(),
            MessageType::ErrorInConfiguration
        );
        assert_eq!(
            SetupError::from(ConfigError::PoolAlreadyInitialized).response(),
            MessageType::ErrorInConfiguration
        );
        assert_eq!(
            SetupError::from(StreamError::Network("refused".into())).response(),
            MessageType::ErrorInConfiguration
        );
        assert_eq!(
            SetupError::from(ConfigError::MissingValue("model_path")).response(),
            MessageType::ErrorInConfigFile
        );
        assert_eq!(
            SetupError::from(ModelError::Invalid("empty".into())).response(),
            MessageType::ErrorInConfigFile
        );
    }
}
