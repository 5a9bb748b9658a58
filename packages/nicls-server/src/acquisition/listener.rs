// TCP acquisition reader
//
// Connects to the amplifier export and reads exactly one packet at a time.
// A clean close between packets ends the stream; a close inside a packet is
// an error.

use super::{Frame, FrameCodec, FrameTopic, StreamError, StreamResult};
use crate::bus::{EventBus, PublisherId};
use crate::config::ExperimentConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct AcquisitionReader {
    id: PublisherId,
    host: String,
    port: u16,
    codec: FrameCodec,
    bus: EventBus,
}

impl AcquisitionReader {
    pub fn new(config: &ExperimentConfig, bus: EventBus) -> Self {
        Self {
            id: PublisherId::new(),
            host: config.biosemi_host.clone(),
            port: config.biosemi_port,
            codec: FrameCodec::from_config(config),
            bus,
        }
    }

    /// Identity frames are published under
    pub fn id(&self) -> &PublisherId {
        &self.id
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Open the connection to the amplifier
    pub async fn connect(&self) -> StreamResult<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        info!(%addr, "Connecting to acquisition stream");

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| StreamError::Network(format!("connection to {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        info!(%addr, publisher = %self.id, "Acquisition stream connected");
        Ok(stream)
    }

    /// Read one whole packet. `Ok(None)` means the peer closed cleanly
    /// between packets.
    pub async fn read_frame<R>(&self, reader: &mut R) -> StreamResult<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut packet = vec![0u8; self.codec.packet_bytes()];
        if !read_packet(reader, &mut packet).await? {
            return Ok(None);
        }
        self.codec.decode(&packet).map(Some)
    }

    /// Publish frames until the stream ends or `cancel` fires.
    /// Returns the number of frames published.
    pub async fn run<R>(&self, mut reader: R, cancel: CancellationToken) -> StreamResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(publisher = %self.id, frames, "Acquisition reader stopped");
                    return Ok(frames);
                }
                next = self.read_frame(&mut reader) => next,
            };

            match next {
                Ok(Some(frame)) => {
                    let delivered = self.bus.publish::<FrameTopic>(&self.id, &Arc::new(frame))?;
                    frames += 1;
                    if frames == 1 {
                        debug!(publisher = %self.id, delivered, "First frame published");
                    }
                }
                Ok(None) => {
                    info!(publisher = %self.id, frames, "Acquisition stream closed by peer");
                    return Ok(frames);
                }
                Err(e) => {
                    error!(publisher = %self.id, frames, "Acquisition stream failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

// Returns false on EOF before the first byte
async fn read_packet<R>(reader: &mut R, packet: &mut [u8]) -> StreamResult<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < packet.len() {
        let n = reader.read(&mut packet[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(StreamError::Truncated {
                expected: packet.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireLayout;
    use ndarray::Array2;
    use parking_lot::Mutex;
    use tokio_test::io::Builder;

    fn small_config() -> ExperimentConfig {
        ExperimentConfig {
            channels: 2,
            datarate: 4,
            wire_layout: WireLayout::SampleMajor,
            ..Default::default()
        }
    }

    fn frame(seed: i32) -> Frame {
        Frame::new(Array2::from_shape_fn((2, 4), |(ch, s)| {
            seed * 100 - (ch as i32 * 10 + s as i32)
        }))
    }

    #[tokio::test]
    async fn test_reads_frames_split_across_reads() {
        let reader = AcquisitionReader::new(&small_config(), EventBus::new());
        let bytes = reader.codec().encode(&frame(1)).unwrap();

        let mut stream = Builder::new()
            .read(&bytes[..5])
            .read(&bytes[5..17])
            .read(&bytes[17..])
            .build();

        assert_eq!(reader.read_frame(&mut stream).await.unwrap(), Some(frame(1)));
        assert_eq!(reader.read_frame(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_frame_is_an_error() {
        let reader = AcquisitionReader::new(&small_config(), EventBus::new());
        let bytes = reader.codec().encode(&frame(1)).unwrap();

        let mut stream = Builder::new().read(&bytes[..10]).build();
        let err = reader.read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Truncated {
                expected: 24,
                received: 10
            }
        ));
    }

    #[tokio::test]
    async fn test_run_publishes_each_frame() {
        let bus = EventBus::new();
        let reader = AcquisitionReader::new(&small_config(), bus.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe::<FrameTopic, _>(reader.id(), move |frame| {
            sink.lock().push(frame.samples()[[0, 0]]);
            Ok(())
        });

        let mut script = Builder::new();
        for seed in 1..=3 {
            script.read(&reader.codec().encode(&frame(seed)).unwrap());
        }

        let published = reader
            .run(script.build(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(published, 3);
        assert_eq!(*seen.lock(), vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_run_surfaces_truncation() {
        let reader = AcquisitionReader::new(&small_config(), EventBus::new());
        let bytes = reader.codec().encode(&frame(1)).unwrap();

        let stream = Builder::new().read(&bytes).read(&bytes[..3]).build();
        let result = reader.run(stream, CancellationToken::new()).await;
        assert!(matches!(result, Err(StreamError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_run_surfaces_handler_errors() {
        let bus = EventBus::new();
        let reader = AcquisitionReader::new(&small_config(), bus.clone());
        bus.subscribe::<FrameTopic, _>(reader.id(), |_| anyhow::bail!("consumer rejected frame"));

        let bytes = reader.codec().encode(&frame(1)).unwrap();
        let result = reader
            .run(Builder::new().read(&bytes).build(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StreamError::Publish(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let reader = AcquisitionReader::new(&small_config(), EventBus::new());
        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(reader.run(server, cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ExperimentConfig {
            biosemi_port: port,
            ..small_config()
        };
        let reader = AcquisitionReader::new(&config, EventBus::new());
        assert!(matches!(
            reader.connect().await,
            Err(StreamError::Network(_))
        ));
    }
}
