//! Line-oriented transport over TCP sockets and serial ports.
//!
//! Instruments in this class speak ASCII commands terminated by `\r` (or a
//! configured terminator) and reply with one terminated line.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::Transport;
use crate::device::{ConnectionDescriptor, TransportKind};
use crate::error::{LabError, LabResult};

trait LineStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineStream for T {}

/// Request/response transport over a byte stream.
pub struct LineTransport {
    kind: TransportKind,
    address: String,
    baud_rate: u32,
    terminator: String,
    exchange_timeout: Duration,
    stream: Option<BufReader<Box<dyn LineStream>>>,
}

impl std::fmt::Debug for LineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl LineTransport {
    fn from_descriptor(kind: TransportKind, descriptor: &ConnectionDescriptor) -> Self {
        Self {
            kind,
            address: descriptor.address.clone(),
            baud_rate: descriptor.baud_rate,
            terminator: descriptor.terminator.clone(),
            exchange_timeout: descriptor.exchange_timeout,
            stream: None,
        }
    }

    /// TCP transport to `host:port` (terminal servers, networked controllers).
    pub fn tcp(descriptor: &ConnectionDescriptor) -> Self {
        Self::from_descriptor(TransportKind::Tcp, descriptor)
    }

    /// Serial transport.
    #[cfg(feature = "tokio_serial")]
    pub fn serial(descriptor: &ConnectionDescriptor) -> Self {
        Self::from_descriptor(TransportKind::Serial, descriptor)
    }

    fn transport_error(&self, message: impl Into<String>) -> LabError {
        LabError::Transport {
            address: self.address.clone(),
            message: message.into(),
        }
    }
}

#[cfg_attr(not(feature = "tokio_serial"), allow(unused_variables))]
async fn connect_stream(
    kind: TransportKind,
    address: String,
    baud_rate: u32,
) -> LabResult<Box<dyn LineStream>> {
    match kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(address.as_str())
                .await
                .map_err(|e| LabError::TransportUnavailable {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(feature = "tokio_serial")]
        TransportKind::Serial => {
            use tokio_serial::SerialPortBuilderExt;

            let port = tokio_serial::new(address.as_str(), baud_rate)
                .open_native_async()
                .map_err(|e| LabError::TransportUnavailable {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
            Ok(Box::new(port))
        }
        _ => Err(LabError::TransportUnavailable {
            address,
            reason: format!("{kind:?} is not a line transport"),
        }),
    }
}

#[async_trait]
impl Transport for LineTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> LabResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = connect_stream(self.kind, self.address.clone(), self.baud_rate).await?;
        tracing::debug!(
            address = %self.address,
            kind = ?self.kind,
            baud_rate = self.baud_rate,
            "Line transport opened"
        );
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn close(&mut self) -> LabResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // Best effort: the peer may already be gone.
            let _ = stream.get_mut().shutdown().await;
            tracing::debug!(address = %self.address, "Line transport closed");
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &str) -> LabResult<String> {
        let terminator = self.terminator.clone();
        let delimiter = terminator.as_bytes().last().copied().unwrap_or(b'\n');
        let timeout = self.exchange_timeout;
        let address = self.address.clone();

        let Some(stream) = self.stream.as_mut() else {
            return Err(self.transport_error("transport not open"));
        };

        let io = async {
            let writer = stream.get_mut();
            writer.write_all(request.as_bytes()).await?;
            writer.write_all(terminator.as_bytes()).await?;
            writer.flush().await?;

            let mut reply = Vec::new();
            let read = stream.read_until(delimiter, &mut reply).await?;
            Ok::<_, std::io::Error>((read, reply))
        };

        let (read, reply) = match tokio::time::timeout(timeout, io).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(self.transport_error(e.to_string())),
            Err(_) => {
                return Err(self.transport_error(format!(
                    "no reply to '{request}' within {timeout:?}"
                )))
            }
        };
        if read == 0 {
            self.stream = None;
            return Err(LabError::Transport {
                address,
                message: "peer closed the connection".to_string(),
            });
        }

        let text = String::from_utf8_lossy(&reply);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn descriptor(address: String) -> ConnectionDescriptor {
        ConnectionDescriptor {
            kind: TransportKind::Tcp,
            address,
            baud_rate: 9600,
            terminator: "\r".to_string(),
            exchange_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn exchanges_terminated_lines_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"RATE 100\r");
            socket.write_all(b"OK\r").await.unwrap();
        });

        let mut transport = LineTransport::tcp(&descriptor(addr));
        assert!(!transport.is_open());
        transport.open().await.unwrap();
        let reply = transport.exchange("RATE 100").await.unwrap();
        assert_eq!(reply, "OK");

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        server.await.unwrap();
    }

    #[test]
    fn transports_are_sendable_trait_objects() {
        fn assert_send<T: Send>(_: &T) {}

        let mut transport = LineTransport::tcp(&descriptor("127.0.0.1:9".to_string()));
        assert_send(&transport.open());
        let boxed: Box<dyn Transport> = Box::new(transport);
        assert!(format!("{boxed:?}").contains("LineTransport"));
    }

    #[tokio::test]
    async fn exchange_on_closed_transport_fails() {
        let mut transport = LineTransport::tcp(&descriptor("127.0.0.1:9".to_string()));
        let err = transport.exchange("PING").await.unwrap_err();
        assert!(matches!(err, LabError::Transport { .. }));
    }
}
