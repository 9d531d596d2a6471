use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;

use crate::container::ContainerError;
use crate::protocol::{Request, Response};

/// Connect attempts before giving up on a provider socket. The retry exists
/// only to cover the provider's warm-up window right after spawn; it is not
/// a reconnect policy.
pub const DIAL_ATTEMPTS: u32 = 3;
pub const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on one full request/response exchange. A hung provider
/// otherwise stalls its caller forever.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the provider control socket: one synchronous JSON
/// request/response exchange per call, a fresh connection each time.
pub struct CheckChannel {
    socket_path: PathBuf,
    exchange_timeout: Duration,
}

impl CheckChannel {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            exchange_timeout: EXCHANGE_TIMEOUT,
        }
    }

    /// Overrides the default exchange timeout.
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    async fn dial(&self) -> Result<UnixStream, ContainerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    log::warn!(
                        "[channel] ({attempt}/{DIAL_ATTEMPTS}) dial error on {:?}: {e}",
                        self.socket_path
                    );
                    if attempt >= DIAL_ATTEMPTS {
                        return Err(ContainerError::DialFailed(self.socket_path.clone(), e));
                    }
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Performs one exchange: dial, write the request, then wait on a
    /// background reader that publishes either the full payload or a read
    /// error. Exactly one of the two fires; the socket is closed either
    /// way. Callers must not issue concurrent exchanges on one channel.
    pub async fn execute(&self, request: &Request) -> Result<Response, ContainerError> {
        let mut socket = self.dial().await?;

        let payload = request.to_bytes()?;
        socket.write_all(&payload).await?;

        let (read_half, write_half) = socket.into_split();
        let (payload_tx, payload_rx) = oneshot::channel::<Vec<u8>>();
        let (error_tx, error_rx) = oneshot::channel::<std::io::Error>();

        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = Vec::new();
            match read_half.read_to_end(&mut buf).await {
                Ok(_) => {
                    let _ = payload_tx.send(buf);
                }
                Err(e) => {
                    let _ = error_tx.send(e);
                }
            }
        });

        // The losing channel resolves to a receive error once its sender is
        // dropped, which disables that select branch.
        let wait = async {
            tokio::select! {
                Ok(bytes) = payload_rx => Ok(bytes),
                Ok(e) = error_rx => Err(ContainerError::Io(e)),
                else => Err(ContainerError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "provider closed without a result",
                ))),
            }
        };

        let result = match tokio::time::timeout(self.exchange_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                // Tear the reader down too; otherwise it keeps the read
                // half open until the provider hangs up.
                reader.abort();
                return Err(ContainerError::Timeout(self.exchange_timeout));
            }
        };

        // Dropping the write half closes our side of the socket.
        drop(write_half);

        let bytes = result?;
        Ok(Response::from_bytes(&bytes)?)
    }
}
