use std::sync::Weak;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::nrpe::packet::PACKET_SIZE;
use crate::protocol::Response;
use crate::registry::Registry;

pub mod packet;

/// TCP listener speaking the NRPE query/response protocol: one 1036-byte
/// query per connection, one 1036-byte reply, then close. Holds the
/// registry weakly since the registry supervises this service in turn.
pub struct NrpeService {
    name: String,
    listen_on: String,
    registry: Weak<Registry>,
}

impl NrpeService {
    pub fn new(name: &str, interface: &str, port: u16, registry: Weak<Registry>) -> Self {
        Self {
            name: name.to_string(),
            listen_on: format!("{interface}:{port}"),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Services have no inventory to discover; this exists so onboarding
    /// treats them and containers uniformly.
    pub fn bootstrap(&self) {
        log::debug!("[{}] onboarded, serving on {}", self.name, self.listen_on);
    }

    /// Accept loop; runs until the listener fails or the task is aborted.
    pub async fn serve(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.listen_on).await?;
        log::info!("[{}] listening on {}", self.name, self.listen_on);

        loop {
            let (conn, peer) = listener.accept().await?;
            log::debug!("[{}] query from {peer}", self.name);
            let registry = self.registry.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                handle_connection(&name, registry, conn).await;
            });
        }
    }
}

/// Serves one query. Malformed packets are logged and the connection is
/// dropped without a reply; execution failures still produce a well-formed
/// UNKNOWN response so the caller hears back whenever one is possible.
async fn handle_connection<S>(name: &str, registry: Weak<Registry>, mut conn: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut query = [0u8; PACKET_SIZE];
    if let Err(e) = conn.read_exact(&mut query).await {
        log::debug!("[{name}] short read on query: {e}");
        return;
    }

    let (command, arguments) = match packet::decode(&query) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("[{name}] rejecting query: {e}");
            return;
        }
    };

    let Some(registry) = registry.upgrade() else {
        log::warn!("[{name}] registry is gone, dropping query for '{command}'");
        return;
    };

    let response = match registry.execute(&command, arguments).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("[{name}] '{command}' failed: {e}");
            Response::unknown(&command, &e.to_string())
        }
    };

    let reply = packet::encode_response(&response);
    if let Err(e) = conn.write_all(&reply).await {
        log::debug!("[{name}] could not write reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::registry::Entity;
    use crate::testutil::serve_provider;
    use std::sync::Arc;
    use std::time::Duration;

    async fn registry_with_checks() -> (Arc<Registry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let container = Arc::new(
            Container::new(
                "ruby-checks",
                vec!["/bin/sleep".to_string(), "30".to_string()],
                dir.path(),
            )
            .unwrap(),
        );
        tokio::spawn(serve_provider(
            container.process().socket_path().to_path_buf(),
            vec!["check_test".to_string()],
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry
            .register(Entity::Container(Arc::clone(&container)))
            .unwrap();
        registry.onboard("ruby-checks").await.unwrap();
        (registry, dir)
    }

    fn result_code(reply: &[u8]) -> i16 {
        i16::from_be_bytes(reply[8..10].try_into().unwrap())
    }

    fn buffer_text(reply: &[u8]) -> String {
        let buffer = &reply[10..10 + packet::BUFFER_SIZE];
        let end = buffer.iter().position(|&b| b == 0).unwrap();
        String::from_utf8_lossy(&buffer[..end]).into_owned()
    }

    #[tokio::test]
    async fn test_query_executes_a_check() {
        let (registry, _dir) = registry_with_checks().await;
        let (mut client, server) = tokio::io::duplex(4096);

        let service = tokio::spawn(async move {
            handle_connection("nrpe", Arc::downgrade(&registry), server).await;
        });

        client
            .write_all(&packet::encode_query("check_test", &[]))
            .await
            .unwrap();
        let mut reply = [0u8; PACKET_SIZE];
        client.read_exact(&mut reply).await.unwrap();
        service.await.unwrap();

        assert_eq!(result_code(&reply), 0);
        assert_eq!(buffer_text(&reply), "OK");
    }

    #[tokio::test]
    async fn test_unknown_check_gets_an_unknown_reply() {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let (mut client, server) = tokio::io::duplex(4096);

        let service = tokio::spawn(async move {
            handle_connection("nrpe", Arc::downgrade(&registry), server).await;
        });

        client
            .write_all(&packet::encode_query("missing_check", &[]))
            .await
            .unwrap();
        let mut reply = [0u8; PACKET_SIZE];
        client.read_exact(&mut reply).await.unwrap();
        service.await.unwrap();

        assert_eq!(result_code(&reply), 3);
        assert!(buffer_text(&reply).starts_with("[ERROR]"));
    }

    #[tokio::test]
    async fn test_corrupt_query_is_dropped_without_reply() {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let (mut client, server) = tokio::io::duplex(4096);

        let service = tokio::spawn(async move {
            handle_connection("nrpe", Arc::downgrade(&registry), server).await;
        });

        let mut query = packet::encode_query("check_test", &[]);
        query[20] ^= 0xff;
        client.write_all(&query).await.unwrap();
        service.await.unwrap();

        // The handler closed its end without writing anything back.
        let mut reply = [0u8; 1];
        assert_eq!(client.read(&mut reply).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_loop_serves_tcp_clients() {
        let (registry, _dir) = registry_with_checks().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = Arc::new(NrpeService::new(
            "nrpe",
            "127.0.0.1",
            port,
            Arc::downgrade(&registry),
        ));
        let serving = Arc::clone(&service);
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        conn.write_all(&packet::encode_query("check_test", &[]))
            .await
            .unwrap();
        let mut reply = [0u8; PACKET_SIZE];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(result_code(&reply), 0);
    }
}
