use std::path::Path;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::container::channel::CheckChannel;
use crate::container::process::ProcessHandle;
use crate::protocol::{Request, Response};

pub mod channel;
pub mod process;

/// Reserved command every provider must answer with its check inventory.
pub const LIST_CHECKS_COMMAND: &str = "__list_check_methods";

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("command '{0}' is too short, expected an executable plus at least one argument")]
    InvalidCommand(String),
    #[error("failed to spawn provider '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("could not reach provider socket {0:?}: {1}")]
    DialFailed(std::path::PathBuf, std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed provider payload: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("no response from provider within {0:?}")]
    Timeout(Duration),
    #[error("container '{0}' reported no checks")]
    NoInventory(String),
}

#[derive(Default)]
struct ContainerState {
    bootstrapped: bool,
    checks: Vec<String>,
}

/// A supervised provider process plus the socket channel used to query it.
/// The state mutex doubles as the exchange lock: the channel assumes one
/// in-flight request, so all socket traffic is funneled through it.
pub struct Container {
    name: String,
    process: ProcessHandle,
    channel: CheckChannel,
    state: Mutex<ContainerState>,
}

impl Container {
    pub fn new(
        name: &str,
        command: Vec<String>,
        socket_dir: &Path,
    ) -> Result<Self, ContainerError> {
        let process = ProcessHandle::new(name, command, socket_dir)?;
        let channel = CheckChannel::new(process.socket_path().to_path_buf());
        Ok(Self {
            name: name.to_string(),
            process,
            channel,
            state: Mutex::new(ContainerState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Check names discovered at bootstrap; empty until then.
    pub async fn inventory(&self) -> Vec<String> {
        self.state.lock().await.checks.clone()
    }

    /// Asks the provider for its check inventory. Runs at most once; later
    /// calls are a no-op.
    pub async fn bootstrap(&self) -> Result<(), ContainerError> {
        let mut state = self.state.lock().await;
        if state.bootstrapped {
            log::debug!("[{}] already bootstrapped, skipping", self.name);
            return Ok(());
        }

        log::info!(
            "[{}] bootstrapping via {:?}",
            self.name,
            self.process.socket_path()
        );

        let request = Request::new(LIST_CHECKS_COMMAND, vec![]);
        let response = self.channel.execute(&request).await?;
        if response.stdout.is_empty() {
            return Err(ContainerError::NoInventory(self.name.clone()));
        }

        log::info!("[{}] checks: {:?}", self.name, response.stdout);
        state.checks = response.stdout;
        state.bootstrapped = true;
        Ok(())
    }

    /// Runs one check through the provider socket. The command is not
    /// validated against the inventory here; routing already did that.
    pub async fn execute(&self, request: &Request) -> Result<Response, ContainerError> {
        let _exchange = self.state.lock().await;
        self.channel.execute(request).await
    }

    /// Best effort teardown; secondary errors are logged by the layers
    /// below rather than propagated.
    pub async fn shutdown(&self) {
        log::info!("[{}] shutting down", self.name);
        self.process.stop();
    }
}
