use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::task::AbortHandle;

/// Restarts stop once this many exits pile up inside the decay window.
pub const FAILURE_THRESHOLD: usize = 5;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const RESTART_PAUSE: Duration = Duration::from_secs(1);

pub type ServeResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Handle returned when an entity joins the supervising tree; required to
/// remove it again. Each token maps to exactly one live supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken(u64);

/// Restart-on-crash supervisor. Each entry owns a serve loop that is
/// re-invoked after every exit until the failure budget runs out; container
/// processes and network listeners are treated uniformly.
pub struct Supervisor {
    next_token: AtomicU64,
    tasks: Mutex<HashMap<ServiceToken, AbortHandle>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts supervising a serve loop. `serve` is re-invoked for every
    /// restart; any exit, clean or not, counts toward the failure budget
    /// since supervised entities are expected to run until shutdown.
    pub fn add<F>(&self, name: &str, serve: F) -> ServiceToken
    where
        F: Fn() -> BoxFuture<'static, ServeResult> + Send + Sync + 'static,
    {
        let token = ServiceToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let loop_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut exits: VecDeque<Instant> = VecDeque::new();
            loop {
                match serve().await {
                    Ok(()) => log::info!("[supervisor] '{loop_name}' exited"),
                    Err(e) => log::warn!("[supervisor] '{loop_name}' failed: {e}"),
                }

                let now = Instant::now();
                exits.push_back(now);
                while exits
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > FAILURE_WINDOW)
                {
                    exits.pop_front();
                }
                if exits.len() >= FAILURE_THRESHOLD {
                    log::error!(
                        "[supervisor] '{loop_name}' exited {} times within {:?}, giving up",
                        exits.len(),
                        FAILURE_WINDOW
                    );
                    break;
                }

                tokio::time::sleep(RESTART_PAUSE).await;
                log::info!("[supervisor] restarting '{loop_name}'");
            }
        });

        self.tasks
            .lock()
            .expect("supervisor mutex poisoned")
            .insert(token, handle.abort_handle());
        token
    }

    /// Stops supervising the entity behind `token`. Returns false when the
    /// token is unknown (already removed).
    pub fn remove(&self, token: ServiceToken) -> bool {
        let handle = self
            .tasks
            .lock()
            .expect("supervisor mutex poisoned")
            .remove(&token);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("supervisor mutex poisoned");
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
