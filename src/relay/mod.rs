use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::registry::Registry;

/// One flattened data point bound for the time-series backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no backend endpoints configured")]
    NoEndpoints,
    #[error("all {attempted} backend endpoints failed, last error: {source}")]
    EndpointsExhausted {
        attempted: usize,
        source: std::io::Error,
    },
}

/// Periodically drains the response cache and pushes flattened metrics to a
/// Carbon line-protocol backend, deduplicating on the per-check last-sent
/// timestamp and failing over across the configured endpoints in order.
pub struct CarbonRelay {
    name: String,
    dial_on: Vec<String>,
    registry: Arc<Registry>,
    last_run_threshold: Duration,
    marks: Mutex<HashMap<String, i64>>,
}

impl CarbonRelay {
    pub fn new(
        name: &str,
        dial_on: Vec<String>,
        last_run_threshold: Duration,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            dial_on,
            registry,
            last_run_threshold,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Drains unsent metrics from the cache, committing the dedup marks.
    /// The second element remembers each touched mark's previous value so a
    /// failed delivery can roll the commit back.
    fn collect_pending(&self) -> (Vec<Metric>, Vec<(String, Option<i64>)>) {
        let mut marks = self.marks.lock().expect("relay mutex poisoned");
        let mut batch = Vec::new();
        let mut touched = Vec::new();

        for (check, response) in self.registry.cache().snapshot() {
            let Some(metrics) = &response.metrics else {
                continue;
            };
            if marks.get(&check).is_some_and(|sent| *sent >= response.received_at) {
                continue;
            }

            for group in metrics {
                for (key, value) in group {
                    batch.push(Metric {
                        name: format!("{check}.{key}"),
                        value: *value as f64,
                        timestamp: response.received_at,
                    });
                }
            }
            touched.push((check.clone(), marks.insert(check, response.received_at)));
        }

        (batch, touched)
    }

    /// Metrics not yet delivered; updates the dedup marks, so a second call
    /// with no intervening cache writes yields nothing.
    pub fn extract_pending(&self) -> Vec<Metric> {
        self.collect_pending().0
    }

    fn revert_marks(&self, touched: Vec<(String, Option<i64>)>) {
        let mut marks = self.marks.lock().expect("relay mutex poisoned");
        for (check, previous) in touched {
            match previous {
                Some(mark) => {
                    marks.insert(check, mark);
                }
                None => {
                    marks.remove(&check);
                }
            }
        }
    }

    /// Pushes the pending batch to the first endpoint that takes it. On
    /// total endpoint exhaustion the dedup marks are rolled back so the
    /// next tick retries the same batch.
    pub async fn send(&self) -> Result<(), RelayError> {
        let (batch, touched) = self.collect_pending();
        if batch.is_empty() {
            log::debug!("[{}] nothing to relay", self.name);
            return Ok(());
        }
        if self.dial_on.is_empty() {
            self.revert_marks(touched);
            return Err(RelayError::NoEndpoints);
        }

        let payload: String = batch
            .iter()
            .map(|m| format!("{} {} {}\n", m.name, m.value, m.timestamp))
            .collect();

        let mut last_error = None;
        for endpoint in &self.dial_on {
            match self.push(endpoint, payload.as_bytes()).await {
                Ok(()) => {
                    log::info!(
                        "[{}] delivered {} metrics to {endpoint}",
                        self.name,
                        batch.len()
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("[{}] endpoint {endpoint} failed: {e}", self.name);
                    last_error = Some(e);
                }
            }
        }

        self.revert_marks(touched);
        Err(RelayError::EndpointsExhausted {
            attempted: self.dial_on.len(),
            source: last_error.unwrap_or_else(|| std::io::Error::other("no endpoints tried")),
        })
    }

    async fn push(&self, endpoint: &str, payload: &[u8]) -> Result<(), std::io::Error> {
        let mut conn = TcpStream::connect(endpoint).await?;
        conn.write_all(payload).await?;
        conn.shutdown().await?;
        Ok(())
    }

    /// Relay tick loop; errors are logged and the loop keeps going. Also
    /// reports checks that have gone quiet for longer than the configured
    /// threshold.
    pub async fn run(&self, interval: Duration) {
        log::info!(
            "[{}] relaying every {interval:?} to {:?}",
            self.name,
            self.dial_on
        );
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.send().await {
                log::warn!("[{}] relay pass failed: {e}", self.name);
            }

            let stale = self.registry.stale_checks(self.last_run_threshold);
            if !stale.is_empty() {
                log::warn!("[{}] checks not reporting: {stale:?}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_response;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn relay_over(registry: Arc<Registry>, dial_on: Vec<String>) -> CarbonRelay {
        CarbonRelay::new("carbon", dial_on, Duration::from_secs(300), registry)
    }

    fn seeded_registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        registry
            .cache()
            .store("check_test", sample_response("check_test"));
        registry
    }

    #[tokio::test]
    async fn test_extract_pending_is_deduplicated() {
        let relay = relay_over(seeded_registry(), vec![]);

        let first = relay.extract_pending();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "check_test.okay");
        assert_eq!(first[0].value, 1.0);

        assert!(relay.extract_pending().is_empty());
    }

    #[tokio::test]
    async fn test_responses_without_metrics_are_skipped() {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let mut response = sample_response("check_plain");
        response.metrics = None;
        registry.cache().store("check_plain", response);

        let relay = relay_over(registry, vec![]);
        assert!(relay.extract_pending().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_cache_write_reopens_the_mark() {
        let registry = seeded_registry();
        let relay = relay_over(Arc::clone(&registry), vec![]);
        assert_eq!(relay.extract_pending().len(), 1);

        // Same timestamp: still considered sent.
        registry
            .cache()
            .store("check_test", registry.cache().get("check_test").unwrap());
        assert!(relay.extract_pending().is_empty());

        let mut newer = sample_response("check_test");
        newer.received_at += 10;
        registry.cache().store("check_test", newer);
        assert_eq!(relay.extract_pending().len(), 1);
    }

    #[tokio::test]
    async fn test_send_fails_over_to_the_reachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut body = String::new();
            conn.read_to_string(&mut body).await.unwrap();
            body
        });

        let relay = relay_over(
            seeded_registry(),
            vec![
                "127.0.0.1:1".to_string(),
                "127.0.0.1:2".to_string(),
                addr.to_string(),
            ],
        );
        relay.send().await.unwrap();

        let body = received.await.unwrap();
        let line = body.lines().next().unwrap();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields[0], "check_test.okay");
        assert_eq!(fields[1], "1");
        assert!(fields[2].parse::<i64>().unwrap() > 0);

        // Delivered, so the marks stay committed.
        assert!(relay.extract_pending().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_endpoints_roll_the_marks_back() {
        let relay = relay_over(
            seeded_registry(),
            vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()],
        );

        assert!(matches!(
            relay.send().await,
            Err(RelayError::EndpointsExhausted { attempted: 2, .. })
        ));

        // The batch is still pending for the next tick.
        assert_eq!(relay.extract_pending().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_touches_no_endpoint() {
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        // Unresolvable endpoint: send would error if it dialed at all.
        let relay = relay_over(registry, vec!["carbon.invalid:2003".to_string()]);
        relay.send().await.unwrap();
    }
}
