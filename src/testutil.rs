//! Shared helpers for the inline test modules.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use crate::container::LIST_CHECKS_COMMAND;
use crate::protocol::{CheckStatus, Request, Response};

/// Serves the provider side of the control socket protocol: one JSON line
/// request per connection, a JSON response, then close. Answers the
/// inventory command with `checks` and any listed check with an OK
/// response carrying `metrics: [{"okay": 1}]`.
pub async fn serve_provider(socket_path: PathBuf, checks: Vec<String>) {
    let listener = UnixListener::bind(&socket_path).unwrap();
    loop {
        let (conn, _) = listener.accept().await.unwrap();
        let checks = checks.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = conn.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();

            let reply = if request.command == LIST_CHECKS_COMMAND {
                serde_json::json!({
                    "name": LIST_CHECKS_COMMAND,
                    "status": 0,
                    "stdout": checks,
                })
            } else if checks.contains(&request.command) {
                serde_json::json!({
                    "name": request.command,
                    "status": 0,
                    "stdout": ["OK"],
                    "metrics": [{"okay": 1}],
                })
            } else {
                serde_json::json!({
                    "name": request.command,
                    "status": 3,
                    "stdout": [],
                    "error": "unknown command",
                })
            };

            write_half
                .write_all(&serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
        });
    }
}

/// An OK response carrying one `okay = 1` metric, stamped with the current
/// time.
pub fn sample_response(name: &str) -> Response {
    Response {
        name: name.to_string(),
        status: CheckStatus::Ok,
        stdout: vec!["OK".to_string()],
        metrics: Some(vec![HashMap::from([("okay".to_string(), 1)])]),
        error: None,
        received_at: chrono::Utc::now().timestamp(),
    }
}
