//! Minimal HTTP surface on the worker port.
//!
//! A browser or status tool may connect to the manager and issue
//! `GET /<endpoint>`; the manager replies with JSON and closes. The root
//! path returns a small human-readable index.
use crate::error::SwarmResult;
use crate::net::connection::Connection;
use tokio::time::Instant;

pub const ENDPOINTS: &[&str] = &[
    "queue_status",
    "task_status",
    "worker_status",
    "resources_status",
    "wable_status",
];

/// Consume the remaining request headers (terminated by a blank line).
pub async fn consume_headers(conn: &mut Connection, deadline: Instant) -> SwarmResult<()> {
    loop {
        let line = conn.read_line(deadline).await?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

/// Reply to `GET /` with an index of the available endpoints.
pub async fn respond_index(conn: &mut Connection, deadline: Instant) -> SwarmResult<()> {
    let mut body = String::from("<h1>taskswarm manager</h1>\n<ul>\n");
    for e in ENDPOINTS {
        body.push_str(&format!("<li> <a href=\"/{0}\">{0}</a>\n", e));
    }
    body.push_str("</ul>\n");

    conn.send(
        "HTTP/1.1 200 OK\nConnection: close\nContent-type: text/html\n\n",
        deadline,
    )
    .await?;
    conn.send(&body, deadline).await
}

/// Reply to `GET /<endpoint>` with the given JSON document.
pub async fn respond_json(
    conn: &mut Connection,
    body: &serde_json::Value,
    deadline: Instant,
) -> SwarmResult<()> {
    conn.send(
        "HTTP/1.1 200 OK\nConnection: close\nAccess-Control-Allow-Origin: *\nContent-type: text/plain\n\n",
        deadline,
    )
    .await?;
    conn.send(&body.to_string(), deadline).await?;
    conn.send("\n", deadline).await
}

/// Reply with 404 for unknown endpoints.
pub async fn respond_not_found(conn: &mut Connection, deadline: Instant) -> SwarmResult<()> {
    conn.send(
        "HTTP/1.1 404 Not Found\nConnection: close\nContent-type: text/plain\n\nunknown endpoint\n",
        deadline,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::test_pair;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_consume_headers_stops_at_blank_line() {
        let (mut conn, mut client) = test_pair().await;
        client
            .write_all(b"Host: x\r\nAccept: */*\r\n\r\nrest")
            .await
            .unwrap();
        consume_headers(&mut conn, soon()).await.unwrap();
        // the bytes after the blank line are untouched
        let rest = conn.read_exact(4, soon()).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn test_json_response_shape() {
        let (mut conn, mut client) = test_pair().await;
        let body = serde_json::json!([{"tasks_waiting": 3}]);
        respond_json(&mut conn, &body, soon()).await.unwrap();
        drop(conn);

        let mut text = String::new();
        client.read_to_string(&mut text).await.unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\n"));
        assert!(text.contains("Connection: close\n"));
        assert!(text.contains("tasks_waiting"));
    }
}
