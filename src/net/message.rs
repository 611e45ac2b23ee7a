//! Parsing and classification of worker control lines.
//!
//! A worker may interleave unsolicited status lines (resource reports,
//! cache notices, keepalive replies) with replies the manager is waiting
//! for. Every received line is classified so that a caller waiting for a
//! specific reply can let asynchronous updates be absorbed as side
//! effects instead of deadlocking on them.
use crate::core::resources::Resource;

/// Outcome of processing one received line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgClass {
    /// Absorbed as a status update.
    Processed,
    /// Absorbed, and the connection must now close (status clients).
    ProcessedDisconnect,
    /// Not a status update: surface to the waiting caller.
    NotProcessed,
    /// The line was malformed or the connection failed.
    Failure,
}

/// A control line from a worker, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    /// `taskswarm <proto> <host> <os> <arch> <version>` (also accepted
    /// under the legacy `workqueue`/`dataswarm` keywords).
    Hello {
        protocol: i64,
        hostname: String,
        os: String,
        arch: String,
        version: String,
    },
    /// `resource tag <n>` ends a resource report.
    ResourceTag(i64),
    /// `resource <name> <total> <smallest> <largest>`
    Resource { name: String, resource: Resource },
    /// `feature <url-encoded name>`
    Feature(String),
    /// `info <field> <value>`
    Info { field: String, value: String },
    /// `cache-update <cachename> <size> <transfer-usec>`
    CacheUpdate {
        cache_name: String,
        size: i64,
        transfer_time: u64,
    },
    /// `cache-invalid <cachename> <len>` followed by a message payload.
    CacheInvalid { cache_name: String, length: usize },
    /// `transfer-address <host> <port>`
    TransferAddress { host: String, port: u16 },
    /// `available_results`
    AvailableResults,
    /// `alive` keepalive reply.
    Alive,
    /// `name` project-name query.
    NameQuery,
    /// `queue_status` and friends.
    StatusRequest(String),
    /// `GET <path> HTTP/x.y`
    HttpGet(String),
    /// `auth` from a worker expecting a password we do not have.
    Auth,
    /// Legacy `ready` hello from an incompatible worker.
    LegacyReady,
    /// Anything else; surfaced to the caller waiting for a reply.
    Other(String),
}

const STATUS_REQUESTS: &[&str] = &[
    "queue_status",
    "task_status",
    "worker_status",
    "wable_status",
    "resources_status",
];

/// Decode one control line. Returns `WorkerLine::Other` for lines that
/// belong to a solicited exchange (results, transfer frames).
pub fn parse_worker_line(line: &str) -> WorkerLine {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().unwrap_or("");

    match keyword {
        "alive" => WorkerLine::Alive,
        "name" => WorkerLine::NameQuery,
        "auth" => WorkerLine::Auth,
        "ready" => WorkerLine::LegacyReady,
        "available_results" => WorkerLine::AvailableResults,
        "taskswarm" | "workqueue" | "dataswarm" => {
            let rest: Vec<&str> = tokens.collect();
            if rest.len() == 5 {
                if let Ok(protocol) = rest[0].parse() {
                    return WorkerLine::Hello {
                        protocol,
                        hostname: rest[1].to_string(),
                        os: rest[2].to_string(),
                        arch: rest[3].to_string(),
                        version: rest[4].to_string(),
                    };
                }
            }
            WorkerLine::Other(line.to_string())
        }
        "resource" => {
            let rest: Vec<&str> = tokens.collect();
            match rest.as_slice() {
                ["tag", n] => n
                    .parse()
                    .map(WorkerLine::ResourceTag)
                    .unwrap_or_else(|_| WorkerLine::Other(line.to_string())),
                [name, total, smallest, largest] => {
                    match (total.parse(), smallest.parse(), largest.parse()) {
                        (Ok(total), Ok(smallest), Ok(largest)) => WorkerLine::Resource {
                            name: name.to_string(),
                            resource: Resource {
                                inuse: 0,
                                total,
                                smallest,
                                largest,
                            },
                        },
                        _ => WorkerLine::Other(line.to_string()),
                    }
                }
                _ => WorkerLine::Other(line.to_string()),
            }
        }
        "feature" => match tokens.next() {
            Some(encoded) => WorkerLine::Feature(url_decode(encoded)),
            None => WorkerLine::Other(line.to_string()),
        },
        "info" => {
            let field = tokens.next().unwrap_or("").to_string();
            let value = tokens.collect::<Vec<&str>>().join(" ");
            if field.is_empty() {
                WorkerLine::Other(line.to_string())
            } else {
                WorkerLine::Info { field, value }
            }
        }
        "cache-update" => {
            let rest: Vec<&str> = tokens.collect();
            if let [name, size, time] = rest.as_slice() {
                if let (Ok(size), Ok(time)) = (size.parse(), time.parse()) {
                    return WorkerLine::CacheUpdate {
                        cache_name: name.to_string(),
                        size,
                        transfer_time: time,
                    };
                }
            }
            WorkerLine::Other(line.to_string())
        }
        "cache-invalid" => {
            let rest: Vec<&str> = tokens.collect();
            if let [name, len] = rest.as_slice() {
                if let Ok(length) = len.parse() {
                    return WorkerLine::CacheInvalid {
                        cache_name: name.to_string(),
                        length,
                    };
                }
            }
            WorkerLine::Other(line.to_string())
        }
        "transfer-address" => {
            let rest: Vec<&str> = tokens.collect();
            if let [host, port] = rest.as_slice() {
                if let Ok(port) = port.parse() {
                    return WorkerLine::TransferAddress {
                        host: host.to_string(),
                        port,
                    };
                }
            }
            WorkerLine::Other(line.to_string())
        }
        "GET" => {
            let rest: Vec<&str> = tokens.collect();
            if rest.len() == 2 && rest[1].starts_with("HTTP/") {
                WorkerLine::HttpGet(rest[0].to_string())
            } else {
                WorkerLine::Other(line.to_string())
            }
        }
        kw if STATUS_REQUESTS.contains(&kw) => WorkerLine::StatusRequest(kw.to_string()),
        _ => WorkerLine::Other(line.to_string()),
    }
}

/// A `result` line inside a `send_results` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHeader {
    pub status: i64,
    pub exit_code: i64,
    pub stdout_length: i64,
    pub execution_time: u64,
    pub task_id: u64,
}

pub fn parse_result_header(line: &str) -> Option<ResultHeader> {
    let t: Vec<&str> = line.split_whitespace().collect();
    if t.len() != 6 || t[0] != "result" {
        return None;
    }
    Some(ResultHeader {
        status: t[1].parse().ok()?,
        exit_code: t[2].parse().ok()?,
        stdout_length: t[3].parse().ok()?,
        execution_time: t[4].parse().ok()?,
        task_id: t[5].parse().ok()?,
    })
}

/// An `update` line carrying a watched-file tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchUpdate {
    pub task_id: u64,
    pub path: String,
    pub offset: i64,
    pub length: i64,
}

pub fn parse_watch_update(line: &str) -> Option<WatchUpdate> {
    let t: Vec<&str> = line.split_whitespace().collect();
    if t.len() != 5 || t[0] != "update" {
        return None;
    }
    Some(WatchUpdate {
        task_id: t[1].parse().ok()?,
        path: t[2].to_string(),
        offset: t[3].parse().ok()?,
        length: t[4].parse().ok()?,
    })
}

/// One frame of the recursive streaming transfer format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    File { name: String, size: i64, mode: u32 },
    Symlink { name: String, length: usize },
    Dir { name: String },
    Missing { name: String, errno: i64 },
    End,
}

/// Decode one streaming-transfer frame header.
pub fn parse_transfer_frame(line: &str) -> Option<TransferFrame> {
    let t: Vec<&str> = line.split_whitespace().collect();
    match t.as_slice() {
        ["end"] => Some(TransferFrame::End),
        ["file", name, size, mode] => Some(TransferFrame::File {
            name: url_decode(name),
            size: size.parse().ok()?,
            // octal mode with its leading zero, e.g. 0755
            mode: u32::from_str_radix(mode.trim_start_matches('0'), 8).unwrap_or(0o755),
        }),
        ["symlink", name, length] => Some(TransferFrame::Symlink {
            name: url_decode(name),
            length: length.parse().ok()?,
        }),
        ["dir", name] => Some(TransferFrame::Dir {
            name: url_decode(name),
        }),
        ["missing", name, errno] => Some(TransferFrame::Missing {
            name: url_decode(name),
            errno: errno.parse().ok()?,
        }),
        _ => None,
    }
}

/// Percent-encode a token so it survives whitespace-delimited parsing.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Inverse of [`url_encode`]; invalid escapes pass through untouched.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
