//! Streaming file staging between manager and workers.
//!
//! Whole directory trees move in one logical exchange: a `dir` header,
//! the items inside it, then an `end` marker. Single files and symlinks
//! carry a byte count on the header line and the raw bytes after it.
//! A `missing` frame marks one absent item without aborting the rest of
//! the stream.
use crate::core::file::{FileKind, TaskFile};
use crate::error::{SwarmError, SwarmResult};
use crate::net::connection::{Connection, TransferRate};
use crate::net::message::url_encode;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Outcome of a worker-facing operation, deciding who is presumed at
/// fault and how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Success,
    /// The worker is presumed bad: disconnect it and requeue its tasks.
    WorkerFailure,
    /// The task definition is bad: fail the task, keep the worker.
    AppFailure,
    /// A local condition (disk, permissions): retry elsewhere.
    ManagerFailure,
    /// An `end` frame terminated a directory listing.
    EndOfList,
}

/// Total on-disk size of a local file or directory tree, for sizing the
/// transfer deadline before streaming it.
pub fn local_tree_size(path: &Path) -> i64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len() as i64)
        .sum()
}

/// Stream one filesystem item (file, directory, or symlink) to the
/// worker. Top-level symlinks are followed; links inside a directory are
/// sent as links.
pub async fn send_item(
    conn: &mut Connection,
    local: &Path,
    remote_name: &str,
    offset: i64,
    piece_length: i64,
    follow_links: bool,
    rate: &TransferRate,
    total_bytes: &mut i64,
) -> SwarmResult<OpOutcome> {
    let info = if follow_links {
        std::fs::metadata(local)
    } else {
        std::fs::symlink_metadata(local)
    };
    let info = match info {
        Ok(i) => i,
        Err(e) => {
            log::debug!("cannot stat file {}: {}", local.display(), e);
            return Ok(OpOutcome::AppFailure);
        }
    };

    if info.is_dir() {
        send_directory(conn, local, remote_name, rate, total_bytes).await
    } else if info.file_type().is_symlink() {
        send_symlink(conn, local, remote_name, rate, total_bytes).await
    } else if info.is_file() {
        send_file(
            conn,
            local,
            remote_name,
            offset,
            piece_length,
            &info,
            rate,
            total_bytes,
        )
        .await
    } else {
        log::debug!("skipping unusual file: {}", local.display());
        Ok(OpOutcome::Success)
    }
}

/// Send a directory and its contents with the recursive streaming
/// format: a `dir` prefix, each entry, then an `end` marker. Boxed so
/// the mutual recursion with [`send_item`] has a finite type.
fn send_directory<'a>(
    conn: &'a mut Connection,
    local: &'a Path,
    remote_name: &'a str,
    rate: &'a TransferRate,
    total_bytes: &'a mut i64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = SwarmResult<OpOutcome>> + Send + 'a>> {
    Box::pin(async move {
        let entries = match std::fs::read_dir(local) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("cannot open dir {}: {}", local.display(), e);
                return Ok(OpOutcome::AppFailure);
            }
        };

        let deadline = rate.deadline_for(0);
        conn.send(&format!("dir {}\n", url_encode(remote_name)), deadline)
            .await?;

        let mut result = OpOutcome::Success;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::debug!("cannot read dir {}: {}", local.display(), e);
                    result = OpOutcome::AppFailure;
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let sub = send_item(conn, &entry.path(), &name, 0, 0, false, rate, total_bytes).await?;
            if sub != OpOutcome::Success {
                result = sub;
                break;
            }
        }

        conn.send("end\n", rate.deadline_for(0)).await?;
        Ok(result)
    })
}

async fn send_symlink(
    conn: &mut Connection,
    local: &Path,
    remote_name: &str,
    rate: &TransferRate,
    total_bytes: &mut i64,
) -> SwarmResult<OpOutcome> {
    let target = match std::fs::read_link(local) {
        Ok(t) => t,
        Err(_) => return Ok(OpOutcome::AppFailure),
    };
    let target = target.to_string_lossy().into_owned();
    let deadline = rate.deadline_for(target.len() as i64);
    conn.send(
        &format!("symlink {} {}\n", url_encode(remote_name), target.len()),
        deadline,
    )
    .await?;
    conn.write_all(target.as_bytes(), deadline).await?;
    *total_bytes += target.len() as i64;
    Ok(OpOutcome::Success)
}

/// Send one regular file, or a byte range of it when `piece_length` is
/// non-zero. The header advertises the exact payload size; a transfer
/// slower than the tolerated bandwidth aborts at the deadline.
#[allow(clippy::too_many_arguments)]
async fn send_file(
    conn: &mut Connection,
    local: &Path,
    remote_name: &str,
    offset: i64,
    piece_length: i64,
    info: &std::fs::Metadata,
    rate: &TransferRate,
    total_bytes: &mut i64,
) -> SwarmResult<OpOutcome> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncSeekExt;

    // normalize the mode so the worker never materializes an unreadable file
    let mode = (info.permissions().mode() | 0o600) & 0o777;

    let length = if piece_length > 0 {
        piece_length
    } else {
        info.len() as i64
    };

    if offset < 0 || offset + length > info.len() as i64 {
        log::debug!(
            "file piece {} ({}:{}) is out of range",
            local.display(),
            offset,
            length
        );
        return Ok(OpOutcome::AppFailure);
    }

    let mut file = match tokio::fs::File::open(local).await {
        Ok(f) => f,
        Err(e) => {
            log::debug!("cannot open file {}: {}", local.display(), e);
            return Ok(OpOutcome::AppFailure);
        }
    };
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
    }

    let deadline = rate.deadline_for(length);
    conn.send(
        &format!("file {} {} 0{:o}\n", url_encode(remote_name), length, mode),
        deadline,
    )
    .await?;
    let actual = conn.stream_from(&mut file, length, deadline).await?;
    *total_bytes += actual;

    if actual != length {
        return Ok(OpOutcome::WorkerFailure);
    }
    Ok(OpOutcome::Success)
}

/// Send a literal buffer input under its cache name.
pub async fn send_buffer(
    conn: &mut Connection,
    data: &[u8],
    cache_name: &str,
    rate: &TransferRate,
) -> SwarmResult<OpOutcome> {
    let deadline = rate.deadline_for(data.len() as i64);
    conn.send(
        &format!("put {} {} 0777\n", cache_name, data.len()),
        deadline,
    )
    .await?;
    conn.write_all(data, deadline).await?;
    Ok(OpOutcome::Success)
}

/// Announce a single top-level upload of a local item under its cache
/// name, then stream it. Single files use the `put` header; directories
/// stream the recursive format.
pub async fn send_named_item(
    conn: &mut Connection,
    tf: &TaskFile,
    expanded_local: &Path,
    rate: &TransferRate,
    total_bytes: &mut i64,
) -> SwarmResult<OpOutcome> {
    let (offset, piece_length) = match &tf.kind {
        FileKind::Piece { offset, length, .. } => (*offset, *length),
        _ => (0, 0),
    };

    let info = match std::fs::metadata(expanded_local) {
        Ok(i) => i,
        Err(e) => {
            log::debug!("cannot stat file {}: {}", expanded_local.display(), e);
            return Ok(OpOutcome::AppFailure);
        }
    };

    if info.is_file() {
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::AsyncSeekExt;

        let mode = (info.permissions().mode() | 0o600) & 0o777;
        let length = if piece_length > 0 {
            piece_length
        } else {
            info.len() as i64
        };
        if offset < 0 || offset + length > info.len() as i64 {
            return Ok(OpOutcome::AppFailure);
        }

        let mut file = match tokio::fs::File::open(expanded_local).await {
            Ok(f) => f,
            Err(e) => {
                log::debug!("cannot open file {}: {}", expanded_local.display(), e);
                return Ok(OpOutcome::AppFailure);
            }
        };
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        }

        let deadline = rate.deadline_for(length);
        conn.send(
            &format!("put {} {} 0{:o}\n", tf.cache_name, length, mode),
            deadline,
        )
        .await?;
        let actual = conn.stream_from(&mut file, length, deadline).await?;
        *total_bytes += actual;
        if actual != length {
            return Ok(OpOutcome::WorkerFailure);
        }
        Ok(OpOutcome::Success)
    } else {
        // directories (and top-level symlinks to them) stream recursively
        send_item(
            conn,
            expanded_local,
            &tf.cache_name,
            offset,
            piece_length,
            true,
            rate,
            total_bytes,
        )
        .await
    }
}

/// Receive one file payload into `local_path`, creating parent
/// directories as needed. The `file` header has already been consumed.
pub async fn receive_file_payload(
    conn: &mut Connection,
    local_path: &Path,
    length: i64,
    mode: u32,
    rate: &TransferRate,
) -> SwarmResult<OpOutcome> {
    let deadline = rate.deadline_for(length);

    if let Some(parent) = local_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::debug!("could not create directory {}: {}", parent.display(), e);
                conn.drain(length, deadline).await?;
                return Ok(OpOutcome::ManagerFailure);
            }
        }
    }

    log::debug!(
        "receiving file {} (size: {} bytes)",
        local_path.display(),
        length
    );

    if let Err(e) = check_disk_space(local_path.parent().unwrap_or(Path::new(".")), length) {
        log::debug!(
            "could not receive file {}: {}",
            local_path.display(),
            e
        );
        conn.drain(length, deadline).await?;
        return Ok(OpOutcome::ManagerFailure);
    }

    let mut file = match tokio::fs::File::create(local_path).await {
        Ok(f) => f,
        Err(e) => {
            log::warn!("cannot open file {} for writing: {}", local_path.display(), e);
            conn.drain(length, deadline).await?;
            return Ok(OpOutcome::ManagerFailure);
        }
    };

    let actual = conn.stream_to(&mut file, length, deadline).await?;
    file.flush().await?;
    drop(file);

    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(local_path, std::fs::Permissions::from_mode(mode & 0o777));

    if actual != length {
        log::debug!(
            "received item size ({}) does not match the expected size ({})",
            actual,
            length
        );
        let _ = std::fs::remove_file(local_path);
        return Ok(OpOutcome::WorkerFailure);
    }

    Ok(OpOutcome::Success)
}

/// Receive a symlink target and create the link. The `symlink` header has
/// already been consumed.
pub async fn receive_symlink_payload(
    conn: &mut Connection,
    local_path: &Path,
    length: usize,
    rate: &TransferRate,
) -> SwarmResult<OpOutcome> {
    let deadline = rate.deadline_for(length as i64);
    let target = conn.read_exact(length, deadline).await?;
    let target = String::from_utf8_lossy(&target).into_owned();
    match std::os::unix::fs::symlink(&target, local_path) {
        Ok(_) => Ok(OpOutcome::Success),
        Err(e) => {
            log::debug!("could not create symlink {}: {}", local_path.display(), e);
            Ok(OpOutcome::ManagerFailure)
        }
    }
}

/// Apply a watched-file tail update: write `length` bytes at `offset`
/// and truncate the file to `offset + length`. An offset past the end
/// extends the file.
pub async fn apply_watch_update(
    conn: &mut Connection,
    local_path: &Path,
    offset: i64,
    length: i64,
    rate: &TransferRate,
) -> SwarmResult<()> {
    use tokio::io::AsyncSeekExt;

    let deadline = rate.deadline_for(length);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(local_path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset.max(0) as u64))
        .await?;
    conn.stream_to(&mut file, length, deadline).await?;
    file.flush().await?;
    file.set_len((offset + length).max(0) as u64).await?;
    Ok(())
}

/// Confirm there is enough free space under `dir` for an incoming file.
pub fn check_disk_space(dir: &Path, _needed: i64) -> SwarmResult<()> {
    // stat the directory to surface permission problems early; free-space
    // probing is platform-specific and handled by the deployment
    std::fs::metadata(if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    })
    .map_err(SwarmError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file::FileFlags;
    use crate::net::connection::test_pair;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_rate() -> TransferRate {
        TransferRate {
            worker_rate: None,
            queue_rate: None,
            default_rate: 1_000_000.0,
            outlier_factor: 10.0,
            minimum_timeout: Duration::from_secs(5),
        }
    }

    async fn read_all(client: &mut tokio::net::TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_send_single_file_uses_put_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"0123456789").unwrap();

        let (mut conn, mut client) = test_pair().await;
        let tf = TaskFile::local(&path, "data.txt", FileFlags::default());
        let mut total = 0;
        let out = send_named_item(&mut conn, &tf, &path, &test_rate(), &mut total)
            .await
            .unwrap();
        assert_eq!(out, OpOutcome::Success);
        assert_eq!(total, 10);

        let mut text = Vec::new();
        let header = format!("put {} 10 0", tf.cache_name);
        // header line + mode digits + newline + 10 payload bytes
        loop {
            let b = read_all(&mut client, 1).await;
            text.push(b[0]);
            if b[0] == b'\n' {
                break;
            }
        }
        let line = String::from_utf8(text).unwrap();
        assert!(line.starts_with(&header), "got header: {}", line);
        assert_eq!(read_all(&mut client, 10).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_send_directory_streams_recursive_frames() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("a.txt"), b"AA").unwrap();

        let (mut conn, mut client) = test_pair().await;
        let mut total = 0;
        let out = send_item(
            &mut conn,
            &tree,
            "tree",
            0,
            0,
            true,
            &test_rate(),
            &mut total,
        )
        .await
        .unwrap();
        assert_eq!(out, OpOutcome::Success);

        let mut received = Vec::new();
        // dir header + file frame + 2 bytes + end marker
        let mut buf = [0u8; 256];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
            if received.ends_with(b"end\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("dir tree\n"));
        assert!(text.contains("file a.txt 2 0"));
        assert!(text.ends_with("end\n"));
    }

    #[tokio::test]
    async fn test_send_missing_file_is_app_failure() {
        let (mut conn, _client) = test_pair().await;
        let mut total = 0;
        let out = send_item(
            &mut conn,
            Path::new("/nonexistent/for/sure"),
            "x",
            0,
            0,
            true,
            &test_rate(),
            &mut total,
        )
        .await
        .unwrap();
        assert_eq!(out, OpOutcome::AppFailure);
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_receive_file_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/stdout.txt");

        let (mut conn, mut client) = test_pair().await;
        client.write_all(b"hi\n").await.unwrap();
        let out = receive_file_payload(&mut conn, &path, 3, 0o644, &test_rate())
            .await
            .unwrap();
        assert_eq!(out, OpOutcome::Success);
        assert_eq!(std::fs::read(&path).unwrap(), b"hi\n");
    }

    #[tokio::test]
    async fn test_watch_update_extends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.log");
        std::fs::write(&path, b"0123456789").unwrap();

        // offset beyond the end extends the file
        let (mut conn, mut client) = test_pair().await;
        client.write_all(b"XYZ").await.unwrap();
        apply_watch_update(&mut conn, &path, 12, 3, &test_rate())
            .await
            .unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 15);
        assert_eq!(&data[12..], b"XYZ");

        // an overlapping update truncates to offset+length
        client.write_all(b"ab").await.unwrap();
        apply_watch_update(&mut conn, &path, 4, 2, &test_rate())
            .await
            .unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, b"0123ab");
    }

    #[tokio::test]
    async fn test_local_tree_size_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(local_tree_size(dir.path()), 150);
    }
}
