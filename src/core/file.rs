//! Task file specifications and content-addressed cache names.
//!
//! Every input or output of a task is described by a [`TaskFile`]: what it
//! is (local path, literal buffer, URL, producer command, directory), the
//! name it takes inside the task sandbox, and the flags controlling
//! caching and transfer. The cache name is a fingerprint shared by every
//! task that references the same object, so a worker stores one copy.
use std::path::{Path, PathBuf};

/// What kind of object a [`TaskFile`] refers to and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// A literal byte buffer supplied by the application.
    Buffer(Vec<u8>),
    /// A file or directory tree on the manager's filesystem.
    Local(PathBuf),
    /// A byte range of a local file.
    Piece {
        path: PathBuf,
        offset: i64,
        length: i64,
    },
    /// A URL the worker fetches into its cache.
    Url(String),
    /// A command the worker runs, capturing stdout into its cache.
    Command(String),
    /// An empty directory to create in the sandbox.
    Directory,
}

impl FileKind {
    /// Short tag used in logs and cache records.
    pub fn tag(&self) -> &'static str {
        match self {
            FileKind::Buffer(_) => "buffer",
            FileKind::Local(_) => "file",
            FileKind::Piece { .. } => "piece",
            FileKind::Url(_) => "url",
            FileKind::Command(_) => "cmd",
            FileKind::Directory => "dir",
        }
    }
}

/// Transfer and retention flags for a task file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    /// Keep the object in the worker cache across tasks.
    pub cache: bool,
    /// Stream incremental appends back while the task runs (outputs only).
    pub watch: bool,
    /// Fetch the output only when the task failed.
    pub failure_only: bool,
    /// Fetch the output only when the task succeeded.
    pub success_only: bool,
}

impl FileFlags {
    /// Wire encoding: a small bitmask understood by the worker.
    pub fn to_wire(self) -> u32 {
        let mut bits = 0;
        if self.cache {
            bits |= 0x1;
        }
        if self.watch {
            bits |= 0x2;
        }
        if self.failure_only {
            bits |= 0x4;
        }
        if self.success_only {
            bits |= 0x8;
        }
        bits
    }
}

/// One input or output of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFile {
    pub kind: FileKind,
    /// Name of the object inside the task sandbox.
    pub remote_name: String,
    /// Content-addressed name of the object in the worker cache.
    pub cache_name: String,
    pub flags: FileFlags,
    /// Size estimate for URL/command producers; actual size for buffers.
    pub length: i64,
}

impl TaskFile {
    pub fn local<P: AsRef<Path>>(path: P, remote_name: &str, flags: FileFlags) -> Self {
        let path = path.as_ref().to_path_buf();
        let cache_name = fingerprint("file", path.to_string_lossy().as_bytes(), remote_name);
        TaskFile {
            kind: FileKind::Local(path),
            remote_name: remote_name.to_string(),
            cache_name,
            flags,
            length: 0,
        }
    }

    pub fn piece<P: AsRef<Path>>(
        path: P,
        offset: i64,
        length: i64,
        remote_name: &str,
        flags: FileFlags,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let key = format!("{}:{}:{}", path.display(), offset, length);
        let cache_name = fingerprint("piece", key.as_bytes(), remote_name);
        TaskFile {
            kind: FileKind::Piece {
                path,
                offset,
                length,
            },
            remote_name: remote_name.to_string(),
            cache_name,
            flags,
            length,
        }
    }

    pub fn buffer(data: Vec<u8>, remote_name: &str, flags: FileFlags) -> Self {
        let cache_name = fingerprint("buffer", &data, remote_name);
        let length = data.len() as i64;
        TaskFile {
            kind: FileKind::Buffer(data),
            remote_name: remote_name.to_string(),
            cache_name,
            flags,
            length,
        }
    }

    pub fn url(source: &str, remote_name: &str, size_estimate: i64, flags: FileFlags) -> Self {
        // normalized spelling keeps the fingerprint stable across
        // equivalent forms of the same URL
        let source = url::Url::parse(source)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| source.to_string());
        let cache_name = fingerprint("url", source.as_bytes(), remote_name);
        TaskFile {
            kind: FileKind::Url(source),
            remote_name: remote_name.to_string(),
            cache_name,
            flags,
            length: size_estimate,
        }
    }

    pub fn command(cmd: &str, remote_name: &str, size_estimate: i64, flags: FileFlags) -> Self {
        let cache_name = fingerprint("cmd", cmd.as_bytes(), remote_name);
        TaskFile {
            kind: FileKind::Command(cmd.to_string()),
            remote_name: remote_name.to_string(),
            cache_name,
            flags,
            length: size_estimate,
        }
    }

    pub fn directory(remote_name: &str) -> Self {
        TaskFile {
            kind: FileKind::Directory,
            remote_name: remote_name.to_string(),
            cache_name: remote_name.to_string(),
            flags: FileFlags::default(),
            length: 0,
        }
    }

    /// True for kinds that are materialized by streaming bytes from the
    /// manager (as opposed to fetched or created by the worker).
    pub fn is_manager_staged(&self) -> bool {
        matches!(
            self.kind,
            FileKind::Local(_) | FileKind::Piece { .. } | FileKind::Buffer(_)
        )
    }
}

/// Build the cache name for an object: `<kind>-<md5>-<basename>`.
///
/// Two tasks naming the same source under the same sandbox name share one
/// cached copy on the worker.
fn fingerprint(kind: &str, source: &[u8], remote_name: &str) -> String {
    let mut keyed = Vec::with_capacity(source.len() + remote_name.len() + 1);
    keyed.extend_from_slice(source);
    keyed.push(0);
    keyed.extend_from_slice(remote_name.as_bytes());
    let digest = md5::compute(&keyed);
    let base = remote_name.rsplit('/').next().unwrap_or(remote_name);
    format!("{}-{:x}-{}", kind, digest, base)
}
