//! JSON wire format.
//!
//! ```text
//! request:  {"id": 7, "method": "stat", "args": {"path": "/a"}}
//! success:  {"id": 7, "result": {"type": "metadata", "value": {...}}}
//! failure:  {"id": 7, "error": {"kind": "not-found", "message": "not found: /a", "path": "/a"}}
//! ```

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::system_time_serde;
use crate::{Capabilities, DirEntry, ErrorKind, FsError, FsResult, Metadata, OpenFlags};

/// One contract operation with its arguments. Handles are the server's
/// opaque handle ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub(crate) enum Call {
    Capabilities,
    Stat {
        path: PathBuf,
    },
    Lstat {
        path: PathBuf,
    },
    Exists {
        path: PathBuf,
    },
    Open {
        path: PathBuf,
        flags: OpenFlags,
        mode: u32,
    },
    Read {
        handle: u64,
        len: usize,
        position: Option<u64>,
    },
    Write {
        handle: u64,
        data: Vec<u8>,
        position: Option<u64>,
    },
    Flush {
        handle: u64,
    },
    Close {
        handle: u64,
    },
    Unlink {
        path: PathBuf,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Rmdir {
        path: PathBuf,
    },
    Readdir {
        path: PathBuf,
    },
    Truncate {
        path: PathBuf,
        len: u64,
    },
    Chmod {
        path: PathBuf,
        mode: u32,
    },
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
    },
    Utimes {
        path: PathBuf,
        #[serde(with = "system_time_serde")]
        atime: SystemTime,
        #[serde(with = "system_time_serde")]
        mtime: SystemTime,
    },
    Link {
        existing: PathBuf,
        new: PathBuf,
    },
    Symlink {
        target: PathBuf,
        link: PathBuf,
    },
    Readlink {
        path: PathBuf,
    },
    ReadFile {
        path: PathBuf,
    },
    WriteFile {
        path: PathBuf,
        data: Vec<u8>,
        mode: u32,
    },
    AppendFile {
        path: PathBuf,
        data: Vec<u8>,
        mode: u32,
    },
}

impl Call {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Call::Capabilities => "capabilities",
            Call::Stat { .. } => "stat",
            Call::Lstat { .. } => "lstat",
            Call::Exists { .. } => "exists",
            Call::Open { .. } => "open",
            Call::Read { .. } => "read",
            Call::Write { .. } => "write",
            Call::Flush { .. } => "flush",
            Call::Close { .. } => "close",
            Call::Unlink { .. } => "unlink",
            Call::Rename { .. } => "rename",
            Call::Mkdir { .. } => "mkdir",
            Call::Rmdir { .. } => "rmdir",
            Call::Readdir { .. } => "readdir",
            Call::Truncate { .. } => "truncate",
            Call::Chmod { .. } => "chmod",
            Call::Chown { .. } => "chown",
            Call::Utimes { .. } => "utimes",
            Call::Link { .. } => "link",
            Call::Symlink { .. } => "symlink",
            Call::Readlink { .. } => "readlink",
            Call::ReadFile { .. } => "read_file",
            Call::WriteFile { .. } => "write_file",
            Call::AppendFile { .. } => "append_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Request {
    pub(crate) id: u64,
    #[serde(flatten)]
    pub(crate) call: Call,
}

/// Successful result of a [`Call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub(crate) enum Reply {
    Unit,
    Metadata(Metadata),
    Bool(bool),
    Handle(u64),
    Bytes(Vec<u8>),
    Count(usize),
    Entries(Vec<DirEntry>),
    Path(PathBuf),
    Capabilities(Capabilities),
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Unit => "unit",
            Reply::Metadata(_) => "metadata",
            Reply::Bool(_) => "bool",
            Reply::Handle(_) => "handle",
            Reply::Bytes(_) => "bytes",
            Reply::Count(_) => "count",
            Reply::Entries(_) => "entries",
            Reply::Path(_) => "path",
            Reply::Capabilities(_) => "capabilities",
        }
    }

    pub(crate) fn mismatch(&self, expected: &str) -> FsError {
        FsError::io(format!(
            "protocol error: expected {expected} reply, got {}",
            self.kind()
        ))
    }
}

/// An [`FsError`] flattened for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WireError {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) detail: Option<String>,
}

impl From<&FsError> for WireError {
    fn from(error: &FsError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            path: error.path().map(PathBuf::from),
            detail: error.detail().map(str::to_owned),
        }
    }
}

impl From<WireError> for FsError {
    fn from(wire: WireError) -> Self {
        FsError::from_parts(wire.kind, wire.path, wire.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Response {
    pub(crate) id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) result: Option<Reply>,
}

impl Response {
    pub(crate) fn new(id: u64, outcome: FsResult<Reply>) -> Self {
        match outcome {
            Ok(reply) => Self {
                id,
                error: None,
                result: Some(reply),
            },
            Err(e) => Self {
                id,
                error: Some(WireError::from(&e)),
                result: None,
            },
        }
    }

    pub(crate) fn into_result(self) -> FsResult<Reply> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.into()),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(FsError::io("protocol error: empty response")),
        }
    }
}

/// Best-effort request id from a frame that failed to parse.
pub(crate) fn salvage_id(frame: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(frame)
        .ok()?
        .get("id")?
        .as_u64()
}
