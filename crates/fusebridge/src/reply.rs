//! Completion callbacks handed to handlers.
//!
//! Each handler receives a typed reply object and finishes its request by
//! consuming it. A reply can only be used once; one that is dropped unused
//! completes its request with `EIO` so the kernel call does not hang.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::attr::{FileStat, StatFs};
use crate::config::UnsupportedPolicy;
use crate::error::result_code;
use crate::registry::MountEntry;
use crate::request::OpKind;

/// Operation-specific output carried back to the driver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Attr(FileStat),
    Statfs(StatFs),
    Entries(Vec<String>),
    Handle(u64),
    LinkTarget(String),
}

/// Result of one request: a code (negative errno on failure, otherwise zero
/// or a byte count) and the payload to apply on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: i32,
    pub payload: Payload,
}

impl Completion {
    /// A negative code never carries a payload.
    pub fn new(code: i32, payload: Payload) -> Self {
        let payload = if code < 0 { Payload::None } else { payload };
        Completion { code, payload }
    }

    pub fn error(code: i32) -> Self {
        Completion {
            code,
            payload: Payload::None,
        }
    }
}

pub(crate) struct Completer {
    entry: Arc<MountEntry>,
    seq: u64,
    kind: OpKind,
    done: bool,
}

impl Completer {
    pub(crate) fn new(entry: Arc<MountEntry>, seq: u64, kind: OpKind) -> Self {
        Completer {
            entry,
            seq,
            kind,
            done: false,
        }
    }

    pub(crate) fn complete(mut self, code: i32, payload: Payload) {
        self.finish(Completion::new(code, payload));
    }

    /// Answers a request no handler was registered for.
    pub(crate) fn unsupported(self, policy: UnsupportedPolicy) {
        if self.kind.is_notification() {
            return self.complete(0, Payload::None);
        }
        self.entry.note_unsupported();
        let code = policy.code();
        self.complete(code, Payload::None);
    }

    fn finish(&mut self, completion: Completion) {
        self.done = true;
        self.entry.complete(self.seq, self.kind, completion);
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                slot = self.entry.index(),
                op = %self.kind,
                "reply dropped without completing the request"
            );
            self.finish(Completion::error(-libc::EIO));
        }
    }
}

macro_rules! reply_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name {
            completer: Completer,
        }

        impl $name {
            pub(crate) fn new(completer: Completer) -> Self {
                $name { completer }
            }

            /// Fails the request. Accepts the errno with either sign.
            pub fn error(self, errno: i32) {
                self.completer.complete(result_code(errno), Payload::None);
            }

            /// Completes with a raw result code and no payload.
            pub fn code(self, code: i32) {
                self.completer.complete(code, Payload::None);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("op", &self.completer.kind)
                    .field("seq", &self.completer.seq)
                    .finish()
            }
        }
    };
}

reply_type!(
    /// Reply for operations whose result code is the whole answer.
    ReplyEmpty
);
reply_type!(ReplyAttr);
reply_type!(ReplyStatfs);
reply_type!(
    /// Reply for READDIR: the names of the directory's entries.
    ReplyDirectory
);
reply_type!(
    /// Reply for OPEN, OPENDIR and CREATE: the file handle to hand the kernel.
    ReplyOpen
);
reply_type!(ReplyReadlink);
reply_type!(
    /// Reply for READ, WRITE and GETXATTR: the number of bytes transferred.
    ReplyData
);

impl ReplyEmpty {
    pub fn ok(self) {
        self.completer.complete(0, Payload::None);
    }
}

impl ReplyAttr {
    pub fn attr(self, stat: FileStat) {
        self.completer.complete(0, Payload::Attr(stat));
    }
}

impl ReplyStatfs {
    pub fn statfs(self, stat: StatFs) {
        self.completer.complete(0, Payload::Statfs(stat));
    }
}

impl ReplyDirectory {
    pub fn entries<I, S>(self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        self.completer.complete(0, Payload::Entries(names));
    }
}

impl ReplyOpen {
    pub fn opened(self, fh: u64) {
        self.completer.complete(0, Payload::Handle(fh));
    }
}

impl ReplyReadlink {
    pub fn target(self, target: impl Into<String>) {
        self.completer
            .complete(0, Payload::LinkTarget(target.into()));
    }
}

impl ReplyData {
    pub fn size(self, n: usize) {
        let code = i32::try_from(n).unwrap_or(i32::MAX);
        self.completer.complete(code, Payload::None);
    }
}
