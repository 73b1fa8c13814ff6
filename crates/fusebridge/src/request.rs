//! Typed requests: one argument shape per operation kind.

use std::fmt;
use std::time::SystemTime;

use crate::buffer::KernelBuf;

/// Every kernel entry point the bridge forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Init,
    Error,
    Destroy,
    Getattr,
    Fgetattr,
    Statfs,
    Access,
    Open,
    Opendir,
    Create,
    Read,
    Write,
    Flush,
    Release,
    Releasedir,
    Readdir,
    Fsync,
    Fsyncdir,
    Truncate,
    Ftruncate,
    Readlink,
    Symlink,
    Link,
    Rename,
    Unlink,
    Mkdir,
    Rmdir,
    Mknod,
    Chown,
    Chmod,
    Setxattr,
    Getxattr,
    Utimens,
}

impl OpKind {
    pub const ALL: [OpKind; 33] = [
        OpKind::Init,
        OpKind::Error,
        OpKind::Destroy,
        OpKind::Getattr,
        OpKind::Fgetattr,
        OpKind::Statfs,
        OpKind::Access,
        OpKind::Open,
        OpKind::Opendir,
        OpKind::Create,
        OpKind::Read,
        OpKind::Write,
        OpKind::Flush,
        OpKind::Release,
        OpKind::Releasedir,
        OpKind::Readdir,
        OpKind::Fsync,
        OpKind::Fsyncdir,
        OpKind::Truncate,
        OpKind::Ftruncate,
        OpKind::Readlink,
        OpKind::Symlink,
        OpKind::Link,
        OpKind::Rename,
        OpKind::Unlink,
        OpKind::Mkdir,
        OpKind::Rmdir,
        OpKind::Mknod,
        OpKind::Chown,
        OpKind::Chmod,
        OpKind::Setxattr,
        OpKind::Getxattr,
        OpKind::Utimens,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Init => "init",
            OpKind::Error => "error",
            OpKind::Destroy => "destroy",
            OpKind::Getattr => "getattr",
            OpKind::Fgetattr => "fgetattr",
            OpKind::Statfs => "statfs",
            OpKind::Access => "access",
            OpKind::Open => "open",
            OpKind::Opendir => "opendir",
            OpKind::Create => "create",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Flush => "flush",
            OpKind::Release => "release",
            OpKind::Releasedir => "releasedir",
            OpKind::Readdir => "readdir",
            OpKind::Fsync => "fsync",
            OpKind::Fsyncdir => "fsyncdir",
            OpKind::Truncate => "truncate",
            OpKind::Ftruncate => "ftruncate",
            OpKind::Readlink => "readlink",
            OpKind::Symlink => "symlink",
            OpKind::Link => "link",
            OpKind::Rename => "rename",
            OpKind::Unlink => "unlink",
            OpKind::Mkdir => "mkdir",
            OpKind::Rmdir => "rmdir",
            OpKind::Mknod => "mknod",
            OpKind::Chown => "chown",
            OpKind::Chmod => "chmod",
            OpKind::Setxattr => "setxattr",
            OpKind::Getxattr => "getxattr",
            OpKind::Utimens => "utimens",
        }
    }

    /// Lifecycle notifications raised by the driver thread itself rather than
    /// by a kernel call. Without a handler these always succeed.
    pub fn is_notification(&self) -> bool {
        matches!(self, OpKind::Init | OpKind::Error | OpKind::Destroy)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The calling principal of the request in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl RequestContext {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        RequestContext { uid, gid, pid }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorArgs {
    pub mountpoint: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleArgs {
    pub path: String,
    pub fh: u64,
}

/// Used by ACCESS (where `mode` is the access mask), MKDIR and CHMOD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeArgs {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenArgs {
    pub path: String,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    pub path: String,
    pub mode: u32,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateArgs {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtruncateArgs {
    pub path: String,
    pub fh: u64,
    pub size: u64,
}

/// READ and WRITE. `buf` is the kernel's buffer; its length is the request size.
#[derive(Debug, Clone)]
pub struct IoArgs {
    pub path: String,
    pub fh: u64,
    pub buf: KernelBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirArgs {
    pub path: String,
    pub fh: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncArgs {
    pub path: String,
    pub fh: u64,
    pub datasync: bool,
}

/// SYMLINK, LINK and RENAME. For SYMLINK `path` is the link's contents and
/// `dest` the location of the new link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkArgs {
    pub path: String,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MknodArgs {
    pub path: String,
    pub mode: u32,
    pub dev: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChownArgs {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone)]
pub struct SetxattrArgs {
    pub path: String,
    pub name: String,
    pub value: KernelBuf,
    pub position: u32,
    pub flags: i32,
}

/// GETXATTR. An empty `value` buffer asks for the attribute's size.
#[derive(Debug, Clone)]
pub struct GetxattrArgs {
    pub path: String,
    pub name: String,
    pub value: KernelBuf,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtimensArgs {
    pub path: String,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

/// One in-flight call with its arguments.
#[derive(Debug, Clone)]
pub enum Request {
    Init(MountArgs),
    Error(ErrorArgs),
    Destroy(MountArgs),
    Getattr(PathArgs),
    Fgetattr(HandleArgs),
    Statfs(PathArgs),
    Access(ModeArgs),
    Open(OpenArgs),
    Opendir(OpenArgs),
    Create(CreateArgs),
    Read(IoArgs),
    Write(IoArgs),
    Flush(HandleArgs),
    Release(HandleArgs),
    Releasedir(HandleArgs),
    Readdir(ReaddirArgs),
    Fsync(SyncArgs),
    Fsyncdir(SyncArgs),
    Truncate(TruncateArgs),
    Ftruncate(FtruncateArgs),
    Readlink(PathArgs),
    Symlink(LinkArgs),
    Link(LinkArgs),
    Rename(LinkArgs),
    Unlink(PathArgs),
    Mkdir(ModeArgs),
    Rmdir(PathArgs),
    Mknod(MknodArgs),
    Chown(ChownArgs),
    Chmod(ModeArgs),
    Setxattr(SetxattrArgs),
    Getxattr(GetxattrArgs),
    Utimens(UtimensArgs),
}

impl Request {
    pub fn kind(&self) -> OpKind {
        match self {
            Request::Init(_) => OpKind::Init,
            Request::Error(_) => OpKind::Error,
            Request::Destroy(_) => OpKind::Destroy,
            Request::Getattr(_) => OpKind::Getattr,
            Request::Fgetattr(_) => OpKind::Fgetattr,
            Request::Statfs(_) => OpKind::Statfs,
            Request::Access(_) => OpKind::Access,
            Request::Open(_) => OpKind::Open,
            Request::Opendir(_) => OpKind::Opendir,
            Request::Create(_) => OpKind::Create,
            Request::Read(_) => OpKind::Read,
            Request::Write(_) => OpKind::Write,
            Request::Flush(_) => OpKind::Flush,
            Request::Release(_) => OpKind::Release,
            Request::Releasedir(_) => OpKind::Releasedir,
            Request::Readdir(_) => OpKind::Readdir,
            Request::Fsync(_) => OpKind::Fsync,
            Request::Fsyncdir(_) => OpKind::Fsyncdir,
            Request::Truncate(_) => OpKind::Truncate,
            Request::Ftruncate(_) => OpKind::Ftruncate,
            Request::Readlink(_) => OpKind::Readlink,
            Request::Symlink(_) => OpKind::Symlink,
            Request::Link(_) => OpKind::Link,
            Request::Rename(_) => OpKind::Rename,
            Request::Unlink(_) => OpKind::Unlink,
            Request::Mkdir(_) => OpKind::Mkdir,
            Request::Rmdir(_) => OpKind::Rmdir,
            Request::Mknod(_) => OpKind::Mknod,
            Request::Chown(_) => OpKind::Chown,
            Request::Chmod(_) => OpKind::Chmod,
            Request::Setxattr(_) => OpKind::Setxattr,
            Request::Getxattr(_) => OpKind::Getxattr,
            Request::Utimens(_) => OpKind::Utimens,
        }
    }

    /// The primary path of the request; the mountpoint for lifecycle notifications.
    pub fn path(&self) -> &str {
        match self {
            Request::Init(a) | Request::Destroy(a) => &a.mountpoint,
            Request::Error(a) => &a.mountpoint,
            Request::Getattr(a)
            | Request::Statfs(a)
            | Request::Readlink(a)
            | Request::Unlink(a)
            | Request::Rmdir(a) => &a.path,
            Request::Fgetattr(a)
            | Request::Flush(a)
            | Request::Release(a)
            | Request::Releasedir(a) => &a.path,
            Request::Access(a) | Request::Mkdir(a) | Request::Chmod(a) => &a.path,
            Request::Open(a) | Request::Opendir(a) => &a.path,
            Request::Create(a) => &a.path,
            Request::Read(a) | Request::Write(a) => &a.path,
            Request::Readdir(a) => &a.path,
            Request::Fsync(a) | Request::Fsyncdir(a) => &a.path,
            Request::Truncate(a) => &a.path,
            Request::Ftruncate(a) => &a.path,
            Request::Symlink(a) | Request::Link(a) | Request::Rename(a) => &a.path,
            Request::Mknod(a) => &a.path,
            Request::Chown(a) => &a.path,
            Request::Setxattr(a) => &a.path,
            Request::Getxattr(a) => &a.path,
            Request::Utimens(a) => &a.path,
        }
    }
}

/// The per-mount record of the call currently in flight. Overwritten by
/// every call; `seq` identifies which call the contents belong to.
#[derive(Debug, Default)]
pub struct RequestRecord {
    pub seq: u64,
    pub kind: Option<OpKind>,
    pub context: RequestContext,
    pub request: Option<Request>,
    pub result: i32,
}

impl RequestRecord {
    pub(crate) fn fill(&mut self, seq: u64, context: RequestContext, request: Request) {
        self.seq = seq;
        self.kind = Some(request.kind());
        self.context = context;
        self.request = Some(request);
        self.result = 0;
    }

    /// Hands the arguments of call `seq` to the dispatcher. Returns `None` if
    /// the record has already moved on to another call or was taken.
    pub(crate) fn take(&mut self, seq: u64) -> Option<(RequestContext, Request)> {
        if self.seq != seq {
            return None;
        }
        self.request.take().map(|r| (self.context, r))
    }
}
