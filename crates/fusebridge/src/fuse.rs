//! Kernel interface backed by FUSE through `fuser`.
//!
//! `fuser` speaks the inode-addressed FUSE protocol; [`PathFs`] translates
//! each request into the path-addressed [`VfsOps`] entry points, keeping an
//! inode for every path the kernel has looked up.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType as FuserFileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, Session, TimeOrNow,
};
use tracing::{debug, warn};

use crate::attr::{FileInfo, FileStat, StatFs};
use crate::config::BridgeConfig;
use crate::error::errno_of;
use crate::inode::{InodeId, PathTable};
use crate::kernel::{Kernel, KernelError, KernelSession, VfsOps};
use crate::mount::{validate_mountpoint, MountOptions};
use crate::request::RequestContext;

/// Inode reported for directory entries, whose attributes are not known
/// until the kernel looks them up.
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Largest link target READLINK will return, NUL included.
const LINK_BUF_SIZE: usize = libc::PATH_MAX as usize + 1;

#[derive(Debug, Clone)]
pub struct FuseKernel {
    fsname: String,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl FuseKernel {
    pub fn new(config: &BridgeConfig) -> Self {
        FuseKernel {
            fsname: config.fsname.clone(),
            attr_ttl: Duration::from_millis(config.attr_ttl_ms),
            entry_ttl: Duration::from_millis(config.entry_ttl_ms),
        }
    }
}

impl Kernel for FuseKernel {
    fn connect(
        &self,
        mountpoint: &str,
        options: &MountOptions,
        ops: Box<dyn VfsOps>,
    ) -> Result<Box<dyn KernelSession>, KernelError> {
        let mount_failed = |reason: String| KernelError::MountFailed {
            mountpoint: mountpoint.to_string(),
            reason,
        };
        validate_mountpoint(Path::new(mountpoint)).map_err(|e| mount_failed(e.to_string()))?;

        let mut fuser_opts = options.to_fuser();
        if !fuser_opts
            .iter()
            .any(|o| matches!(o, MountOption::FSName(_)))
        {
            fuser_opts.push(MountOption::FSName(self.fsname.clone()));
        }

        let fs = PathFs {
            ops,
            paths: PathTable::new(),
            attr_ttl: self.attr_ttl,
            entry_ttl: self.entry_ttl,
        };
        let session = Session::new(fs, Path::new(mountpoint), &fuser_opts)
            .map_err(|e| mount_failed(e.to_string()))?;
        Ok(Box::new(FuseSession { session }))
    }

    fn force_unmount(&self, mountpoint: &str) -> Result<(), KernelError> {
        match run_fusermount("fusermount", mountpoint) {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(mountpoint, "fusermount failed, trying fusermount3: {}", first);
                run_fusermount("fusermount3", mountpoint).map_err(|reason| {
                    KernelError::UnmountFailed {
                        mountpoint: mountpoint.to_string(),
                        reason,
                    }
                })
            }
        }
    }
}

fn run_fusermount(binary: &str, mountpoint: &str) -> Result<(), String> {
    match Command::new(binary).arg("-u").arg(mountpoint).output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(format!(
            "{} -u {} failed: {}",
            binary,
            mountpoint,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => Err(format!("failed to run {}: {}", binary, e)),
    }
}

struct FuseSession {
    session: Session<PathFs>,
}

impl KernelSession for FuseSession {
    fn run(&mut self) -> Result<(), KernelError> {
        self.session.run().map_err(KernelError::Session)
    }
}

pub struct PathFs {
    ops: Box<dyn VfsOps>,
    paths: PathTable,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

fn ctx(req: &Request<'_>) -> RequestContext {
    RequestContext::new(req.uid(), req.gid(), req.pid())
}

/// A negative INIT result refuses the mount with that errno.
fn init_result(code: i32) -> Result<(), c_int> {
    if code < 0 {
        Err(errno_of(code))
    } else {
        Ok(())
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn entry_kind(name: &str) -> FuserFileType {
    match name {
        "." | ".." => FuserFileType::Directory,
        _ => FuserFileType::RegularFile,
    }
}

impl PathFs {
    fn path(&self, ino: InodeId) -> Result<String, c_int> {
        self.paths
            .path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child(&self, parent: InodeId, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.paths.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn stat(&mut self, ctx: RequestContext, path: &str) -> Result<FileStat, c_int> {
        let mut stat = FileStat::default();
        let code = self.ops.getattr(ctx, path, &mut stat);
        if code < 0 {
            return Err(errno_of(code));
        }
        Ok(stat)
    }

    /// Answers a request that created `path` with its attributes.
    fn reply_entry(&mut self, ctx: RequestContext, path: &str, code: i32, reply: ReplyEntry) {
        if code < 0 {
            reply.error(errno_of(code));
            return;
        }
        match self.stat(ctx, path) {
            Ok(stat) => {
                let ino = self.paths.lookup(path);
                reply.entry(&self.entry_ttl, &stat.to_fuser(ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn reply_empty(code: i32, reply: ReplyEmpty) {
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.ok();
        }
    }

    fn apply_setattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        changes: SetAttr,
    ) -> Result<FileStat, c_int> {
        let check = |code: i32| if code < 0 { Err(errno_of(code)) } else { Ok(()) };

        if let Some(mode) = changes.mode {
            check(self.ops.chmod(ctx, path, mode))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            let uid = changes.uid.unwrap_or(u32::MAX);
            let gid = changes.gid.unwrap_or(u32::MAX);
            check(self.ops.chown(ctx, path, uid, gid))?;
        }
        if let Some(size) = changes.size {
            let code = match changes.fh {
                Some(fh) => self.ops.ftruncate(ctx, path, size, &FileInfo::new(0, fh)),
                None => self.ops.truncate(ctx, path, size),
            };
            check(code)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            let current = self.stat(ctx, path)?;
            let atime = changes.atime.map_or(current.atime, resolve_time);
            let mtime = changes.mtime.map_or(current.mtime, resolve_time);
            check(self.ops.utimens(ctx, path, atime, mtime))?;
        }
        self.stat(ctx, path)
    }
}

struct SetAttr {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
    fh: Option<u64>,
}

impl Filesystem for PathFs {
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let code = self.ops.init(ctx(req));
        debug!("init code={}", code);
        init_result(code)
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.stat(ctx(req), &path) {
            Ok(stat) => {
                let ino = self.paths.lookup(&path);
                reply.entry(&self.entry_ttl, &stat.to_fuser(ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.paths.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut stat = FileStat::default();
        let code = match fh {
            Some(fh) => self
                .ops
                .fgetattr(ctx(req), &path, &mut stat, &FileInfo::new(0, fh)),
            None => self.ops.getattr(ctx(req), &path, &mut stat),
        };
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.attr(&self.attr_ttl, &stat.to_fuser(ino));
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        };
        match self.apply_setattr(ctx(req), &path, changes) {
            Ok(stat) => reply.attr(&self.attr_ttl, &stat.to_fuser(ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut buf = vec![0u8; LINK_BUF_SIZE];
        let code = self.ops.readlink(ctx(req), &path, &mut buf);
        if code < 0 {
            return reply.error(errno_of(code));
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        reply.data(&buf[..len]);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self
            .ops
            .mknod(ctx(req), &path, mode & !umask, rdev as u64);
        self.reply_entry(ctx(req), &path, code, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.mkdir(ctx(req), &path, mode & !umask);
        self.reply_entry(ctx(req), &path, code, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.unlink(ctx(req), &path);
        if code >= 0 {
            self.paths.unlink(&path);
        }
        Self::reply_empty(code, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.rmdir(ctx(req), &path);
        if code >= 0 {
            self.paths.unlink(&path);
        }
        Self::reply_empty(code, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, link_name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let Some(target) = target.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let code = self.ops.symlink(ctx(req), target, &path);
        self.reply_entry(ctx(req), &path, code, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        let code = self.ops.rename(ctx(req), &from, &to);
        if code >= 0 {
            self.paths.rename(&from, &to);
        }
        Self::reply_empty(code, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (from, to) = match (self.path(ino), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        let code = self.ops.link(ctx(req), &from, &to);
        self.reply_entry(ctx(req), &to, code, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut info = FileInfo::new(flags, 0);
        let code = self.ops.open(ctx(req), &path, &mut info);
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.opened(info.fh, 0);
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut buf = vec![0u8; size as usize];
        let info = FileInfo::new(flags, fh);
        let code = self
            .ops
            .read(ctx(req), &path, &mut buf, offset.max(0) as u64, &info);
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            let n = (code as usize).min(buf.len());
            reply.data(&buf[..n]);
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let info = FileInfo::new(flags, fh);
        let code = self
            .ops
            .write(ctx(req), &path, data, offset.max(0) as u64, &info);
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.written(code as u32);
        }
    }

    fn flush(&mut self, req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.flush(ctx(req), &path, &FileInfo::new(0, fh));
        Self::reply_empty(code, reply);
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.release(ctx(req), &path, &FileInfo::new(flags, fh));
        Self::reply_empty(code, reply);
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self
            .ops
            .fsync(ctx(req), &path, datasync, &FileInfo::new(0, fh));
        Self::reply_empty(code, reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut info = FileInfo::new(flags, 0);
        let code = self.ops.opendir(ctx(req), &path, &mut info);
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.opened(info.fh, 0);
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let skip = offset.max(0);
        let mut index: i64 = 0;
        // Handlers list the whole directory; entries before `offset` were
        // returned by an earlier call.
        let mut filler = |name: &str| {
            index += 1;
            if index <= skip {
                return false;
            }
            reply.add(UNKNOWN_INO, index, entry_kind(name), name)
        };
        let code = self.ops.readdir(
            ctx(req),
            &path,
            &mut filler,
            offset.max(0) as u64,
            &FileInfo::new(0, fh),
        );
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.ok();
        }
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self
            .ops
            .releasedir(ctx(req), &path, &FileInfo::new(flags, fh));
        Self::reply_empty(code, reply);
    }

    fn fsyncdir(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self
            .ops
            .fsyncdir(ctx(req), &path, datasync, &FileInfo::new(0, fh));
        Self::reply_empty(code, reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path(ino).unwrap_or_else(|_| "/".to_string());
        let mut st = StatFs::default();
        let code = self.ops.statfs(ctx(req), &path, &mut st);
        if code < 0 {
            reply.error(errno_of(code));
        } else {
            reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namemax, st.frsize,
            );
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let Some(name) = name.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let code = self
            .ops
            .setxattr(ctx(req), &path, name, value, flags, position);
        Self::reply_empty(code, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let Some(name) = name.to_str() else {
            return reply.error(libc::EINVAL);
        };
        let mut buf = vec![0u8; size as usize];
        let code = self.ops.getxattr(ctx(req), &path, name, &mut buf, 0);
        if code < 0 {
            reply.error(errno_of(code));
        } else if size == 0 {
            reply.size(code as u32);
        } else if code as u32 > size {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&buf[..code as usize]);
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let code = self.ops.access(ctx(req), &path, mask as u32);
        Self::reply_empty(code, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let mut info = FileInfo::new(flags, 0);
        let code = self.ops.create(ctx(req), &path, mode & !umask, &mut info);
        if code < 0 {
            return reply.error(errno_of(code));
        }
        match self.stat(ctx(req), &path) {
            Ok(stat) => {
                let ino = self.paths.lookup(&path);
                reply.created(&self.entry_ttl, &stat.to_fuser(ino), 0, info.fh, 0);
            }
            Err(errno) => {
                warn!(path = %path, "created file has no attributes");
                reply.error(errno);
            }
        }
    }
}
