//! The kernel call interface the bridge sits behind.
//!
//! A [`Kernel`] performs the mount handshake and produces a
//! [`KernelSession`] whose blocking service loop invokes [`VfsOps`] entry
//! points, one call at a time, on the driver thread.

use std::time::SystemTime;

use thiserror::Error;

use crate::attr::{FileInfo, FileStat, StatFs};
use crate::mount::MountOptions;
use crate::request::RequestContext;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Failed to mount {mountpoint}: {reason}")]
    MountFailed { mountpoint: String, reason: String },

    #[error("Kernel session error: {0}")]
    Session(#[from] std::io::Error),

    #[error("Failed to unmount {mountpoint}: {reason}")]
    UnmountFailed { mountpoint: String, reason: String },
}

impl KernelError {
    pub fn to_errno(&self) -> i32 {
        match self {
            KernelError::MountFailed { .. } => libc::EIO,
            KernelError::Session(e) => e.raw_os_error().unwrap_or(libc::EIO),
            KernelError::UnmountFailed { .. } => libc::EBUSY,
        }
    }
}

pub trait Kernel: Send + Sync + 'static {
    /// Performs the mount handshake. Runs on the mount's driver thread.
    fn connect(
        &self,
        mountpoint: &str,
        options: &MountOptions,
        ops: Box<dyn VfsOps>,
    ) -> Result<Box<dyn KernelSession>, KernelError>;

    /// Tears down the session mounted at `mountpoint` from any thread, making
    /// its service loop return.
    fn force_unmount(&self, mountpoint: &str) -> Result<(), KernelError>;
}

pub trait KernelSession {
    /// Serves kernel calls until the session ends.
    fn run(&mut self) -> Result<(), KernelError>;
}

/// Receives directory entries during READDIR.
pub trait DirFiller {
    /// Adds one entry. Returns true when the kernel's buffer is full and no
    /// more entries should be offered.
    fn fill(&mut self, name: &str) -> bool;
}

impl<F> DirFiller for F
where
    F: FnMut(&str) -> bool,
{
    fn fill(&mut self, name: &str) -> bool {
        self(name)
    }
}

/// Path-addressed filesystem entry points, each returning 0 (or a byte
/// count) on success and a negative errno on failure. Outputs are written
/// into the caller's memory only on success.
pub trait VfsOps: Send {
    /// Called once by the session when the handshake has completed.
    fn init(&mut self, ctx: RequestContext) -> i32;

    fn getattr(&mut self, ctx: RequestContext, path: &str, stat: &mut FileStat) -> i32;

    fn fgetattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        stat: &mut FileStat,
        info: &FileInfo,
    ) -> i32;

    fn statfs(&mut self, ctx: RequestContext, path: &str, stat: &mut StatFs) -> i32;

    fn access(&mut self, ctx: RequestContext, path: &str, mask: u32) -> i32;

    fn open(&mut self, ctx: RequestContext, path: &str, info: &mut FileInfo) -> i32;

    fn opendir(&mut self, ctx: RequestContext, path: &str, info: &mut FileInfo) -> i32;

    fn create(&mut self, ctx: RequestContext, path: &str, mode: u32, info: &mut FileInfo) -> i32;

    fn read(
        &mut self,
        ctx: RequestContext,
        path: &str,
        buf: &mut [u8],
        offset: u64,
        info: &FileInfo,
    ) -> i32;

    fn write(
        &mut self,
        ctx: RequestContext,
        path: &str,
        data: &[u8],
        offset: u64,
        info: &FileInfo,
    ) -> i32;

    fn flush(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32;

    fn release(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32;

    fn releasedir(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32;

    fn readdir(
        &mut self,
        ctx: RequestContext,
        path: &str,
        filler: &mut dyn DirFiller,
        offset: u64,
        info: &FileInfo,
    ) -> i32;

    fn fsync(&mut self, ctx: RequestContext, path: &str, datasync: bool, info: &FileInfo) -> i32;

    fn fsyncdir(
        &mut self,
        ctx: RequestContext,
        path: &str,
        datasync: bool,
        info: &FileInfo,
    ) -> i32;

    fn truncate(&mut self, ctx: RequestContext, path: &str, size: u64) -> i32;

    fn ftruncate(&mut self, ctx: RequestContext, path: &str, size: u64, info: &FileInfo) -> i32;

    /// Writes the NUL-terminated link target into `buf`.
    fn readlink(&mut self, ctx: RequestContext, path: &str, buf: &mut [u8]) -> i32;

    fn symlink(&mut self, ctx: RequestContext, target: &str, linkpath: &str) -> i32;

    fn link(&mut self, ctx: RequestContext, from: &str, to: &str) -> i32;

    fn rename(&mut self, ctx: RequestContext, from: &str, to: &str) -> i32;

    fn unlink(&mut self, ctx: RequestContext, path: &str) -> i32;

    fn mkdir(&mut self, ctx: RequestContext, path: &str, mode: u32) -> i32;

    fn rmdir(&mut self, ctx: RequestContext, path: &str) -> i32;

    fn mknod(&mut self, ctx: RequestContext, path: &str, mode: u32, dev: u64) -> i32;

    fn chown(&mut self, ctx: RequestContext, path: &str, uid: u32, gid: u32) -> i32;

    fn chmod(&mut self, ctx: RequestContext, path: &str, mode: u32) -> i32;

    fn setxattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        name: &str,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> i32;

    /// With an empty `value` buffer, returns the size of the attribute.
    fn getxattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        name: &str,
        value: &mut [u8],
        position: u32,
    ) -> i32;

    fn utimens(
        &mut self,
        ctx: RequestContext,
        path: &str,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> i32;
}
