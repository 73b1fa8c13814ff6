//! Attribute structures exchanged with the kernel interface.
//!
//! These mirror `struct stat`, `struct statvfs` and `struct fuse_file_info`
//! closely enough that a kernel adapter can copy them field by field.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_BLKSIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    NamedPipe,
    Socket,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }

    pub fn to_fuser(self) -> fuser::FileType {
        match self {
            FileType::RegularFile => fuser::FileType::RegularFile,
            FileType::Directory => fuser::FileType::Directory,
            FileType::Symlink => fuser::FileType::Symlink,
            FileType::BlockDevice => fuser::FileType::BlockDevice,
            FileType::CharDevice => fuser::FileType::CharDevice,
            FileType::NamedPipe => fuser::FileType::NamedPipe,
            FileType::Socket => fuser::FileType::Socket,
        }
    }
}

/// File attributes as filled in by GETATTR / FGETATTR handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Default for FileStat {
    fn default() -> Self {
        FileStat {
            dev: 0,
            ino: 0,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }
}

impl FileStat {
    /// Regular file with the given permission bits and size, timestamps set to now.
    pub fn file(perm: u32, size: u64) -> Self {
        let now = SystemTime::now();
        FileStat {
            mode: libc::S_IFREG as u32 | (perm & 0o7777),
            nlink: 1,
            size,
            blocks: blocks_for_size(size),
            blksize: DEFAULT_BLKSIZE,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub fn directory(perm: u32) -> Self {
        let now = SystemTime::now();
        FileStat {
            mode: libc::S_IFDIR as u32 | (perm & 0o7777),
            nlink: 2,
            size: DEFAULT_BLKSIZE as u64,
            blocks: 1,
            blksize: DEFAULT_BLKSIZE,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub fn symlink(target_len: u64) -> Self {
        let now = SystemTime::now();
        FileStat {
            mode: libc::S_IFLNK as u32 | 0o777,
            nlink: 1,
            size: target_len,
            blocks: blocks_for_size(target_len),
            blksize: DEFAULT_BLKSIZE,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    /// Converts to the attribute record `fuser` replies with, under the inode
    /// number the adapter assigned to this path.
    pub fn to_fuser(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: self.kind().to_fuser(),
            perm: self.perm(),
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev as u32,
            blksize: if self.blksize == 0 {
                DEFAULT_BLKSIZE
            } else {
                self.blksize
            },
            flags: 0,
        }
    }
}

/// Filesystem statistics as filled in by STATFS handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u32,
}

/// Per-open-file state the kernel threads through OPEN .. RELEASE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub flags: i32,
    pub fh: u64,
}

impl FileInfo {
    pub fn new(flags: i32, fh: u64) -> Self {
        FileInfo { flags, fh }
    }
}

pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

/// Splits a point in time into seconds and nanoseconds relative to the epoch.
/// Times before the epoch yield negative seconds with non-negative nanos.
pub fn to_timespec(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            let secs = d.as_secs() as i64;
            let nanos = d.subsec_nanos();
            if nanos == 0 {
                (-secs, 0)
            } else {
                (-secs - 1, 1_000_000_000 - nanos)
            }
        }
    }
}

pub fn from_timespec(secs: i64, nanos: u32) -> SystemTime {
    let nanos = nanos.min(999_999_999);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nanos as u64)
    }
}
