//! Per-mount driver thread.
//!
//! The driver thread owns the kernel session. Every kernel call it serves is
//! turned into a [`Request`], handed to the dispatcher, and the thread blocks
//! on the mount's completion gate until a handler answers.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::attr::{FileInfo, FileStat, StatFs};
use crate::buffer::{lend, lend_mut};
use crate::gate::GateOutcome;
use crate::kernel::{DirFiller, Kernel, VfsOps};
use crate::registry::{MountEntry, MountId, Registry};
use crate::reply::{Completion, Payload};
use crate::request::*;

/// Signals raised by driver threads for the dispatcher.
#[derive(Debug)]
pub enum Wake {
    /// Call `seq` of `entry` is waiting in its request record.
    Dispatch { entry: Arc<MountEntry>, seq: u64 },
    /// The driver thread of mount `id` has finished.
    Exited { id: MountId },
}

#[derive(Clone)]
pub(crate) struct MountDriver {
    entry: Arc<MountEntry>,
    wake: UnboundedSender<Wake>,
}

pub(crate) fn spawn(
    kernel: Arc<dyn Kernel>,
    registry: Arc<Registry>,
    entry: Arc<MountEntry>,
    wake: UnboundedSender<Wake>,
) -> io::Result<JoinHandle<()>> {
    let driver = MountDriver { entry, wake };
    thread::Builder::new()
        .name(format!("fusebridge-{}", driver.entry.index()))
        .spawn(move || driver.run(kernel, registry))
}

impl MountDriver {
    fn run(self, kernel: Arc<dyn Kernel>, registry: Arc<Registry>) {
        let mountpoint = self.entry.mountpoint().to_string();
        let ops: Box<dyn VfsOps> = Box::new(self.clone());

        match kernel.connect(&mountpoint, self.entry.options(), ops) {
            Err(e) => {
                error!(slot = self.entry.index(), %mountpoint, "mount failed: {}", e);
                self.call(
                    RequestContext::default(),
                    Request::Error(ErrorArgs {
                        mountpoint: mountpoint.clone(),
                        reason: e.to_string(),
                    }),
                );
            }
            Ok(mut session) => {
                if self.entry.is_garbage() {
                    debug!(slot = self.entry.index(), "unmounted during handshake");
                } else if let Err(e) = session.run() {
                    warn!(slot = self.entry.index(), %mountpoint, "session ended: {}", e);
                }
                info!(slot = self.entry.index(), %mountpoint, "session finished");
                self.call(
                    RequestContext::default(),
                    Request::Destroy(MountArgs {
                        mountpoint: mountpoint.clone(),
                    }),
                );
                drop(session);
            }
        }

        registry.release(&self.entry);
        let _ = self.wake.send(Wake::Exited {
            id: self.entry.id(),
        });
    }

    /// Issues one request and blocks until it is completed.
    fn call(&self, ctx: RequestContext, request: Request) -> Completion {
        let kind = request.kind();
        let seq = self.entry.begin(ctx, request);
        if kind != OpKind::Destroy && self.entry.is_garbage() {
            debug!(
                slot = self.entry.index(),
                op = %kind,
                "refused call on unmounting filesystem"
            );
            self.entry.gate().disarm(seq);
            return Completion::error(-libc::ENOTCONN);
        }
        let wake = Wake::Dispatch {
            entry: Arc::clone(&self.entry),
            seq,
        };
        if self.wake.send(wake).is_err() {
            warn!(slot = self.entry.index(), "dispatcher is gone");
            self.entry.gate().disarm(seq);
            return Completion::error(-libc::ENOTCONN);
        }
        match self.entry.gate().wait(seq) {
            GateOutcome::Completed(completion) => completion,
            GateOutcome::Aborted => {
                self.entry.note_aborted();
                Completion::error(-libc::ENOTCONN)
            }
        }
    }

    fn call_code(&self, ctx: RequestContext, request: Request) -> i32 {
        self.call(ctx, request).code
    }
}

/// Feeds `names` to the kernel's fill routine until it reports a full buffer.
/// Returns the number of fill calls made.
pub(crate) fn fill_entries(filler: &mut dyn DirFiller, names: &[String]) -> usize {
    let mut calls = 0;
    for name in names {
        calls += 1;
        if filler.fill(name) {
            break;
        }
    }
    calls
}

/// Copies a link target into `buf`, truncating to leave room for the NUL.
pub(crate) fn copy_link_target(buf: &mut [u8], target: &str) {
    if buf.is_empty() {
        return;
    }
    let n = target.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&target.as_bytes()[..n]);
    buf[n] = 0;
}

fn path_args(path: &str) -> PathArgs {
    PathArgs {
        path: path.to_string(),
    }
}

fn handle_args(path: &str, info: &FileInfo) -> HandleArgs {
    HandleArgs {
        path: path.to_string(),
        fh: info.fh,
    }
}

fn mode_args(path: &str, mode: u32) -> ModeArgs {
    ModeArgs {
        path: path.to_string(),
        mode,
    }
}

fn link_args(path: &str, dest: &str) -> LinkArgs {
    LinkArgs {
        path: path.to_string(),
        dest: dest.to_string(),
    }
}

impl VfsOps for MountDriver {
    fn init(&mut self, ctx: RequestContext) -> i32 {
        let mountpoint = self.entry.mountpoint().to_string();
        info!(slot = self.entry.index(), %mountpoint, "mounted");
        self.call_code(ctx, Request::Init(MountArgs { mountpoint }))
    }

    fn getattr(&mut self, ctx: RequestContext, path: &str, stat: &mut FileStat) -> i32 {
        let completion = self.call(ctx, Request::Getattr(path_args(path)));
        if let Payload::Attr(s) = completion.payload {
            *stat = s;
        }
        completion.code
    }

    fn fgetattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        stat: &mut FileStat,
        info: &FileInfo,
    ) -> i32 {
        let completion = self.call(ctx, Request::Fgetattr(handle_args(path, info)));
        if let Payload::Attr(s) = completion.payload {
            *stat = s;
        }
        completion.code
    }

    fn statfs(&mut self, ctx: RequestContext, path: &str, stat: &mut StatFs) -> i32 {
        let completion = self.call(ctx, Request::Statfs(path_args(path)));
        if let Payload::Statfs(s) = completion.payload {
            *stat = s;
        }
        completion.code
    }

    fn access(&mut self, ctx: RequestContext, path: &str, mask: u32) -> i32 {
        self.call_code(ctx, Request::Access(mode_args(path, mask)))
    }

    fn open(&mut self, ctx: RequestContext, path: &str, info: &mut FileInfo) -> i32 {
        let request = Request::Open(OpenArgs {
            path: path.to_string(),
            flags: info.flags,
        });
        let completion = self.call(ctx, request);
        if let Payload::Handle(fh) = completion.payload {
            info.fh = fh;
        }
        completion.code
    }

    fn opendir(&mut self, ctx: RequestContext, path: &str, info: &mut FileInfo) -> i32 {
        let request = Request::Opendir(OpenArgs {
            path: path.to_string(),
            flags: info.flags,
        });
        let completion = self.call(ctx, request);
        if let Payload::Handle(fh) = completion.payload {
            info.fh = fh;
        }
        completion.code
    }

    fn create(&mut self, ctx: RequestContext, path: &str, mode: u32, info: &mut FileInfo) -> i32 {
        let request = Request::Create(CreateArgs {
            path: path.to_string(),
            mode,
            flags: info.flags,
        });
        let completion = self.call(ctx, request);
        if let Payload::Handle(fh) = completion.payload {
            info.fh = fh;
        }
        completion.code
    }

    fn read(
        &mut self,
        ctx: RequestContext,
        path: &str,
        buf: &mut [u8],
        offset: u64,
        info: &FileInfo,
    ) -> i32 {
        lend_mut(buf, |buf| {
            let request = Request::Read(IoArgs {
                path: path.to_string(),
                fh: info.fh,
                buf,
                offset,
            });
            self.call_code(ctx, request)
        })
    }

    fn write(
        &mut self,
        ctx: RequestContext,
        path: &str,
        data: &[u8],
        offset: u64,
        info: &FileInfo,
    ) -> i32 {
        lend(data, |buf| {
            let request = Request::Write(IoArgs {
                path: path.to_string(),
                fh: info.fh,
                buf,
                offset,
            });
            self.call_code(ctx, request)
        })
    }

    fn flush(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32 {
        self.call_code(ctx, Request::Flush(handle_args(path, info)))
    }

    fn release(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32 {
        self.call_code(ctx, Request::Release(handle_args(path, info)))
    }

    fn releasedir(&mut self, ctx: RequestContext, path: &str, info: &FileInfo) -> i32 {
        self.call_code(ctx, Request::Releasedir(handle_args(path, info)))
    }

    fn readdir(
        &mut self,
        ctx: RequestContext,
        path: &str,
        filler: &mut dyn DirFiller,
        offset: u64,
        info: &FileInfo,
    ) -> i32 {
        let request = Request::Readdir(ReaddirArgs {
            path: path.to_string(),
            fh: info.fh,
            offset,
        });
        let completion = self.call(ctx, request);
        if let Payload::Entries(names) = &completion.payload {
            fill_entries(filler, names);
        }
        completion.code
    }

    fn fsync(&mut self, ctx: RequestContext, path: &str, datasync: bool, info: &FileInfo) -> i32 {
        let request = Request::Fsync(SyncArgs {
            path: path.to_string(),
            fh: info.fh,
            datasync,
        });
        self.call_code(ctx, request)
    }

    fn fsyncdir(
        &mut self,
        ctx: RequestContext,
        path: &str,
        datasync: bool,
        info: &FileInfo,
    ) -> i32 {
        let request = Request::Fsyncdir(SyncArgs {
            path: path.to_string(),
            fh: info.fh,
            datasync,
        });
        self.call_code(ctx, request)
    }

    fn truncate(&mut self, ctx: RequestContext, path: &str, size: u64) -> i32 {
        let request = Request::Truncate(TruncateArgs {
            path: path.to_string(),
            size,
        });
        self.call_code(ctx, request)
    }

    fn ftruncate(&mut self, ctx: RequestContext, path: &str, size: u64, info: &FileInfo) -> i32 {
        let request = Request::Ftruncate(FtruncateArgs {
            path: path.to_string(),
            fh: info.fh,
            size,
        });
        self.call_code(ctx, request)
    }

    fn readlink(&mut self, ctx: RequestContext, path: &str, buf: &mut [u8]) -> i32 {
        let completion = self.call(ctx, Request::Readlink(path_args(path)));
        if let Payload::LinkTarget(target) = &completion.payload {
            copy_link_target(buf, target);
        }
        completion.code
    }

    fn symlink(&mut self, ctx: RequestContext, target: &str, linkpath: &str) -> i32 {
        self.call_code(ctx, Request::Symlink(link_args(target, linkpath)))
    }

    fn link(&mut self, ctx: RequestContext, from: &str, to: &str) -> i32 {
        self.call_code(ctx, Request::Link(link_args(from, to)))
    }

    fn rename(&mut self, ctx: RequestContext, from: &str, to: &str) -> i32 {
        self.call_code(ctx, Request::Rename(link_args(from, to)))
    }

    fn unlink(&mut self, ctx: RequestContext, path: &str) -> i32 {
        self.call_code(ctx, Request::Unlink(path_args(path)))
    }

    fn mkdir(&mut self, ctx: RequestContext, path: &str, mode: u32) -> i32 {
        self.call_code(ctx, Request::Mkdir(mode_args(path, mode)))
    }

    fn rmdir(&mut self, ctx: RequestContext, path: &str) -> i32 {
        self.call_code(ctx, Request::Rmdir(path_args(path)))
    }

    fn mknod(&mut self, ctx: RequestContext, path: &str, mode: u32, dev: u64) -> i32 {
        let request = Request::Mknod(MknodArgs {
            path: path.to_string(),
            mode,
            dev,
        });
        self.call_code(ctx, request)
    }

    fn chown(&mut self, ctx: RequestContext, path: &str, uid: u32, gid: u32) -> i32 {
        let request = Request::Chown(ChownArgs {
            path: path.to_string(),
            uid,
            gid,
        });
        self.call_code(ctx, request)
    }

    fn chmod(&mut self, ctx: RequestContext, path: &str, mode: u32) -> i32 {
        self.call_code(ctx, Request::Chmod(mode_args(path, mode)))
    }

    fn setxattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        name: &str,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> i32 {
        lend(value, |value| {
            let request = Request::Setxattr(SetxattrArgs {
                path: path.to_string(),
                name: name.to_string(),
                value,
                position,
                flags,
            });
            self.call_code(ctx, request)
        })
    }

    fn getxattr(
        &mut self,
        ctx: RequestContext,
        path: &str,
        name: &str,
        value: &mut [u8],
        position: u32,
    ) -> i32 {
        lend_mut(value, |value| {
            let request = Request::Getxattr(GetxattrArgs {
                path: path.to_string(),
                name: name.to_string(),
                value,
                position,
            });
            self.call_code(ctx, request)
        })
    }

    fn utimens(
        &mut self,
        ctx: RequestContext,
        path: &str,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> i32 {
        let request = Request::Utimens(UtimensArgs {
            path: path.to_string(),
            atime,
            mtime,
        });
        self.call_code(ctx, request)
    }
}
