//! In-process kernel for exercising handlers without FUSE.
//!
//! `SimKernel` accepts mounts like a real kernel would and lets plain
//! threads issue filesystem calls against them through a [`SimClient`].
//! Calls are served one at a time on the mount's driver thread, exactly as
//! a kernel session would serve them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::attr::{FileInfo, FileStat, StatFs};
use crate::kernel::{Kernel, KernelError, KernelSession, VfsOps};
use crate::mount::MountOptions;
use crate::request::RequestContext;

type SimCall = Box<dyn FnOnce(&mut dyn VfsOps) + Send>;

enum SimMsg {
    Call(SimCall),
    Shutdown,
}

struct Channel {
    tx: mpsc::UnboundedSender<SimMsg>,
    rx: Option<mpsc::UnboundedReceiver<SimMsg>>,
}

#[derive(Default)]
struct SimState {
    channels: HashMap<String, Channel>,
    failures: HashMap<String, String>,
    connected: HashSet<String>,
    options: HashMap<String, String>,
    unmounts: Vec<String>,
}

impl SimState {
    fn channel(&mut self, mountpoint: &str) -> &mut Channel {
        self.channels
            .entry(mountpoint.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Channel { tx, rx: Some(rx) }
            })
    }
}

#[derive(Clone, Default)]
pub struct SimKernel {
    state: Arc<Mutex<SimState>>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next mount handshake at `mountpoint` fail with `reason`.
    pub fn fail_next_mount(&self, mountpoint: &str, reason: &str) {
        self.lock()
            .failures
            .insert(mountpoint.to_string(), reason.to_string());
    }

    /// A client issuing calls against whatever is, or will be, mounted at
    /// `mountpoint`.
    pub fn client(&self, mountpoint: &str) -> SimClient {
        let tx = self.lock().channel(mountpoint).tx.clone();
        SimClient {
            tx,
            ctx: RequestContext::default(),
        }
    }

    pub fn is_connected(&self, mountpoint: &str) -> bool {
        self.lock().connected.contains(mountpoint)
    }

    /// The assembled option string the mount at `mountpoint` was made with.
    pub fn mount_options(&self, mountpoint: &str) -> Option<String> {
        self.lock().options.get(mountpoint).cloned()
    }

    /// Mountpoints passed to `force_unmount`, in order.
    pub fn unmounts(&self) -> Vec<String> {
        self.lock().unmounts.clone()
    }
}

impl Kernel for SimKernel {
    fn connect(
        &self,
        mountpoint: &str,
        options: &MountOptions,
        ops: Box<dyn VfsOps>,
    ) -> Result<Box<dyn KernelSession>, KernelError> {
        let mut state = self.lock();
        if let Some(reason) = state.failures.remove(mountpoint) {
            state.channels.remove(mountpoint);
            return Err(KernelError::MountFailed {
                mountpoint: mountpoint.to_string(),
                reason,
            });
        }
        let rx = state
            .channel(mountpoint)
            .rx
            .take()
            .ok_or_else(|| KernelError::MountFailed {
                mountpoint: mountpoint.to_string(),
                reason: "device or resource busy".to_string(),
            })?;
        state.connected.insert(mountpoint.to_string());
        state
            .options
            .insert(mountpoint.to_string(), options.assembled());
        debug!(mountpoint, "sim session connected");
        Ok(Box::new(SimSession {
            mountpoint: mountpoint.to_string(),
            rx,
            ops,
            state: Arc::clone(&self.state),
        }))
    }

    fn force_unmount(&self, mountpoint: &str) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.unmounts.push(mountpoint.to_string());
        if !state.connected.remove(mountpoint) {
            return Err(KernelError::UnmountFailed {
                mountpoint: mountpoint.to_string(),
                reason: "not mounted".to_string(),
            });
        }
        if let Some(channel) = state.channels.remove(mountpoint) {
            let _ = channel.tx.send(SimMsg::Shutdown);
        }
        Ok(())
    }
}

struct SimSession {
    mountpoint: String,
    rx: mpsc::UnboundedReceiver<SimMsg>,
    ops: Box<dyn VfsOps>,
    state: Arc<Mutex<SimState>>,
}

impl KernelSession for SimSession {
    fn run(&mut self) -> Result<(), KernelError> {
        self.ops.init(RequestContext::default());
        while let Some(msg) = self.rx.blocking_recv() {
            match msg {
                SimMsg::Call(call) => call(self.ops.as_mut()),
                SimMsg::Shutdown => break,
            }
        }
        debug!(mountpoint = %self.mountpoint, "sim session ended");
        Ok(())
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.connected.remove(&self.mountpoint);
    }
}

/// Issues blocking filesystem calls against one simulated mount. Each
/// method returns the kernel-visible result code, with `-ENOTCONN` once the
/// session is gone. Must not be used from an async task.
#[derive(Clone)]
pub struct SimClient {
    tx: mpsc::UnboundedSender<SimMsg>,
    ctx: RequestContext,
}

impl SimClient {
    /// Issues subsequent calls as the given principal.
    pub fn with_context(mut self, ctx: RequestContext) -> Self {
        self.ctx = ctx;
        self
    }

    fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut dyn VfsOps, RequestContext) -> R + Send + 'static,
    ) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        let ctx = self.ctx;
        let msg = SimMsg::Call(Box::new(move |ops: &mut dyn VfsOps| {
            let _ = tx.send(f(ops, ctx));
        }));
        self.tx.send(msg).ok()?;
        rx.blocking_recv().ok()
    }

    fn code(&self, f: impl FnOnce(&mut dyn VfsOps, RequestContext) -> i32 + Send + 'static) -> i32 {
        self.call(f).unwrap_or(-libc::ENOTCONN)
    }

    fn with_output<T: Send + Default + 'static>(
        &self,
        f: impl FnOnce(&mut dyn VfsOps, RequestContext) -> (i32, T) + Send + 'static,
    ) -> (i32, T) {
        self.call(f)
            .unwrap_or_else(|| (-libc::ENOTCONN, T::default()))
    }

    pub fn getattr(&self, path: &str) -> (i32, FileStat) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut stat = FileStat::default();
            let code = ops.getattr(ctx, &path, &mut stat);
            (code, stat)
        })
    }

    pub fn fgetattr(&self, path: &str, fh: u64) -> (i32, FileStat) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut stat = FileStat::default();
            let code = ops.fgetattr(ctx, &path, &mut stat, &FileInfo::new(0, fh));
            (code, stat)
        })
    }

    pub fn statfs(&self, path: &str) -> (i32, StatFs) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut stat = StatFs::default();
            let code = ops.statfs(ctx, &path, &mut stat);
            (code, stat)
        })
    }

    pub fn access(&self, path: &str, mask: u32) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.access(ctx, &path, mask))
    }

    /// Returns the result code and the file handle the handler chose.
    pub fn open(&self, path: &str, flags: i32) -> (i32, u64) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut info = FileInfo::new(flags, 0);
            let code = ops.open(ctx, &path, &mut info);
            (code, info.fh)
        })
    }

    pub fn opendir(&self, path: &str, flags: i32) -> (i32, u64) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut info = FileInfo::new(flags, 0);
            let code = ops.opendir(ctx, &path, &mut info);
            (code, info.fh)
        })
    }

    pub fn create(&self, path: &str, mode: u32, flags: i32) -> (i32, u64) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut info = FileInfo::new(flags, 0);
            let code = ops.create(ctx, &path, mode, &mut info);
            (code, info.fh)
        })
    }

    /// Reads up to `size` bytes. The returned bytes are truncated to the
    /// result code when it is a non-negative byte count.
    pub fn read(&self, path: &str, fh: u64, size: usize, offset: u64) -> (i32, Vec<u8>) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut buf = vec![0u8; size];
            let code = ops.read(ctx, &path, &mut buf, offset, &FileInfo::new(0, fh));
            if code >= 0 {
                buf.truncate(code as usize);
            }
            (code, buf)
        })
    }

    pub fn write(&self, path: &str, fh: u64, data: &[u8], offset: u64) -> i32 {
        let path = path.to_string();
        let data = data.to_vec();
        self.code(move |ops, ctx| ops.write(ctx, &path, &data, offset, &FileInfo::new(0, fh)))
    }

    pub fn flush(&self, path: &str, fh: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.flush(ctx, &path, &FileInfo::new(0, fh)))
    }

    pub fn release(&self, path: &str, fh: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.release(ctx, &path, &FileInfo::new(0, fh)))
    }

    pub fn releasedir(&self, path: &str, fh: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.releasedir(ctx, &path, &FileInfo::new(0, fh)))
    }

    pub fn readdir(&self, path: &str) -> (i32, Vec<String>) {
        self.readdir_limited(path, usize::MAX)
    }

    /// Lists a directory with a fill routine that reports a full buffer
    /// after accepting `limit` names. The returned names are every name the
    /// fill routine was offered.
    pub fn readdir_limited(&self, path: &str, limit: usize) -> (i32, Vec<String>) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut names = Vec::new();
            let mut filler = |name: &str| {
                names.push(name.to_string());
                names.len() >= limit
            };
            let code = ops.readdir(ctx, &path, &mut filler, 0, &FileInfo::default());
            (code, names)
        })
    }

    pub fn fsync(&self, path: &str, fh: u64, datasync: bool) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.fsync(ctx, &path, datasync, &FileInfo::new(0, fh)))
    }

    pub fn fsyncdir(&self, path: &str, fh: u64, datasync: bool) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.fsyncdir(ctx, &path, datasync, &FileInfo::new(0, fh)))
    }

    pub fn truncate(&self, path: &str, size: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.truncate(ctx, &path, size))
    }

    pub fn ftruncate(&self, path: &str, fh: u64, size: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.ftruncate(ctx, &path, size, &FileInfo::new(0, fh)))
    }

    /// Reads a link into a buffer of `capacity` bytes and returns the raw buffer.
    pub fn readlink(&self, path: &str, capacity: usize) -> (i32, Vec<u8>) {
        let path = path.to_string();
        self.with_output(move |ops, ctx| {
            let mut buf = vec![0u8; capacity];
            let code = ops.readlink(ctx, &path, &mut buf);
            (code, buf)
        })
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> i32 {
        let (target, linkpath) = (target.to_string(), linkpath.to_string());
        self.code(move |ops, ctx| ops.symlink(ctx, &target, &linkpath))
    }

    pub fn link(&self, from: &str, to: &str) -> i32 {
        let (from, to) = (from.to_string(), to.to_string());
        self.code(move |ops, ctx| ops.link(ctx, &from, &to))
    }

    pub fn rename(&self, from: &str, to: &str) -> i32 {
        let (from, to) = (from.to_string(), to.to_string());
        self.code(move |ops, ctx| ops.rename(ctx, &from, &to))
    }

    pub fn unlink(&self, path: &str) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.unlink(ctx, &path))
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.mkdir(ctx, &path, mode))
    }

    pub fn rmdir(&self, path: &str) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.rmdir(ctx, &path))
    }

    pub fn mknod(&self, path: &str, mode: u32, dev: u64) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.mknod(ctx, &path, mode, dev))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.chown(ctx, &path, uid, gid))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.chmod(ctx, &path, mode))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32, position: u32) -> i32 {
        let (path, name, value) = (path.to_string(), name.to_string(), value.to_vec());
        self.code(move |ops, ctx| ops.setxattr(ctx, &path, &name, &value, flags, position))
    }

    /// Reads an attribute into a buffer of `size` bytes, truncated to the
    /// result code on success.
    pub fn getxattr(&self, path: &str, name: &str, size: usize, position: u32) -> (i32, Vec<u8>) {
        let (path, name) = (path.to_string(), name.to_string());
        self.with_output(move |ops, ctx| {
            let mut buf = vec![0u8; size];
            let code = ops.getxattr(ctx, &path, &name, &mut buf, position);
            if code >= 0 {
                buf.truncate((code as usize).min(size));
            }
            (code, buf)
        })
    }

    pub fn utimens(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> i32 {
        let path = path.to_string();
        self.code(move |ops, ctx| ops.utimens(ctx, &path, atime, mtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::DirFiller;

    /// Answers every call with a fixed code and records what it saw.
    struct Echo {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Echo {
        fn note(&self, what: String) -> i32 {
            self.seen.lock().unwrap().push(what);
            0
        }
    }

    impl VfsOps for Echo {
        fn init(&mut self, _: RequestContext) -> i32 {
            self.note("init".into())
        }
        fn getattr(&mut self, ctx: RequestContext, path: &str, stat: &mut FileStat) -> i32 {
            stat.uid = ctx.uid;
            self.note(format!("getattr {}", path))
        }
        fn fgetattr(&mut self, _: RequestContext, p: &str, _: &mut FileStat, _: &FileInfo) -> i32 {
            self.note(format!("fgetattr {}", p))
        }
        fn statfs(&mut self, _: RequestContext, p: &str, _: &mut StatFs) -> i32 {
            self.note(format!("statfs {}", p))
        }
        fn access(&mut self, _: RequestContext, p: &str, _: u32) -> i32 {
            self.note(format!("access {}", p))
        }
        fn open(&mut self, _: RequestContext, _: &str, info: &mut FileInfo) -> i32 {
            info.fh = 5;
            0
        }
        fn opendir(&mut self, _: RequestContext, _: &str, _: &mut FileInfo) -> i32 {
            0
        }
        fn create(&mut self, _: RequestContext, _: &str, _: u32, _: &mut FileInfo) -> i32 {
            0
        }
        fn read(&mut self, _: RequestContext, _: &str, buf: &mut [u8], _: u64, _: &FileInfo) -> i32 {
            buf[..2].copy_from_slice(b"ok");
            2
        }
        fn write(&mut self, _: RequestContext, _: &str, d: &[u8], _: u64, _: &FileInfo) -> i32 {
            d.len() as i32
        }
        fn flush(&mut self, _: RequestContext, _: &str, _: &FileInfo) -> i32 {
            0
        }
        fn release(&mut self, _: RequestContext, _: &str, _: &FileInfo) -> i32 {
            0
        }
        fn releasedir(&mut self, _: RequestContext, _: &str, _: &FileInfo) -> i32 {
            0
        }
        fn readdir(
            &mut self,
            _: RequestContext,
            _: &str,
            filler: &mut dyn DirFiller,
            _: u64,
            _: &FileInfo,
        ) -> i32 {
            for name in ["a", "b", "c"] {
                if filler.fill(name) {
                    break;
                }
            }
            0
        }
        fn fsync(&mut self, _: RequestContext, _: &str, _: bool, _: &FileInfo) -> i32 {
            0
        }
        fn fsyncdir(&mut self, _: RequestContext, _: &str, _: bool, _: &FileInfo) -> i32 {
            0
        }
        fn truncate(&mut self, _: RequestContext, _: &str, _: u64) -> i32 {
            0
        }
        fn ftruncate(&mut self, _: RequestContext, _: &str, _: u64, _: &FileInfo) -> i32 {
            0
        }
        fn readlink(&mut self, _: RequestContext, _: &str, _: &mut [u8]) -> i32 {
            0
        }
        fn symlink(&mut self, _: RequestContext, _: &str, _: &str) -> i32 {
            0
        }
        fn link(&mut self, _: RequestContext, _: &str, _: &str) -> i32 {
            0
        }
        fn rename(&mut self, _: RequestContext, _: &str, _: &str) -> i32 {
            0
        }
        fn unlink(&mut self, _: RequestContext, _: &str) -> i32 {
            0
        }
        fn mkdir(&mut self, _: RequestContext, _: &str, _: u32) -> i32 {
            0
        }
        fn rmdir(&mut self, _: RequestContext, _: &str) -> i32 {
            0
        }
        fn mknod(&mut self, _: RequestContext, _: &str, _: u32, _: u64) -> i32 {
            0
        }
        fn chown(&mut self, _: RequestContext, _: &str, _: u32, _: u32) -> i32 {
            0
        }
        fn chmod(&mut self, _: RequestContext, _: &str, _: u32) -> i32 {
            0
        }
        fn setxattr(&mut self, _: RequestContext, _: &str, _: &str, _: &[u8], _: i32, _: u32) -> i32 {
            0
        }
        fn getxattr(&mut self, _: RequestContext, _: &str, _: &str, _: &mut [u8], _: u32) -> i32 {
            0
        }
        fn utimens(&mut self, _: RequestContext, _: &str, _: SystemTime, _: SystemTime) -> i32 {
            0
        }
    }

    fn start(
        kernel: &SimKernel,
        path: &str,
    ) -> (std::thread::JoinHandle<()>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ops = Box::new(Echo {
            seen: Arc::clone(&seen),
        });
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let kernel = kernel.clone();
        let path = path.to_string();
        let thread = std::thread::spawn(move || {
            let mut session = kernel
                .connect(&path, &MountOptions::new(["ro"]), ops)
                .unwrap();
            ready_tx.send(()).unwrap();
            session.run().unwrap();
        });
        ready_rx.recv().unwrap();
        (thread, seen)
    }

    #[test]
    fn test_calls_reach_session() {
        let kernel = SimKernel::new();
        let (thread, seen) = start(&kernel, "/sim");
        assert!(kernel.is_connected("/sim"));
        assert_eq!(kernel.mount_options("/sim").as_deref(), Some("ro"));

        let client = kernel
            .client("/sim")
            .with_context(RequestContext::new(42, 1, 2));
        let (code, stat) = client.getattr("/f");
        assert_eq!(code, 0);
        assert_eq!(stat.uid, 42);
        assert_eq!(client.open("/f", 0), (0, 5));
        assert_eq!(client.read("/f", 5, 16, 0), (2, b"ok".to_vec()));
        assert_eq!(client.write("/f", 5, b"abc", 0), 3);

        kernel.force_unmount("/sim").unwrap();
        thread.join().unwrap();
        assert!(!kernel.is_connected("/sim"));
        assert_eq!(seen.lock().unwrap()[0], "init");
        assert_eq!(client.access("/f", 0), -libc::ENOTCONN);
    }

    #[test]
    fn test_readdir_limited_stops() {
        let kernel = SimKernel::new();
        let (thread, _) = start(&kernel, "/sim");
        let client = kernel.client("/sim");
        assert_eq!(client.readdir("/").1, vec!["a", "b", "c"]);
        assert_eq!(client.readdir_limited("/", 2).1, vec!["a", "b"]);
        kernel.force_unmount("/sim").unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_injected_failure() {
        let kernel = SimKernel::new();
        let client = kernel.client("/sim");
        kernel.fail_next_mount("/sim", "no device");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = kernel
            .connect("/sim", &MountOptions::default(), Box::new(Echo { seen }))
            .err()
            .unwrap();
        assert!(err.to_string().contains("no device"));
        assert_eq!(client.unlink("/x"), -libc::ENOTCONN);
    }

    #[test]
    fn test_double_connect_is_busy() {
        let kernel = SimKernel::new();
        let (thread, _) = start(&kernel, "/sim");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let second = kernel.connect("/sim", &MountOptions::default(), Box::new(Echo { seen }));
        assert!(second.is_err());
        kernel.force_unmount("/sim").unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_force_unmount_unknown() {
        let kernel = SimKernel::new();
        assert!(kernel.force_unmount("/nothing").is_err());
        assert_eq!(kernel.unmounts(), vec!["/nothing"]);
    }
}
