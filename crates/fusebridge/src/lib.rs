//! Bridges blocking kernel filesystem sessions into a single-threaded
//! handler dispatcher.
//!
//! Each mount gets its own driver thread that serves kernel calls. Calls are
//! forwarded as requests to a [`Dispatcher`] running on the application's
//! thread, which invokes the handlers registered in [`Operations`]. The
//! driver blocks until the handler completes its typed reply.

pub mod attr;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fuse;
pub mod gate;
pub mod inode;
pub mod kernel;
pub mod mount;
pub mod ops;
pub mod registry;
pub mod reply;
pub mod request;
pub mod sim;

pub use attr::{FileInfo, FileStat, FileType, StatFs};
pub use bridge::{Bridge, MountHandle};
pub use buffer::{BufferError, KernelBuf};
pub use config::{BridgeConfig, UnsupportedPolicy};
pub use dispatch::Dispatcher;
pub use error::{BridgeError, Result};
pub use fuse::FuseKernel;
pub use kernel::{Kernel, KernelError, KernelSession, VfsOps};
pub use mount::MountOptions;
pub use ops::Operations;
pub use registry::MountStats;
pub use reply::{
    ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyOpen, ReplyReadlink, ReplyStatfs,
};
pub use request::{OpKind, RequestContext};
pub use sim::{SimClient, SimKernel};
