//! The handler set registered for one mount.
//!
//! ```ignore
//! let ops = Operations::new()
//!     .getattr(|_ctx, args, reply| match args.path.as_str() {
//!         "/" => reply.attr(FileStat::directory(0o755)),
//!         _ => reply.error(libc::ENOENT),
//!     })
//!     .readdir(|_ctx, _args, reply| reply.entries([".", ".."]));
//! ```

use std::fmt;

use crate::reply::*;
use crate::request::*;

/// A handler for one operation kind. Handlers run on the dispatcher's
/// thread and need not be `Send`; they may complete their reply later from a
/// task spawned on that thread.
pub type Handler<A, R> = Box<dyn Fn(&RequestContext, A, R)>;

macro_rules! operations {
    ($( $kind:ident => $name:ident($args:ty, $reply:ty); )*) => {
        /// Mapping from operation kind to an optional handler. Kinds without
        /// a handler are answered by the bridge's unsupported policy.
        #[derive(Default)]
        pub struct Operations {
            $( pub(crate) $name: Option<Handler<$args, $reply>>, )*
        }

        impl Operations {
            $(
                pub fn $name(mut self, handler: impl Fn(&RequestContext, $args, $reply) + 'static) -> Self {
                    self.$name = Some(Box::new(handler));
                    self
                }
            )*

            pub fn has(&self, kind: OpKind) -> bool {
                match kind {
                    $( OpKind::$kind => self.$name.is_some(), )*
                }
            }
        }
    };
}

operations! {
    Init => init(MountArgs, ReplyEmpty);
    Error => error(ErrorArgs, ReplyEmpty);
    Destroy => destroy(MountArgs, ReplyEmpty);
    Getattr => getattr(PathArgs, ReplyAttr);
    Fgetattr => fgetattr(HandleArgs, ReplyAttr);
    Statfs => statfs(PathArgs, ReplyStatfs);
    Access => access(ModeArgs, ReplyEmpty);
    Open => open(OpenArgs, ReplyOpen);
    Opendir => opendir(OpenArgs, ReplyOpen);
    Create => create(CreateArgs, ReplyOpen);
    Read => read(IoArgs, ReplyData);
    Write => write(IoArgs, ReplyData);
    Flush => flush(HandleArgs, ReplyEmpty);
    Release => release(HandleArgs, ReplyEmpty);
    Releasedir => releasedir(HandleArgs, ReplyEmpty);
    Readdir => readdir(ReaddirArgs, ReplyDirectory);
    Fsync => fsync(SyncArgs, ReplyEmpty);
    Fsyncdir => fsyncdir(SyncArgs, ReplyEmpty);
    Truncate => truncate(TruncateArgs, ReplyEmpty);
    Ftruncate => ftruncate(FtruncateArgs, ReplyEmpty);
    Readlink => readlink(PathArgs, ReplyReadlink);
    Symlink => symlink(LinkArgs, ReplyEmpty);
    Link => link(LinkArgs, ReplyEmpty);
    Rename => rename(LinkArgs, ReplyEmpty);
    Unlink => unlink(PathArgs, ReplyEmpty);
    Mkdir => mkdir(ModeArgs, ReplyEmpty);
    Rmdir => rmdir(PathArgs, ReplyEmpty);
    Mknod => mknod(MknodArgs, ReplyEmpty);
    Chown => chown(ChownArgs, ReplyEmpty);
    Chmod => chmod(ModeArgs, ReplyEmpty);
    Setxattr => setxattr(SetxattrArgs, ReplyEmpty);
    Getxattr => getxattr(GetxattrArgs, ReplyData);
    Utimens => utimens(UtimensArgs, ReplyEmpty);
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<OpKind> {
        OpKind::ALL
            .iter()
            .copied()
            .filter(|k| self.has(*k))
            .collect()
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations")
            .field("registered", &self.registered())
            .finish()
    }
}
