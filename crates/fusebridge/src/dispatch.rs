//! The single-threaded dispatcher.
//!
//! Drains wake signals from driver threads, turns each pending request
//! record into one handler invocation and hands the handler its reply.
//! Runs on the thread that hosts the handlers, normally inside a
//! `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::config::UnsupportedPolicy;
use crate::driver::Wake;
use crate::ops::Operations;
use crate::registry::{MountEntry, MountId};
use crate::reply::*;
use crate::request::{Request, RequestContext};

pub(crate) struct MountHandlers {
    pub(crate) ops: Operations,
    pub(crate) unsupported: UnsupportedPolicy,
}

pub(crate) type HandlerMap = Rc<RefCell<HashMap<MountId, Rc<MountHandlers>>>>;

/// Context of the handler invocation currently running, if any.
pub(crate) type CurrentContext = Rc<Cell<Option<RequestContext>>>;

pub struct Dispatcher {
    wake_rx: UnboundedReceiver<Wake>,
    handlers: HandlerMap,
    current: CurrentContext,
}

struct ContextScope<'a>(&'a CurrentContext);

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

impl Dispatcher {
    pub(crate) fn new(
        wake_rx: UnboundedReceiver<Wake>,
        handlers: HandlerMap,
        current: CurrentContext,
    ) -> Self {
        Dispatcher {
            wake_rx,
            handlers,
            current,
        }
    }

    /// Dispatches until every bridge handle and driver thread is gone.
    pub async fn run(mut self) {
        while let Some(wake) = self.wake_rx.recv().await {
            self.handle(wake);
        }
        debug!("dispatcher finished");
    }

    /// Dispatches whatever is already queued without waiting. Returns the
    /// number of signals handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(wake) = self.wake_rx.try_recv() {
            self.handle(wake);
            handled += 1;
        }
        handled
    }

    fn handle(&self, wake: Wake) {
        match wake {
            Wake::Dispatch { entry, seq } => self.dispatch(entry, seq),
            Wake::Exited { id } => {
                self.handlers.borrow_mut().remove(&id);
                debug!(mount = id.0, "driver exited, handlers dropped");
            }
        }
    }

    fn dispatch(&self, entry: Arc<MountEntry>, seq: u64) {
        let Some((ctx, request)) = entry.take_request(seq) else {
            warn!(slot = entry.index(), seq, "wake for a request that is no longer pending");
            return;
        };
        let kind = request.kind();
        debug!(slot = entry.index(), op = %kind, path = request.path(), "dispatch");

        let handlers = self.handlers.borrow().get(&entry.id()).cloned();
        let completer = Completer::new(entry, seq, kind);
        let Some(handlers) = handlers else {
            warn!(op = %kind, "no handler set for mount");
            completer.complete(-libc::ENOTCONN, Payload::None);
            return;
        };

        self.current.set(Some(ctx));
        let _scope = ContextScope(&self.current);
        invoke(&handlers, &ctx, request, completer);
    }
}

fn invoke(handlers: &MountHandlers, ctx: &RequestContext, request: Request, completer: Completer) {
    let ops = &handlers.ops;

    macro_rules! call {
        ($name:ident, $args:expr, $reply:ident) => {
            match &ops.$name {
                Some(handler) => handler(ctx, $args, $reply::new(completer)),
                None => completer.unsupported(handlers.unsupported),
            }
        };
    }

    match request {
        Request::Init(a) => call!(init, a, ReplyEmpty),
        Request::Error(a) => call!(error, a, ReplyEmpty),
        Request::Destroy(a) => call!(destroy, a, ReplyEmpty),
        Request::Getattr(a) => call!(getattr, a, ReplyAttr),
        Request::Fgetattr(a) => call!(fgetattr, a, ReplyAttr),
        Request::Statfs(a) => call!(statfs, a, ReplyStatfs),
        Request::Access(a) => call!(access, a, ReplyEmpty),
        Request::Open(a) => call!(open, a, ReplyOpen),
        Request::Opendir(a) => call!(opendir, a, ReplyOpen),
        Request::Create(a) => call!(create, a, ReplyOpen),
        Request::Read(a) => call!(read, a, ReplyData),
        Request::Write(a) => call!(write, a, ReplyData),
        Request::Flush(a) => call!(flush, a, ReplyEmpty),
        Request::Release(a) => call!(release, a, ReplyEmpty),
        Request::Releasedir(a) => call!(releasedir, a, ReplyEmpty),
        Request::Readdir(a) => call!(readdir, a, ReplyDirectory),
        Request::Fsync(a) => call!(fsync, a, ReplyEmpty),
        Request::Fsyncdir(a) => call!(fsyncdir, a, ReplyEmpty),
        Request::Truncate(a) => call!(truncate, a, ReplyEmpty),
        Request::Ftruncate(a) => call!(ftruncate, a, ReplyEmpty),
        Request::Readlink(a) => call!(readlink, a, ReplyReadlink),
        Request::Symlink(a) => call!(symlink, a, ReplyEmpty),
        Request::Link(a) => call!(link, a, ReplyEmpty),
        Request::Rename(a) => call!(rename, a, ReplyEmpty),
        Request::Unlink(a) => call!(unlink, a, ReplyEmpty),
        Request::Mkdir(a) => call!(mkdir, a, ReplyEmpty),
        Request::Rmdir(a) => call!(rmdir, a, ReplyEmpty),
        Request::Mknod(a) => call!(mknod, a, ReplyEmpty),
        Request::Chown(a) => call!(chown, a, ReplyEmpty),
        Request::Chmod(a) => call!(chmod, a, ReplyEmpty),
        Request::Setxattr(a) => call!(setxattr, a, ReplyEmpty),
        Request::Getxattr(a) => call!(getxattr, a, ReplyData),
        Request::Utimens(a) => call!(utimens, a, ReplyEmpty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateOutcome;
    use crate::mount::MountOptions;
    use crate::request::{PathArgs, ReaddirArgs};
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        tx: mpsc::UnboundedSender<Wake>,
        handlers: HandlerMap,
        current: CurrentContext,
        entry: Arc<MountEntry>,
    }

    fn fixture(ops: Operations, unsupported: UnsupportedPolicy) -> Fixture {
        fixture_with(|_| ops, unsupported)
    }

    fn fixture_with(
        build: impl FnOnce(&CurrentContext) -> Operations,
        unsupported: UnsupportedPolicy,
    ) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers: HandlerMap = Rc::default();
        let current: CurrentContext = Rc::default();
        let ops = build(&current);
        let entry = Arc::new(MountEntry::new(
            0,
            MountId(1),
            "/mnt/x".to_string(),
            MountOptions::default(),
        ));
        handlers
            .borrow_mut()
            .insert(entry.id(), Rc::new(MountHandlers { ops, unsupported }));
        Fixture {
            dispatcher: Dispatcher::new(rx, Rc::clone(&handlers), Rc::clone(&current)),
            tx,
            handlers,
            current,
            entry,
        }
    }

    fn submit(f: &Fixture, ctx: RequestContext, request: Request) -> u64 {
        let seq = f.entry.begin(ctx, request);
        f.tx.send(Wake::Dispatch {
            entry: Arc::clone(&f.entry),
            seq,
        })
        .unwrap();
        seq
    }

    fn completed(f: &Fixture, seq: u64) -> Completion {
        match f.entry.gate().wait(seq) {
            GateOutcome::Completed(c) => c,
            GateOutcome::Aborted => panic!("aborted"),
        }
    }

    fn getattr(path: &str) -> Request {
        Request::Getattr(PathArgs {
            path: path.to_string(),
        })
    }

    #[test]
    fn test_dispatch_invokes_handler() {
        let ops = Operations::new().getattr(|_, args, reply| {
            if args.path == "/" {
                reply.attr(crate::attr::FileStat::directory(0o755));
            } else {
                reply.error(libc::ENOENT);
            }
        });
        let mut f = fixture(ops, UnsupportedPolicy::NotImplemented);

        let seq = submit(&f, RequestContext::default(), getattr("/"));
        assert_eq!(f.dispatcher.dispatch_pending(), 1);
        let c = completed(&f, seq);
        assert_eq!(c.code, 0);
        assert!(matches!(c.payload, Payload::Attr(_)));

        let seq = submit(&f, RequestContext::default(), getattr("/nope"));
        f.dispatcher.dispatch_pending();
        assert_eq!(completed(&f, seq).code, -libc::ENOENT);
    }

    #[test]
    fn test_missing_handler_uses_policy() {
        let mut f = fixture(Operations::new(), UnsupportedPolicy::NotImplemented);
        let seq = submit(
            &f,
            RequestContext::default(),
            Request::Readdir(ReaddirArgs {
                path: "/".to_string(),
                fh: 0,
                offset: 0,
            }),
        );
        f.dispatcher.dispatch_pending();
        assert_eq!(completed(&f, seq).code, -libc::ENOSYS);
    }

    #[test]
    fn test_context_visible_only_during_handler() {
        let seen = Rc::new(Cell::new(None));
        let observed = Rc::clone(&seen);
        let mut f = fixture_with(
            |current| {
                let current = Rc::clone(current);
                Operations::new().getattr(move |ctx, _, reply| {
                    assert_eq!(current.get(), Some(*ctx));
                    observed.set(current.get());
                    reply.error(libc::ENOENT);
                })
            },
            UnsupportedPolicy::NotImplemented,
        );

        let ctx = RequestContext::new(1000, 100, 4242);
        let seq = submit(&f, ctx, getattr("/a"));
        f.dispatcher.dispatch_pending();
        completed(&f, seq);

        assert_eq!(seen.get(), Some(ctx));
        assert_eq!(f.current.get(), None);
    }

    #[test]
    fn test_exited_drops_handlers() {
        let mut f = fixture(Operations::new(), UnsupportedPolicy::Succeed);
        f.tx.send(Wake::Exited { id: f.entry.id() }).unwrap();
        f.dispatcher.dispatch_pending();
        assert!(f.handlers.borrow().is_empty());

        let seq = submit(&f, RequestContext::default(), getattr("/"));
        f.dispatcher.dispatch_pending();
        assert_eq!(completed(&f, seq).code, -libc::ENOTCONN);
    }

    #[test]
    fn test_stale_wake_is_ignored() {
        let mut f = fixture(Operations::new(), UnsupportedPolicy::Succeed);
        let seq = f.entry.begin(RequestContext::default(), getattr("/"));
        f.entry.take_request(seq);
        f.tx.send(Wake::Dispatch {
            entry: Arc::clone(&f.entry),
            seq,
        })
        .unwrap();
        assert_eq!(f.dispatcher.dispatch_pending(), 1);
        assert_eq!(f.entry.gate().in_flight(), Some(seq));
    }
}
