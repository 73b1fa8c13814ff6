//! Mount lifecycle: slot allocation, driver threads and teardown.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatch::{CurrentContext, Dispatcher, HandlerMap, MountHandlers};
use crate::driver::{self, Wake};
use crate::error::{BridgeError, Result};
use crate::kernel::Kernel;
use crate::mount::MountOptions;
use crate::ops::Operations;
use crate::registry::{MountEntry, MountStats, Registry};
use crate::request::RequestContext;

/// Handle used by the embedding application to mount and unmount
/// filesystems. Cheap to clone; all clones share one slot table and one
/// dispatcher. Lives on the dispatcher's thread.
#[derive(Clone)]
pub struct Bridge {
    kernel: Arc<dyn Kernel>,
    registry: Arc<Registry>,
    config: Rc<BridgeConfig>,
    handlers: HandlerMap,
    current: CurrentContext,
    wake: UnboundedSender<Wake>,
}

impl Bridge {
    /// Creates a bridge and the dispatcher that serves it. The dispatcher
    /// must be driven on the same thread, e.g. with
    /// `tokio::task::spawn_local(dispatcher.run())`.
    pub fn new(kernel: impl Kernel, config: BridgeConfig) -> Result<(Bridge, Dispatcher)> {
        config.validate()?;
        let (wake, wake_rx) = mpsc::unbounded_channel();
        let handlers = HandlerMap::default();
        let current: CurrentContext = Rc::new(Cell::new(None));
        let bridge = Bridge {
            kernel: Arc::new(kernel),
            registry: Arc::new(Registry::new(config.max_mounts)),
            config: Rc::new(config),
            handlers: Rc::clone(&handlers),
            current: Rc::clone(&current),
            wake,
        };
        Ok((bridge, Dispatcher::new(wake_rx, handlers, current)))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Mounts a filesystem served by `ops` at `mountpoint`.
    ///
    /// Returns as soon as the driver thread is running. Whether the kernel
    /// accepted the mount is reported to the handlers as INIT or ERROR.
    pub fn mount(
        &self,
        mountpoint: &str,
        ops: Operations,
        options: MountOptions,
    ) -> Result<MountHandle> {
        if mountpoint.is_empty() {
            return Err(BridgeError::InvalidArgument {
                msg: "mountpoint must not be empty".to_string(),
            });
        }
        options.validate()?;
        if self.wake.is_closed() {
            return Err(BridgeError::DispatcherGone);
        }

        let entry = {
            let mut table = self.registry.lock();
            if table.find_live(mountpoint).is_some() {
                return Err(BridgeError::AlreadyMounted {
                    mountpoint: mountpoint.to_string(),
                });
            }
            let index = table.allocate()?;
            let entry = Arc::new(MountEntry::new(
                index,
                self.registry.next_id(),
                mountpoint.to_string(),
                options,
            ));
            table.install(index, Arc::clone(&entry));
            entry
        };

        self.handlers.borrow_mut().insert(
            entry.id(),
            Rc::new(MountHandlers {
                ops,
                unsupported: self.config.unsupported,
            }),
        );

        let spawned = driver::spawn(
            Arc::clone(&self.kernel),
            Arc::clone(&self.registry),
            Arc::clone(&entry),
            self.wake.clone(),
        );
        match spawned {
            Ok(handle) => entry.set_thread(handle),
            Err(e) => {
                self.handlers.borrow_mut().remove(&entry.id());
                self.registry.release(&entry);
                return Err(BridgeError::ThreadSpawn(e));
            }
        }

        info!(
            slot = entry.index(),
            mountpoint,
            options = %entry.options().assembled(),
            "mount requested"
        );
        Ok(MountHandle { entry })
    }

    /// Unmounts the filesystem at `mountpoint` and waits for its driver
    /// thread to finish. Unknown mountpoints, and ones already being
    /// unmounted, are ignored.
    pub async fn unmount(&self, mountpoint: &str) -> Result<()> {
        let entry = {
            let table = self.registry.lock();
            match table.find_live(mountpoint) {
                Some(entry) => {
                    entry.mark_garbage();
                    entry
                }
                None => {
                    debug!(mountpoint, "unmount of unknown mountpoint ignored");
                    return Ok(());
                }
            }
        };
        info!(slot = entry.index(), mountpoint, "unmounting");

        let kernel = Arc::clone(&self.kernel);
        let teardown = tokio::task::spawn_blocking(move || {
            if let Err(e) = kernel.force_unmount(entry.mountpoint()) {
                warn!(slot = entry.index(), "forced unmount failed: {}", e);
            }
            // Calls issued from here on are refused by the driver itself.
            if entry.abort_in_flight() {
                debug!(slot = entry.index(), "aborted pending call");
            }
            if let Some(handle) = entry.take_thread() {
                if handle.join().is_err() {
                    warn!(slot = entry.index(), "driver thread panicked");
                }
            }
        });
        teardown
            .await
            .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?;
        info!(mountpoint, "unmounted");
        Ok(())
    }

    /// The calling principal of the request whose handler is running.
    ///
    /// Only valid inside the synchronous part of a handler invocation; the
    /// same value is passed to every handler as its first argument.
    pub fn context(&self) -> Result<RequestContext> {
        self.current.get().ok_or(BridgeError::NoActiveRequest)
    }

    /// Mountpoints of all live mounts, in slot order.
    pub fn mounted(&self) -> Vec<String> {
        self.registry
            .lock()
            .live()
            .map(|e| e.mountpoint().to_string())
            .collect()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("mounted", &self.mounted())
            .finish()
    }
}

/// Returned by [`Bridge::mount`]; observes one mount.
#[derive(Debug, Clone)]
pub struct MountHandle {
    entry: Arc<MountEntry>,
}

impl MountHandle {
    pub fn slot(&self) -> usize {
        self.entry.index()
    }

    pub fn mountpoint(&self) -> &str {
        self.entry.mountpoint()
    }

    /// The assembled, comma-joined option string.
    pub fn options(&self) -> String {
        self.entry.options().assembled()
    }

    /// False once the driver thread has finished.
    pub fn is_alive(&self) -> bool {
        !self.entry.has_exited()
    }

    pub fn is_unmounting(&self) -> bool {
        self.entry.is_garbage()
    }

    pub fn stats(&self) -> MountStats {
        self.entry.stats()
    }

    /// Sequence number of the call the driver thread is waiting on, if any.
    pub fn pending(&self) -> Option<u64> {
        self.entry.gate().in_flight()
    }
}
