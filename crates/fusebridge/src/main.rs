//! Mounts a read-only filesystem holding a single file, `/hello`.

use anyhow::Context;
use fusebridge::{
    Bridge, BridgeConfig, FileStat, FuseKernel, MountOptions, Operations, UnsupportedPolicy,
};
use tokio::task::LocalSet;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const HELLO_PATH: &str = "/hello";
const HELLO_TEXT: &[u8] = b"Hello from fusebridge!\n";

fn hello_ops() -> Operations {
    Operations::new()
        .init(|_, args, reply| {
            tracing::info!("mounted at {}", args.mountpoint);
            reply.ok();
        })
        .error(|_, args, reply| {
            tracing::error!("mount at {} failed: {}", args.mountpoint, args.reason);
            reply.ok();
        })
        .getattr(|_, args, reply| match args.path.as_str() {
            "/" => reply.attr(FileStat::directory(0o555)),
            HELLO_PATH => reply.attr(FileStat::file(0o444, HELLO_TEXT.len() as u64)),
            _ => reply.error(libc::ENOENT),
        })
        .readdir(|_, args, reply| {
            if args.path == "/" {
                reply.entries([".", "..", &HELLO_PATH[1..]]);
            } else {
                reply.error(libc::ENOTDIR);
            }
        })
        .open(|_, args, reply| {
            if args.path != HELLO_PATH {
                reply.error(libc::ENOENT);
            } else if args.flags & libc::O_ACCMODE != libc::O_RDONLY {
                reply.error(libc::EACCES);
            } else {
                reply.opened(0);
            }
        })
        .opendir(|_, args, reply| {
            if args.path == "/" {
                reply.opened(0);
            } else {
                reply.error(libc::ENOTDIR);
            }
        })
        .read(|_, args, reply| {
            if args.path != HELLO_PATH {
                return reply.error(libc::ENOENT);
            }
            let start = (args.offset as usize).min(HELLO_TEXT.len());
            match args.buf.copy_from(&HELLO_TEXT[start..]) {
                Ok(n) => reply.size(n),
                Err(_) => reply.error(libc::EIO),
            }
        })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: fusebridge-hello <mountpoint>");
        std::process::exit(1);
    }
    let mountpoint = args[1].clone();

    let config = BridgeConfig::default().with_unsupported(UnsupportedPolicy::NotImplemented);
    let kernel = FuseKernel::new(&config);
    let (bridge, dispatcher) = Bridge::new(kernel, config)?;

    LocalSet::new()
        .run_until(async move {
            let dispatching = tokio::task::spawn_local(dispatcher.run());

            let options = MountOptions::new(["ro", "fsname=hello"]);
            let handle = bridge
                .mount(&mountpoint, hello_ops(), options)
                .with_context(|| format!("mounting {}", mountpoint))?;
            tracing::info!("serving slot {}; press ctrl-c to unmount", handle.slot());

            tokio::signal::ctrl_c().await?;
            bridge.unmount(&mountpoint).await?;
            tracing::info!("stats: {:?}", handle.stats());

            drop(bridge);
            dispatching.await?;
            Ok::<(), anyhow::Error>(())
        })
        .await
}
