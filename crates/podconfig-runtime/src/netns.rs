use crate::error::{Result, RuntimeError};
use crate::network::{IpLinks, LinkOps};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Namespace of the calling thread
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Which network namespace to enter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetnsTarget {
    /// The host namespace, reached through pid 1
    Host,
    /// The namespace of a process
    Process(u32),
}

impl NetnsTarget {
    pub fn pid(&self) -> u32 {
        match self {
            NetnsTarget::Host => 1,
            NetnsTarget::Process(pid) => *pid,
        }
    }

    /// `<proc_root>/<pid>/ns/net`
    pub fn path(&self, proc_root: &Path) -> PathBuf {
        proc_root
            .join(self.pid().to_string())
            .join("ns")
            .join("net")
    }
}

impl std::fmt::Display for NetnsTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetnsTarget::Host => write!(f, "host"),
            NetnsTarget::Process(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Runs link operations inside a network namespace
///
/// `with_namespace` enters the target, runs `f` against the backend's link
/// operations and leaves again on every exit path, including errors and
/// panics inside `f`.
pub trait NetnsBackend: Send + Sync + 'static {
    type Links: LinkOps + Send + 'static;

    fn proc_root(&self) -> &Path;

    fn namespace_path(&self, target: NetnsTarget) -> PathBuf {
        target.path(self.proc_root())
    }

    fn with_namespace<R, F>(
        &self,
        target: NetnsTarget,
        f: F,
    ) -> impl Future<Output = Result<R>> + Send
    where
        R: Send + 'static,
        F: FnOnce(&Self::Links) -> Result<R> + Send + 'static;
}

/// Kernel namespace switching via setns(2)
///
/// Every switch happens on a freshly spawned OS thread, so no tokio worker
/// ever changes namespace and two switches never share a thread.
#[derive(Debug, Clone)]
pub struct HostNetns {
    proc_root: PathBuf,
    links: IpLinks,
}

impl HostNetns {
    pub fn new(proc_root: impl Into<PathBuf>, links: IpLinks) -> Self {
        Self {
            proc_root: proc_root.into(),
            links,
        }
    }
}

impl NetnsBackend for HostNetns {
    type Links = IpLinks;

    fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn with_namespace<R, F>(
        &self,
        target: NetnsTarget,
        f: F,
    ) -> impl Future<Output = Result<R>> + Send
    where
        R: Send + 'static,
        F: FnOnce(&Self::Links) -> Result<R> + Send + 'static,
    {
        let path = self.namespace_path(target);
        let links = self.links.clone();

        async move {
            let (tx, rx) = oneshot::channel();
            let worker_path = path.clone();

            std::thread::Builder::new()
                .name("podconfig-netns".to_string())
                .spawn(move || {
                    let result = NetnsGuard::enter(&worker_path).and_then(|guard| {
                        let out = f(&links);
                        drop(guard);
                        out
                    });
                    let _ = tx.send(result);
                })
                .map_err(|e| {
                    RuntimeError::internal_error(format!(
                        "failed to spawn namespace worker: {}",
                        e
                    ))
                })?;

            rx.await.map_err(|_| {
                RuntimeError::internal_error(format!(
                    "namespace worker for {} exited without a result",
                    path.display()
                ))
            })?
        }
    }
}

/// Holds the thread inside a foreign namespace; dropping it switches back
struct NetnsGuard {
    original: File,
    path: PathBuf,
}

impl NetnsGuard {
    fn enter(path: &Path) -> Result<Self> {
        let original = File::open(THREAD_NETNS)
            .map_err(|e| RuntimeError::namespace_open(THREAD_NETNS, e.to_string()))?;
        let target = File::open(path)
            .map_err(|e| RuntimeError::namespace_open(path.display().to_string(), e.to_string()))?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| {
            RuntimeError::namespace_open(path.display().to_string(), format!("setns: {}", e))
        })?;
        debug!("Entered network namespace {}", path.display());

        Ok(Self {
            original,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!("Left network namespace {}", self.path.display()),
            // The worker thread exits right after, so nothing else runs here
            Err(e) => error!(
                "Failed to restore namespace after {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}
