//! Daemon supervisors.
//!
//! A daemon-bearing router materialises its configuration under
//! `/run/nsnetsim/<node>/`, launches the daemon in the foreground inside the
//! router's namespace with output captured to a log file, waits for the
//! control socket to appear, proxies raw queries over it, and tears the
//! process down with SIGTERM, a bounded grace, then SIGKILL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::exec::{process_alive, Executor};
use crate::{Error, Result, RUN_BASE_DIR};

/// How long a daemon gets to expose its control socket.
pub const READINESS_DEADLINE: Duration = Duration::from_secs(10);
const READINESS_POLL: Duration = Duration::from_millis(100);
/// A control-socket response is considered complete after this much silence.
const RESPONSE_IDLE: Duration = Duration::from_millis(500);
/// Upper bound on waiting for any control-socket response at all.
const RESPONSE_DEADLINE: Duration = Duration::from_secs(5);

/// Filesystem layout of a daemon-bearing node under `/run/nsnetsim/<node>/`.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub control_socket: PathBuf,
    pub log: PathBuf,
    pub pidfile: PathBuf,
}

impl RuntimeDir {
    pub fn for_node(node: &str) -> Self {
        let dir = Path::new(RUN_BASE_DIR).join(node);
        Self {
            config: dir.join("config"),
            control_socket: dir.join("control.sock"),
            log: dir.join("daemon.log"),
            pidfile: dir.join("daemon.pid"),
            dir,
        }
    }
}

/// The routing daemons a router can host.
#[derive(Debug)]
pub enum Daemon {
    Bird(BirdDaemon),
    ExaBgp(ExaBgpDaemon),
    StayRtr(StayRtrDaemon),
}

impl Daemon {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Daemon::Bird(_) => "bird",
            Daemon::ExaBgp(_) => "exabgp",
            Daemon::StayRtr(_) => "stayrtr",
        }
    }

    pub fn runtime(&self) -> &RuntimeDir {
        match self {
            Daemon::Bird(daemon) => &daemon.runtime,
            Daemon::ExaBgp(daemon) => &daemon.runtime,
            Daemon::StayRtr(daemon) => &daemon.runtime,
        }
    }

    pub fn pid(&self) -> Option<i32> {
        match self {
            Daemon::Bird(daemon) => daemon.pid,
            Daemon::ExaBgp(daemon) => daemon.pid,
            Daemon::StayRtr(daemon) => daemon.pid,
        }
    }

    pub(crate) async fn launch(
        &mut self,
        exec: &mut Executor,
        node: &str,
        ns: &str,
    ) -> Result<()> {
        info!(node, kind = self.kind_name(), "launching daemon");
        match self {
            Daemon::Bird(daemon) => daemon.launch(exec, node, ns).await,
            Daemon::ExaBgp(daemon) => daemon.launch(exec, node, ns).await,
            Daemon::StayRtr(daemon) => daemon.launch(exec, node, ns).await,
        }
    }

    pub(crate) async fn query(
        &self,
        exec: &Executor,
        node: &str,
        ns: &str,
        request: &[u8],
    ) -> Result<Vec<u8>> {
        match self {
            Daemon::Bird(daemon) => daemon.query(request).await,
            Daemon::ExaBgp(daemon) => daemon.query(exec, ns, request).await,
            Daemon::StayRtr(_) => Err(Error::Unsupported {
                node: node.to_string(),
                operation: "query",
            }),
        }
    }
}

/// BIRD: launched in the foreground with its control socket placed in the
/// runtime directory; queried over that Unix socket with raw bytes.
#[derive(Debug)]
pub struct BirdDaemon {
    config: PathBuf,
    runtime: RuntimeDir,
    pid: Option<i32>,
}

impl BirdDaemon {
    pub fn new(node: &str, config: &Path) -> Result<Self> {
        require_file("BIRD config file", config)?;
        Ok(Self {
            config: config.to_path_buf(),
            runtime: RuntimeDir::for_node(node),
            pid: None,
        })
    }

    async fn launch(&mut self, exec: &mut Executor, node: &str, ns: &str) -> Result<()> {
        exec.make_run_dir(&self.runtime.dir)?;
        materialise_config(&self.config, &self.runtime.config)?;

        let config = self.runtime.config.display().to_string();
        check_config(node, "bird", &["-c".into(), config.clone(), "-p".into()]).await?;

        let args = vec![
            "-f".to_string(),
            "-c".to_string(),
            config,
            "-s".to_string(),
            self.runtime.control_socket.display().to_string(),
        ];
        let pid = exec.spawn_in_netns(node, ns, "bird", &args, &[], &self.runtime.log)?;
        write_pidfile(&self.runtime.pidfile, pid)?;

        await_control_socket(node, pid, &self.runtime.control_socket).await?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Raw request/response over the BIRD control socket. The greeting
    /// banner is drained before the request is written; no parsing happens
    /// here.
    async fn query(&self, request: &[u8]) -> Result<Vec<u8>> {
        let socket = &self.runtime.control_socket;
        let socket_name = socket.to_string_lossy().to_string();
        let mut stream = UnixStream::connect(socket)
            .await
            .map_err(|err| Error::from_io(err, "connect to control socket", &socket_name))?;

        let mut buf = [0u8; 4096];
        let _ = tokio::time::timeout(RESPONSE_IDLE, stream.read(&mut buf)).await;

        stream
            .write_all(request)
            .await
            .map_err(|err| Error::from_io(err, "write to control socket", &socket_name))?;
        if !request.ends_with(b"\n") {
            stream
                .write_all(b"\n")
                .await
                .map_err(|err| Error::from_io(err, "write to control socket", &socket_name))?;
        }

        let mut response = Vec::new();
        let deadline = tokio::time::Instant::now() + RESPONSE_DEADLINE;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            match tokio::time::timeout(RESPONSE_IDLE, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(err)) => {
                    return Err(Error::from_io(err, "read control socket", &socket_name))
                }
                Err(_) if !response.is_empty() => break,
                Err(_) => {}
            }
        }
        Ok(response)
    }
}

/// ExaBGP: controlled over a FIFO pair beneath the runtime directory. The
/// pipes are minted before launch so the poll-for-path readiness contract
/// holds, and queries go through `exabgpcli` inside the namespace.
#[derive(Debug)]
pub struct ExaBgpDaemon {
    config: PathBuf,
    runtime: RuntimeDir,
    pipe_in: PathBuf,
    pipe_out: PathBuf,
    pipename: String,
    pid: Option<i32>,
}

impl ExaBgpDaemon {
    pub fn new(node: &str, config: &Path) -> Result<Self> {
        require_file("ExaBGP config file", config)?;
        let runtime = RuntimeDir::for_node(node);
        Ok(Self {
            config: config.to_path_buf(),
            pipe_in: runtime.dir.join("control.sock.in"),
            pipe_out: runtime.dir.join("control.sock.out"),
            // Relative to /run, which is on exabgp's pipe search path.
            pipename: format!("nsnetsim/{node}/control.sock"),
            runtime,
            pid: None,
        })
    }

    async fn launch(&mut self, exec: &mut Executor, node: &str, ns: &str) -> Result<()> {
        exec.make_run_dir(&self.runtime.dir)?;
        materialise_config(&self.config, &self.runtime.config)?;

        let config = self.runtime.config.display().to_string();
        check_config(node, "exabgp", &["--test".into(), config.clone()]).await?;

        for pipe in [&self.pipe_in, &self.pipe_out] {
            mkfifo(pipe.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
                Error::from_io(
                    std::io::Error::from_raw_os_error(errno as i32),
                    "create control pipe",
                    &pipe.to_string_lossy(),
                )
            })?;
        }

        let envs = vec![
            ("exabgp.api.pipename".to_string(), self.pipename.clone()),
            (
                "exabgp.daemon.pid".to_string(),
                self.runtime.pidfile.display().to_string(),
            ),
            ("exabgp.log.all".to_string(), "true".to_string()),
            (
                "exabgp.log.destination".to_string(),
                self.runtime.log.display().to_string(),
            ),
        ];
        let pid = exec.spawn_in_netns(node, ns, "exabgp", &[config], &envs, &self.runtime.log)?;
        write_pidfile(&self.runtime.pidfile, pid)?;

        await_control_socket(node, pid, &self.pipe_out).await?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Hand the request line to `exabgpcli` inside the namespace; the tool
    /// speaks the pipe protocol and its stdout is the raw response.
    async fn query(&self, exec: &Executor, ns: &str, request: &[u8]) -> Result<Vec<u8>> {
        let request = String::from_utf8_lossy(request);
        let args: Vec<String> = request.split_whitespace().map(str::to_string).collect();
        let envs = vec![("exabgp.api.pipename".to_string(), self.pipename.clone())];

        let output = exec.run_in_netns(ns, "exabgpcli", &args, &envs).await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::external(
                format!("exabgpcli {request} failed"),
                std::io::Error::new(std::io::ErrorKind::Other, detail),
            ));
        }
        Ok(output.stdout)
    }
}

/// StayRTR: an RPKI-to-router server. It has no control socket, so readiness
/// reduces to process liveness and `query` is unsupported.
#[derive(Debug)]
pub struct StayRtrDaemon {
    cache: Option<PathBuf>,
    slurm: Option<PathBuf>,
    runtime: RuntimeDir,
    pid: Option<i32>,
}

impl StayRtrDaemon {
    pub fn new(node: &str, cache: Option<&Path>, slurm: Option<&Path>) -> Result<Self> {
        if let Some(cache) = cache {
            require_file("StayRTR cache file", cache)?;
        }
        if let Some(slurm) = slurm {
            require_file("StayRTR SLURM file", slurm)?;
        }
        Ok(Self {
            cache: cache.map(Path::to_path_buf),
            slurm: slurm.map(Path::to_path_buf),
            runtime: RuntimeDir::for_node(node),
            pid: None,
        })
    }

    async fn launch(&mut self, exec: &mut Executor, node: &str, ns: &str) -> Result<()> {
        exec.make_run_dir(&self.runtime.dir)?;

        match &self.cache {
            Some(cache) => materialise_config(cache, &self.runtime.config)?,
            // No caller cache: serve an empty, freshly stamped one.
            None => {
                let cache = serde_json::json!({
                    "metadata": {
                        "buildtime": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                        "vrps": 0,
                    },
                    "roas": [],
                });
                std::fs::write(&self.runtime.config, cache.to_string()).map_err(|err| {
                    Error::from_io(
                        err,
                        "write StayRTR cache",
                        &self.runtime.config.to_string_lossy(),
                    )
                })?;
            }
        }

        let mut args = vec![
            "-cache".to_string(),
            self.runtime.config.display().to_string(),
        ];
        if let Some(slurm) = &self.slurm {
            let slurm_copy = self.runtime.dir.join("slurm");
            materialise_config(slurm, &slurm_copy)?;
            args.push("-slurm".to_string());
            args.push(slurm_copy.display().to_string());
        }

        let pid = exec.spawn_in_netns(node, ns, "stayrtr", &args, &[], &self.runtime.log)?;
        write_pidfile(&self.runtime.pidfile, pid)?;

        // No socket to wait on; give the process a moment to fail fast.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while tokio::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return Err(Error::DaemonUnready {
                    node: node.to_string(),
                    socket: self.runtime.pidfile.clone(),
                });
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
        self.pid = Some(pid);
        Ok(())
    }
}

fn require_file(what: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::NotFound {
            object: format!("{what} '{}'", path.display()),
        })
    }
}

/// Copy the caller-supplied file into the runtime directory so the daemon
/// sees stable paths for its whole lifetime.
fn materialise_config(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target)
        .map(|_| ())
        .map_err(|err| Error::from_io(err, "materialise config", &source.to_string_lossy()))
}

/// Run the daemon's own syntax check against the materialised config before
/// anything is spawned into the namespace.
async fn check_config(node: &str, program: &str, args: &[String]) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| Error::from_io(err, "run config check", program))?;

    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(stderr.trim());
        }
        return Err(Error::external(
            format!("config check with '{program}' failed for node '{node}'"),
            std::io::Error::new(std::io::ErrorKind::Other, detail),
        ));
    }
    debug!(node, program, "config check passed");
    Ok(())
}

fn write_pidfile(path: &Path, pid: i32) -> Result<()> {
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|err| Error::from_io(err, "write pid file", &path.to_string_lossy()))
}

/// Poll until the daemon's control socket appears. A daemon that dies first
/// or misses the deadline is reported unready; the caller unwinds.
async fn await_control_socket(node: &str, pid: i32, socket: &Path) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READINESS_DEADLINE;
    loop {
        let alive = process_alive(pid);
        if alive && socket.exists() {
            debug!(node, socket = %socket.display(), "daemon ready");
            return Ok(());
        }
        if !alive || tokio::time::Instant::now() >= deadline {
            return Err(Error::DaemonUnready {
                node: node.to_string(),
                socket: socket.to_path_buf(),
            });
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_layout() {
        let runtime = RuntimeDir::for_node("r1");
        assert_eq!(runtime.dir, Path::new("/run/nsnetsim/r1"));
        assert_eq!(runtime.config, Path::new("/run/nsnetsim/r1/config"));
        assert_eq!(
            runtime.control_socket,
            Path::new("/run/nsnetsim/r1/control.sock")
        );
        assert_eq!(runtime.log, Path::new("/run/nsnetsim/r1/daemon.log"));
        assert_eq!(runtime.pidfile, Path::new("/run/nsnetsim/r1/daemon.pid"));
    }

    #[test]
    fn missing_config_fails_construction() {
        let err = BirdDaemon::new("r1", Path::new("/nonexistent/bird.conf")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = ExaBgpDaemon::new("r1", Path::new("/nonexistent/exabgp.conf")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn stayrtr_accepts_absent_cache() {
        let daemon = StayRtrDaemon::new("r1", None, None).unwrap();
        assert!(daemon.cache.is_none());
        assert!(
            StayRtrDaemon::new("r1", Some(Path::new("/nonexistent/cache.json")), None).is_err()
        );
    }

    #[tokio::test]
    async fn dead_process_is_reported_unready() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);

        let err = await_control_socket("r1", pid, Path::new("/nonexistent/control.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DaemonUnready { .. }));
    }
}
