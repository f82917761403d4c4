//! Installed Jupyter kernels over ZeroMQ
//!
//! [`JupyterLauncher`] looks kernels up in the `kernels/<name>/kernel.json`
//! files of the Jupyter data directories, writes a connection file and starts
//! the kernel's `argv` with `{connection_file}` substituted. [`JupyterKernel`]
//! then talks to it over the shell, control and iopub channels using the
//! [`wire`](crate::wire) format.

use crate::error::{KernelError, Result};
use crate::kernel::{CellReply, Kernel, KernelLauncher, KernelSpec};
use crate::subprocess::{died, StderrTail};
use crate::wire::{cell_reply, decode, encode, OutputCollector, Signer};
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, JupyterKernelspec, JupyterMessage, KernelInfoRequest,
    ShutdownRequest, Transport,
};
use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// `argv` entry replaced by the connection file path
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// `argv` entry replaced by the kernelspec directory
pub const RESOURCE_DIR_PLACEHOLDER: &str = "{resource_dir}";

/// Time a kernel gets to answer its first `kernel_info_request`
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Python run silently in Python kernels to pick the figure format
const FIGURE_SETUP: &str = include_str!("figures.py");

const KERNEL_INFO_RETRY: Duration = Duration::from_secs(1);
const CONNECT_RETRY: Duration = Duration::from_millis(100);
const LIVENESS_INTERVAL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Directories searched for `kernels/<name>/kernel.json`, highest priority first
///
/// `JUPYTER_PATH` entries, then the user data directory (`JUPYTER_DATA_DIR`
/// overrides it), then the active conda or virtual environment, then the
/// system directories.
#[must_use]
pub fn jupyter_data_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(paths) = std::env::var_os("JUPYTER_PATH") {
        found.extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
    }

    match std::env::var_os("JUPYTER_DATA_DIR") {
        Some(dir) => found.push(PathBuf::from(dir)),
        None => {
            if cfg!(target_os = "macos") {
                found.extend(dirs::home_dir().map(|home| home.join("Library").join("Jupyter")));
            } else {
                found.extend(dirs::data_dir().map(|data| data.join("jupyter")));
            }
        }
    }

    for prefix in ["CONDA_PREFIX", "VIRTUAL_ENV"] {
        if let Some(prefix) = std::env::var_os(prefix) {
            found.push(PathBuf::from(prefix).join("share").join("jupyter"));
        }
    }

    if cfg!(windows) {
        if let Some(program_data) = std::env::var_os("PROGRAMDATA") {
            found.push(PathBuf::from(program_data).join("jupyter"));
        }
    } else {
        found.push(PathBuf::from("/usr/local/share/jupyter"));
        found.push(PathBuf::from("/usr/share/jupyter"));
    }

    let mut seen = std::collections::HashSet::new();
    found.retain(|dir| seen.insert(dir.clone()));
    found
}

/// A kernelspec found on disk
#[derive(Debug, Clone)]
pub struct InstalledKernel {
    /// Lowercased directory name
    pub name: String,
    /// Directory holding `kernel.json`
    pub resource_dir: PathBuf,
    /// Parsed `kernel.json`
    pub spec: JupyterKernelspec,
}

impl InstalledKernel {
    /// Read `<resource_dir>/kernel.json`
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Io`] or [`KernelError::Protocol`] for a missing
    /// or malformed file.
    pub fn load(resource_dir: &Path) -> Result<Self> {
        let name = resource_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let content = fs::read(resource_dir.join("kernel.json"))?;
        let spec = serde_json::from_slice(&content).map_err(|e| {
            KernelError::Protocol(format!("{}: {e}", resource_dir.join("kernel.json").display()))
        })?;
        Ok(Self {
            name,
            resource_dir: resource_dir.to_path_buf(),
            spec,
        })
    }

    fn command(&self, connection_file: &Path) -> Result<Command> {
        let connection_file = connection_file.to_string_lossy();
        let resource_dir = self.resource_dir.to_string_lossy();
        let mut args = self.spec.argv.iter().map(|arg| {
            arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection_file)
                .replace(RESOURCE_DIR_PLACEHOLDER, &resource_dir)
        });
        let program = args
            .next()
            .ok_or_else(|| KernelError::EmptyCommand(self.name.clone()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }

    fn is_python(&self) -> bool {
        self.spec.language.eq_ignore_ascii_case("python")
    }
}

/// Every kernelspec under `data_dirs`, keyed by lowercased name
///
/// A name defined in several directories resolves to the first one.
/// Unreadable specs are logged and skipped.
#[must_use]
pub fn find_kernelspecs(data_dirs: &[PathBuf]) -> BTreeMap<String, InstalledKernel> {
    let mut found = BTreeMap::new();
    for dir in data_dirs {
        let Ok(entries) = fs::read_dir(dir.join("kernels")) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.join("kernel.json").is_file() {
                continue;
            }
            match InstalledKernel::load(&path) {
                Ok(kernel) => {
                    found.entry(kernel.name.clone()).or_insert(kernel);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping kernelspec"),
            }
        }
    }
    found
}

/// Launches installed Jupyter kernels
#[derive(Debug, Clone)]
pub struct JupyterLauncher {
    data_dirs: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    figure_format: Option<String>,
    startup_timeout: Duration,
}

impl Default for JupyterLauncher {
    fn default() -> Self {
        Self::new(jupyter_data_dirs())
    }
}

impl JupyterLauncher {
    /// Launcher searching `data_dirs` only
    #[must_use]
    pub fn new(data_dirs: Vec<PathBuf>) -> Self {
        Self {
            data_dirs,
            env: BTreeMap::new(),
            figure_format: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Set an environment variable for every kernel started by this launcher
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Make Python kernels render matplotlib and plotly figures as `format`
    #[must_use]
    pub fn with_figure_format(mut self, format: impl Into<String>) -> Self {
        self.figure_format = Some(format.into());
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Kernelspec for `spec`: name (case-insensitive), then language
    #[must_use]
    pub fn resolve(&self, spec: &KernelSpec) -> Option<InstalledKernel> {
        let mut installed = find_kernelspecs(&self.data_dirs);
        if let Some(kernel) = installed.remove(&spec.name.to_lowercase()) {
            return Some(kernel);
        }
        let language = spec.language.as_deref()?;
        installed
            .into_values()
            .find(|kernel| kernel.spec.language.eq_ignore_ascii_case(language))
    }
}

impl KernelLauncher for JupyterLauncher {
    fn launch(&self, spec: &KernelSpec, working_dir: &Path) -> Result<Box<dyn Kernel>> {
        let installed = self
            .resolve(spec)
            .ok_or_else(|| KernelError::UnknownKernel(spec.name.clone()))?;
        let mut kernel =
            JupyterKernel::start(&installed, working_dir, &self.env, self.startup_timeout)?;
        if let Some(format) = self.figure_format.as_deref().filter(|_| installed.is_python()) {
            kernel.run_setup(&FIGURE_SETUP.replace("{format}", format));
        }
        Ok(Box::new(kernel))
    }
}

/// Free TCP ports on the loopback interface
fn free_ports<const N: usize>() -> std::io::Result<[u16; N]> {
    let listeners = (0..N)
        .map(|_| TcpListener::bind(("127.0.0.1", 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    let mut ports = [0; N];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener.local_addr()?.port();
    }
    Ok(ports)
}

fn connection_info(kernel_name: &str) -> Result<ConnectionInfo> {
    let [shell_port, iopub_port, stdin_port, control_port, hb_port] = free_ports::<5>()?;
    Ok(ConnectionInfo {
        ip: "127.0.0.1".to_string(),
        transport: Transport::TCP,
        shell_port,
        iopub_port,
        stdin_port,
        control_port,
        hb_port,
        key: Uuid::new_v4().to_string(),
        signature_scheme: "hmac-sha256".to_string(),
        kernel_name: Some(kernel_name.to_string()),
    })
}

struct Channels {
    shell: DealerSocket,
    control: DealerSocket,
    iopub: SubSocket,
}

impl Channels {
    async fn connect(info: &ConnectionInfo) -> Result<Self> {
        let mut shell = DealerSocket::new();
        shell.connect(&info.shell_url()).await?;
        let mut control = DealerSocket::new();
        control.connect(&info.control_url()).await?;
        let mut iopub = SubSocket::new();
        iopub.connect(&info.iopub_url()).await?;
        iopub.subscribe("").await?;
        Ok(Self {
            shell,
            control,
            iopub,
        })
    }

    /// Connect, retrying until the kernel has bound its sockets
    async fn connect_with_retry(info: &ConnectionInfo) -> Self {
        loop {
            match Self::connect(info).await {
                Ok(channels) => return channels,
                Err(e) => {
                    trace!(error = %e, "Kernel sockets not ready");
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    /// Resend `kernel_info_request` until the shell replies and iopub delivers
    async fn handshake(&mut self, signer: &Signer, session: &str) -> Result<()> {
        let mut replied = false;
        let mut subscribed = false;
        while !(replied && subscribed) {
            let request = JupyterMessage::new(KernelInfoRequest {}, None).with_session(session);
            send(&mut self.shell, &request, signer).await?;
            let mut retry = std::pin::pin!(tokio::time::sleep(KERNEL_INFO_RETRY));
            while !(replied && subscribed) {
                tokio::select! {
                    message = self.shell.recv() => {
                        replied |= decode(&message?.into_vec(), signer)?.msg_type == "kernel_info_reply";
                    }
                    message = self.iopub.recv() => {
                        decode(&message?.into_vec(), signer)?;
                        subscribed = true;
                    }
                    () = &mut retry => break,
                }
            }
        }
        Ok(())
    }

    /// Outputs and reply of the request `msg_id`
    async fn collect_reply(&mut self, signer: &Signer, msg_id: &str) -> Result<CellReply> {
        let mut collector = OutputCollector::default();
        let mut reply = None;
        loop {
            if collector.is_idle() {
                if let Some(reply) = reply.take() {
                    return Ok(cell_reply(&reply, collector.into_outputs()));
                }
            }
            tokio::select! {
                message = self.iopub.recv() => {
                    let message = decode(&message?.into_vec(), signer)?;
                    if message.parent_msg_id.as_deref() == Some(msg_id) {
                        trace!(msg_type = %message.msg_type, "iopub");
                        collector.handle(&message.msg_type, message.content)?;
                    }
                }
                message = self.shell.recv() => {
                    let message = decode(&message?.into_vec(), signer)?;
                    if message.msg_type == "execute_reply"
                        && message.parent_msg_id.as_deref() == Some(msg_id)
                    {
                        reply = Some(message.content);
                    }
                }
            }
        }
    }
}

async fn send(socket: &mut DealerSocket, message: &JupyterMessage, signer: &Signer) -> Result<()> {
    let frames = encode(message, signer)?;
    let message = ZmqMessage::try_from(frames).map_err(|e| KernelError::Protocol(e.to_string()))?;
    socket.send(message).await?;
    Ok(())
}

/// Run `task` until it completes; `None` if the kernel process exits first
async fn while_alive<T>(
    child: &mut Child,
    task: impl Future<Output = Result<T>>,
) -> Result<Option<T>> {
    let mut task = std::pin::pin!(task);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    loop {
        tokio::select! {
            result = &mut task => return result.map(Some),
            _ = liveness.tick() => {
                if child.try_wait()?.is_some() {
                    return Ok(None);
                }
            }
        }
    }
}

/// A running Jupyter kernel process
pub struct JupyterKernel {
    name: String,
    channels: Option<Channels>,
    runtime: Runtime,
    child: Child,
    stderr: StderrTail,
    signer: Signer,
    session: String,
    _connection_dir: TempDir,
}

impl JupyterKernel {
    /// Start `kernel` in `working_dir` and wait until it answers
    ///
    /// # Errors
    ///
    /// [`KernelError::Spawn`] if the process cannot start,
    /// [`KernelError::Died`] if it exits during startup and
    /// [`KernelError::NotReady`] if it stays silent past `startup_timeout`.
    pub fn start(
        kernel: &InstalledKernel,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let info = connection_info(&kernel.name)?;
        let connection_dir = tempfile::Builder::new()
            .prefix("nbstatic-kernel-")
            .tempdir()?;
        let connection_file = connection_dir
            .path()
            .join(format!("kernel-{}.json", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| KernelError::Protocol(e.to_string()))?;
        fs::write(&connection_file, json)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let signer = Signer::new(&info.key)?;

        let mut cmd = kernel.command(&connection_file)?;
        cmd.current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(spec_env) = &kernel.spec.env {
            cmd.envs(spec_env);
        }
        let mut child = cmd.spawn().map_err(|source| KernelError::Spawn {
            name: kernel.name.clone(),
            source,
        })?;
        debug!(
            kernel = %kernel.name,
            pid = child.id(),
            dir = %working_dir.display(),
            "Started Jupyter kernel"
        );

        let stderr = match child.stderr.take() {
            Some(stderr) => StderrTail::capture(&kernel.name, stderr),
            None => Err(std::io::Error::other("kernel stderr not captured")),
        };
        let stderr = match stderr {
            Ok(stderr) => stderr,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let mut kernel = Self {
            name: kernel.name.clone(),
            channels: None,
            runtime,
            child,
            stderr,
            signer,
            session: Uuid::new_v4().to_string(),
            _connection_dir: connection_dir,
        };
        kernel.connect(&info, startup_timeout)?;
        info!(kernel = %kernel.name, "Kernel ready");
        Ok(kernel)
    }

    fn connect(&mut self, info: &ConnectionInfo, startup_timeout: Duration) -> Result<()> {
        let Self {
            runtime,
            child,
            signer,
            session,
            ..
        } = &mut *self;
        let startup = async {
            let mut channels = Channels::connect_with_retry(info).await;
            channels.handshake(signer, session).await?;
            Ok(channels)
        };
        let outcome = runtime.block_on(async {
            tokio::time::timeout(startup_timeout, while_alive(child, startup)).await
        });
        match outcome {
            Ok(Ok(Some(channels))) => {
                self.channels = Some(channels);
                Ok(())
            }
            Ok(Ok(None)) => Err(self.death()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(KernelError::NotReady {
                name: self.name.clone(),
                timeout: startup_timeout,
            }),
        }
    }

    /// Send `request` on the shell channel and wait for its reply and outputs
    fn request(&mut self, request: &JupyterMessage, timeout: Duration) -> Result<CellReply> {
        let Self {
            runtime,
            child,
            channels,
            signer,
            ..
        } = &mut *self;
        let channels = channels
            .as_mut()
            .ok_or_else(|| KernelError::Protocol("kernel is shut down".to_string()))?;
        let msg_id = request.header.msg_id.clone();
        let exchange = async {
            send(&mut channels.shell, request, signer).await?;
            channels.collect_reply(signer, &msg_id).await
        };
        let outcome = runtime
            .block_on(async { tokio::time::timeout(timeout, while_alive(child, exchange)).await });
        match outcome {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(self.death()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(KernelError::Timeout(timeout)),
        }
    }

    /// Run `code` without recording it; failures are only logged
    fn run_setup(&mut self, code: &str) {
        let request = JupyterMessage::new(
            ExecuteRequest {
                code: code.to_string(),
                silent: true,
                store_history: false,
                user_expressions: None,
                allow_stdin: false,
                stop_on_error: false,
            },
            None,
        )
        .with_session(&self.session);
        match self.request(&request, SETUP_TIMEOUT) {
            Ok(reply) => {
                if let Some(failure) = reply.failure {
                    warn!(
                        kernel = %self.name,
                        ename = %failure.ename,
                        evalue = %failure.evalue,
                        "Kernel setup failed"
                    );
                }
            }
            Err(e) => warn!(kernel = %self.name, error = %e, "Kernel setup failed"),
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn death(&mut self) -> KernelError {
        died(&self.name, &mut self.child, &mut self.stderr)
    }
}

impl Kernel for JupyterKernel {
    fn execute(
        &mut self,
        code: &str,
        execution_count: i64,
        timeout: Duration,
    ) -> Result<CellReply> {
        trace!(kernel = %self.name, execution_count, "Executing cell");
        let request = JupyterMessage::new(
            ExecuteRequest {
                code: code.to_string(),
                silent: false,
                store_history: true,
                user_expressions: None,
                allow_stdin: false,
                stop_on_error: true,
            },
            None,
        )
        .with_session(&self.session);
        match self.request(&request, timeout) {
            Err(KernelError::Timeout(timeout)) => {
                warn!(kernel = %self.name, ?timeout, "Kernel timed out, killing it");
                self.kill();
                Err(KernelError::Timeout(timeout))
            }
            other => other,
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut channels) = self.channels.take() else {
            if self.child.try_wait()?.is_none() {
                self.kill();
            }
            return Ok(());
        };
        if self.child.try_wait()?.is_some() {
            let _guard = self.runtime.enter();
            drop(channels);
            return Ok(());
        }

        let request = JupyterMessage::new(ShutdownRequest { restart: false }, None)
            .with_session(&self.session);
        let Self {
            runtime,
            child,
            signer,
            ..
        } = &mut *self;
        let stopped = runtime.block_on(async {
            let shutdown = async {
                send(&mut channels.control, &request, signer).await?;
                loop {
                    if child.try_wait()?.is_some() {
                        return Ok::<_, KernelError>(());
                    }
                    tokio::time::sleep(LIVENESS_INTERVAL).await;
                }
            };
            tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await
        });
        {
            let _guard = self.runtime.enter();
            drop(channels);
        }
        match stopped {
            Ok(Ok(())) => debug!(kernel = %self.name, "Kernel shut down"),
            Ok(Err(e)) => {
                warn!(kernel = %self.name, error = %e, "Shutdown request failed, killing kernel");
                self.kill();
            }
            Err(_) => {
                warn!(kernel = %self.name, "Kernel ignored shutdown request, killing it");
                self.kill();
            }
        }
        Ok(())
    }
}

impl Drop for JupyterKernel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(kernel = %self.name, error = %e, "Failed to stop kernel");
        }
    }
}
