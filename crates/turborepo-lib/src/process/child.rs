//! A single supervised child process.
//!
//! The `Child` handle is cheap to clone; the underlying process is owned
//! by a monitor task that reports the exit through a watch channel and
//! accepts stop/kill commands through an mpsc channel.

use std::{
    collections::BTreeMap,
    fmt, io,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, watch},
};
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;

/// Builder for the command a task runs. Deliberately small: the scheduler
/// treats the command as opaque.
#[derive(Debug, Clone)]
pub struct Command {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<AbsoluteSystemPathBuf>,
    envs: BTreeMap<String, String>,
    env_clear: bool,
    open_stdin: bool,
}

impl Command {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: BTreeMap::new(),
            env_clear: false,
            open_stdin: true,
        }
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn current_dir(&mut self, cwd: AbsoluteSystemPathBuf) -> &mut Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn envs(
        &mut self,
        envs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> &mut Self {
        self.envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Starts from an empty environment instead of inheriting.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self
    }

    pub fn open_stdin(&mut self) -> &mut Self {
        self.open_stdin = true;
        self
    }

    pub fn label(&self) -> String {
        format!(
            "({}) {} {}",
            self.cwd
                .as_ref()
                .map(|cwd| cwd.as_str())
                .unwrap_or_default(),
            self.program.display(),
            self.args.join(" ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// Killed by the manager during shutdown.
    Killed,
    /// Killed by something outside the manager.
    KilledExternal,
    Failed,
}

enum ChildCommand {
    Stop,
    Kill,
}

#[derive(Clone)]
pub struct Child {
    pid: Option<u32>,
    label: String,
    command_channel: mpsc::Sender<ChildCommand>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    stdin: Arc<Mutex<Option<tokio::process::ChildStdin>>>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("pid", &self.pid)
            .field("label", &self.label)
            .finish()
    }
}

impl Child {
    /// Spawns the command in its own process group and starts the monitor
    /// task.
    pub fn spawn(command: Command, stop_timeout: Duration) -> io::Result<Child> {
        let label = command.label();
        let Command {
            program,
            args,
            cwd,
            envs,
            env_clear,
            open_stdin,
        } = command;

        let mut cmd = std::process::Command::new(&program);
        cmd.args(&args);
        if let Some(cwd) = &cwd {
            cmd.current_dir(cwd.as_std_path());
        }
        if env_clear {
            cmd.env_clear();
        }
        cmd.envs(envs);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // A fresh group lets shutdown signal grandchildren too.
            cmd.process_group(0);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(if open_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (command_tx, mut command_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let exit = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => exit_for_status(status),
                            Err(_) => ChildExit::Failed,
                        };
                    }
                    Some(request) = command_rx.recv() => {
                        match request {
                            ChildCommand::Stop => {
                                signal_group(pid, GracefulSignal::Terminate);
                                match tokio::time::timeout(stop_timeout, child.wait()).await {
                                    // Died from the graceful signal, still
                                    // counts as killed by us.
                                    Ok(_) => break ChildExit::Killed,
                                    Err(_) => {
                                        signal_group(pid, GracefulSignal::Kill);
                                        child.kill().await.ok();
                                        break ChildExit::Killed;
                                    }
                                }
                            }
                            ChildCommand::Kill => {
                                signal_group(pid, GracefulSignal::Kill);
                                child.kill().await.ok();
                                break ChildExit::Killed;
                            }
                        }
                    }
                }
            };
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Child {
            pid,
            label,
            command_channel: command_tx,
            exit_channel: exit_rx,
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.stdin.lock().expect("stdin lock poisoned").take()
    }

    /// Waits for the child to reach a terminal state.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        if let Some(exit) = *self.exit_channel.borrow() {
            return Some(exit);
        }
        self.exit_channel.changed().await.ok()?;
        *self.exit_channel.borrow()
    }

    /// SIGTERM the group, wait the configured deadline, then SIGKILL.
    pub async fn stop(mut self) -> Option<ChildExit> {
        self.command_channel.send(ChildCommand::Stop).await.ok();
        self.wait().await
    }

    /// SIGKILL immediately.
    pub async fn kill(mut self) -> Option<ChildExit> {
        self.command_channel.send(ChildCommand::Kill).await.ok();
        self.wait().await
    }

    /// Streams the child's stdout and stderr into `writer` in arrival
    /// order, then reports the exit. A task's own output keeps its source
    /// order; interleaving across tasks is the caller's concern.
    pub async fn wait_with_piped_outputs(
        &mut self,
        writer: &mut impl std::io::Write,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        let mut stdout = self.stdout.lock().expect("stdout lock poisoned").take();
        let mut stderr = self.stderr.lock().expect("stderr lock poisoned").take();
        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = stderr.is_some();

        while stdout_open || stderr_open {
            tokio::select! {
                read = read_some(&mut stdout, &mut stdout_buf), if stdout_open => {
                    match read? {
                        0 => stdout_open = false,
                        n => writer.write_all(&stdout_buf[..n])?,
                    }
                }
                read = read_some(&mut stderr, &mut stderr_buf), if stderr_open => {
                    match read? {
                        0 => stderr_open = false,
                        n => writer.write_all(&stderr_buf[..n])?,
                    }
                }
            }
        }

        Ok(self.wait().await)
    }
}

async fn read_some<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

fn exit_for_status(status: std::process::ExitStatus) -> ChildExit {
    match status.code() {
        Some(code) => ChildExit::Finished(Some(code)),
        // Terminated by a signal we didn't send.
        None => ChildExit::KilledExternal,
    }
}

enum GracefulSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GracefulSignal) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };
    let Some(pid) = pid else {
        return;
    };
    let signal = match signal {
        GracefulSignal::Terminate => Signal::SIGTERM,
        GracefulSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("failed to signal process group {pid}: {e}");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GracefulSignal) {
    // Windows has no process groups in this sense; the platform
    // equivalent is handled by kill_on_drop and Child::kill.
}
