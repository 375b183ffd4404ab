//! Interactive process capability used by terminal sessions.
//!
//! [`PtySpawner`] starts a shell attached to a pseudo-terminal and hands back
//! its byte streams plus a [`PtyProcess`] handle for resize and signals. The
//! session state machine only ever sees these traits.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    fn to_pty(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How the process ended. A signal death carries no exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Control half of a spawned interactive process.
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn resize(&mut self, size: TerminalSize) -> io::Result<()>;

    /// Ask the process to hang up and terminate.
    fn terminate(&mut self);

    /// Kill the process unconditionally.
    fn kill(&mut self);
}

/// Blocks until the process exits. Run it on a blocking thread.
pub type ExitWaiter = Box<dyn FnOnce() -> io::Result<ExitInfo> + Send>;

pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub waiter: ExitWaiter,
}

pub trait PtySpawner: Send + Sync {
    fn spawn(&self, cwd: &Path, size: TerminalSize) -> io::Result<SpawnedPty>;
}

/// Spawns `shell` on the host's native pseudo-terminal.
#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    shell: String,
}

impl NativePtySpawner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, cwd: &Path, size: TerminalSize) -> io::Result<SpawnedPty> {
        let pair = native_pty_system()
            .openpty(size.to_pty())
            .map_err(io::Error::other)?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair.slave.spawn_command(cmd).map_err(io::Error::other)?;
        // Only the child may hold the slave side, or reads never see EOF.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(io::Error::other)?;
        let writer = pair.master.take_writer().map_err(io::Error::other)?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));
        debug!(shell = %self.shell, pid = ?pid, "spawned pty");

        let waiter = {
            let exited = exited.clone();
            Box::new(move || {
                let info = wait_for_exit(child, pid);
                exited.store(true, Ordering::SeqCst);
                info
            }) as ExitWaiter
        };

        Ok(SpawnedPty {
            process: Box::new(NativePty {
                master: pair.master,
                killer,
                pid,
                exited,
            }),
            reader,
            writer,
            waiter,
        })
    }
}

struct NativePty {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl NativePty {
    fn reaped(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.master.resize(size.to_pty()).map_err(io::Error::other)
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::Signal;

        if self.reaped() {
            return;
        }
        // Interactive shells ignore SIGTERM, so hang up first.
        signal_group(self.pid, Signal::SIGHUP);
        signal_group(self.pid, Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if self.reaped() || kill_group(self.pid) {
            return;
        }
        if let Err(err) = self.killer.kill() {
            debug!(pid = ?self.pid, error = %err, "kill failed");
        }
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) -> bool {
    if pid.is_none() {
        return false;
    }
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    true
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) -> bool {
    false
}

/// The shell leads its own session, so its pid is also the process group id.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => debug!(
            pid,
            signal = signal.as_str(),
            error = %err,
            "signal delivery failed"
        ),
    }
}

#[cfg(unix)]
fn wait_for_exit(
    mut child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
) -> io::Result<ExitInfo> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let status = child.wait()?;
        return Ok(ExitInfo {
            exit_code: Some(status.exit_code() as i32),
            signal: None,
        });
    };
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitInfo {
                    exit_code: Some(code),
                    signal: None,
                })
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitInfo {
                    exit_code: None,
                    signal: Some(signal.as_str().to_string()),
                })
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(err) => return Err(io::Error::from(err)),
        }
    }
}

#[cfg(not(unix))]
fn wait_for_exit(
    mut child: Box<dyn Child + Send + Sync>,
    _pid: Option<u32>,
) -> io::Result<ExitInfo> {
    let status = child.wait()?;
    Ok(ExitInfo {
        exit_code: Some(status.exit_code() as i32),
        signal: None,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Drain `reader` on a thread so the shell never blocks on a full pty.
    fn collect(mut reader: Box<dyn Read + Send>) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn wait_for(rx: &mpsc::Receiver<Vec<u8>>, seen: &mut Vec<u8>, needle: &str) -> bool {
        for _ in 0..50 {
            if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(100)) {
                seen.extend_from_slice(&chunk);
            }
            if String::from_utf8_lossy(seen).contains(needle) {
                return true;
            }
        }
        false
    }

    #[test]
    fn spawn_echo_and_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let pty = NativePtySpawner::new("/bin/sh")
            .spawn(dir.path(), TerminalSize::default())
            .expect("spawn failed");
        let SpawnedPty {
            process,
            reader,
            mut writer,
            waiter,
        } = pty;
        assert!(process.pid().is_some());
        let rx = collect(reader);

        writer.write_all(b"echo hello_$((40+2))\n").unwrap();
        writer.flush().unwrap();
        let mut seen = Vec::new();
        assert!(
            wait_for(&rx, &mut seen, "hello_42"),
            "got: {}",
            String::from_utf8_lossy(&seen)
        );

        writer.write_all(b"exit 7\n").unwrap();
        writer.flush().unwrap();
        let info = waiter().unwrap();
        assert_eq!(info.exit_code, Some(7));
        assert_eq!(info.signal, None);
    }

    #[test]
    fn terminate_hangs_up_the_shell() {
        let dir = tempfile::TempDir::new().unwrap();
        let SpawnedPty {
            mut process,
            reader,
            writer: _writer,
            waiter,
        } = NativePtySpawner::new("/bin/sh")
            .spawn(dir.path(), TerminalSize { cols: 100, rows: 40 })
            .unwrap();
        let _rx = collect(reader);

        process.resize(TerminalSize { cols: 120, rows: 50 }).unwrap();
        process.terminate();
        let info = waiter().unwrap();
        assert_eq!(info.exit_code, None);
        assert!(info.signal.is_some());
    }

    #[test]
    fn dropping_the_handle_kills_the_shell() {
        let dir = tempfile::TempDir::new().unwrap();
        let SpawnedPty {
            process,
            reader,
            writer: _writer,
            waiter,
        } = NativePtySpawner::new("/bin/sh")
            .spawn(dir.path(), TerminalSize::default())
            .unwrap();
        let _rx = collect(reader);

        drop(process);
        let info = waiter().unwrap();
        assert_eq!(info.signal.as_deref(), Some("SIGKILL"));
    }
}
