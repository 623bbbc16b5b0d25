//! PTY spawn/write/resize, grounded on the reader-thread-plus-channel shape
//! used for dev-server PTYs, but stripped of any terminal emulation: this
//! host forwards raw bytes only, the browser owns the emulator.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

/// A chunk of raw PTY output, tagged with the dimensions in effect when it
/// was produced (so `Output`/`Buffer` frames can carry `[cols][rows]`).
#[derive(Debug, Clone)]
pub struct PtyChunk {
    pub cols: u16,
    pub rows: u16,
    pub data: Vec<u8>,
}

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    dims: Arc<Mutex<(u16, u16)>>,
    shell_pid: Option<u32>,
}

impl PtyHandle {
    pub fn spawn(shell: &str, cwd: &std::path::Path, cols: u16, rows: u16) -> Result<(Self, mpsc::UnboundedReceiver<PtyChunk>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("failed to open PTY")?;

        let mut cmd = shell_command(shell);
        cmd.cwd(cwd);
        let child = pair.slave.spawn_command(cmd).context("failed to spawn shell")?;
        let shell_pid = child.process_id();
        drop(pair.slave);

        let writer = pair.master.take_writer().context("failed to take PTY writer")?;
        let reader = pair.master.try_clone_reader().context("failed to clone PTY reader")?;

        let dims = Arc::new(Mutex::new((cols, rows)));
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader_thread(reader, tx, Arc::clone(&dims));

        let handle = Self {
            master: pair.master,
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            dims,
            shell_pid,
        };
        Ok((handle, rx))
    }

    #[must_use]
    pub fn shell_pid(&self) -> Option<u32> {
        self.shell_pid
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        writer.write_all(data).context("PTY write failed")
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("PTY resize ioctl failed")?;
        *self.dims.lock().expect("dims lock poisoned") = (cols, rows);
        Ok(())
    }

    #[must_use]
    pub fn dims(&self) -> (u16, u16) {
        *self.dims.lock().expect("dims lock poisoned")
    }

    /// Non-blocking check of whether the child has exited, without reaping
    /// beyond what `try_wait` itself does.
    pub fn try_wait_exit_code(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().expect("child lock poisoned");
        match child.try_wait().context("waitpid poll failed")? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    /// Send the shell a termination signal. SIGHUP, not SIGTERM: interactive
    /// shells (and tools run inside them) commonly ignore or swallow
    /// SIGTERM; SIGHUP is what a closing real terminal sends and reliably
    /// tears the session down.
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().expect("child lock poisoned");
        child.kill().context("failed to signal shell")
    }
}

fn shell_command(shell: &str) -> CommandBuilder {
    let parts: Vec<&str> = shell.split_whitespace().collect();
    let program = parts.first().copied().unwrap_or("/bin/sh");
    let mut cmd = CommandBuilder::new(program);
    for arg in parts.iter().skip(1) {
        cmd.arg(arg);
    }
    cmd
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<PtyChunk>,
    dims: Arc<Mutex<(u16, u16)>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let (cols, rows) = *dims.lock().expect("dims lock poisoned");
                    let chunk = PtyChunk { cols, rows, data: buf[..n].to_vec() };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PTY read error, reader thread exiting");
                    break;
                }
            }
        }
        tracing::debug!("PTY reader thread exiting");
    })
}
