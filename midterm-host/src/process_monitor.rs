//! Process-tree / foreground-process poller (§4.2 "process/foreground
//! tracking"). Linux-specific via procfs; a no-op elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use midterm_proto::session::ForegroundProcess;
use tokio::sync::broadcast;

use crate::session::SessionState;
use crate::HostEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(session: Arc<SessionState>, events: broadcast::Sender<HostEvent>, shell_pid: u32) {
    let mut last_children: HashMap<u32, String> = HashMap::new();
    let mut last_foreground: Option<ForegroundProcess> = None;
    let mut last_cwd: Option<String> = None;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        if let Some(exit_code) = session.pty.try_wait_exit_code().unwrap_or(None) {
            session.mark_exited(exit_code);
            let _ = events.send(HostEvent::StateChange);
            tracing::info!(exit_code, "shell exited");
            return;
        }

        let current_children = child_names(shell_pid);
        diff_children(&events, shell_pid, &last_children, &current_children);
        last_children = current_children;

        let (foreground, cwd) = foreground_process(shell_pid);

        if cwd != last_cwd {
            session.set_cwd(cwd.clone());
            last_cwd = cwd;
        }

        if foreground != last_foreground {
            session.set_foreground(foreground.clone());
            if let Some(fg) = &foreground {
                let payload = serde_json::json!({
                    "pid": fg.pid,
                    "name": fg.name,
                    "cmd": fg.command_line,
                    "cwd": session.snapshot().current_working_directory,
                });
                if let Ok(json) = serde_json::to_vec(&payload) {
                    let _ = events.send(HostEvent::ForegroundChange(json));
                }
            }
            last_foreground = foreground;
        }
    }
}

/// Emits a `ProcessEvent` (start/exit/rename) for every pid that appeared,
/// disappeared, or changed its `comm` name between two polls (§4.2).
fn diff_children(
    events: &broadcast::Sender<HostEvent>,
    shell_pid: u32,
    before: &HashMap<u32, String>,
    after: &HashMap<u32, String>,
) {
    for (&pid, name) in after {
        match before.get(&pid) {
            None => emit_process_event(events, "start", pid, shell_pid, name, cmdline(pid)),
            Some(old_name) if old_name != name => {
                emit_process_event(events, "rename", pid, shell_pid, name, cmdline(pid))
            }
            Some(_) => {}
        }
    }
    for (&pid, name) in before {
        if !after.contains_key(&pid) {
            emit_process_event(events, "exit", pid, shell_pid, name, None);
        }
    }
}

fn emit_process_event(
    events: &broadcast::Sender<HostEvent>,
    kind: &str,
    pid: u32,
    ppid: u32,
    name: &str,
    cmd: Option<String>,
) {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let payload = serde_json::json!({
        "type": kind,
        "pid": pid,
        "ppid": ppid,
        "name": name,
        "cmd": cmd,
        "ts": ts,
    });
    if let Ok(json) = serde_json::to_vec(&payload) {
        let _ = events.send(HostEvent::ProcessEvent(json));
    }
}

#[cfg(target_os = "linux")]
fn foreground_process(shell_pid: u32) -> (Option<ForegroundProcess>, Option<String>) {
    let cwd = std::fs::read_link(format!("/proc/{shell_pid}/cwd"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned());

    // The foreground process is whichever direct child of the shell has a
    // controlling-terminal session matching the shell's own; approximated
    // here as "the most recently started direct child", which is what a
    // shell's job-control foreground group almost always is.
    let children = direct_children(shell_pid);
    let Some(&pid) = children.last() else {
        return (None, cwd);
    };

    let name = comm(pid);
    let cmd = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .ok()
        .map(|s| s.replace('\0', " ").trim().to_string())
        .unwrap_or_default();

    (Some(ForegroundProcess { pid, name, command_line: cmd }), cwd)
}

#[cfg(target_os = "linux")]
fn comm(pid: u32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm")).ok().map(|s| s.trim().to_string()).unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn cmdline(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .ok()
        .map(|s| s.replace('\0', " ").trim().to_string())
}

/// Direct children of `parent_pid`, keyed by `comm` name, used to diff the
/// process tree between polls (§4.2).
#[cfg(target_os = "linux")]
fn child_names(parent_pid: u32) -> HashMap<u32, String> {
    let mut children = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return children;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // Field 4 (after the `(comm)` parenthesized field, which may itself
        // contain spaces) is the parent pid.
        if let Some(close_paren) = stat.rfind(')') {
            let rest: Vec<&str> = stat[close_paren + 2..].split_whitespace().collect();
            if let Some(ppid_str) = rest.first() {
                if ppid_str.parse::<u32>() == Ok(parent_pid) {
                    children.insert(pid, comm(pid));
                }
            }
        }
    }
    children
}

#[cfg(target_os = "linux")]
fn direct_children(parent_pid: u32) -> Vec<u32> {
    let mut children: Vec<u32> = child_names(parent_pid).into_keys().collect();
    children.sort_unstable();
    children
}

#[cfg(not(target_os = "linux"))]
fn foreground_process(_shell_pid: u32) -> (Option<ForegroundProcess>, Option<String>) {
    (None, None)
}

#[cfg(not(target_os = "linux"))]
fn child_names(_parent_pid: u32) -> HashMap<u32, String> {
    HashMap::new()
}

#[cfg(not(target_os = "linux"))]
fn cmdline(_pid: u32) -> Option<String> {
    None
}
