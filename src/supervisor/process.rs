use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

const TERM_GRACE: Duration = Duration::from_millis(100);
const PORT_RELEASE_WAIT: Duration = Duration::from_millis(200);

/// True when nothing is listening on `port`, on either the wildcard or the
/// loopback address.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => drop(listener),
        Err(_) => return false,
    }
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Terminates whatever listens on `port`, as reported by `lsof`. Our own
/// process is never a target. A missing `lsof` counts as "nothing found".
pub async fn kill_listeners(port: u16) -> usize {
    let output = match Command::new("lsof")
        .args(["-t", "-i", &format!(":{}", port)])
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        Ok(_) => return 0,
        Err(e) => {
            tracing::debug!("lsof unavailable: {}", e);
            return 0;
        }
    };

    let own_pid = std::process::id();
    let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .filter(|pid| *pid != own_pid)
        .collect();

    for pid in &pids {
        tracing::info!("Terminating process {} listening on port {}", pid, port);
        send_signal(*pid, Signal::Term);
        tokio::time::sleep(TERM_GRACE).await;
        if process_exists(*pid) {
            send_signal(*pid, Signal::Kill);
        }
    }
    if !pids.is_empty() {
        tokio::time::sleep(PORT_RELEASE_WAIT).await;
    }
    pids.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Largest value accepted as a pid. Zero and anything that would wrap to a
/// negative `pid_t` address process groups rather than one process.
pub const MAX_PID: u32 = i32::MAX as u32;

pub fn is_valid_pid(pid: u32) -> bool {
    pid != 0 && pid <= MAX_PID
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<libc::pid_t> {
    if is_valid_pid(pid) {
        Some(pid as libc::pid_t)
    } else {
        None
    }
}

#[cfg(unix)]
fn raw_signal(signal: Signal) -> libc::c_int {
    match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    }
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    match raw_pid(pid) {
        Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    match raw_pid(pid) {
        Some(pid) => unsafe { libc::kill(pid, raw_signal(signal)) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Signals the process group led by `pid`, falling back to the process alone.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    let Some(raw) = raw_pid(pid) else {
        return false;
    };
    let grouped = unsafe { libc::killpg(raw, raw_signal(signal)) == 0 };
    grouped || send_signal(pid, signal)
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    send_signal(pid, signal)
}

/// The last `lines` lines of a log file.
pub fn tail(path: &Path, lines: usize) -> std::io::Result<String> {
    let data = std::fs::read_to_string(path)?;
    let all: Vec<&str> = data.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_port_availability_tracks_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        drop(listener);
        assert!(is_port_available(port));
    }

    #[test]
    fn test_tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let content: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, content).unwrap();

        let last = tail(&path, 20).unwrap();
        assert_eq!(last.lines().count(), 20);
        assert!(last.starts_with("line 11"));
        assert!(last.ends_with("line 30"));
        assert_eq!(tail(&path, 100).unwrap().lines().count(), 30);
        assert!(tail(&dir.path().join("missing.log"), 5).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_own_process_exists() {
        assert!(process_exists(std::process::id()));
    }

    #[test]
    fn test_group_addressing_pids_are_rejected() {
        for pid in [0, MAX_PID + 1, u32::MAX] {
            assert!(!is_valid_pid(pid));
            assert!(!process_exists(pid));
            assert!(!send_signal(pid, Signal::Term));
            assert!(!signal_group(pid, Signal::Term));
        }
        assert!(is_valid_pid(1));
        assert!(is_valid_pid(MAX_PID));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_listeners_spares_own_process() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(kill_listeners(port).await, 0);
        assert!(!is_port_available(port));
    }
}
