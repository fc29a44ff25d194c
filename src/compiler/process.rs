//! Waiting on toolchain processes with an optional wall-clock limit

use crate::error::{CompilerError, Result};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Put `command`'s child in a new process group, so a timeout can stop the
/// workers a compiler driver forks (`cc1`, `as`, `ld`) along with it.
pub fn isolate_process_group(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = command;
}

/// Kill `child` and, when it leads its own process group, every process in that group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // Fails with ESRCH when the child is not a group leader.
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
                return;
            }
        }
    }
    let _ = child.kill();
}

/// Wait for `child`, killing and reaping it if `timeout` expires first.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    program: &str,
) -> Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };

    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::warn!("'{}' exceeded {:?}, killing pid {}", program, timeout, child.id());
            kill_tree(child);
            child.wait()?;
            return Err(CompilerError::Timeout {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Shell-like rendering of a command line, for logs.
pub fn render_command(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        let arg = arg.to_string_lossy();
        rendered.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            rendered.push_str(&format!("'{}'", arg));
        } else {
            rendered.push_str(&arg);
        }
    }
    rendered
}
