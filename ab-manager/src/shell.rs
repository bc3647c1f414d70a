use std::{
    fmt, io,
    process::{Command, Output, Stdio},
    sync::mpsc,
    time::Duration,
};

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("'cmd' arg cannot be empty")]
    EmptyCommand,
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn { cmd: String, source: io::Error },
    #[error("`{cmd}` did not finish within {timeout:?} and was killed")]
    Timeout { cmd: String, timeout: Duration },
    #[error("failed waiting for `{cmd}`: {source}")]
    Wait { cmd: String, source: io::Error },
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<Output> for CmdOutput {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs external tools. Every invocation is bounded by a timeout.
pub trait Shell: Send + Sync + fmt::Debug {
    fn exec(&self, cmd: &[&str], timeout: Duration) -> Result<CmdOutput, ShellError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Host;

impl Shell for Host {
    fn exec(&self, cmd: &[&str], timeout: Duration) -> Result<CmdOutput, ShellError> {
        let (program, args) = cmd.split_first().ok_or(ShellError::EmptyCommand)?;
        let cmd_str = cmd.join(" ");
        debug!("running `{cmd_str}`");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ShellError::Spawn {
                cmd: cmd_str.clone(),
                source,
            })?;
        let pid = child.id();

        let (tx, rx) = mpsc::sync_channel(1);
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let output = match rx.recv_timeout(timeout) {
            Ok(output) => output,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("`{cmd_str}` timed out after {timeout:?}, killing it");
                kill(pid);
                // Reap the child so it doesn't linger as a zombie.
                let _ = rx.recv();
                return Err(ShellError::Timeout {
                    cmd: cmd_str,
                    timeout,
                });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(ShellError::Wait {
                    cmd: cmd_str,
                    source: io::Error::other("waiter thread exited"),
                });
            }
        };

        output.map(CmdOutput::from).map_err(|source| ShellError::Wait {
            cmd: cmd_str,
            source,
        })
    }
}

fn kill(pid: u32) {
    let Some(pid) = i32::try_from(pid)
        .ok()
        .and_then(rustix::process::Pid::from_raw)
    else {
        return;
    };
    if let Err(e) = rustix::process::kill_process(pid, rustix::process::Signal::Kill)
    {
        warn!("failed to kill pid {pid:?}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_and_exit_code() {
        let out = Host
            .exec(&["sh", "-c", "echo hi; exit 3"], Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert!(!out.success());
    }

    #[test]
    fn kills_commands_that_exceed_the_timeout() {
        let err = Host
            .exec(&["sleep", "30"], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ShellError::Timeout { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = Host
            .exec(&["definitely-not-a-real-binary-1234"], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ShellError::Spawn { .. }));
        assert!(matches!(
            Host.exec(&[], Duration::from_secs(1)),
            Err(ShellError::EmptyCommand)
        ));
    }
}
