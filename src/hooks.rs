// src/hooks.rs

//! External hook scripts
//!
//! Client post-update hooks and server QA hooks are plain scripts run with
//! `/bin/sh`. Output is logged line by line, stdin is closed, and a script
//! running past its timeout is killed.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Interpreter used for hook scripts
pub const SHELL: &str = "/bin/sh";

/// How a hook run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Exited(i32),
    /// Killed by a signal
    Signaled,
    TimedOut,
}

impl HookStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Run `script` with `args`, waiting at most `timeout`
///
/// Failing to start the script is an error; its exit status is not.
pub fn run_hook(script: &Path, args: &[&str], timeout: Duration) -> Result<HookStatus> {
    if !script.is_file() {
        return Err(Error::NotFoundError(format!(
            "hook {} does not exist",
            script.display()
        )));
    }

    let label = script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| script.display().to_string());
    debug!("Executing hook: {} {} {:?}", SHELL, script.display(), args);

    let mut child = Command::new(SHELL)
        .arg(script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::InitError(format!("Failed to spawn hook {}: {}", label, e)))?;

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let output = child.wait_with_output()?;
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                info!("[{}] {}", label, line);
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                warn!("[{}] {}", label, line);
            }

            match status.code() {
                Some(code) => Ok(HookStatus::Exited(code)),
                None => Ok(HookStatus::Signaled),
            }
        }
        None => {
            let _ = child.kill();
            let _ = child.wait();
            warn!(
                "Hook {} timed out after {} seconds",
                label,
                timeout.as_secs()
            );
            Ok(HookStatus::TimedOut)
        }
    }
}
