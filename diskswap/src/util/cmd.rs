//! External command execution helpers.
//!
//! Every stage shells out to block-device tooling (`lsblk`, `losetup`,
//! `partprobe`, `mkfs.ext4`, ...). These helpers keep the error mapping
//! in one place: stdout on success, stderr folded into the error on a
//! non-zero exit.

use diskswap_shared::{DiskswapError, DiskswapResult};
use tokio::process::Command;

/// Run a command and return its stdout as a string.
///
/// A non-zero exit becomes an `Internal` error carrying the command line
/// and stderr; callers map it into their stage-specific variant.
pub async fn run(program: &str, args: &[&str]) -> DiskswapResult<String> {
    #[cfg(test)]
    if let Some(stdout) = script::intercepted(program, args) {
        return Ok(stdout);
    }

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| DiskswapError::Internal(format!("failed to spawn {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DiskswapError::Internal(format!(
            "{} {} exited with {:?}: {}",
            program,
            args.join(" "),
            output.status.code(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command and report only whether it succeeded.
pub async fn run_ok(program: &str, args: &[&str]) -> bool {
    #[cfg(test)]
    if script::intercepted(program, args).is_some() {
        return true;
    }

    matches!(
        Command::new(program).args(args).output().await,
        Ok(output) if output.status.success()
    )
}

/// Run a command best-effort, ignoring the outcome entirely. Used on
/// defensive cleanup paths ("already unmounted", "already detached").
pub async fn run_quiet(program: &str, args: &[&str]) {
    #[cfg(test)]
    if script::intercepted(program, args).is_some() {
        return;
    }

    if let Err(e) = Command::new(program).args(args).output().await {
        tracing::debug!(program, error = %e, "best-effort command failed to spawn");
    }
}

/// Test-only command interception: while an [`script::Interceptor`] is
/// alive, every command is recorded and answered with canned stdout
/// instead of being spawned. Lets teardown ordering and command pairing
/// be asserted without touching real block devices.
#[cfg(test)]
pub(crate) mod script {
    use std::collections::HashMap;

    use parking_lot::{Mutex, MutexGuard};

    static SERIAL: Mutex<()> = Mutex::new(());
    static ACTIVE: Mutex<Option<State>> = Mutex::new(None);

    #[derive(Default)]
    struct State {
        log: Vec<String>,
        stdout: HashMap<String, String>,
    }

    /// Active interception. Tests holding one are serialized against
    /// each other; dropping it restores real command execution.
    pub struct Interceptor {
        _serial: MutexGuard<'static, ()>,
    }

    pub fn intercept() -> Interceptor {
        let serial = SERIAL.lock();
        *ACTIVE.lock() = Some(State::default());
        Interceptor { _serial: serial }
    }

    impl Interceptor {
        /// Canned stdout for every invocation of `program`.
        pub fn stdout_for(&self, program: &str, stdout: &str) {
            if let Some(state) = ACTIVE.lock().as_mut() {
                state.stdout.insert(program.to_string(), stdout.to_string());
            }
        }

        /// Every intercepted command line, in invocation order.
        pub fn log(&self) -> Vec<String> {
            ACTIVE
                .lock()
                .as_ref()
                .map(|state| state.log.clone())
                .unwrap_or_default()
        }
    }

    impl Drop for Interceptor {
        fn drop(&mut self) {
            *ACTIVE.lock() = None;
        }
    }

    pub(super) fn intercepted(program: &str, args: &[&str]) -> Option<String> {
        let mut active = ACTIVE.lock();
        let state = active.as_mut()?;
        state.log.push(format!("{} {}", program, args.join(" ")));
        Some(state.stdout.get(program).cloned().unwrap_or_default())
    }
}
