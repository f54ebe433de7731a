//! Child-process runner for check and heal scripts.

use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::constants::{CHILD_POLL_INTERVAL, EXIT_HEALED};
use crate::status::RawVerdict;

/// Terminal state of one script invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptResult {
    /// The process exited with a code.
    Exited(i32),
    /// The process was killed by a signal.
    Signaled,
    /// The process outlived the hard timeout and was killed.
    TimedOut,
    /// The first token of the command is not an executable file.
    NotExecutable,
}

impl ScriptResult {
    /// Maps the run outcome onto a check verdict. A timeout is OK by
    /// design: declaring the host bad because a script hung would let a
    /// stuck dependency pull whole pools out of rotation at once.
    pub fn check_verdict(self) -> RawVerdict {
        match self {
            ScriptResult::Exited(code) => RawVerdict::from_exit_code(code),
            ScriptResult::TimedOut => RawVerdict::from_exit_code(0),
            ScriptResult::Signaled | ScriptResult::NotExecutable => {
                RawVerdict::from_exit_code(1)
            }
        }
    }

    /// Whether a heal command finished successfully.
    pub fn healed(self) -> bool {
        self == ScriptResult::Exited(EXIT_HEALED)
    }
}

/// Splits a command line on whitespace and verifies the first token is an
/// executable file. Returns the argv on success.
pub fn resolve_command(cmdline: &str) -> Option<Vec<String>> {
    let argv: Vec<String> = cmdline.split_whitespace().map(String::from).collect();
    let first = argv.first()?;
    if is_executable(Path::new(first)) {
        Some(argv)
    } else {
        None
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs a script to completion with a fresh environment and a hard
/// timeout. The merged output is logged line by line under the check id.
pub fn run_script(
    check_id: &str,
    cmdline: &str,
    env: &[(String, String)],
    timeout: Duration,
) -> ScriptResult {
    let Some(argv) = resolve_command(cmdline) else {
        warn!("Check '{check_id}': '{cmdline}' is not executable");
        return ScriptResult::NotExecutable;
    };

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("Check '{check_id}': failed to spawn '{}': {err}", argv[0]);
            return ScriptResult::NotExecutable;
        }
    };

    let readers = spawn_output_readers(check_id, &mut child);
    let result = wait_with_timeout(check_id, &mut child, timeout);
    for reader in readers {
        let _ = reader.join();
    }
    result
}

/// Streams stdout and stderr so the child never blocks on a full pipe.
fn spawn_output_readers(check_id: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        let id = check_id.to_string();
        readers.push(thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                info!("[{id}] {line}");
            }
        }));
    }

    if let Some(stderr) = child.stderr.take() {
        let id = check_id.to_string();
        readers.push(thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                info!("[{id}] {line}");
            }
        }));
    }

    readers
}

fn wait_with_timeout(check_id: &str, child: &mut Child, timeout: Duration) -> ScriptResult {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return match status.code() {
                    Some(code) => {
                        debug!("Check '{check_id}' exited with code {code}");
                        ScriptResult::Exited(code)
                    }
                    None => {
                        warn!("Check '{check_id}' was killed by a signal");
                        ScriptResult::Signaled
                    }
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!(
                        "Check '{check_id}' exceeded its {}s timeout; killing it",
                        timeout.as_secs()
                    );
                    if let Err(err) = child.kill() {
                        error!("Check '{check_id}': failed to kill: {err}");
                    }
                    let _ = child.wait();
                    return ScriptResult::TimedOut;
                }
                thread::sleep(CHILD_POLL_INTERVAL);
            }
            Err(err) => {
                error!("Check '{check_id}': failed to poll child: {err}");
                let _ = child.kill();
                let _ = child.wait();
                return ScriptResult::Signaled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::status::Verdict;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn exit_code_becomes_the_verdict() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "bad.sh", "#!/bin/sh\nexit 2\n");

        let result = run_script("t", &script, &[], Duration::from_secs(5));
        assert_eq!(result, ScriptResult::Exited(2));
        assert_eq!(result.check_verdict().verdict, Verdict::Bad);
    }

    #[test]
    fn missing_executable_is_a_warn() {
        let result = run_script(
            "t",
            "/nonexistent/check --flag",
            &[],
            Duration::from_secs(5),
        );
        assert_eq!(result, ScriptResult::NotExecutable);
        assert_eq!(result.check_verdict().verdict, Verdict::Warn);
    }

    #[test]
    fn non_executable_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, "not a script").unwrap();

        assert!(resolve_command(&path.to_string_lossy()).is_none());
        assert!(resolve_command("").is_none());
    }

    #[test]
    fn arguments_survive_the_whitespace_split() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "args.sh",
            "#!/bin/sh\n[ \"$1\" = \"alpha\" ] && [ \"$2\" = \"beta\" ] && exit 0\nexit 2\n",
        );

        let result = run_script(
            "t",
            &format!("{script} alpha beta"),
            &[],
            Duration::from_secs(5),
        );
        assert_eq!(result, ScriptResult::Exited(0));
    }

    #[test]
    fn environment_reaches_the_child() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("env.out");
        let script = write_script(
            dir.path(),
            "env.sh",
            &format!("#!/bin/sh\necho \"$APOLLO_RECORD\" > {}\n", out.display()),
        );

        let env = vec![(
            "APOLLO_RECORD".to_string(),
            "www.service.lga.consul".to_string(),
        )];
        let result = run_script("t", &script, &env, Duration::from_secs(5));
        assert_eq!(result, ScriptResult::Exited(0));
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            "www.service.lga.consul"
        );
    }

    #[test]
    fn timeout_fails_open() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 30\nexit 2\n");

        let started = Instant::now();
        let result = run_script("t", &script, &[], Duration::from_millis(300));
        assert_eq!(result, ScriptResult::TimedOut);
        assert_eq!(result.check_verdict().verdict, Verdict::Ok);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn heal_success_is_exit_zero_only() {
        assert!(ScriptResult::Exited(0).healed());
        assert!(!ScriptResult::Exited(1).healed());
        assert!(!ScriptResult::TimedOut.healed());
        assert!(!ScriptResult::NotExecutable.healed());
    }
}
