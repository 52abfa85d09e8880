//! Command execution and file access for the local sandbox service.
//!
//! A local sandbox is a directory under the service root. Commands run through
//! `sh -c` with that directory as `HOME` and default working directory. File
//! paths given to the file API are confined to the directory.
//!
//! Processes are not isolated: every sandbox shares the host's process table
//! and network ports, so `ps` and `pkill` inside one sandbox see and reach
//! processes of other sandboxes and of the service user. Each command carries
//! [`SANDBOX_ROOT_ENV`] so that a sandbox's own processes can be found and
//! terminated when it is destroyed.

use crate::api::CommandResult;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Set on every command (and inherited by its descendants) to the sandbox
/// directory it runs in.
pub const SANDBOX_ROOT_ENV: &str = "SANDBOXCTL_SANDBOX_ROOT";

/// Resource limits applied to every command.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub nofile: u64,
    pub fsize_kb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            nofile: 4096,
            fsize_kb: 1048576,
        }
    }
}

/// Configuration for running a command in a sandbox.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub limits: Limits,
}

/// Create the directory backing a sandbox and return its canonical path.
pub fn create_sandbox_dir(root: &Path, sandbox_id: &str) -> Result<PathBuf, String> {
    let dir = root.join(sandbox_id);
    if dir.exists() {
        return Err(format!("sandbox directory {} already exists", dir.display()));
    }
    fs::create_dir_all(&dir).map_err(|e| format!("mkdir: {}", e))?;
    dir.canonicalize().map_err(|e| format!("canonicalize: {}", e))
}

/// Kill every process still running for a sandbox, then remove its
/// directory and everything in it.
pub fn destroy_sandbox(sandbox_root: &Path) {
    let killed = terminate_sandbox_processes(sandbox_root);
    if killed > 0 {
        info!(sandbox_root = ?sandbox_root, killed, "Terminated sandbox processes");
    }
    if let Err(e) = fs::remove_dir_all(sandbox_root) {
        debug!(sandbox_root = ?sandbox_root, error = %e, "cleanup failed");
    }
}

/// Run a shell command inside a sandbox, capturing stdout followed by stderr.
///
/// The command leads its own process group. On timeout the whole group is
/// killed, including anything it started in the background.
pub async fn run_in_sandbox(
    sandbox_root: &Path,
    config: &RunConfig,
) -> Result<CommandResult, String> {
    let cwd = working_dir(sandbox_root, config.cwd.as_deref())?;
    info!(command = %config.command, cwd = ?cwd, "Running command");

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&config.command)
        .current_dir(&cwd)
        .env("HOME", sandbox_root)
        .envs(&config.env)
        .env(SANDBOX_ROOT_ENV, sandbox_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    apply_limits(&mut command, config.limits);

    let child = command.spawn().map_err(|e| format!("spawn: {}", e))?;
    let pid = child.id();
    let output = match tokio::time::timeout(config.timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| format!("wait: {}", e))?,
        Err(_) => {
            info!(timeout = ?config.timeout, "Command timed out");
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            return Ok(CommandResult {
                exit_code: TIMEOUT_EXIT_CODE,
                output: format!("command timed out after {}s", config.timeout.as_secs()),
            });
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let exit_code = exit_code(&output.status);
    debug!(exit_code, output_len = text.len(), "Command finished");

    Ok(CommandResult {
        exit_code,
        output: text,
    })
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(target_os = "linux")]
fn kill_process_group(leader: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(leader) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(leader, error = %e, "killpg failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_process_group(_leader: u32) {}

/// SIGKILL every process whose environment names `sandbox_root` in
/// [`SANDBOX_ROOT_ENV`]. Returns how many were signalled.
#[cfg(target_os = "linux")]
pub fn terminate_sandbox_processes(sandbox_root: &Path) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::os::unix::ffi::OsStrExt;

    let mut tag = format!("{SANDBOX_ROOT_ENV}=").into_bytes();
    tag.extend_from_slice(sandbox_root.as_os_str().as_bytes());

    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    let own = std::process::id();
    let mut killed = 0;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own {
            continue;
        }
        // Unreadable for processes of other users or ones that already exited.
        let Ok(environ) = fs::read(entry.path().join("environ")) else {
            continue;
        };
        if !environ.split(|b| *b == 0).any(|var| var == tag.as_slice()) {
            continue;
        }
        let Ok(raw) = i32::try_from(pid) else {
            continue;
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => killed += 1,
            Err(e) => debug!(pid, error = %e, "kill failed"),
        }
    }
    killed
}

#[cfg(not(target_os = "linux"))]
pub fn terminate_sandbox_processes(_sandbox_root: &Path) -> usize {
    0
}

#[cfg(target_os = "linux")]
fn apply_limits(command: &mut Command, limits: Limits) {
    // SAFETY: the closure only calls getrlimit/setrlimit, which are
    // async-signal-safe.
    unsafe {
        command.pre_exec(move || set_resource_limits(limits));
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_limits(_command: &mut Command, _limits: Limits) {}

/// Lower (never raise) the child's limits so an unprivileged service works.
#[cfg(target_os = "linux")]
fn set_resource_limits(limits: Limits) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let lower = |resource: Resource, value: u64| -> std::io::Result<()> {
        let (soft, hard) = getrlimit(resource).map_err(std::io::Error::from)?;
        let target = value.min(hard);
        if target < soft || hard != target {
            setrlimit(resource, target, target).map_err(std::io::Error::from)?;
        }
        Ok(())
    };

    lower(Resource::RLIMIT_NOFILE, limits.nofile)?;
    lower(Resource::RLIMIT_FSIZE, limits.fsize_kb.saturating_mul(1024))?;
    lower(Resource::RLIMIT_CORE, 0)?;
    Ok(())
}

fn working_dir(sandbox_root: &Path, cwd: Option<&str>) -> Result<PathBuf, String> {
    let dir = match cwd {
        None | Some("") | Some("~") => sandbox_root.to_path_buf(),
        Some(path) => match path.strip_prefix("~/") {
            Some(rest) => sandbox_root.join(rest),
            None if Path::new(path).is_absolute() => PathBuf::from(path),
            None => sandbox_root.join(path),
        },
    };
    if !dir.is_dir() {
        return Err(format!("working directory {} does not exist", dir.display()));
    }
    Ok(dir)
}

/// Map a file API path onto the sandbox directory, rejecting escapes.
pub fn resolve_in_sandbox(sandbox_root: &Path, path: &str) -> Result<PathBuf, String> {
    let relative = if let Some(rest) = path.strip_prefix("~/") {
        PathBuf::from(rest)
    } else if Path::new(path).is_absolute() {
        Path::new(path)
            .strip_prefix(sandbox_root)
            .map(Path::to_path_buf)
            .map_err(|_| format!("path {} is outside the sandbox", path))?
    } else {
        PathBuf::from(path)
    };

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(format!("path {} is outside the sandbox", path)),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err("path names the sandbox root".to_string());
    }
    Ok(sandbox_root.join(clean))
}

/// Write a file directly into the sandbox filesystem.
pub fn write_file_in_sandbox(
    sandbox_root: &Path,
    path: &str,
    content: &[u8],
) -> Result<(), String> {
    let full_path = resolve_in_sandbox(sandbox_root, path)?;

    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("mkdir parent: {}", e))?;
    }

    fs::write(&full_path, content).map_err(|e| format!("write file: {}", e))?;
    info!(path = ?full_path, bytes = content.len(), "Wrote file");
    Ok(())
}

/// Read a file directly from the sandbox filesystem.
pub fn read_file_in_sandbox(sandbox_root: &Path, path: &str) -> Result<Vec<u8>, String> {
    let full_path = resolve_in_sandbox(sandbox_root, path)?;
    fs::read(&full_path).map_err(|e| format!("read file: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> RunConfig {
        RunConfig {
            command: command.to_string(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(10),
            limits: Limits::default(),
        }
    }

    #[test]
    fn resolve_confines_paths() {
        let root = Path::new("/srv/sandboxes/abc");
        assert_eq!(
            resolve_in_sandbox(root, "~/app/index.js").unwrap(),
            root.join("app/index.js")
        );
        assert_eq!(
            resolve_in_sandbox(root, "/srv/sandboxes/abc/proxy.js").unwrap(),
            root.join("proxy.js")
        );
        assert_eq!(resolve_in_sandbox(root, "./a/b").unwrap(), root.join("a/b"));
        assert!(resolve_in_sandbox(root, "/etc/passwd").is_err());
        assert!(resolve_in_sandbox(root, "../other/x").is_err());
        assert!(resolve_in_sandbox(root, "~/").is_err());
    }

    #[test]
    fn file_round_trip_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        write_file_in_sandbox(&root, "~/pages/api/health.js", b"export default 1;").unwrap();
        let read = read_file_in_sandbox(&root, "pages/api/health.js").unwrap();
        assert_eq!(read, b"export default 1;");
        destroy_sandbox(&root);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn runs_in_home_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();

        let home = run_in_sandbox(&root, &config("printf %s \"$HOME\"; pwd >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(home.exit_code, 3);
        let expected = root.display().to_string();
        assert!(home.output.starts_with(&expected));
        assert!(home.output.ends_with(&format!("{expected}\n")));
    }

    #[tokio::test]
    async fn timeout_yields_conventional_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        let mut slow = config("sleep 5");
        slow.timeout = Duration::from_millis(100);
        let result = run_in_sandbox(&root, &slow).await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn missing_cwd_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        let mut cmd = config("true");
        cmd.cwd = Some("~/missing".to_string());
        assert!(run_in_sandbox(&root, &cmd).await.is_err());
    }

    /// True while `pid` exists and is not a zombie.
    #[cfg(target_os = "linux")]
    fn alive(pid: u32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn commands_carry_the_sandbox_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        let mut cmd = config("printf %s \"$SANDBOXCTL_SANDBOX_ROOT\"");
        cmd.env.insert(SANDBOX_ROOT_ENV.to_string(), "/elsewhere".to_string());
        let result = run_in_sandbox(&root, &cmd).await.unwrap();
        assert_eq!(result.output, root.display().to_string());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn destroy_kills_detached_processes() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        let other = create_sandbox_dir(dir.path(), "other").unwrap();

        let launch = "nohup sleep 600 > /dev/null 2>&1 < /dev/null & echo $!";
        let mine = run_in_sandbox(&root, &config(launch)).await.unwrap();
        let theirs = run_in_sandbox(&other, &config(launch)).await.unwrap();
        let mine: u32 = mine.output.trim().parse().unwrap();
        let theirs: u32 = theirs.output.trim().parse().unwrap();
        assert!(alive(mine) && alive(theirs));

        destroy_sandbox(&root);
        assert!(wait_until_gone(mine).await);
        assert!(alive(theirs));

        destroy_sandbox(&other);
        assert!(wait_until_gone(theirs).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = create_sandbox_dir(dir.path(), "sbx").unwrap();
        let mut slow = config("sleep 600 & echo $! > child.pid; wait");
        slow.timeout = Duration::from_millis(300);
        let result = run_in_sandbox(&root, &slow).await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);

        let child: u32 = fs::read_to_string(root.join("child.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(child).await);
    }
}
