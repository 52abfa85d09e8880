//! Builders for the POSIX shell commands sent into a sandbox.
//!
//! Everything here is pure string construction so it can be unit tested
//! without a sandbox. Paths starting with `~/` keep the tilde unquoted so the
//! remote shell expands it.

use std::collections::BTreeMap;

const HEREDOC_DELIMITER: &str = "SANDBOXCTL_EOF";

const REGEX_META: &[char] = &[
    '.', '[', ']', '(', ')', '*', '+', '?', '{', '}', '|', '^', '$', '\\',
];

/// Quote a string for POSIX sh using single quotes.
pub fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Quote a path, leaving a leading `~` expandable.
pub fn quote_path(path: &str) -> String {
    if path == "~" {
        return "~".to_string();
    }
    match path.strip_prefix("~/") {
        Some("") => "~/".to_string(),
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

/// Turn a literal process pattern into an extended regex that matches the
/// same text but not the shell command carrying it: `node` becomes `[n]ode`,
/// `./server.sh` becomes `[.]/server\.sh`.
///
/// Regex metacharacters are escaped, so patterns are matched as substrings.
pub fn self_safe_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut bracketed = false;
    for c in pattern.chars() {
        if !bracketed && !matches!(c, '[' | ']' | '^' | '\\') {
            out.push('[');
            out.push(c);
            out.push(']');
            bracketed = true;
        } else if REGEX_META.contains(&c) {
            out.push('\\');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

/// Write `content` to `path` through a quoted heredoc.
///
/// The output is byte-identical to `content`: the heredoc always ends with a
/// newline, so the stream is cut back to the content length with `head -c`.
pub fn heredoc_write(path: &str, content: &str) -> String {
    let delimiter = heredoc_delimiter(content);
    let quoted = quote_path(path);
    let mut body = content.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!(
        "mkdir -p \"$(dirname {quoted})\" && head -c {len} > {quoted} <<'{delimiter}'\n{body}{delimiter}",
        len = content.len(),
    )
}

fn heredoc_delimiter(content: &str) -> String {
    let mut candidate = HEREDOC_DELIMITER.to_string();
    let mut suffix = 0;
    while content.lines().any(|line| line == candidate) {
        suffix += 1;
        candidate = format!("{HEREDOC_DELIMITER}_{suffix}");
    }
    candidate
}

/// Kill every process whose command line matches `pattern`.
///
/// `pkill` exits 1 when nothing matched; that is folded into success so
/// running the same kill twice is a no-op rather than a failure.
pub fn kill_by_pattern(pattern: &str) -> String {
    let safe = shell_quote(&self_safe_pattern(pattern));
    format!("pkill -9 -f {safe}; [ $? -le 1 ]")
}

/// List live (non-zombie) processes whose command line matches `pattern`.
/// Exits 1 when none.
pub fn list_matching(pattern: &str) -> String {
    let safe = shell_quote(&self_safe_pattern(pattern));
    format!("ps -eo pid,stat,args | awk '$2 !~ /^Z/' | grep -E {safe}")
}

/// Start `command` detached from the calling shell. Output goes to `log` and
/// the pid is echoed.
pub fn launch_detached(
    command: &str,
    cwd: &str,
    env: &BTreeMap<String, String>,
    log: &str,
) -> String {
    let log = quote_path(log);
    let env_prefix: String = env
        .iter()
        .map(|(key, value)| format!("{key}={} ", shell_quote(value)))
        .collect();
    let env_prefix = if env_prefix.is_empty() {
        String::new()
    } else {
        format!("env {env_prefix}")
    };
    format!(
        "mkdir -p \"$(dirname {log})\" && cd {cwd} || exit 1; \
nohup {env_prefix}sh -c {command} > {log} 2>&1 < /dev/null & echo $!",
        cwd = quote_path(cwd),
        command = shell_quote(command),
    )
}

pub fn tail_log(path: &str, lines: usize) -> String {
    format!("tail -n {lines} {} 2>&1", quote_path(path))
}

pub fn path_exists(path: &str) -> String {
    format!("test -e {}", quote_path(path))
}

/// Listening TCP sockets, filtered to `ports` when any are given.
pub fn listening_ports(ports: &[u16]) -> String {
    let listing = "(ss -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null)";
    if ports.is_empty() {
        return listing.to_string();
    }
    let alternatives = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join("|");
    format!("{listing} | grep -E ':({alternatives})[[:space:]]'")
}

/// Fetch `url` with curl, printing the body followed by a line holding the
/// HTTP status code (`000` when no response arrived).
pub fn http_probe(url: &str, max_time_secs: u64) -> String {
    format!(
        "curl -s -m {max_time_secs} -w '\\n%{{http_code}}' {}",
        shell_quote(url)
    )
}

/// Prints the remote home directory without a trailing newline.
pub const REMOTE_HOME: &str = "printf %s \"$HOME\"";

/// Body and status parsed from the output of [`http_probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    /// 0 when the server never answered.
    pub status: u16,
    pub body: String,
}

pub fn parse_probe_output(output: &str) -> ProbeResponse {
    let trimmed = output.trim_end_matches(['\r', '\n']);
    let (body, code) = match trimmed.rsplit_once('\n') {
        Some((body, code)) => (body, code),
        None => ("", trimmed),
    };
    ProbeResponse {
        status: code.trim().parse().unwrap_or(0),
        body: body.to_string(),
    }
}
