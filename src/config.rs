//! Operator configuration: sandbox coordinates and playbooks.
//!
//! A playbook is a TOML document describing one pass of the
//! inspect / mutate / restart / verify workflow. Page markup and server code
//! are referenced as local files relative to the playbook, never inlined in
//! code.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Address of the local sandbox service started by `sandboxctl serve`.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_VERIFY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOG_TAIL_LINES: usize = 20;

/// API key for the sandbox service. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Credential from a flag or environment value. Surrounding whitespace is
    /// dropped and a blank value means no credential.
    pub fn from_input(value: Option<String>) -> Option<Self> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Self)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Everything needed to open a session handle.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub api_key: Option<Credential>,
    pub sandbox_id: String,
    pub exec_timeout: Duration,
}

impl Settings {
    /// Merge command-line/env values over the playbook's `[sandbox]` table.
    pub fn resolve(
        api_url: Option<String>,
        api_key: Option<String>,
        sandbox_id: Option<String>,
        file: Option<&SandboxSection>,
    ) -> Result<Self> {
        let api_url = api_url
            .or_else(|| file.and_then(|s| s.api_url.clone()))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        url::Url::parse(&api_url)
            .map_err(|err| Error::Config(format!("invalid API URL '{api_url}': {err}")))?;

        let sandbox_id = sandbox_id
            .or_else(|| file.and_then(|s| s.id.clone()))
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::Config("no sandbox id: pass --sandbox or set SANDBOX_ID".to_string())
            })?;

        let api_key = Credential::from_input(api_key);

        let exec_timeout = file
            .and_then(|s| s.exec_timeout_secs)
            .unwrap_or(crate::api::DEFAULT_EXEC_TIMEOUT_SECS);

        Ok(Self {
            api_url,
            api_key,
            sandbox_id,
            exec_timeout: Duration::from_secs(exec_timeout),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    pub id: Option<String>,
    pub api_url: Option<String>,
    pub exec_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxSection,
    /// Read-only commands whose output is printed.
    #[serde(default)]
    pub inspect: Vec<CommandSpec>,
    /// Process patterns to terminate before anything is written.
    #[serde(default)]
    pub kill: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    /// Mutating shell commands run after the files are written.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Paths that must exist once the run has finished.
    #[serde(default)]
    pub expect_files: Vec<String>,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
    #[serde(default)]
    pub verify: VerifySettings,
    /// Ports whose preview links are printed at the end.
    #[serde(default)]
    pub preview_ports: Vec<u16>,

    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.command)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Use the service's file API.
    #[default]
    Upload,
    /// Stream the content through `cat <<'EOF'` in a shell command.
    Heredoc,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    /// Destination inside the sandbox. A directory when `source_dir` is set.
    pub path: String,
    /// Local file, relative to the playbook.
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
    /// Local directory whose files are copied under `path`, keeping their
    /// relative layout.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Only copy files with these extensions from `source_dir`, e.g.
    /// `["ts", "tsx"]`. Empty copies everything.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Defaults to `~/<name>.log`.
    #[serde(default)]
    pub log: Option<String>,
    /// Substring used to find and kill the running instance; defaults to the
    /// command itself.
    #[serde(default)]
    pub kill_pattern: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_cwd() -> String {
    "~".to_string()
}

impl ServiceSpec {
    pub fn log_path(&self) -> String {
        self.log
            .clone()
            .unwrap_or_else(|| format!("~/{}.log", self.name))
    }

    pub fn pattern(&self) -> &str {
        self.kill_pattern.as_deref().unwrap_or(&self.command)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSpec {
    pub name: String,
    /// URL as seen from inside the sandbox, e.g. `http://localhost:3001/health`.
    pub url: String,
    #[serde(default)]
    pub expect_status: Option<u16>,
    #[serde(default)]
    pub expect_body: Option<String>,
    /// Log file tailed when the probe fails.
    #[serde(default)]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySettings {
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_verify_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_verify_timeout() -> u64 {
    DEFAULT_VERIFY_TIMEOUT_SECS
}

fn default_verify_interval() -> u64 {
    DEFAULT_VERIFY_INTERVAL_MS
}

fn default_tail_lines() -> usize {
    DEFAULT_LOG_TAIL_LINES
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_VERIFY_TIMEOUT_SECS,
            interval_ms: DEFAULT_VERIFY_INTERVAL_MS,
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
        }
    }
}

impl VerifySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Playbook {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("cannot read playbook {}: {err}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, base_dir)
    }

    pub fn parse(text: &str, base_dir: PathBuf) -> Result<Self> {
        let mut playbook: Playbook = toml::from_str(text)?;
        playbook.base_dir = base_dir;
        playbook.validate()?;
        Ok(playbook)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("playbook")
    }

    fn validate(&self) -> Result<()> {
        for file in &self.files {
            let sources = [
                file.source.is_some(),
                file.content.is_some(),
                file.source_dir.is_some(),
            ];
            match sources.iter().filter(|set| **set).count() {
                0 => {
                    return Err(Error::Config(format!(
                        "file '{}' needs a source, source_dir or content",
                        file.path
                    )))
                }
                1 => {}
                _ => {
                    return Err(Error::Config(format!(
                        "file '{}' sets more than one of source, source_dir and content",
                        file.path
                    )))
                }
            }
            if !file.extensions.is_empty() && file.source_dir.is_none() {
                return Err(Error::Config(format!(
                    "file '{}' sets extensions without source_dir",
                    file.path
                )));
            }
        }
        for service in &self.services {
            if service.pattern().trim().is_empty() {
                return Err(Error::Config(format!(
                    "service '{}' has an empty kill pattern",
                    service.name
                )));
            }
            if let Some(key) = service.env.keys().find(|key| !is_env_key(key)) {
                return Err(Error::Config(format!(
                    "service '{}' has invalid environment variable name '{key}'",
                    service.name
                )));
            }
        }
        if let Some(pattern) = self.kill.iter().find(|p| p.trim().is_empty()) {
            return Err(Error::Config(format!("empty kill pattern {pattern:?}")));
        }
        Ok(())
    }

    /// Content for a file entry, reading `source` relative to the playbook.
    pub fn file_content(&self, file: &FileSpec) -> Result<Vec<u8>> {
        if let Some(content) = &file.content {
            return Ok(content.clone().into_bytes());
        }
        let source = file
            .source
            .as_ref()
            .ok_or_else(|| Error::Config(format!("file '{}' has no content", file.path)))?;
        let full = self.local_path(source);
        std::fs::read(&full).map_err(|err| {
            Error::Config(format!("cannot read {}: {err}", full.display()))
        })
    }

    /// Expand a file entry into single-file entries. A `source_dir` entry
    /// becomes one entry per matching file, sorted by path; other entries are
    /// returned unchanged.
    pub fn expand_file(&self, file: &FileSpec) -> Result<Vec<FileSpec>> {
        let Some(dir) = &file.source_dir else {
            return Ok(vec![file.clone()]);
        };
        let dir = self.local_path(dir);
        let mut sources = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.map_err(|err| {
                Error::Config(format!("cannot walk {}: {err}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if file.extensions.is_empty() || has_extension(&path, &file.extensions) {
                sources.push(path);
            }
        }
        sources.sort();
        if sources.is_empty() {
            return Err(Error::Config(format!(
                "no matching files in {}",
                dir.display()
            )));
        }

        let base = file.path.trim_end_matches('/');
        sources
            .into_iter()
            .map(|source| {
                let relative = source.strip_prefix(&dir).map_err(|_| {
                    Error::Config(format!("{} is outside {}", source.display(), dir.display()))
                })?;
                let relative: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                Ok(FileSpec {
                    path: format!("{base}/{}", relative.join("/")),
                    source: Some(source),
                    content: None,
                    source_dir: None,
                    extensions: Vec::new(),
                    mode: file.mode,
                })
            })
            .collect()
    }

    fn local_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn has_extension(path: &Path, wanted: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    wanted
        .iter()
        .any(|w| w.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYBOOK: &str = r#"
name = "final-working-fix"
kill = ["node", "next"]

[sandbox]
id = "ca32d930"

[[inspect]]
label = "home"
command = "ls -la ~/"

[[files]]
path = "~/vitalmatrix-final-proxy.js"
content = "console.log('proxy');\n"

[[services]]
name = "proxy"
command = "node vitalmatrix-final-proxy.js"
env = { PORT = "3001" }
port = 3001

[[probes]]
name = "proxy health"
url = "http://localhost:3001/health"
expect_body = "healthy"
log = "~/proxy.log"

[verify]
timeout_secs = 25
"#;

    #[test]
    fn parses_full_playbook() {
        let playbook = Playbook::parse(PLAYBOOK, PathBuf::from(".")).unwrap();
        assert_eq!(playbook.display_name(), "final-working-fix");
        assert_eq!(playbook.kill, vec!["node", "next"]);
        assert_eq!(playbook.inspect[0].display_label(), "home");
        assert_eq!(playbook.files[0].mode, WriteMode::Upload);
        let service = &playbook.services[0];
        assert_eq!(service.cwd, "~");
        assert_eq!(service.log_path(), "~/proxy.log");
        assert_eq!(service.pattern(), "node vitalmatrix-final-proxy.js");
        assert_eq!(playbook.verify.timeout(), Duration::from_secs(25));
        assert_eq!(playbook.verify.log_tail_lines, DEFAULT_LOG_TAIL_LINES);
    }

    #[test]
    fn rejects_file_without_content() {
        let text = "[[files]]\npath = \"/tmp/x\"\n";
        let err = Playbook::parse(text, PathBuf::from(".")).unwrap_err();
        assert!(err.to_string().contains("needs a source, source_dir or content"));
    }

    #[test]
    fn rejects_bad_env_key() {
        let text = "[[services]]\nname = \"a\"\ncommand = \"x\"\nenv = { \"1BAD\" = \"v\" }\n";
        assert!(Playbook::parse(text, PathBuf::from(".")).is_err());
    }

    #[test]
    fn reads_source_relative_to_playbook() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.js"), "export default 1;\n").unwrap();
        let text = "[[files]]\npath = \"~/app/index.js\"\nsource = \"index.js\"\nmode = \"heredoc\"\n";
        let playbook = Playbook::parse(text, dir.path().to_path_buf()).unwrap();
        let file = &playbook.files[0];
        assert_eq!(file.mode, WriteMode::Heredoc);
        assert_eq!(playbook.file_content(file).unwrap(), b"export default 1;\n");
    }

    #[test]
    fn source_dir_expands_to_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("local/src/services");
        std::fs::create_dir_all(services.join("firebase")).unwrap();
        std::fs::write(services.join("pulse.ts"), "export const a = 1;\n").unwrap();
        std::fs::write(services.join("Feed.TSX"), "<Feed />\n").unwrap();
        std::fs::write(services.join("firebase/config.ts"), "export {};\n").unwrap();
        std::fs::write(services.join("notes.md"), "skip me\n").unwrap();

        let text = r#"
[[files]]
path = "~/vitalmatrix/src/services/"
source_dir = "local/src/services"
extensions = ["ts", ".tsx"]
mode = "heredoc"
"#;
        let playbook = Playbook::parse(text, dir.path().to_path_buf()).unwrap();
        let expanded = playbook.expand_file(&playbook.files[0]).unwrap();
        let paths: Vec<&str> = expanded.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "~/vitalmatrix/src/services/Feed.TSX",
                "~/vitalmatrix/src/services/firebase/config.ts",
                "~/vitalmatrix/src/services/pulse.ts",
            ]
        );
        assert!(expanded.iter().all(|f| f.mode == WriteMode::Heredoc));
        assert_eq!(
            playbook.file_content(&expanded[2]).unwrap(),
            b"export const a = 1;\n"
        );
    }

    #[test]
    fn source_dir_without_matches_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), "x").unwrap();
        let text = "[[files]]\npath = \"~/src\"\nsource_dir = \".\"\nextensions = [\"ts\"]\n";
        let playbook = Playbook::parse(text, dir.path().to_path_buf()).unwrap();
        assert!(playbook.expand_file(&playbook.files[0]).is_err());
    }

    #[test]
    fn extensions_need_source_dir() {
        let text = "[[files]]\npath = \"~/a.ts\"\ncontent = \"x\"\nextensions = [\"ts\"]\n";
        assert!(Playbook::parse(text, PathBuf::from(".")).is_err());
    }

    #[test]
    fn blank_credentials_are_dropped_and_trimmed() {
        assert!(Credential::from_input(None).is_none());
        assert!(Credential::from_input(Some("   ".to_string())).is_none());
        let key = Credential::from_input(Some("  s3cret\n".to_string())).unwrap();
        assert_eq!(key.expose(), "s3cret");
    }

    #[test]
    fn settings_prefer_cli_over_file() {
        let file = SandboxSection {
            id: Some("from-file".to_string()),
            api_url: Some("https://sandbox.example".to_string()),
            exec_timeout_secs: Some(30),
        };
        let settings = Settings::resolve(
            None,
            Some("  secret ".to_string()),
            Some("from-cli".to_string()),
            Some(&file),
        )
        .unwrap();
        assert_eq!(settings.sandbox_id, "from-cli");
        assert_eq!(settings.api_url, "https://sandbox.example");
        assert_eq!(settings.exec_timeout, Duration::from_secs(30));
        assert_eq!(settings.api_key.as_ref().unwrap().expose(), "secret");
        assert_eq!(format!("{:?}", settings.api_key), "Some(Credential(***))");
    }

    #[test]
    fn settings_require_sandbox_id() {
        let err = Settings::resolve(None, None, None, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
