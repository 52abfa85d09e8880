//! The inspect / mutate / restart / verify loop driven by a playbook.
//!
//! Steps run strictly in order against one session handle. A failing step is
//! recorded and the run continues; nothing is rolled back. Only expected
//! files and probes decide whether the run as a whole verified.

use crate::client::{resolve_path, ExecOptions, Sandbox};
use crate::config::{CommandSpec, FileSpec, Playbook, ProbeSpec, ServiceSpec, WriteMode};
use crate::shell;
use crate::verify::{self, PollOutcome};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, warn};

/// How long a kill is given to take effect before it counts as failed.
const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(3);
const KILL_SETTLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Inspect,
    Kill,
    Write,
    Command,
    Launch,
    ExpectFile,
    Probe,
    Ports,
    Preview,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Inspect => "inspect",
            Step::Kill => "kill",
            Step::Write => "write",
            Step::Command => "command",
            Step::Launch => "launch",
            Step::ExpectFile => "file",
            Step::Probe => "probe",
            Step::Ports => "ports",
            Step::Preview => "preview",
        }
    }

    /// Whether a failure of this step fails verification.
    pub fn is_verification(&self) -> bool {
        matches!(self, Step::ExpectFile | Step::Probe)
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: Step,
    pub label: String,
    pub passed: bool,
    /// Captured output or failure reason.
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after launching services.
    pub skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub playbook: String,
    pub sandbox: String,
    pub outcomes: Vec<StepOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    /// True when every expected file and probe passed.
    pub fn verified(&self) -> bool {
        self.outcomes
            .iter()
            .filter(|o| o.step.is_verification())
            .all(|o| o.passed)
    }

    /// Human-readable report for the operator's terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== {} on sandbox {} ==", self.playbook, self.sandbox);
        for outcome in &self.outcomes {
            let mark = if outcome.passed { "ok" } else { "FAIL" };
            let _ = writeln!(
                out,
                "[{mark:>4}] {:<8} {}",
                outcome.step.as_str(),
                outcome.label
            );
            for line in outcome.detail.lines() {
                let _ = writeln!(out, "         {line}");
            }
        }
        let failed = self.failures().count();
        let _ = writeln!(
            out,
            "summary: {} passed, {failed} failed; verification {}",
            self.outcomes.len() - failed,
            if self.verified() { "passed" } else { "FAILED" }
        );
        out
    }
}

/// Run every step of `playbook` against `sandbox`.
pub async fn run(sandbox: &dyn Sandbox, playbook: &Playbook, options: &RunOptions) -> RunReport {
    let mut runner = Runner {
        sandbox,
        playbook,
        outcomes: Vec::new(),
    };
    info!(playbook = playbook.display_name(), sandbox = sandbox.id(), "starting run");

    for spec in &playbook.inspect {
        runner.command(Step::Inspect, spec).await;
    }
    for pattern in &playbook.kill {
        runner.kill(pattern).await;
    }
    for file in &playbook.files {
        runner.write_entry(file).await;
    }
    for spec in &playbook.commands {
        runner.command(Step::Command, spec).await;
    }
    for service in &playbook.services {
        runner.kill(service.pattern()).await;
        runner.launch(service).await;
    }

    if !options.skip_verify {
        for path in &playbook.expect_files {
            runner.expect_file(path).await;
        }
        for probe in &playbook.probes {
            runner.probe(probe).await;
        }
        let ports = declared_ports(playbook);
        if !ports.is_empty() {
            runner.ports(&ports).await;
        }
    }

    for port in preview_ports(playbook) {
        runner.preview(port).await;
    }

    let report = RunReport {
        playbook: playbook.display_name().to_string(),
        sandbox: sandbox.id().to_string(),
        outcomes: runner.outcomes,
    };
    info!(
        failed = report.failures().count(),
        verified = report.verified(),
        "run finished"
    );
    report
}

fn declared_ports(playbook: &Playbook) -> Vec<u16> {
    let mut ports: Vec<u16> = playbook.services.iter().filter_map(|s| s.port).collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn preview_ports(playbook: &Playbook) -> Vec<u16> {
    let mut ports = playbook.preview_ports.clone();
    ports.sort_unstable();
    ports.dedup();
    ports
}

struct Runner<'a> {
    sandbox: &'a dyn Sandbox,
    playbook: &'a Playbook,
    outcomes: Vec<StepOutcome>,
}

impl Runner<'_> {
    fn record(&mut self, step: Step, label: impl Into<String>, passed: bool, detail: String) {
        let label = label.into();
        if passed {
            info!(step = step.as_str(), %label, "step passed");
        } else {
            warn!(step = step.as_str(), %label, %detail, "step failed");
        }
        self.outcomes.push(StepOutcome {
            step,
            label,
            passed,
            detail,
        });
    }

    async fn command(&mut self, step: Step, spec: &CommandSpec) {
        let options = ExecOptions {
            cwd: spec.cwd.clone(),
            timeout: spec.timeout_secs.map(Duration::from_secs),
            ..ExecOptions::default()
        };
        match self.sandbox.exec(&spec.command, &options).await {
            Ok(result) if result.success() => {
                self.record(step, spec.display_label(), true, result.output)
            }
            Ok(result) => self.record(
                step,
                spec.display_label(),
                false,
                format!("exit {}\n{}", result.exit_code, result.output),
            ),
            Err(err) => self.record(step, spec.display_label(), false, err.to_string()),
        }
    }

    async fn kill(&mut self, pattern: &str) {
        let options = ExecOptions::default();
        let killed = self
            .sandbox
            .exec(&shell::kill_by_pattern(pattern), &options)
            .await;
        match killed {
            Ok(result) if result.success() => {}
            Ok(result) => {
                return self.record(
                    Step::Kill,
                    pattern,
                    false,
                    format!("pkill exit {}\n{}", result.exit_code, result.output),
                )
            }
            Err(err) => return self.record(Step::Kill, pattern, false, err.to_string()),
        }

        let sandbox = self.sandbox;
        let listing = shell::list_matching(pattern);
        let settled = verify::poll_until(KILL_SETTLE_TIMEOUT, KILL_SETTLE_INTERVAL, || {
            let listing = listing.clone();
            let options = options.clone();
            async move {
                match sandbox.exec(&listing, &options).await {
                    Ok(result) if result.success() => Err(result.output),
                    Ok(_) => Ok(()),
                    Err(err) => Err(err.to_string()),
                }
            }
        })
        .await;
        match settled {
            PollOutcome::Ready { .. } => self.record(Step::Kill, pattern, true, String::new()),
            PollOutcome::GaveUp { last_error, .. } => self.record(
                Step::Kill,
                pattern,
                false,
                format!("still running:\n{last_error}"),
            ),
        }
    }

    async fn write_entry(&mut self, entry: &FileSpec) {
        match self.playbook.expand_file(entry) {
            Ok(files) => {
                for file in &files {
                    self.write(file).await;
                }
            }
            Err(err) => self.record(Step::Write, &entry.path, false, err.to_string()),
        }
    }

    async fn write(&mut self, file: &FileSpec) {
        let content = match self.playbook.file_content(file) {
            Ok(content) => content,
            Err(err) => return self.record(Step::Write, &file.path, false, err.to_string()),
        };
        let len = content.len();
        let written = match file.mode {
            WriteMode::Upload => self.upload(&file.path, &content).await,
            WriteMode::Heredoc => self.heredoc(&file.path, content).await,
        };
        match written {
            Ok(()) => self.record(Step::Write, &file.path, true, format!("{len} bytes")),
            Err(reason) => self.record(Step::Write, &file.path, false, reason),
        }
    }

    async fn upload(&self, path: &str, content: &[u8]) -> Result<(), String> {
        let resolved = resolve_path(self.sandbox, path)
            .await
            .map_err(|err| err.to_string())?;
        self.sandbox
            .write_file(&resolved, content)
            .await
            .map_err(|err| err.to_string())
    }

    async fn heredoc(&self, path: &str, content: Vec<u8>) -> Result<(), String> {
        let text = String::from_utf8(content)
            .map_err(|_| "binary content needs mode = \"upload\"".to_string())?;
        let result = self
            .sandbox
            .exec(&shell::heredoc_write(path, &text), &ExecOptions::default())
            .await
            .map_err(|err| err.to_string())?;
        if result.success() {
            Ok(())
        } else {
            Err(format!("exit {}\n{}", result.exit_code, result.output))
        }
    }

    async fn launch(&mut self, service: &ServiceSpec) {
        let command = shell::launch_detached(
            &service.command,
            &service.cwd,
            &service.env,
            &service.log_path(),
        );
        match self.sandbox.exec(&command, &ExecOptions::default()).await {
            Ok(result) if result.success() => self.record(
                Step::Launch,
                &service.name,
                true,
                format!("pid {} logging to {}", result.output.trim(), service.log_path()),
            ),
            Ok(result) => self.record(
                Step::Launch,
                &service.name,
                false,
                format!("exit {}\n{}", result.exit_code, result.output),
            ),
            Err(err) => self.record(Step::Launch, &service.name, false, err.to_string()),
        }
    }

    async fn expect_file(&mut self, path: &str) {
        match self
            .sandbox
            .exec(&shell::path_exists(path), &ExecOptions::default())
            .await
        {
            Ok(result) if result.success() => {
                self.record(Step::ExpectFile, path, true, "exists".to_string())
            }
            Ok(_) => self.record(Step::ExpectFile, path, false, "missing".to_string()),
            Err(err) => self.record(Step::ExpectFile, path, false, err.to_string()),
        }
    }

    async fn probe(&mut self, probe: &ProbeSpec) {
        let timeout = self.playbook.verify.timeout();
        let interval = self.playbook.verify.interval();
        let sandbox = self.sandbox;
        let outcome =
            verify::poll_until(timeout, interval, || verify::probe_once(sandbox, probe)).await;
        match outcome {
            PollOutcome::Ready {
                value,
                attempts,
                elapsed,
            } => self.record(
                Step::Probe,
                &probe.name,
                true,
                format!(
                    "HTTP {} after {attempts} attempt(s) in {:.1}s",
                    value.status,
                    elapsed.as_secs_f64()
                ),
            ),
            PollOutcome::GaveUp {
                last_error,
                attempts,
                elapsed,
            } => {
                let mut detail = format!(
                    "{last_error} (gave up after {attempts} attempt(s) in {:.1}s)",
                    elapsed.as_secs_f64()
                );
                if let Some(log) = &probe.log {
                    detail.push_str(&self.log_tail(log).await);
                }
                self.record(Step::Probe, &probe.name, false, detail)
            }
        }
    }

    async fn log_tail(&self, log: &str) -> String {
        let lines = self.playbook.verify.log_tail_lines;
        match self
            .sandbox
            .exec(&shell::tail_log(log, lines), &ExecOptions::default())
            .await
        {
            Ok(result) => format!("\n--- last {lines} lines of {log} ---\n{}", result.output),
            Err(err) => format!("\n(could not read {log}: {err})"),
        }
    }

    async fn ports(&mut self, ports: &[u16]) {
        let label = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        match self
            .sandbox
            .exec(&shell::listening_ports(ports), &ExecOptions::default())
            .await
        {
            Ok(result) if result.success() => self.record(Step::Ports, label, true, result.output),
            Ok(_) => self.record(Step::Ports, label, false, "no listeners found".to_string()),
            Err(err) => self.record(Step::Ports, label, false, err.to_string()),
        }
    }

    async fn preview(&mut self, port: u16) {
        match self.sandbox.preview_url(port).await {
            Ok(url) => self.record(Step::Preview, port.to_string(), true, url),
            Err(err) => self.record(Step::Preview, port.to_string(), false, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CommandResult;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory sandbox answering commands by prefix.
    #[derive(Default)]
    struct FakeSandbox {
        commands: Mutex<Vec<String>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        responses: Vec<(&'static str, i32, &'static str)>,
    }

    impl FakeSandbox {
        fn with(responses: Vec<(&'static str, i32, &'static str)>) -> Self {
            Self {
                responses,
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            "fake"
        }

        async fn exec(&self, command: &str, _options: &ExecOptions) -> Result<CommandResult> {
            self.commands.lock().unwrap().push(command.to_string());
            let (exit_code, output) = self
                .responses
                .iter()
                .find(|(prefix, _, _)| command.starts_with(prefix))
                .map(|(_, code, out)| (*code, out.to_string()))
                .unwrap_or((0, String::new()));
            Ok(CommandResult { exit_code, output })
        }

        async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::NotFound(path.to_string()))
        }

        async fn preview_url(&self, port: u16) -> Result<String> {
            Ok(format!("https://{port}-fake.preview.example"))
        }
    }

    fn playbook(text: &str) -> Playbook {
        Playbook::parse(text, PathBuf::from(".")).unwrap()
    }

    const DEPLOY: &str = r#"
name = "proxy-fix"
kill = ["node"]
expect_files = ["~/app/pages/index.js"]
preview_ports = [3001]

[[inspect]]
label = "home"
command = "ls -la ~/"

[[files]]
path = "~/proxy.js"
content = "require('express');\n"

[[services]]
name = "proxy"
command = "node proxy.js"
port = 3001

[[probes]]
name = "proxy health"
url = "http://localhost:3001/health"
expect_body = "healthy"
log = "~/proxy.log"

[verify]
timeout_secs = 1
interval_ms = 10
"#;

    #[tokio::test]
    async fn healthy_run_verifies() {
        let sandbox = FakeSandbox::with(vec![
            ("printf %s", 0, "/home/daytona"),
            ("ps -eo", 1, ""),
            ("curl", 0, "{\"status\":\"healthy\"}\n200"),
            ("ls -la", 0, "total 0"),
        ]);
        let report = run(&sandbox, &playbook(DEPLOY), &RunOptions::default()).await;

        assert!(report.verified(), "{}", report.render());
        assert_eq!(report.failures().count(), 0, "{}", report.render());
        assert_eq!(
            sandbox.files.lock().unwrap().get("/home/daytona/proxy.js").unwrap(),
            b"require('express');\n"
        );
        let steps: Vec<Step> = report.outcomes.iter().map(|o| o.step).collect();
        assert_eq!(
            steps,
            vec![
                Step::Inspect,
                Step::Kill,
                Step::Write,
                Step::Kill,
                Step::Launch,
                Step::ExpectFile,
                Step::Probe,
                Step::Ports,
                Step::Preview,
            ]
        );
        let preview = report.outcomes.last().unwrap();
        assert_eq!(preview.detail, "https://3001-fake.preview.example");
    }

    #[tokio::test]
    async fn failed_probe_tails_log_and_keeps_going() {
        let sandbox = FakeSandbox::with(vec![
            ("printf %s", 0, "/home/daytona"),
            ("ps -eo", 1, ""),
            ("curl", 7, "\n000"),
            ("tail -n 20", 0, "Error: Cannot find module 'express'"),
        ]);
        let report = run(&sandbox, &playbook(DEPLOY), &RunOptions::default()).await;

        assert!(!report.verified());
        let probe = report
            .outcomes
            .iter()
            .find(|o| o.step == Step::Probe)
            .unwrap();
        assert!(!probe.passed);
        assert!(probe.detail.contains("no response"));
        assert!(probe.detail.contains("Cannot find module 'express'"));
        assert_eq!(report.outcomes.last().unwrap().step, Step::Preview);
        assert!(report.render().contains("verification FAILED"));
    }

    #[tokio::test]
    async fn soft_failures_do_not_stop_later_steps() {
        let text = r#"
[[commands]]
command = "sed -i '/import.*css/d' src/pages/index.tsx"
cwd = "~/vitalmatrix"

[[commands]]
command = "rm -f ~/vitalmatrix/pages/api/health.js"
"#;
        let sandbox = FakeSandbox::with(vec![("sed", 2, "sed: can't read src/pages/index.tsx")]);
        let report = run(&sandbox, &playbook(text), &RunOptions::default()).await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].passed);
        assert!(report.outcomes[0].detail.starts_with("exit 2"));
        assert!(report.outcomes[1].passed);
        assert!(report.verified());
    }

    #[tokio::test]
    async fn kill_reports_survivors() {
        let text = "kill = [\"next\"]\n";
        let sandbox = FakeSandbox::with(vec![("ps -eo", 0, "  42 S next-server")]);
        let playbook = playbook(text);
        let report = run(&sandbox, &playbook, &RunOptions::default()).await;
        let kill = &report.outcomes[0];
        assert!(!kill.passed);
        assert!(kill.detail.contains("next-server"));
    }

    #[tokio::test]
    async fn repeated_runs_issue_the_same_commands() {
        let sandbox = FakeSandbox::with(vec![
            ("printf %s", 0, "/home/daytona"),
            ("ps -eo", 1, ""),
            ("curl", 0, "healthy\n200"),
        ]);
        let playbook = playbook(DEPLOY);
        let first = run(&sandbox, &playbook, &RunOptions::default()).await;
        let issued = sandbox.commands().len();
        let second = run(&sandbox, &playbook, &RunOptions::default()).await;
        assert!(first.verified() && second.verified());
        assert_eq!(first.outcomes.len(), second.outcomes.len());
        assert_eq!(sandbox.commands().len(), issued * 2);
    }

    #[tokio::test]
    async fn heredoc_mode_streams_through_exec() {
        let text = r#"
[[files]]
path = "~/app/pages/index.js"
content = "export default function Home() {}\n"
mode = "heredoc"
"#;
        let sandbox = FakeSandbox::default();
        let report = run(&sandbox, &playbook(text), &RunOptions { skip_verify: true }).await;
        assert!(report.outcomes[0].passed);
        let commands = sandbox.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("<<'SANDBOXCTL_EOF'\nexport default function Home() {}\n"));
        assert!(sandbox.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_dir_uploads_each_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");
        std::fs::create_dir_all(&services).unwrap();
        std::fs::write(services.join("auth.ts"), "export const auth = 1;\n").unwrap();
        std::fs::write(services.join("Feed.tsx"), "<Feed />\n").unwrap();
        std::fs::write(services.join("README.md"), "docs\n").unwrap();
        let text = r#"
[[files]]
path = "~/vitalmatrix/src/services"
source_dir = "services"
extensions = ["ts", "tsx"]
"#;
        let playbook = Playbook::parse(text, dir.path().to_path_buf()).unwrap();
        let sandbox = FakeSandbox::with(vec![("printf %s", 0, "/home/daytona")]);
        let report = run(&sandbox, &playbook, &RunOptions::default()).await;

        let labels: Vec<&str> = report.outcomes.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "~/vitalmatrix/src/services/Feed.tsx",
                "~/vitalmatrix/src/services/auth.ts",
            ]
        );
        assert!(report.outcomes.iter().all(|o| o.passed));
        let files = sandbox.files.lock().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            files["/home/daytona/vitalmatrix/src/services/auth.ts"],
            b"export const auth = 1;\n"
        );
    }
}
