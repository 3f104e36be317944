//! Compose executor: thin wrapper over `docker compose` / `docker-compose`.

use crate::Result;
use anyhow::{Context, bail};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::debug;

/// Which compose front-end to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    /// `docker compose` plugin.
    Plugin,
    /// Standalone `docker-compose`.
    Standalone,
}

impl Program {
    fn argv(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Program::Plugin => ("docker", &["compose"]),
            Program::Standalone => ("docker-compose", &[]),
        }
    }

    /// Prefer the plugin, fall back to the standalone binary.
    pub fn detect() -> Result<Self> {
        if succeeds("docker", &["compose", "version"]) {
            return Ok(Program::Plugin);
        }
        if succeeds("docker-compose", &["--version"]) {
            return Ok(Program::Standalone);
        }
        bail!(crate::diagnostics::error_message(
            "neither 'docker compose' nor 'docker-compose' is available"
        ))
    }
}

fn succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct Compose {
    program: Program,
    project: String,
    root: PathBuf,
    env_file: PathBuf,
}

impl Compose {
    pub fn new(program: Program, project: &str, root: &Path, env_file: &Path) -> Self {
        Self {
            program,
            project: project.to_string(),
            root: root.to_path_buf(),
            env_file: env_file.to_path_buf(),
        }
    }

    /// Full argv: `<program> -p <project> --env-file=<file> <verbs...>`.
    pub fn args(&self, verbs: &[String]) -> Vec<String> {
        let (program, prefix) = self.program.argv();
        let mut out = vec![program.to_string()];
        out.extend(prefix.iter().map(|s| s.to_string()));
        out.push("-p".to_string());
        out.push(self.project.clone());
        out.push(format!("--env-file={}", self.env_file.display()));
        out.extend(verbs.iter().cloned());
        out
    }

    fn command(&self, verbs: &[String]) -> Command {
        let argv = self.args(verbs);
        debug!("running {}", argv.join(" "));
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&self.root);
        cmd
    }

    /// Run with inherited stdio and return the exit code.
    pub fn run(&self, verbs: &[String]) -> Result<i32> {
        let status = self
            .command(verbs)
            .status()
            .with_context(|| format!("failed to run compose {}", verbs.join(" ")))?;
        // killed by a signal
        Ok(status.code().unwrap_or(1))
    }

    /// Host port published for `service:internal`.
    pub fn port(&self, service: &str, internal: &str) -> Result<Option<u16>> {
        let verbs = vec!["port".to_string(), service.to_string(), internal.to_string()];
        let output = self
            .command(&verbs)
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("failed to query port of {}", service))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_port_line(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+)$").expect("static port pattern"))
}

/// `0.0.0.0:63017` -> 63017.
pub fn parse_port_line(line: &str) -> Option<u16> {
    port_re()
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
