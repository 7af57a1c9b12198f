//! Shell evaluation of assignment files
//!
//! Used for recipe files that need more of the shell than the in-process
//! parser supports. The file is run by `bash -r` with an empty environment
//! inside a scratch directory, and each assigned variable is echoed back on
//! its own line.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::config::defaults;
use crate::core::bashvar::{AssignmentStrategy, Diagnostic, Evaluation};
use crate::error::BashVarError;

/// Evaluates assignment files with an external shell
#[derive(Debug, Clone)]
pub struct ShellStrategy {
    shell: PathBuf,
    output_limit: usize,
}

impl Default for ShellStrategy {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("bash"),
            output_limit: defaults::SHELL_OUTPUT_LIMIT,
        }
    }
}

impl ShellStrategy {
    /// Use a different shell binary and output limit
    pub fn with_config(shell: PathBuf, output_limit: usize) -> Self {
        Self {
            shell,
            output_limit,
        }
    }
}

fn assignment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*([a-zA-Z_][a-zA-Z0-9_]*)\+?=").expect("assignment pattern is valid")
    })
}

/// Names assigned at the start of a line, first occurrence order
pub fn assigned_names(source: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for captures in assignment_pattern().captures_iter(source) {
        let name = &captures[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Build the script fed to the shell: the file, then one echo per name
fn build_script(source: &str, names: &[String]) -> String {
    let mut script = String::with_capacity(source.len() + names.len() * 32);
    script.push_str(source);
    script.push('\n');
    for name in names {
        script.push_str(&format!("echo \"${{{name}//$'\\n'/\\\\n}}\"\n"));
    }
    script
}

/// Kill a shell we no longer read from and reap it
fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill shell {}: {e}", child.id());
    }
    if let Err(e) = child.wait() {
        debug!("Failed to reap shell {}: {e}", child.id());
    }
}

fn unescape_line(line: &str) -> String {
    line.replace("\\n", "\n")
}

impl AssignmentStrategy for ShellStrategy {
    fn evaluate(&self, source: &str, file: &str) -> Result<Evaluation, BashVarError> {
        let names = assigned_names(source);
        let script = build_script(source, &names);
        let shell_error = |e: &dyn std::fmt::Display| BashVarError::Shell {
            file: file.to_string(),
            error: e.to_string(),
        };

        // resolved up front, the child gets no PATH of its own
        let shell = which::which(&self.shell).map_err(|e| shell_error(&e))?;
        let scratch = tempfile::tempdir().map_err(|e| shell_error(&e))?;
        debug!("Evaluating {file} with {}", shell.display());

        let mut child = Command::new(&shell)
            .arg("-r")
            .env_clear()
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| shell_error(&e))?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            stop(&mut child);
            return Err(shell_error(&"shell pipes unavailable"));
        };

        let limit = self.output_limit as u64 + 1;
        let writer = std::thread::spawn(move || stdin.write_all(script.as_bytes()));
        let err_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stderr.take(limit).read_to_end(&mut buf).map(|_| buf)
        });

        let mut out = Vec::new();
        let read = stdout.take(limit).read_to_end(&mut out);
        if out.len() > self.output_limit {
            stop(&mut child);
            return Err(BashVarError::OutputTooLarge {
                file: file.to_string(),
                limit: self.output_limit,
            });
        }
        read.map_err(|e| shell_error(&e))?;

        // the shell may exit before reading the whole script
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shell stopped reading {file}: {e}"),
            Err(_) => return Err(shell_error(&"stdin writer panicked")),
        }
        let err_output = err_reader
            .join()
            .map_err(|_| shell_error(&"stderr reader panicked"))?
            .map_err(|e| shell_error(&e))?;
        child.wait().map_err(|e| shell_error(&e))?;

        let mut evaluation = Evaluation::default();
        let stderr_text = String::from_utf8_lossy(&err_output);
        for line in stderr_text.lines().filter(|l| !l.trim().is_empty()) {
            evaluation
                .diagnostics
                .push(Diagnostic::ShellMessage(line.to_string()));
        }

        let stdout_text = String::from_utf8_lossy(&out);
        let values: Vec<&str> = stdout_text.lines().collect();
        if values.len() != names.len() && stderr_text.trim().is_empty() {
            evaluation.diagnostics.push(Diagnostic::OutputMismatch {
                expected: names.len(),
                actual: values.len(),
            });
        }
        for (name, value) in names.into_iter().zip(values) {
            evaluation.variables.insert(name, unescape_line(value));
        }
        Ok(evaluation)
    }
}
