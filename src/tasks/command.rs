//! External command task.
//!
//! Runs a program in its own process group (tied to the engine's life via the
//! parent-death signal), captures its output and fails the task on a non-zero
//! exit. Trimmed stdout can be published under a variable.

use crate::namespace::Vars;
use crate::process_guard::CommandProcessGroup;
use crate::task::{Task, TaskContext};
use anyhow::{Context, Result};
use serde_json::Value;
use std::process::{Command, Stdio};
use tracing::info;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None if terminated by signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Error unless the command exited successfully
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )
        }
    }
}

/// Run `program` with `args` and wait for it
pub fn run_command(program: &str, args: &[String], env: &[(String, String)]) -> Result<CommandOutput> {
    info!("run_command: {} args={:?}", program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .with_context(|| format!("Failed to run command: {}", program))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}

#[derive(Debug, Clone)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    output_var: Option<String>,
}

impl CommandTask {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            output_var: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Publish trimmed stdout under `name`
    pub fn output_var(mut self, name: impl Into<String>) -> Self {
        self.output_var = Some(name.into());
        self
    }
}

impl Task for CommandTask {
    fn run(&self, ctx: &mut TaskContext<'_>) -> Result<Vars> {
        let output = run_command(&self.program, &self.args, &self.env)?;
        output.ensure_success(&format!("task '{}' ({})", ctx.task_id(), self.program))?;

        let mut produced = Vars::new();
        if let Some(name) = &self.output_var {
            produced.insert(name.clone(), Value::String(output.stdout.trim().to_string()));
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::task::TaskId;
    use serde_json::json;

    #[test]
    fn test_command_publishes_trimmed_stdout() {
        let namespace = Namespace::new();
        let id = TaskId::from("hostname");
        let task = CommandTask::new("echo").args(["  node-1  "]).output_var("host");

        let mut ctx = TaskContext::new(&id, &namespace);
        let produced = task.run(&mut ctx).expect("echo succeeds");
        assert_eq!(produced.get("host"), Some(&json!("node-1")));
    }

    #[test]
    fn test_command_env_is_passed() {
        let output = run_command(
            "sh",
            &["-c".to_string(), "printf %s \"$TARGET_CLOUD\"".to_string()],
            &[("TARGET_CLOUD".to_string(), "dst".to_string())],
        )
        .expect("sh runs");
        assert!(output.success);
        assert_eq!(output.stdout, "dst");
    }

    #[test]
    fn test_non_zero_exit_fails_task() {
        let namespace = Namespace::new();
        let id = TaskId::from("convert");
        let task = CommandTask::new("sh").args(["-c", "echo bad image >&2; exit 3"]);

        let mut ctx = TaskContext::new(&id, &namespace);
        let err = task.run(&mut ctx).unwrap_err().to_string();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("bad image"));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        assert!(run_command("/nonexistent/cloudshift-tool", &[], &[]).is_err());
    }
}
