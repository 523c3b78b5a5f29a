//! External tool execution.
//!
//! Disk, seed and domain-definition work is delegated to host tools
//! (`qemu-img`, `cloud-localds`, `virt-install`). They run through a
//! [`CommandRunner`] so tests and the development backend can stand in
//! for the real binaries.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HypervisorError, Result};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the same command through `sudo` when asked to.
    pub fn sudo_if(self, use_sudo: bool) -> Self {
        if !use_sudo {
            return self;
        }
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
        }
    }

    /// The tool being run, looking past a `sudo` prefix.
    pub fn tool_name(&self) -> &str {
        if self.program == "sudo" {
            self.args.first().map(String::as_str).unwrap_or("sudo")
        } else {
            &self.program
        }
    }

    /// Value following `flag`, e.g. `--name` → `web1`.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Every value following `flag`.
    pub fn flag_values(&self, flag: &str) -> Vec<&str> {
        self.args
            .windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Best diagnostic text the tool produced.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Spawns external processes and waits for them.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Only a spawn failure is an error here; a
    /// non-zero exit comes back in [`ToolOutput`].
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .await
            .map_err(|e| HypervisorError::ExternalTool {
                tool: invocation.tool_name().to_string(),
                message: format!("failed to run {}: {}", invocation.program, e),
            })?;

        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a tool and turn a non-zero exit into `ExternalTool`.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &ToolInvocation,
) -> Result<ToolOutput> {
    debug!(command = %invocation, "Running external tool");

    let output = runner.run(invocation).await?;
    if !output.success {
        return Err(HypervisorError::ExternalTool {
            tool: invocation.tool_name().to_string(),
            message: output.diagnostic(),
        });
    }
    Ok(output)
}
