use crate::config::ToolConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Executable plus the arguments that precede the request flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub executable: String,
    pub leading_args: Vec<String>,
}

impl ResolvedCommand {
    pub fn new(executable: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            leading_args,
        }
    }

    pub fn direct(config: &ToolConfig) -> Self {
        Self::new(&config.tool_bin, Vec::new())
    }

    pub fn via_runner(config: &ToolConfig) -> Self {
        let mut leading_args = config.runner_args.clone();
        leading_args.push(config.tool_package.clone());
        Self::new(&config.runner, leading_args)
    }
}

/// Decides once per process how the tool is invoked and remembers it.
pub struct CommandResolver {
    config: ToolConfig,
    resolved: OnceCell<ResolvedCommand>,
}

impl CommandResolver {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            resolved: OnceCell::new(),
        }
    }

    /// A resolver that skips discovery and always yields `command`.
    #[cfg(test)]
    pub fn fixed(command: ResolvedCommand) -> Self {
        Self {
            config: ToolConfig::default(),
            resolved: OnceCell::new_with(Some(command)),
        }
    }

    /// Never fails: anything short of a working direct executable falls
    /// back to the package runner.
    pub async fn resolve(&self) -> &ResolvedCommand {
        self.resolved
            .get_or_init(|| async {
                let command = if answers_version(&self.config.tool_bin).await {
                    ResolvedCommand::direct(&self.config)
                } else {
                    ResolvedCommand::via_runner(&self.config)
                };
                info!(
                    executable = %command.executable,
                    leading_args = ?command.leading_args,
                    "resolved tool command"
                );
                command
            })
            .await
    }
}

async fn answers_version(executable: &str) -> bool {
    let status = Command::new(executable)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(PROBE_TIMEOUT, status).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            debug!(executable, error = %err, "direct invocation unavailable");
            false
        }
        Err(_) => {
            debug!(executable, "direct invocation version check timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tool_bin: &str) -> ToolConfig {
        ToolConfig {
            tool_bin: tool_bin.to_string(),
            ..ToolConfig::default()
        }
    }

    #[test]
    fn runner_fallback_prefixes_package_name() {
        let command = ResolvedCommand::via_runner(&ToolConfig::default());
        assert_eq!(command.executable, "npx");
        assert_eq!(command.leading_args, vec!["-y", "@google/gemini-cli"]);
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_runner() {
        let resolver = CommandResolver::new(config("cli-bridge-no-such-tool-4f1c"));
        let command = resolver.resolve().await;
        assert_eq!(command, &ResolvedCommand::via_runner(&ToolConfig::default()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installed_binary_is_invoked_directly() {
        let resolver = CommandResolver::new(config("true"));
        let command = resolver.resolve().await;
        assert_eq!(command.executable, "true");
        assert!(command.leading_args.is_empty());
    }

    #[tokio::test]
    async fn resolution_is_cached() {
        let resolver = CommandResolver::new(config("cli-bridge-no-such-tool-4f1c"));
        let first = resolver.resolve().await as *const ResolvedCommand;
        let second = resolver.resolve().await as *const ResolvedCommand;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fixed_resolver_skips_discovery() {
        let command = ResolvedCommand::new("/bin/sh", vec!["-c".into(), "exit 0".into()]);
        let resolver = CommandResolver::fixed(command.clone());
        assert_eq!(resolver.resolve().await, &command);
    }
}
