use clap::Args;

pub const DEFAULT_TOOL_BIN: &str = "gemini";
pub const DEFAULT_RUNNER: &str = "npx";
pub const DEFAULT_TOOL_PACKAGE: &str = "@google/gemini-cli";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// How to reach the external CLI tool.
#[derive(Debug, Clone, Args)]
pub struct ToolConfig {
    /// Executable tried first for direct invocation.
    #[arg(long, env = "CLI_BRIDGE_TOOL_BIN", default_value = DEFAULT_TOOL_BIN)]
    pub tool_bin: String,

    /// Package runner used when the executable is not installed.
    #[arg(long, env = "CLI_BRIDGE_RUNNER", default_value = DEFAULT_RUNNER)]
    pub runner: String,

    /// Arguments placed between the runner and the package name.
    #[arg(long = "runner-arg", default_values = ["-y"], allow_hyphen_values = true)]
    pub runner_args: Vec<String>,

    /// Package the runner fetches and executes.
    #[arg(long, env = "CLI_BRIDGE_TOOL_PACKAGE", default_value = DEFAULT_TOOL_PACKAGE)]
    pub tool_package: String,

    /// Environment variable the tool reads its API key from.
    #[arg(long, env = "CLI_BRIDGE_API_KEY_ENV", default_value = DEFAULT_API_KEY_ENV)]
    pub api_key_env: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            tool_bin: DEFAULT_TOOL_BIN.to_string(),
            runner: DEFAULT_RUNNER.to_string(),
            runner_args: vec!["-y".to_string()],
            tool_package: DEFAULT_TOOL_PACKAGE.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}
