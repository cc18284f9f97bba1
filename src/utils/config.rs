// src/utils/config.rs
use crate::core::SamplingParams;
use clap::Parser;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("temperature must be between 0 and 2.0, got {0}")]
    Temperature(f32),
    #[error("context window too small (minimum 512), got {0}")]
    ContextWindow(usize),
    #[error("max tokens must be greater than zero")]
    MaxTokens,
    #[error("upstream url must not be empty")]
    UpstreamUrl,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "CODER_BRIDGE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "CODER_BRIDGE_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Base url of the OpenAI-compatible server doing the actual inference
    #[arg(
        long,
        env = "CODER_BRIDGE_UPSTREAM_URL",
        default_value = "http://127.0.0.1:8080/v1"
    )]
    pub upstream_url: String,

    /// Model id reported to clients
    #[arg(long, env = "CODER_BRIDGE_MODEL_ID", default_value = "cerebras-qwen3")]
    pub model_id: String,

    /// Human readable model name for the info endpoint
    #[arg(
        long,
        env = "CODER_BRIDGE_MODEL_NAME",
        default_value = "Cerebras-Qwen3-Coder-25B"
    )]
    pub model_name: String,

    #[arg(long, env = "CODER_BRIDGE_CONTEXT_WINDOW", default_value_t = 131072)]
    pub context_window: usize,

    /// max tokens for each request
    #[arg(long, env = "CODER_BRIDGE_MAX_TOKENS", default_value_t = 16384)]
    pub max_tokens: usize,

    #[arg(long, env = "CODER_BRIDGE_TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, env = "CODER_BRIDGE_TOP_P", default_value_t = 0.8)]
    pub top_p: f32,

    #[arg(long, env = "CODER_BRIDGE_TOP_K", default_value_t = 20)]
    pub top_k: isize,

    #[arg(long, env = "CODER_BRIDGE_REPEAT_PENALTY", default_value_t = 1.1)]
    pub repeat_penalty: f32,

    #[arg(long, env = "CODER_BRIDGE_PRESENCE_PENALTY", default_value_t = 0.0)]
    pub presence_penalty: f32,

    #[arg(long, env = "CODER_BRIDGE_FREQUENCY_PENALTY", default_value_t = 0.0)]
    pub frequency_penalty: f32,

    /// Forward generated text untouched instead of extracting tool calls
    #[arg(long, env = "CODER_BRIDGE_DISABLE_TOOL_CALLING", default_value_t = false)]
    pub disable_tool_calling: bool,

    /// SSE keep-alive interval in milliseconds
    #[arg(long, env = "KEEP_ALIVE_INTERVAL", default_value_t = 100)]
    pub keep_alive_interval: u64,

    /// Tracing filter used when RUST_LOG is unset
    #[arg(long, env = "CODER_BRIDGE_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub model_id: String,
    pub model_name: String,
    pub context_window: usize,
    /// Upper bound applied to every request's max_tokens
    pub max_tokens: usize,
    /// Defaults for sampling fields the client leaves unset
    pub sampling: SamplingParams,
    pub tool_calling: bool,
    pub keep_alive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            upstream_url: "http://127.0.0.1:8080/v1".to_string(),
            model_id: "cerebras-qwen3".to_string(),
            model_name: "Cerebras-Qwen3-Coder-25B".to_string(),
            context_window: 131072,
            max_tokens: 16384,
            sampling: SamplingParams::default(),
            tool_calling: true,
            keep_alive_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            upstream_url: args.upstream_url.clone(),
            model_id: args.model_id.clone(),
            model_name: args.model_name.clone(),
            context_window: args.context_window,
            max_tokens: args.max_tokens,
            sampling: SamplingParams {
                temperature: args.temperature,
                top_p: args.top_p,
                top_k: args.top_k,
                max_tokens: args.max_tokens,
                repeat_penalty: args.repeat_penalty,
                presence_penalty: args.presence_penalty,
                frequency_penalty: args.frequency_penalty,
            },
            tool_calling: !args.disable_tool_calling,
            keep_alive_ms: args.keep_alive_interval,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let temperature = self.sampling.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Temperature(temperature));
        }
        if self.context_window < 512 {
            return Err(ConfigError::ContextWindow(self.context_window));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::MaxTokens);
        }
        if self.upstream_url.trim().is_empty() {
            return Err(ConfigError::UpstreamUrl);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_args_defaults() {
        let args = Args::parse_from(["coder-bridge"]);
        let config = ServerConfig::from_args(&args);
        assert_eq!(config, ServerConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:8081");
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "coder-bridge",
            "--port",
            "9000",
            "--temperature",
            "0.2",
            "--disable-tool-calling",
            "--upstream-url",
            "http://gpu-box:8080/v1",
        ]);
        let config = ServerConfig::from_args(&args);
        assert_eq!(config.port, 9000);
        assert_eq!(config.sampling.temperature, 0.2);
        assert!(!config.tool_calling);
        assert_eq!(config.upstream_url, "http://gpu-box:8080/v1");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.sampling.temperature = 2.5;
        assert_eq!(config.validate(), Err(ConfigError::Temperature(2.5)));

        let mut config = ServerConfig::default();
        config.context_window = 256;
        assert_eq!(config.validate(), Err(ConfigError::ContextWindow(256)));

        let mut config = ServerConfig::default();
        config.max_tokens = 0;
        assert_eq!(config.validate(), Err(ConfigError::MaxTokens));

        let mut config = ServerConfig::default();
        config.upstream_url = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::UpstreamUrl));
    }
}
