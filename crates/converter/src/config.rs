use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Placeholder replaced by the quoted remote source path in `convert_command`
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder replaced by the quoted remote target path in `convert_command`
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Where the "remote" side of a run lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Multiplexed OpenSSH connection to `remote.host`
    Ssh,
    /// Commands run through `sh -c` on this machine
    Local,
}

/// Connection settings for the ssh transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    /// Private key passed with `-i`; agent/default keys are used otherwise
    pub identity_file: Option<PathBuf>,
    /// Path to the ssh client binary
    pub ssh_bin: PathBuf,
    pub connect_timeout_secs: u64,
    /// Directory for the ControlMaster socket (system temp dir when unset)
    pub control_dir: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            port: 22,
            identity_file: None,
            ssh_bin: PathBuf::from("ssh"),
            connect_timeout_secs: 15,
            control_dir: None,
        }
    }
}

impl RemoteConfig {
    /// `user@host`, or just `host` when no user is configured
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host),
            _ => self.host.clone(),
        }
    }
}

/// Idempotent "probe, install if absent, verify" commands run once per batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub probe: String,
    pub install: String,
    pub verify: String,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            probe: "command -v ffmpeg".to_string(),
            install: "export DEBIAN_FRONTEND=noninteractive; apt-get update && apt-get install -y ffmpeg"
                .to_string(),
            verify: "ffmpeg -version".to_string(),
        }
    }
}

/// Configuration for a remote conversion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Flat directory holding source files and their converted outputs
    pub local_dir: PathBuf,
    /// Extension of files to convert (without the dot)
    pub source_ext: String,
    /// Extension of produced files (without the dot)
    pub target_ext: String,
    /// Existing targets smaller than this are not treated as converted (0 = presence only)
    pub min_target_bytes: u64,
    pub transport: Transport,
    pub remote: RemoteConfig,
    /// Parent directory of the per-run workspace on the remote side
    pub workspace_base: String,
    /// Workspace directory name prefix; the run id is appended
    pub workspace_prefix: String,
    /// Conversion command template with `{input}` and `{output}` placeholders
    pub convert_command: String,
    /// Remote tool check; `None` skips it
    pub capability: Option<CapabilityConfig>,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    /// Timeout for each capability command (install can be slow)
    pub setup_timeout_secs: u64,
    /// Number of items processed concurrently over the shared session
    pub workers: usize,
    /// Run-level deadline after which no new items are dispatched
    pub run_timeout_secs: Option<u64>,
    /// Write `<stem>.why.txt` next to sources that failed
    pub failure_notes: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConvertConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            local_dir: PathBuf::from("."),
            source_ext: "wav".to_string(),
            target_ext: "mp3".to_string(),
            min_target_bytes: 0,
            transport: Transport::Ssh,
            remote: RemoteConfig::default(),
            workspace_base: "/tmp".to_string(),
            workspace_prefix: "rconv".to_string(),
            convert_command: "ffmpeg -nostdin -y -i {input} -acodec libmp3lame -q:a 2 {output}"
                .to_string(),
            capability: Some(CapabilityConfig::default()),
            command_timeout_secs: 600,
            transfer_timeout_secs: 300,
            setup_timeout_secs: 900,
            workers: 1,
            run_timeout_secs: None,
            failure_notes: false,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        for (name, ext) in [("source_ext", &self.source_ext), ("target_ext", &self.target_ext)] {
            if ext.is_empty() || ext.contains('.') || ext.contains('/') {
                bail!("{} must be a bare extension without dots, got {:?}", name, ext);
            }
        }
        if self.source_ext.eq_ignore_ascii_case(&self.target_ext) {
            bail!("source_ext and target_ext must differ (both are {:?})", self.source_ext);
        }
        if !self.convert_command.contains(INPUT_PLACEHOLDER)
            || !self.convert_command.contains(OUTPUT_PLACEHOLDER)
        {
            bail!(
                "convert_command must contain both {} and {}: {:?}",
                INPUT_PLACEHOLDER,
                OUTPUT_PLACEHOLDER,
                self.convert_command
            );
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.workspace_base.is_empty() || self.workspace_prefix.is_empty() {
            bail!("workspace_base and workspace_prefix must not be empty");
        }
        if self.workspace_prefix.contains('/') {
            bail!("workspace_prefix must not contain '/': {:?}", self.workspace_prefix);
        }
        if self.transport == Transport::Ssh && self.remote.host.trim().is_empty() {
            bail!("remote.host is required for the ssh transport");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
