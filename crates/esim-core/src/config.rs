use std::{fs, io, path::PathBuf, time::Duration};

use esim_util::{env_flag, env_parse, state_file_path, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "esim-config.json";

pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_CODE: i32 = 1001;
pub const DEFAULT_UNIVERSAL_LINK_BASE: &str =
    "https://esimsetup.apple.com/esim_qrcode_provisioning";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsimConfig {
    pub bridge_timeout_ms: u64,
    /// Zero keeps a pending code until it is cleared.
    pub code_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_code: i32,
    pub universal_link_base: String,
    pub event_log: bool,
}

impl Default for EsimConfig {
    fn default() -> Self {
        Self {
            bridge_timeout_ms: DEFAULT_BRIDGE_TIMEOUT_MS,
            code_retention_secs: crate::store::DEFAULT_CODE_RETENTION.as_secs(),
            sweep_interval_secs: 30,
            request_code: DEFAULT_REQUEST_CODE,
            universal_link_base: DEFAULT_UNIVERSAL_LINK_BASE.to_string(),
            event_log: false,
        }
    }
}

impl EsimConfig {
    /// Defaults, then `esim-config.json` from the state dir, then environment
    /// overrides.
    pub fn load() -> Self {
        let path = config_path();
        let mut cfg = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<EsimConfig>(&data) {
                Ok(file_cfg) => file_cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    EsimConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                EsimConfig::default()
            }
        };
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        if let Some(ms) = env_parse::<u64>("ESIM_BRIDGE_TIMEOUT_MS") {
            self.bridge_timeout_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("ESIM_CODE_RETENTION_SECS") {
            self.code_retention_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("ESIM_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = secs;
        }
        if let Ok(base) = std::env::var("ESIM_UNIVERSAL_LINK_BASE") {
            if !base.trim().is_empty() {
                self.universal_link_base = base.trim().to_string();
            }
        }
        if let Some(enabled) = env_flag("ESIM_EVENT_LOG") {
            self.event_log = enabled;
        }
    }

    pub fn save(&self) -> io::Result<()> {
        write_json_atomic(&config_path(), self)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms.max(1))
    }

    pub fn code_retention(&self) -> Option<Duration> {
        match self.code_retention_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

pub fn config_path() -> PathBuf {
    state_file_path(CONFIG_FILE)
}
