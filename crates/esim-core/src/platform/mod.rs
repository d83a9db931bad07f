//! Seam to the operating system's eSIM subsystem.

mod sim;

pub use sim::SimulatedPlatform;

use serde::Serialize;

use crate::error::PlatformError;

/// First Android SDK level exposing an eUICC manager.
pub const MIN_ESIM_SDK: u32 = 28;
/// First Android SDK level where the activation broker pulls the code from
/// the carrier provisioning service.
pub const BROKER_SDK: u32 = 34;

pub const RESULT_OK: i32 = -1;
pub const RESULT_CANCELED: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Android,
    Ios,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EuiccInfo {
    pub enabled: bool,
    pub eid: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsTarget {
    EsimSettings,
    NetworkOperatorSettings,
    WirelessSettings,
}

impl SettingsTarget {
    /// Tried in order; the first resolvable target is opened.
    pub const FALLBACK_ORDER: [SettingsTarget; 3] = [
        SettingsTarget::EsimSettings,
        SettingsTarget::NetworkOperatorSettings,
        SettingsTarget::WirelessSettings,
    ];

    pub fn action(self) -> &'static str {
        match self {
            SettingsTarget::EsimSettings => "android.settings.ESIM_SETTINGS",
            SettingsTarget::NetworkOperatorSettings => {
                "android.settings.NETWORK_OPERATOR_SETTINGS"
            }
            SettingsTarget::WirelessSettings => "android.settings.WIRELESS_SETTINGS",
        }
    }
}

/// Everything the provisioning core needs from the host OS.
///
/// Implementations may be called from any thread.
pub trait EsimPlatform: Send + Sync {
    fn os_family(&self) -> OsFamily;

    /// SDK level on Android, major version on iOS.
    fn os_version(&self) -> u32;

    fn device_model(&self) -> String {
        String::new()
    }

    /// `Ok(None)` when the OS exposes no eUICC manager.
    fn euicc(&self) -> Result<Option<EuiccInfo>, PlatformError>;

    /// Starts the system activation UI; the outcome comes back later through
    /// [`Provisioner::on_activity_result`](crate::machine::Provisioner::on_activity_result)
    /// with the same `request_code`.
    fn launch_activation(&self, request_code: i32) -> Result<(), PlatformError>;

    fn can_resolve(&self, target: SettingsTarget) -> bool;

    fn open_settings(&self, target: SettingsTarget) -> Result<(), PlatformError>;

    /// Hands `url` to the external browser. Returns whether it opened.
    fn open_url(&self, url: &str) -> bool;
}
