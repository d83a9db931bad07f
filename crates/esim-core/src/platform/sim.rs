use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{EsimPlatform, EuiccInfo, OsFamily, SettingsTarget};
use crate::error::PlatformError;

#[derive(Default)]
struct Record {
    launches: Vec<i32>,
    settings_opened: Vec<SettingsTarget>,
    urls_opened: Vec<String>,
}

/// Scriptable in-memory platform used by the CLI driver and tests.
pub struct SimulatedPlatform {
    family: OsFamily,
    version: u32,
    model: String,
    euicc: Option<EuiccInfo>,
    resolvable: Vec<SettingsTarget>,
    launch_error: Option<PlatformError>,
    open_url_result: bool,
    panic_on_euicc_lookup: bool,
    record: Mutex<Record>,
}

impl SimulatedPlatform {
    pub fn android(sdk: u32) -> Self {
        Self {
            family: OsFamily::Android,
            version: sdk,
            model: "sim-android".into(),
            euicc: Some(EuiccInfo {
                enabled: true,
                eid: Some("89049032000000000000000000000001".into()),
            }),
            resolvable: SettingsTarget::FALLBACK_ORDER.to_vec(),
            launch_error: None,
            open_url_result: true,
            panic_on_euicc_lookup: false,
            record: Mutex::new(Record::default()),
        }
    }

    pub fn ios(version: u32) -> Self {
        Self {
            family: OsFamily::Ios,
            model: "iPhone15,2".into(),
            resolvable: Vec::new(),
            ..Self::android(version)
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_euicc_enabled(mut self, enabled: bool) -> Self {
        let eid = self.euicc.take().and_then(|info| info.eid);
        self.euicc = Some(EuiccInfo { enabled, eid });
        self
    }

    pub fn without_euicc(mut self) -> Self {
        self.euicc = None;
        self
    }

    pub fn with_resolvable(mut self, targets: &[SettingsTarget]) -> Self {
        self.resolvable = targets.to_vec();
        self
    }

    pub fn with_launch_error(mut self, message: &str) -> Self {
        self.launch_error = Some(PlatformError::Call(message.to_string()));
        self
    }

    /// Launching the activation UI finds no foreground activity.
    pub fn without_activity(mut self) -> Self {
        self.launch_error = Some(PlatformError::NoActivity);
        self
    }

    pub fn with_url_result(mut self, opens: bool) -> Self {
        self.open_url_result = opens;
        self
    }

    /// Makes the eUICC lookup panic, standing in for an unexpected OS fault.
    pub fn panicking_euicc_lookup(mut self) -> Self {
        self.panic_on_euicc_lookup = true;
        self
    }

    pub fn launches(&self) -> Vec<i32> {
        self.lock().launches.clone()
    }

    pub fn settings_opened(&self) -> Vec<SettingsTarget> {
        self.lock().settings_opened.clone()
    }

    pub fn urls_opened(&self) -> Vec<String> {
        self.lock().urls_opened.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EsimPlatform for SimulatedPlatform {
    fn os_family(&self) -> OsFamily {
        self.family
    }

    fn os_version(&self) -> u32 {
        self.version
    }

    fn device_model(&self) -> String {
        self.model.clone()
    }

    fn euicc(&self) -> Result<Option<EuiccInfo>, PlatformError> {
        if self.panic_on_euicc_lookup {
            panic!("simulated eUICC service crash");
        }
        Ok(self.euicc.clone())
    }

    fn launch_activation(&self, request_code: i32) -> Result<(), PlatformError> {
        if let Some(err) = &self.launch_error {
            return Err(err.clone());
        }
        self.lock().launches.push(request_code);
        Ok(())
    }

    fn can_resolve(&self, target: SettingsTarget) -> bool {
        self.resolvable.contains(&target)
    }

    fn open_settings(&self, target: SettingsTarget) -> Result<(), PlatformError> {
        if !self.can_resolve(target) {
            return Err(PlatformError::Unresolvable(target.action().to_string()));
        }
        self.lock().settings_opened.push(target);
        Ok(())
    }

    fn open_url(&self, url: &str) -> bool {
        if self.open_url_result {
            self.lock().urls_opened.push(url.to_string());
        }
        self.open_url_result
    }
}
