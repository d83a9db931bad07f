use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::EsimConfig;
use crate::error::MethodError;
use crate::event::{Event, EventKind};
use crate::fault;
use crate::platform::{EsimPlatform, OsFamily, MIN_ESIM_SDK, RESULT_CANCELED, RESULT_OK};
use crate::store::{ActivationCode, ActivationCodeStore};
use crate::strategy::{
    open_universal_link, strategy_for, CapabilityTier, DispatchContext, DispatchOutcome,
};

const ANDROID_INSTRUCTIONS: &str = "1. Save QR Code\n\
2. Go to Settings on your device\n\
3. TAP Connections\n\
4. TAP SIM Manager\n\
5. TAP Add eSIM\n\
6. TAP Scan QR code from service provider\n\
7. TAP Enter activation code\n\
8. ENTER the activation code found in the eSIM details\n\
9. TAP Connect\n\
10. TAP Add";

const IOS_INSTRUCTIONS: &str = "1. Save QR Code\n\
2. On your device, go to Settings\n\
3. Tap Cellular or Mobile\n\
4. Tap Add Cellular Plan or Add Mobile Data Plan\n\
5. Tap Add eSIM\n\
6. Tap Use QR Code\n\
7. Tap Open Photos\n\
8. SELECT the saved QR code\n\
9. TAP Continue twice\n\
10. WAIT a few minutes for your eSIM to activate\n\
11. TAP Done";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    CapabilityChecked,
    CodeValidated,
    Dispatched,
    AwaitingOsResult,
    Succeeded,
    Cancelled,
    Unrecognized,
    /// Resolved without an OS result: settings fallback or external link.
    FellBack,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded
                | AttemptState::Cancelled
                | AttemptState::Unrecognized
                | AttemptState::FellBack
                | AttemptState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Idle => "idle",
            AttemptState::CapabilityChecked => "capability_checked",
            AttemptState::CodeValidated => "code_validated",
            AttemptState::Dispatched => "dispatched",
            AttemptState::AwaitingOsResult => "awaiting_os_result",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Cancelled => "cancelled",
            AttemptState::Unrecognized => "unrecognized",
            AttemptState::FellBack => "fell_back",
            AttemptState::Failed => "failed",
        }
    }
}

struct InstallationAttempt {
    id: Uuid,
    tier: Option<CapabilityTier>,
    state: AttemptState,
    code_stored: bool,
    started_at: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptSummary {
    pub id: Uuid,
    pub tier: Option<CapabilityTier>,
    pub state: AttemptState,
}

impl InstallationAttempt {
    fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            id: self.id,
            tier: self.tier,
            state: self.state,
        }
    }
}

#[derive(Default)]
struct AttemptSlot {
    active: Option<InstallationAttempt>,
    last: Option<AttemptSummary>,
}

/// Plugin method surface and per-installation state machine.
///
/// One attempt may be in flight at a time; a second install is refused until
/// the first reaches a terminal state or its pending code expires.
pub struct Provisioner {
    platform: Arc<dyn EsimPlatform>,
    bus: Arc<EventBus>,
    store: Arc<ActivationCodeStore>,
    config: EsimConfig,
    slot: Mutex<AttemptSlot>,
}

impl Provisioner {
    pub fn new(
        platform: Arc<dyn EsimPlatform>,
        bus: Arc<EventBus>,
        store: Arc<ActivationCodeStore>,
        config: EsimConfig,
    ) -> Self {
        Self {
            platform,
            bus,
            store,
            config,
            slot: Mutex::new(AttemptSlot::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ActivationCodeStore> {
        &self.store
    }

    pub fn config(&self) -> &EsimConfig {
        &self.config
    }

    pub fn active_attempt(&self) -> Option<AttemptSummary> {
        self.lock().active.as_ref().map(InstallationAttempt::summary)
    }

    pub fn last_outcome(&self) -> Option<AttemptSummary> {
        self.lock().last.clone()
    }

    /// Routes a named method call from the host or the page bridge.
    pub fn handle_method_call(&self, method: &str, args: &Value) -> Result<Value, MethodError> {
        self.guarded(method, || match method {
            "isSupportESim" => {
                let models: Vec<String> = match args {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                self.is_support_esim(&models).map(Value::Bool)
            }
            "installEsimProfile" => {
                let profile = match args {
                    Value::String(code) => code.as_str(),
                    Value::Object(map) => map.get("profile").and_then(Value::as_str).unwrap_or(""),
                    _ => "",
                };
                self.install_esim_profile(profile).map(Value::Bool)
            }
            "instructions" => Ok(Value::String(self.instructions().to_string())),
            "openUniversalLink" => match args.as_str() {
                Some(code) => self.open_universal_link(code).map(Value::Bool),
                None => Err(MethodError::InvalidArgument(
                    "Activation code is required".into(),
                )),
            },
            other => Err(MethodError::NotImplemented(other.to_string())),
        })
    }

    /// Capability check. Emits diagnostics only.
    ///
    /// On iOS a non-empty `supported_models` list decides support by device
    /// model; otherwise the eUICC state does.
    pub fn is_support_esim(&self, supported_models: &[String]) -> Result<bool, MethodError> {
        self.guarded("isSupportESim", || {
            self.bus.publish(Event::debug("isSupportESim_called"));
            let sdk = self.platform.os_version();

            if self.platform.os_family() == OsFamily::Ios {
                let model = self.platform.device_model();
                let supported = if supported_models.is_empty() {
                    matches!(self.platform.euicc(), Ok(Some(info)) if info.enabled)
                } else {
                    supported_models.iter().any(|candidate| candidate == &model)
                };
                self.bus.publish(
                    Event::debug("isSupportESim_result")
                        .with("isEnabled", supported)
                        .with("model", model),
                );
                return Ok(supported);
            }

            if sdk < MIN_ESIM_SDK {
                self.bus
                    .publish(Event::debug("isSupportESim_unsupported_sdk").with("sdk", sdk));
                return Ok(false);
            }

            let info = match self.platform.euicc() {
                Ok(Some(info)) => info,
                Ok(None) | Err(_) => {
                    self.bus
                        .publish(Event::debug("isSupportESim_no_euicc_manager").with("sdk", sdk));
                    return Ok(false);
                }
            };

            self.bus.publish(
                Event::debug("isSupportESim_result")
                    .with("isEnabled", info.enabled)
                    .with("sdk", sdk)
                    .with("euiccId", info.eid.unwrap_or_else(|| "null".into())),
            );
            Ok(info.enabled)
        })
    }

    /// Starts one installation attempt.
    ///
    /// `Ok(true)` means the OS flow (or external link) took over; `Ok(false)`
    /// means a fallback was taken or the dispatch failed.
    pub fn install_esim_profile(&self, profile: &str) -> Result<bool, MethodError> {
        let id = Uuid::new_v4();
        let result = self.guarded("installEsimProfile", || self.run_install(id, profile));
        if matches!(result, Err(MethodError::Exception(_))) {
            self.finish(id, AttemptState::Failed);
        }
        result
    }

    fn run_install(&self, id: Uuid, profile: &str) -> Result<bool, MethodError> {
        let Some(code) = ActivationCode::parse(profile) else {
            self.bus.publish(
                Event::fail("empty_activation_code").with("reason", "Activation code is empty"),
            );
            return Err(MethodError::EmptyCode);
        };

        self.expire_stale_attempt();
        self.reserve(id)?;

        let tier = CapabilityTier::assess(self.platform.as_ref());
        let sdk = self.platform.os_version();
        self.update(id, |attempt| {
            attempt.tier = Some(tier);
            attempt.state = AttemptState::CapabilityChecked;
        });
        self.bus.publish(
            Event::debug("capability_checked")
                .with("attemptId", id.to_string())
                .with("tier", tier.label())
                .with("sdk", sdk),
        );

        self.update(id, |attempt| attempt.state = AttemptState::CodeValidated);
        self.bus.publish(
            Event::status("install_requested")
                .with("sdk", sdk)
                .with("codeLength", code.char_len()),
        );

        let Some(strategy) = strategy_for(tier) else {
            self.bus.publish(
                Event::fail("euicc_unavailable")
                    .with("reason", "EuiccManager_null")
                    .with("sdk", sdk),
            );
            self.finish(id, AttemptState::Failed);
            return Err(MethodError::EuiccUnavailable);
        };

        self.update(id, |attempt| {
            attempt.state = AttemptState::Dispatched;
            attempt.code_stored = tier == CapabilityTier::Integrated;
        });
        self.bus
            .publish(Event::status("dispatched").with("strategy", strategy.name()));

        let ctx = DispatchContext {
            platform: self.platform.as_ref(),
            bus: &self.bus,
            store: &self.store,
            config: &self.config,
        };
        let outcome = strategy.dispatch(&ctx, &code);
        info!("attempt {id}: {} dispatch -> {outcome:?}", strategy.name());

        match &outcome {
            DispatchOutcome::Launched { request_code } => {
                let still_dispatched = self.update(id, |attempt| {
                    if attempt.state == AttemptState::Dispatched {
                        attempt.state = AttemptState::AwaitingOsResult;
                    }
                });
                if still_dispatched {
                    self.bus.publish(
                        Event::status("activation_intent_launched")
                            .with("requestCode", *request_code),
                    );
                }
            }
            DispatchOutcome::LinkOpened | DispatchOutcome::SettingsOpened(_) => {
                self.finish(id, AttemptState::FellBack);
            }
            DispatchOutcome::LaunchFailed { .. }
            | DispatchOutcome::SettingsUnavailable
            | DispatchOutcome::LinkFailed => self.finish(id, AttemptState::Failed),
        }
        Ok(outcome.installed_directly())
    }

    /// Re-entry point for the OS activation UI. Returns whether
    /// `request_code` belonged to this plugin.
    pub fn on_activity_result(
        &self,
        request_code: i32,
        result_code: i32,
        extras: &[String],
    ) -> bool {
        let handled = self.guarded("onActivityResult", || {
            Ok(self.classify_result(request_code, result_code, extras))
        });
        handled.unwrap_or(true)
    }

    fn classify_result(&self, request_code: i32, result_code: i32, extras: &[String]) -> bool {
        let expected = self.config.request_code;
        self.bus.publish(
            Event::debug("onActivityResult")
                .with("requestCode", request_code)
                .with("resultCode", result_code)
                .with("expectedRequestCode", expected)
                .with("RESULT_OK", RESULT_OK)
                .with("RESULT_CANCELED", RESULT_CANCELED),
        );
        if request_code != expected {
            return false;
        }

        let state = match result_code {
            RESULT_OK => {
                self.bus.publish(
                    Event::stage(EventKind::Success, "esim_installed")
                        .with("message", "eSIM installed successfully"),
                );
                AttemptState::Succeeded
            }
            RESULT_CANCELED => {
                self.bus.publish(
                    Event::fail("esim_installation_canceled")
                        .with("reason", "User canceled")
                        .with("resultCode", result_code),
                );
                AttemptState::Cancelled
            }
            other => {
                let data = if extras.is_empty() {
                    "no_extras".to_string()
                } else {
                    extras.join(", ")
                };
                self.bus.publish(
                    Event::stage(EventKind::Unknown, "unexpected_result_code")
                        .with("resultCode", other)
                        .with("data", data),
                );
                AttemptState::Unrecognized
            }
        };

        self.store.clear();
        let active = self.lock().active.as_ref().map(|attempt| attempt.id);
        match active {
            Some(id) => self.finish(id, state),
            None => warn!("activity result {result_code} arrived with no attempt in flight"),
        }
        true
    }

    /// Fails an attempt whose pending code outlived the retention window.
    /// Returns whether anything expired.
    pub fn expire_stale_attempt(&self) -> bool {
        if !self.store.sweep_expired() {
            return false;
        }
        let retention = self.store.retention().unwrap_or_default();
        warn!("pending activation code expired after {}s", retention.as_secs());

        let stale = {
            let slot = self.lock();
            slot.active
                .as_ref()
                .filter(|attempt| attempt.code_stored)
                .map(|attempt| (attempt.id, attempt.started_at.elapsed()))
        };
        let mut event = Event::fail("activation_code_expired")
            .with("retentionSecs", retention.as_secs());
        if let Some((_, age)) = stale {
            event = event.with("attemptAgeSecs", age.as_secs());
        }
        self.bus.publish(event);
        if let Some((id, _)) = stale {
            self.finish(id, AttemptState::Failed);
        }
        true
    }

    /// Periodically calls [`expire_stale_attempt`](Self::expire_stale_attempt)
    /// until the provisioner is dropped.
    pub fn spawn_retention_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(provisioner) = weak.upgrade() else {
                    return;
                };
                provisioner.expire_stale_attempt();
            }
        })
    }

    pub fn open_universal_link(&self, code: &str) -> Result<bool, MethodError> {
        self.guarded("openUniversalLink", || {
            let code = ActivationCode::parse(code).ok_or_else(|| {
                MethodError::InvalidArgument("Activation code is required".into())
            })?;
            let ctx = DispatchContext {
                platform: self.platform.as_ref(),
                bus: &self.bus,
                store: &self.store,
                config: &self.config,
            };
            Ok(open_universal_link(&ctx, &code) == DispatchOutcome::LinkOpened)
        })
    }

    pub fn instructions(&self) -> &'static str {
        match self.platform.os_family() {
            OsFamily::Android => ANDROID_INSTRUCTIONS,
            OsFamily::Ios => IOS_INSTRUCTIONS,
        }
    }

    fn guarded<T>(
        &self,
        method: &str,
        op: impl FnOnce() -> Result<T, MethodError>,
    ) -> Result<T, MethodError> {
        match fault::contain(op) {
            Ok(result) => result,
            Err(fault) => {
                error!("{method} failed unexpectedly: {}", fault.message);
                let mut event = Event::fail("method_exception")
                    .with("method", method)
                    .with("error", fault.message.clone())
                    .with("stackTrace", fault.trace);
                if let Some(location) = fault.location {
                    event = event.with("location", location);
                }
                self.bus.publish(event);
                Err(MethodError::Exception(fault.message))
            }
        }
    }

    fn reserve(&self, id: Uuid) -> Result<(), MethodError> {
        let in_flight = {
            let mut slot = self.lock();
            match slot.active.as_ref() {
                Some(existing) => Some((existing.id, existing.state)),
                None => {
                    slot.active = Some(InstallationAttempt {
                        id,
                        tier: None,
                        state: AttemptState::Idle,
                        code_stored: false,
                        started_at: Instant::now(),
                    });
                    None
                }
            }
        };
        match in_flight {
            None => Ok(()),
            Some((existing, state)) => {
                self.bus.publish(
                    Event::fail("install_in_progress")
                        .with("attemptId", existing.to_string())
                        .with("state", state.as_str()),
                );
                Err(MethodError::InstallInProgress)
            }
        }
    }

    /// Applies `change` to the active attempt if it is still `id`.
    fn update(&self, id: Uuid, change: impl FnOnce(&mut InstallationAttempt)) -> bool {
        let mut slot = self.lock();
        match slot.active.as_mut() {
            Some(attempt) if attempt.id == id => {
                change(attempt);
                true
            }
            _ => false,
        }
    }

    fn finish(&self, id: Uuid, state: AttemptState) {
        debug_assert!(state.is_terminal());
        let finished = {
            let mut slot = self.lock();
            match slot.active.take() {
                Some(mut attempt) if attempt.id == id => {
                    attempt.state = state;
                    let summary = attempt.summary();
                    slot.last = Some(summary.clone());
                    Some((summary, attempt.code_stored))
                }
                other => {
                    slot.active = other;
                    None
                }
            }
        };
        let Some((summary, code_stored)) = finished else {
            return;
        };
        if code_stored {
            self.store.clear();
        }
        self.bus.publish(
            Event::debug("attempt_finished")
                .with("attemptId", summary.id.to_string())
                .with("state", summary.state.as_str()),
        );
    }

    fn lock(&self) -> MutexGuard<'_, AttemptSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{SettingsTarget, SimulatedPlatform};
    use crate::store::DEFAULT_CODE_RETENTION;
    use serde_json::json;

    const PROFILE: &str = "LPA:1$smdp.example.com$04386-AGYFT-A74Y8-3F815";

    struct Fixture {
        platform: Arc<SimulatedPlatform>,
        provisioner: Arc<Provisioner>,
        events: Arc<Mutex<Vec<Event>>>,
        _sub: crate::bus::Subscription,
    }

    impl Fixture {
        fn new(platform: SimulatedPlatform) -> Self {
            Self::with_store(platform, ActivationCodeStore::new(Some(DEFAULT_CODE_RETENTION)))
        }

        fn with_store(platform: SimulatedPlatform, store: ActivationCodeStore) -> Self {
            let platform = Arc::new(platform);
            let bus = EventBus::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            let sub = bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
            let provisioner = Arc::new(Provisioner::new(
                platform.clone(),
                bus,
                Arc::new(store),
                EsimConfig::default(),
            ));
            Self {
                platform,
                provisioner,
                events,
                _sub: sub,
            }
        }

        fn stages(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| event.stage_name().map(str::to_string))
                .collect()
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(Event::kind).collect()
        }
    }

    #[test]
    fn support_check_below_minimum_sdk_is_false_with_diagnostics_only() {
        let fx = Fixture::new(SimulatedPlatform::android(27));

        assert_eq!(fx.provisioner.is_support_esim(&[]), Ok(false));
        assert!(fx.kinds().iter().all(|kind| *kind == EventKind::Debug));
        assert_eq!(
            fx.stages(),
            vec!["isSupportESim_called", "isSupportESim_unsupported_sdk"]
        );
        assert!(fx.provisioner.store().is_empty());
    }

    #[test]
    fn support_check_reports_euicc_state() {
        let enabled = Fixture::new(SimulatedPlatform::android(34));
        assert_eq!(enabled.provisioner.is_support_esim(&[]), Ok(true));

        let disabled = Fixture::new(SimulatedPlatform::android(34).with_euicc_enabled(false));
        assert_eq!(disabled.provisioner.is_support_esim(&[]), Ok(false));

        let missing = Fixture::new(SimulatedPlatform::android(30).without_euicc());
        assert_eq!(missing.provisioner.is_support_esim(&[]), Ok(false));
        assert!(missing
            .stages()
            .contains(&"isSupportESim_no_euicc_manager".to_string()));
    }

    #[test]
    fn ios_support_check_uses_supported_model_list() {
        let fx = Fixture::new(SimulatedPlatform::ios(17).with_model("iPhone14,5"));
        assert_eq!(
            fx.provisioner.is_support_esim(&["iPhone14,5".to_string()]),
            Ok(true)
        );
        assert_eq!(
            fx.provisioner.is_support_esim(&["iPhone9,1".to_string()]),
            Ok(false)
        );
    }

    #[test]
    fn blank_codes_are_rejected_before_dispatch() {
        for blank in ["", "   ", "\t\n"] {
            let fx = Fixture::new(SimulatedPlatform::android(34));

            assert_eq!(
                fx.provisioner.install_esim_profile(blank),
                Err(MethodError::EmptyCode)
            );
            assert!(fx.provisioner.store().is_empty());
            assert!(fx.platform.launches().is_empty());
            assert!(fx.provisioner.active_attempt().is_none());
            assert!(fx.stages().contains(&"empty_activation_code".to_string()));
        }
    }

    #[test]
    fn blank_code_during_pending_install_is_a_validation_error() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        assert_eq!(
            fx.provisioner.install_esim_profile("   "),
            Err(MethodError::EmptyCode)
        );
        assert_eq!(fx.provisioner.store().get().unwrap().as_str(), PROFILE);
        assert_eq!(
            fx.provisioner.active_attempt().unwrap().state,
            AttemptState::AwaitingOsResult
        );
        assert!(!fx.stages().contains(&"install_in_progress".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_code_leaves_expired_attempt_alone() {
        let fx = Fixture::with_store(
            SimulatedPlatform::android(34),
            ActivationCodeStore::new(Some(Duration::from_secs(5))),
        );
        fx.provisioner.install_esim_profile(PROFILE).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(
            fx.provisioner.install_esim_profile(""),
            Err(MethodError::EmptyCode)
        );
        assert!(!fx.provisioner.store().is_empty());
        assert!(fx.provisioner.last_outcome().is_none());
        assert!(fx.provisioner.active_attempt().is_some());
        assert!(!fx.stages().contains(&"activation_code_expired".to_string()));
    }

    #[test]
    fn os_pulls_the_code_then_reports_success() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        let endpoint = crate::endpoint::ProvisioningEndpoint::new(
            Arc::clone(fx.provisioner.store()),
            Arc::clone(fx.provisioner.bus()),
        );

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(true));
        let pulled = endpoint.get_activation_code().unwrap();
        assert_eq!(pulled.as_str(), PROFILE);
        assert_eq!(endpoint.get_activation_code(), Ok(pulled));

        assert!(fx.provisioner.on_activity_result(
            fx.provisioner.config().request_code,
            RESULT_OK,
            &[]
        ));

        assert!(fx.provisioner.store().is_empty());
        assert_eq!(
            endpoint.get_activation_code(),
            Err(crate::endpoint::NO_CODE)
        );
        let stages = fx.stages();
        let provided = stages
            .iter()
            .position(|stage| stage == "activation_code_provided")
            .unwrap();
        let installed = stages
            .iter()
            .position(|stage| stage == "esim_installed")
            .unwrap();
        assert!(provided < installed);
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Succeeded
        );
    }

    #[test]
    fn integrated_install_hands_code_to_os_and_clears_on_success() {
        let fx = Fixture::new(SimulatedPlatform::android(34));

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(true));
        assert_eq!(fx.provisioner.store().get().unwrap().as_str(), PROFILE);
        assert_eq!(
            fx.provisioner.active_attempt().unwrap().state,
            AttemptState::AwaitingOsResult
        );
        let stages = fx.stages();
        assert!(stages.contains(&"dispatched".to_string()));
        assert!(stages.contains(&"activation_intent_launched".to_string()));

        assert!(fx.provisioner.on_activity_result(1001, RESULT_OK, &[]));
        assert!(fx.provisioner.store().is_empty());
        assert!(fx.provisioner.active_attempt().is_none());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Succeeded
        );
        assert!(fx.stages().contains(&"esim_installed".to_string()));
    }

    #[test]
    fn events_never_carry_the_code() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();
        fx.provisioner.on_activity_result(1001, RESULT_OK, &[]);

        for event in fx.events.lock().unwrap().iter() {
            let rendered = event.to_message().to_string();
            assert!(!rendered.contains("04386-AGYFT"), "leaked in {rendered}");
        }
    }

    #[test]
    fn cancellation_is_terminal_and_fail_class() {
        let fx = Fixture::new(SimulatedPlatform::android(35));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        assert!(fx.provisioner.on_activity_result(1001, RESULT_CANCELED, &[]));

        assert!(fx.provisioner.store().is_empty());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Cancelled
        );
        let events = fx.events.lock().unwrap();
        let cancel = events
            .iter()
            .find(|event| event.stage_name() == Some("esim_installation_canceled"))
            .unwrap();
        assert_eq!(cancel.kind(), EventKind::Fail);
    }

    #[test]
    fn unknown_result_code_is_unrecognized_not_failed() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        assert!(fx
            .provisioner
            .on_activity_result(1001, 7, &["detailed_code".to_string()]));

        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Unrecognized
        );
        assert!(fx.provisioner.store().is_empty());
        let events = fx.events.lock().unwrap();
        let unknown = events
            .iter()
            .find(|event| event.kind() == EventKind::Unknown)
            .unwrap();
        assert_eq!(unknown.get("data"), Some(&json!("detailed_code")));
    }

    #[test]
    fn foreign_request_codes_are_ignored() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        assert!(!fx.provisioner.on_activity_result(42, RESULT_OK, &[]));
        assert!(fx.provisioner.store().get().is_some());
        assert_eq!(
            fx.provisioner.active_attempt().unwrap().state,
            AttemptState::AwaitingOsResult
        );
    }

    #[test]
    fn exactly_one_terminal_state_per_awaiting_attempt() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        fx.provisioner.on_activity_result(1001, RESULT_OK, &[]);
        fx.provisioner.on_activity_result(1001, RESULT_CANCELED, &[]);

        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Succeeded
        );
        let finished = fx
            .stages()
            .iter()
            .filter(|stage| *stage == "attempt_finished")
            .count();
        assert_eq!(finished, 1);
    }

    #[test]
    fn legacy_os_falls_back_to_settings_without_touching_store() {
        let fx = Fixture::new(SimulatedPlatform::android(26));

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(false));

        assert!(fx.provisioner.store().is_empty());
        assert!(fx.platform.launches().is_empty());
        assert_eq!(
            fx.platform.settings_opened(),
            vec![SettingsTarget::EsimSettings]
        );
        assert!(fx.kinds().contains(&EventKind::Unsupport));
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::FellBack
        );
    }

    #[test]
    fn exhausted_fallback_fails_the_attempt() {
        let fx = Fixture::new(SimulatedPlatform::android(33).with_resolvable(&[]));

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(false));
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Failed
        );
        assert!(fx.stages().contains(&"settings_not_available".to_string()));
    }

    #[test]
    fn missing_euicc_manager_is_an_error() {
        let fx = Fixture::new(SimulatedPlatform::android(31).without_euicc());

        assert_eq!(
            fx.provisioner.install_esim_profile(PROFILE),
            Err(MethodError::EuiccUnavailable)
        );
        assert!(fx.provisioner.active_attempt().is_none());
        assert!(fx.provisioner.store().is_empty());
    }

    #[test]
    fn launch_failure_returns_false_and_clears() {
        let fx = Fixture::new(SimulatedPlatform::android(34).with_launch_error("activity gone"));

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(false));
        assert!(fx.provisioner.store().is_empty());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Failed
        );
        assert!(fx.stages().contains(&"launch_failed".to_string()));
    }

    #[test]
    fn second_install_is_refused_while_awaiting() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        assert_eq!(
            fx.provisioner.install_esim_profile("LPA:1$other$code"),
            Err(MethodError::InstallInProgress)
        );
        assert_eq!(fx.provisioner.store().get().unwrap().as_str(), PROFILE);
        assert_eq!(fx.platform.launches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_frees_the_slot_for_a_new_install() {
        let fx = Fixture::with_store(
            SimulatedPlatform::android(34),
            ActivationCodeStore::new(Some(Duration::from_secs(60))),
        );
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            fx.provisioner.install_esim_profile("LPA:1$second$code"),
            Ok(true)
        );

        assert!(fx.stages().contains(&"activation_code_expired".to_string()));
        assert_eq!(
            fx.provisioner.store().get().unwrap().as_str(),
            "LPA:1$second$code"
        );
        assert_eq!(fx.platform.launches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_sweeper_fails_abandoned_attempts() {
        let fx = Fixture::with_store(
            SimulatedPlatform::android(34),
            ActivationCodeStore::new(Some(Duration::from_secs(5))),
        );
        let sweeper = fx.provisioner.spawn_retention_sweeper(Duration::from_secs(1));
        fx.provisioner.install_esim_profile(PROFILE).unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;

        assert!(fx.provisioner.active_attempt().is_none());
        assert!(fx.provisioner.store().is_empty());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Failed
        );
        sweeper.abort();
    }

    #[test]
    fn unexpected_fault_becomes_exception_and_frees_slot() {
        let fx = Fixture::new(SimulatedPlatform::android(34).panicking_euicc_lookup());

        let result = fx.provisioner.install_esim_profile(PROFILE);

        assert_eq!(
            result,
            Err(MethodError::Exception("simulated eUICC service crash".into()))
        );
        assert!(fx.provisioner.active_attempt().is_none());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::Failed
        );
        let events = fx.events.lock().unwrap();
        let fault = events
            .iter()
            .find(|event| event.stage_name() == Some("method_exception"))
            .unwrap();
        assert_eq!(fault.get("method"), Some(&json!("installEsimProfile")));
        let trace = fault.get("stackTrace").and_then(Value::as_str).unwrap();
        assert!(!trace.contains("disabled backtrace"));
        let location = fault.get("location").and_then(Value::as_str).unwrap();
        assert!(location.contains("sim.rs"));
    }

    #[test]
    fn ios_install_opens_universal_link() {
        let fx = Fixture::new(SimulatedPlatform::ios(17));

        assert_eq!(fx.provisioner.install_esim_profile(PROFILE), Ok(true));
        let urls = fx.platform.urls_opened();
        assert_eq!(urls.len(), 1);
        let expected = "https://esimsetup.apple.com/esim_qrcode_provisioning?carddata=";
        assert!(urls[0].starts_with(expected));
        assert!(fx.provisioner.store().is_empty());
        assert_eq!(
            fx.provisioner.last_outcome().unwrap().state,
            AttemptState::FellBack
        );
    }

    #[test]
    fn method_calls_route_by_name() {
        let fx = Fixture::new(SimulatedPlatform::android(34));
        let p = &fx.provisioner;

        assert_eq!(p.handle_method_call("isSupportESim", &Value::Null), Ok(json!(true)));
        assert_eq!(
            p.handle_method_call("installEsimProfile", &json!({ "profile": "  " })),
            Err(MethodError::EmptyCode)
        );
        assert_eq!(
            p.handle_method_call("installEsimProfile", &json!({})),
            Err(MethodError::EmptyCode)
        );
        assert_eq!(
            p.handle_method_call("installEsimProfile", &json!({ "profile": PROFILE })),
            Ok(json!(true))
        );
        assert!(p
            .handle_method_call("instructions", &Value::Null)
            .unwrap()
            .as_str()
            .unwrap()
            .starts_with("1. Save QR Code"));
        assert_eq!(
            p.handle_method_call("openUniversalLink", &json!(5)).unwrap_err().code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            p.handle_method_call("selfDestruct", &Value::Null).unwrap_err().code(),
            "NOT_IMPLEMENTED"
        );
    }
}
