use tracing::{debug, info, warn};
use url::Url;

use crate::bus::EventBus;
use crate::config::EsimConfig;
use crate::event::{Event, EventKind};
use crate::platform::{EsimPlatform, OsFamily, SettingsTarget, BROKER_SDK, MIN_ESIM_SDK};
use crate::store::{ActivationCode, ActivationCodeStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    SdkBelowMinimum,
    EuiccDisabled,
    SdkBelowBroker,
}

impl FallbackReason {
    pub fn tag(self) -> &'static str {
        match self {
            FallbackReason::SdkBelowMinimum => "SDK<28",
            FallbackReason::EuiccDisabled => "EUICC_DISABLED",
            FallbackReason::SdkBelowBroker => "SDK<34",
        }
    }
}

/// Platform bucket deciding which provisioning path is legal. Assessed once
/// per attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityTier {
    Integrated,
    Fallback(FallbackReason),
    NoEuiccManager,
    UniversalLink,
}

impl CapabilityTier {
    pub fn assess(platform: &dyn EsimPlatform) -> Self {
        if platform.os_family() == OsFamily::Ios {
            return CapabilityTier::UniversalLink;
        }
        let sdk = platform.os_version();
        if sdk < MIN_ESIM_SDK {
            return CapabilityTier::Fallback(FallbackReason::SdkBelowMinimum);
        }
        let euicc = match platform.euicc() {
            Ok(Some(info)) => info,
            Ok(None) => return CapabilityTier::NoEuiccManager,
            Err(err) => {
                warn!("eUICC manager lookup failed: {err}");
                return CapabilityTier::NoEuiccManager;
            }
        };
        if !euicc.enabled {
            CapabilityTier::Fallback(FallbackReason::EuiccDisabled)
        } else if sdk < BROKER_SDK {
            CapabilityTier::Fallback(FallbackReason::SdkBelowBroker)
        } else {
            CapabilityTier::Integrated
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CapabilityTier::Integrated => "integrated",
            CapabilityTier::Fallback(_) => "fallback",
            CapabilityTier::NoEuiccManager => "no_euicc_manager",
            CapabilityTier::UniversalLink => "universal_link",
        }
    }
}

pub struct DispatchContext<'a> {
    pub platform: &'a dyn EsimPlatform,
    pub bus: &'a EventBus,
    pub store: &'a ActivationCodeStore,
    pub config: &'a EsimConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Control went to the OS UI; a result arrives later under `request_code`.
    Launched { request_code: i32 },
    LaunchFailed { error: String },
    SettingsOpened(SettingsTarget),
    SettingsUnavailable,
    LinkOpened,
    LinkFailed,
}

impl DispatchOutcome {
    /// The boolean reported back to the caller of `installEsimProfile`.
    pub fn installed_directly(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Launched { .. } | DispatchOutcome::LinkOpened
        )
    }
}

pub trait ProvisioningStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn dispatch(&self, ctx: &DispatchContext<'_>, code: &ActivationCode) -> DispatchOutcome;
}

pub fn strategy_for(tier: CapabilityTier) -> Option<Box<dyn ProvisioningStrategy>> {
    match tier {
        CapabilityTier::Integrated => Some(Box::new(IntegratedFlow)),
        CapabilityTier::Fallback(reason) => Some(Box::new(SettingsFallback { reason })),
        CapabilityTier::UniversalLink => Some(Box::new(UniversalLink)),
        CapabilityTier::NoEuiccManager => None,
    }
}

/// Stores the code for the carrier provisioning service, then launches the
/// system activation UI.
pub struct IntegratedFlow;

impl ProvisioningStrategy for IntegratedFlow {
    fn name(&self) -> &'static str {
        "integrated"
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, code: &ActivationCode) -> DispatchOutcome {
        ctx.bus.publish(
            Event::status("storing_activation_code").with("codeLength", code.char_len()),
        );
        ctx.store.set(code.clone());

        ctx.bus.publish(Event::status("launching_euicc_activation"));
        let request_code = ctx.config.request_code;
        match ctx.platform.launch_activation(request_code) {
            Ok(()) => {
                info!("eUICC activation launched (request code {request_code})");
                DispatchOutcome::Launched { request_code }
            }
            Err(err) => {
                warn!("eUICC activation launch failed: {err}");
                ctx.store.clear();
                ctx.bus
                    .publish(Event::fail("launch_failed").with("error", err.to_string()));
                DispatchOutcome::LaunchFailed {
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Leaves the code alone and sends the user to a settings screen instead.
pub struct SettingsFallback {
    pub reason: FallbackReason,
}

impl ProvisioningStrategy for SettingsFallback {
    fn name(&self) -> &'static str {
        "settings_fallback"
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, _code: &ActivationCode) -> DispatchOutcome {
        let sdk = ctx.platform.os_version();
        match self.reason {
            FallbackReason::SdkBelowMinimum => ctx.bus.publish(
                Event::new(EventKind::Unsupport)
                    .with("reason", self.reason.tag())
                    .with("sdk", sdk),
            ),
            FallbackReason::EuiccDisabled => ctx
                .bus
                .publish(Event::new(EventKind::Unsupport).with("reason", self.reason.tag())),
            FallbackReason::SdkBelowBroker => ctx.bus.publish(
                Event::status("fallback_to_settings")
                    .with("reason", self.reason.tag())
                    .with("sdk", sdk),
            ),
        }
        open_settings_fallback(ctx)
    }
}

/// Opens the first resolvable settings screen from
/// [`SettingsTarget::FALLBACK_ORDER`].
pub fn open_settings_fallback(ctx: &DispatchContext<'_>) -> DispatchOutcome {
    let Some(target) = SettingsTarget::FALLBACK_ORDER
        .into_iter()
        .find(|target| ctx.platform.can_resolve(*target))
    else {
        ctx.bus.publish(
            Event::fail("settings_not_available")
                .with("reason", "eSIM settings not available on this device"),
        );
        return DispatchOutcome::SettingsUnavailable;
    };

    ctx.bus
        .publish(Event::status("opening_settings").with("action", target.action()));
    match ctx.platform.open_settings(target) {
        Ok(()) => DispatchOutcome::SettingsOpened(target),
        Err(err) => {
            ctx.bus
                .publish(Event::fail("settings_open_failed").with("error", err.to_string()));
            DispatchOutcome::SettingsUnavailable
        }
    }
}

/// Hands the code to the vendor's web provisioning page through an external
/// deep link.
pub struct UniversalLink;

impl ProvisioningStrategy for UniversalLink {
    fn name(&self) -> &'static str {
        "universal_link"
    }

    fn dispatch(&self, ctx: &DispatchContext<'_>, code: &ActivationCode) -> DispatchOutcome {
        open_universal_link(ctx, code)
    }
}

pub fn build_universal_link(base: &str, code: &ActivationCode) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("carddata", code.as_str());
    Ok(url)
}

pub fn open_universal_link(ctx: &DispatchContext<'_>, code: &ActivationCode) -> DispatchOutcome {
    let url = match build_universal_link(&ctx.config.universal_link_base, code) {
        Ok(url) => url,
        Err(err) => {
            ctx.bus.publish(
                Event::fail("universal_link_invalid").with("error", err.to_string()),
            );
            return DispatchOutcome::LinkFailed;
        }
    };

    ctx.bus.publish(
        Event::status("opening_universal_link").with("codeLength", code.char_len()),
    );
    debug!("opening universal link on {}", url.host_str().unwrap_or("?"));
    if ctx.platform.open_url(url.as_str()) {
        ctx.bus.publish(Event::status("universal_link_opened"));
        DispatchOutcome::LinkOpened
    } else {
        ctx.bus.publish(Event::fail("universal_link_failed"));
        DispatchOutcome::LinkFailed
    }
}
