//! Pull-style service the OS activation broker calls to fetch the pending
//! activation code.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bus::EventBus;
use crate::error::CodeUnavailable;
use crate::event::Event;
use crate::store::{ActivationCode, ActivationCodeStore};

/// Intent action the OS uses when binding the provisioning service.
pub const BIND_CARRIER_PROVISIONING_SERVICE: &str =
    "android.service.euicc.action.BIND_CARRIER_PROVISIONING_SERVICE";

pub const NO_CODE: CodeUnavailable = CodeUnavailable {
    code: -1,
    reason: "No activation code available",
};

pub const NO_CODE_FOR_EID: CodeUnavailable = CodeUnavailable {
    code: -2,
    reason: "No activation code for EID",
};

/// Read-only view over the handoff store. Repeated calls return the same
/// answer and never change the store.
pub struct ProvisioningEndpoint {
    store: Arc<ActivationCodeStore>,
    bus: Arc<EventBus>,
}

impl ProvisioningEndpoint {
    pub fn new(store: Arc<ActivationCodeStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn on_create(&self) {
        info!("provisioning service created");
        self.bus.publish(Event::debug("service_created"));
    }

    pub fn on_bind(&self, action: Option<&str>) {
        debug!("provisioning service bound: {action:?}");
        self.bus.publish(
            Event::debug("service_bound").with("action", action.unwrap_or("unknown")),
        );
    }

    pub fn on_destroy(&self) {
        info!("provisioning service destroyed");
        self.bus.publish(Event::debug("service_destroyed"));
    }

    pub fn get_activation_code(&self) -> Result<ActivationCode, CodeUnavailable> {
        let code = self.store.get();
        self.bus.publish(
            Event::debug("getActivationCode_called")
                .with("hasCode", code.is_some())
                .with("codeLength", code.as_ref().map_or(0, ActivationCode::char_len)),
        );
        match code {
            Some(code) => {
                self.bus.publish(
                    Event::status("activation_code_provided").with("codeLength", code.char_len()),
                );
                Ok(code)
            }
            None => {
                self.bus.publish(Event::status("activation_code_missing"));
                Err(NO_CODE)
            }
        }
    }

    /// The EID is only reported; a single pending code serves every card.
    pub fn get_activation_code_for_eid(
        &self,
        eid: &str,
    ) -> Result<ActivationCode, CodeUnavailable> {
        let code = self.store.get();
        self.bus.publish(
            Event::debug("getActivationCodeForEid_called")
                .with("eid", eid)
                .with("hasCode", code.is_some())
                .with("codeLength", code.as_ref().map_or(0, ActivationCode::char_len)),
        );
        match code {
            Some(code) => {
                self.bus.publish(
                    Event::status("activation_code_provided_for_eid")
                        .with("eid", eid)
                        .with("codeLength", code.char_len()),
                );
                Ok(code)
            }
            None => {
                self.bus
                    .publish(Event::status("activation_code_missing_for_eid").with("eid", eid));
                Err(NO_CODE_FOR_EID)
            }
        }
    }
}
