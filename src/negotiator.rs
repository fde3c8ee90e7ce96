use crate::engine::{LocalCapabilities, MediaEngine};
use crate::error::NegotiationError;
use log::{info, warn};
use roomcore::CapabilityDescriptor;
use serde_json::Value;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Loaded {
    descriptor: CapabilityDescriptor,
    local: LocalCapabilities,
}

/// Holds the room's capability descriptor and the local capability set derived from it.
///
/// Transport creation and consumption are refused with
/// [`NegotiationError::NotReady`] until [`load`](Self::load) has succeeded.
pub struct CapabilityNegotiator {
    engine: Arc<dyn MediaEngine>,
    loaded: RwLock<Option<Loaded>>,
}

impl CapabilityNegotiator {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            loaded: RwLock::new(None),
        }
    }

    /// Validates the descriptor from a join confirmation and derives local capabilities.
    ///
    /// A failed load leaves any previously loaded capabilities in place.
    pub async fn load(
        &self,
        remote: Option<&Value>,
    ) -> Result<CapabilityDescriptor, NegotiationError> {
        let descriptor = match CapabilityDescriptor::parse(remote) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(target: "Room/Negotiator", "Rejecting capability descriptor: {e}");
                return Err(e.into());
            }
        };
        let local = self.engine.create_capability_set(&descriptor).await?;
        info!(
            target: "Room/Negotiator",
            "Capabilities loaded (codecs: {:?})",
            descriptor.codec_names()
        );
        if let Ok(mut loaded) = self.loaded.write() {
            *loaded = Some(Loaded {
                descriptor: descriptor.clone(),
                local,
            });
        }
        Ok(descriptor)
    }

    pub fn local(&self) -> Result<LocalCapabilities, NegotiationError> {
        self.loaded
            .read()
            .ok()
            .and_then(|l| l.as_ref().map(|l| l.local.clone()))
            .ok_or(NegotiationError::NotReady)
    }

    pub fn descriptor(&self) -> Option<CapabilityDescriptor> {
        self.loaded
            .read()
            .ok()
            .and_then(|l| l.as_ref().map(|l| l.descriptor.clone()))
    }

    pub fn is_loaded(&self) -> bool {
        self.local().is_ok()
    }

    pub fn reset(&self) {
        if let Ok(mut loaded) = self.loaded.write() {
            *loaded = None;
        }
    }
}
