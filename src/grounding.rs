use crate::error::LiveError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

pub trait LocationProvider: Send + Sync {
    fn current_location(&self) -> Result<LatLng, LiveError>;
}

/// Always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub LatLng);

impl LocationProvider for FixedLocation {
    fn current_location(&self) -> Result<LatLng, LiveError> {
        Ok(self.0)
    }
}

/// The maps-grounding toggle and the location it needs.
///
/// The location is asked for once each time the toggle goes on and is
/// forgotten when it goes off.
pub struct MapsGrounding {
    provider: Box<dyn LocationProvider>,
    enabled: bool,
    location: Option<LatLng>,
}

impl MapsGrounding {
    pub fn new(provider: Box<dyn LocationProvider>) -> Self {
        Self {
            provider,
            enabled: false,
            location: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn location(&self) -> Option<LatLng> {
        self.location
    }

    /// Turning the toggle on fails, and leaves it off, when no location can
    /// be obtained.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), LiveError> {
        if !enabled {
            self.enabled = false;
            self.location = None;
            return Ok(());
        }
        if self.enabled {
            return Ok(());
        }
        match self.provider.current_location() {
            Ok(location) => {
                info!(
                    "[Grounding] User location: {}, {}",
                    location.latitude, location.longitude
                );
                self.location = Some(location);
                self.enabled = true;
                Ok(())
            }
            Err(e) => {
                warn!("[Grounding] Error getting user location: {}", e);
                self.enabled = false;
                self.location = None;
                Err(LiveError::Location(
                    "Could not get user location for Google Maps. Please enable location services."
                        .into(),
                ))
            }
        }
    }

    /// `tools` entry requesting maps grounding, when enabled.
    pub fn tool(&self) -> Option<Value> {
        self.enabled.then(|| json!({ "googleMaps": {} }))
    }

    /// `toolConfig` carrying `retrievalConfig.latLng`, when a location is known.
    pub fn tool_config(&self) -> Option<Value> {
        let location = self.location.filter(|_| self.enabled)?;
        Some(json!({
            "retrievalConfig": {
                "latLng": {
                    "latitude": location.latitude,
                    "longitude": location.longitude,
                }
            }
        }))
    }
}
