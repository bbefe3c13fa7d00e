use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::models::Location;
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    pub timeout: Duration,
    pub high_accuracy: bool,
    /// Oldest cached fix the provider may return. Zero asks for a fresh one.
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            high_accuracy: true,
            maximum_age: Duration::ZERO,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("position lookup timed out")]
    Timeout,

    #[error("geolocation is not supported here")]
    Unsupported,
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn current_position(&self, options: &PositionOptions) -> Result<Location, GeolocationError>;
}

/// A device without positioning.
pub struct NoGeolocation;

#[async_trait]
impl GeolocationProvider for NoGeolocation {
    async fn current_position(&self, _options: &PositionOptions) -> Result<Location, GeolocationError> {
        Err(GeolocationError::Unsupported)
    }
}

/// Reports configured coordinates, stamped at lookup time.
pub struct FixedPosition {
    latitude: f64,
    longitude: f64,
}

impl FixedPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

#[async_trait]
impl GeolocationProvider for FixedPosition {
    async fn current_position(&self, _options: &PositionOptions) -> Result<Location, GeolocationError> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(GeolocationError::Unavailable(format!(
                "coordinates out of range: {}, {}",
                self.latitude, self.longitude
            )));
        }
        Ok(Location {
            latitude: self.latitude,
            longitude: self.longitude,
            recorded_at: utils::epoch_millis(),
        })
    }
}
