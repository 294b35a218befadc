use async_trait::async_trait;

/// Best-effort device location.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Last known `(latitude, longitude)`, or `None` without a fix.
    async fn last_known(&self) -> Option<(f64, f64)>;
}

/// A location configured by the owner.
pub struct FixedLocation {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn last_known(&self) -> Option<(f64, f64)> {
        Some((self.latitude, self.longitude))
    }
}

/// No location source available.
pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn last_known(&self) -> Option<(f64, f64)> {
        None
    }
}
