//! Emergency-contact alerting for suspicious movement.

use crate::contacts::ContactsStore;
use crate::location::LocationProvider;
use crate::messaging::{self, AlertEvent, MessageSink};
use std::sync::Arc;
use std::time::Duration;

/// Placeholder used in place of a map link when there is no fix.
pub const LOCATION_FALLBACK: &str = "Location unavailable";

const LOCATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on delivering one movement alert to every contact.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Map link for a fix, or [`LOCATION_FALLBACK`].
pub fn location_link(location: Option<(f64, f64)>) -> String {
    match location {
        Some((lat, lon)) => format!("https://www.google.com/maps?q={lat},{lon}"),
        None => LOCATION_FALLBACK.to_string(),
    }
}

pub fn movement_message(location: Option<(f64, f64)>) -> String {
    format!(
        "An unusual movement occurred. Make sure your device is safe with you.\n\nTrack your device here: {}",
        location_link(location)
    )
}

pub struct ContactAlerter {
    contacts: ContactsStore,
    location: Arc<dyn LocationProvider>,
    sink: Arc<dyn MessageSink>,
    location_timeout: Duration,
    delivery_timeout: Duration,
}

impl ContactAlerter {
    pub fn new(
        contacts: ContactsStore,
        location: Arc<dyn LocationProvider>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            contacts,
            location,
            sink,
            location_timeout: LOCATION_TIMEOUT,
            delivery_timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Message every emergency contact. Returns the number reached.
    ///
    /// A missing location or unreadable contacts list degrades the alert;
    /// it never fails it. Delivery that outlasts the delivery timeout is
    /// abandoned and counts as nobody reached.
    pub async fn alert_contacts(&self) -> usize {
        let location = tokio::time::timeout(self.location_timeout, self.location.last_known())
            .await
            .unwrap_or_else(|_| {
                tracing::warn!("location lookup timed out");
                None
            });

        let contacts = self.contacts.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read emergency contacts");
            Vec::new()
        });
        if contacts.is_empty() {
            tracing::warn!("no emergency contacts configured; movement alert not sent");
            return 0;
        }

        let event = AlertEvent {
            message: movement_message(location),
            attachment: None,
            recipients: contacts.into_iter().map(|c| c.recipient).collect(),
        };
        match tokio::time::timeout(
            self.delivery_timeout,
            messaging::deliver(self.sink.as_ref(), &event),
        )
        .await
        {
            Ok(delivered) => delivered,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.delivery_timeout.as_secs_f32(),
                    "movement alert delivery timed out"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{FixedLocation, NoLocation};
    use crate::messaging::testing::RecordingSink;
    use crate::testutil::scratch_dir;
    use async_trait::async_trait;

    #[test]
    fn test_message_with_fix() {
        let msg = movement_message(Some((51.5, -0.12)));
        assert!(msg.starts_with("An unusual movement occurred."));
        assert!(msg.ends_with("https://www.google.com/maps?q=51.5,-0.12"));
    }

    #[test]
    fn test_message_without_fix_uses_fallback() {
        let msg = movement_message(None);
        assert!(msg.ends_with("Track your device here: Location unavailable"));
    }

    #[tokio::test]
    async fn test_alert_each_contact_without_fix() {
        let dir = scratch_dir("alerting");
        let contacts = ContactsStore::new(dir.join("contacts.txt"));
        contacts.add("Mom", "+15550100").unwrap();
        contacts.add("Dad", "+15550101").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let alerter = ContactAlerter::new(contacts, Arc::new(NoLocation), sink.clone());
        assert_eq!(alerter.alert_contacts().await, 2);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.text.contains(LOCATION_FALLBACK)));
        assert_eq!(sent[0].recipient, "+15550100");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_alert_includes_fixed_location() {
        let dir = scratch_dir("alerting");
        let contacts = ContactsStore::new(dir.join("contacts.txt"));
        contacts.add("Mom", "+15550100").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let location = Arc::new(FixedLocation {
            latitude: 40.0,
            longitude: 2.5,
        });
        let alerter = ContactAlerter::new(contacts, location, sink.clone());
        alerter.alert_contacts().await;
        assert!(sink.sent()[0].text.contains("maps?q=40,2.5"));
        std::fs::remove_dir_all(&dir).ok();
    }

    struct StuckLocation;

    #[async_trait]
    impl LocationProvider for StuckLocation {
        async fn last_known(&self) -> Option<(f64, f64)> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_slow_location_falls_back() {
        let dir = scratch_dir("alerting");
        let contacts = ContactsStore::new(dir.join("contacts.txt"));
        contacts.add("Mom", "+15550100").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let mut alerter = ContactAlerter::new(contacts, Arc::new(StuckLocation), sink.clone());
        alerter.location_timeout = Duration::from_millis(20);
        assert_eq!(alerter.alert_contacts().await, 1);
        assert!(sink.sent()[0].text.contains(LOCATION_FALLBACK));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stalled_sink_is_abandoned() {
        let dir = scratch_dir("alerting");
        let contacts = ContactsStore::new(dir.join("contacts.txt"));
        contacts.add("Mom", "+15550100").unwrap();

        let sink = Arc::new(RecordingSink {
            hang: true,
            ..Default::default()
        });
        let alerter = ContactAlerter::new(contacts, Arc::new(NoLocation), sink)
            .with_delivery_timeout(Duration::from_millis(30));
        assert_eq!(alerter.alert_contacts().await, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_no_contacts_sends_nothing() {
        let dir = scratch_dir("alerting");
        let sink = Arc::new(RecordingSink::default());
        let alerter = ContactAlerter::new(
            ContactsStore::new(dir.join("contacts.txt")),
            Arc::new(NoLocation),
            sink.clone(),
        );
        assert_eq!(alerter.alert_contacts().await, 0);
        assert!(sink.sent().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
