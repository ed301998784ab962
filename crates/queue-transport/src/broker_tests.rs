//! Tests for broker types.

use super::*;

#[test]
fn test_provider_message_limits() {
    assert!(ProviderType::InMemory.max_message_size() > ProviderType::AzureServiceBus.max_message_size());
    assert_eq!(ProviderType::AzureServiceBus.max_message_size(), 256 * 1024);
}

#[test]
fn test_queue_description_defaults() {
    let name = QueueName::new("orders".to_string()).unwrap();
    let description = QueueDescription::new(name.clone());

    assert_eq!(description.name, name);
    assert_eq!(description.lock_duration, Duration::from_secs(30));
    assert_eq!(description.max_size_mb, 1024);
    assert_eq!(description.max_delivery_count, 6);
    assert_eq!(description.duplicate_detection_window, Duration::from_secs(600));
    assert!(!description.requires_session);
}

#[test]
fn test_queue_description_matches_configured_defaults() {
    let name = QueueName::new("orders".to_string()).unwrap();

    let description = QueueDescription::new(name.clone());

    assert_eq!(description, QueueSettings::default().to_description(name));
    assert_eq!(
        description.default_message_ttl,
        Duration::from_millis(crate::config::DEFAULT_MESSAGE_TTL_MS)
    );
}
