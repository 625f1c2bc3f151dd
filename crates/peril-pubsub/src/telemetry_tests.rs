use super::*;

#[test]
fn test_second_initialisation_is_rejected() {
    let config = LoggingConfig {
        level: "peril_pubsub=debug".to_string(),
        json_format: true,
    };

    assert!(init_logging(&config).is_ok());
    assert!(matches!(
        init_logging(&config),
        Err(ConfigurationError::Invalid { .. })
    ));
}
