//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one frontend
/// - Non-empty, unique frontend names
/// - No duplicate listen addresses, including the admin address
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.frontends.is_empty() {
        errors.push("at least one frontend must be defined".to_string());
    }

    let mut frontend_names = HashSet::new();
    let mut listen_addresses = HashSet::new();

    for frontend in &config.frontends {
        if frontend.name.is_empty() {
            errors.push("frontend name cannot be empty".to_string());
        }

        if !frontend_names.insert(&frontend.name) {
            errors.push(format!("duplicate frontend name: {}", frontend.name));
        }

        // Port 0 asks the OS for a fresh port, so it never collides.
        if frontend.listen.port() != 0 && !listen_addresses.insert(frontend.listen) {
            errors.push(format!(
                "duplicate listen address: {} (frontend: {})",
                frontend.listen, frontend.name
            ));
        }
    }

    let admin = &config.global.admin;
    if admin.enabled && admin.address.port() != 0 && listen_addresses.contains(&admin.address) {
        errors.push(format!(
            "admin address {} is also used by a frontend",
            admin.address
        ));
    }

    if admin.enabled && !admin.metrics_path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            admin.metrics_path
        ));
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn frontend(name: &str, listen: &str) -> FrontendConfig {
        FrontendConfig {
            name: name.to_string(),
            listen: listen.parse().unwrap(),
            drain_type: None,
        }
    }

    fn minimal_config() -> Config {
        Config {
            global: GlobalConfig::default(),
            drain: DrainConfig::default(),
            frontends: vec![frontend("web", "127.0.0.1:8080")],
        }
    }

    #[test]
    fn test_valid_config() {
        let config = minimal_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_no_frontends() {
        let mut config = minimal_config();
        config.frontends.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("at least one frontend"));
    }

    #[test]
    fn test_empty_frontend_name() {
        let mut config = minimal_config();
        config.frontends[0].name.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("name cannot be empty"));
    }

    #[test]
    fn test_duplicate_frontend_names() {
        let mut config = minimal_config();
        config.frontends.push(frontend("web", "127.0.0.1:8081"));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate frontend name"));
    }

    #[test]
    fn test_duplicate_listen_address() {
        let mut config = minimal_config();
        config.frontends.push(frontend("api", "127.0.0.1:8080"));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate listen address"));
    }

    #[test]
    fn test_ephemeral_ports_do_not_collide() {
        let mut config = minimal_config();
        config.frontends = vec![
            frontend("a", "127.0.0.1:0"),
            frontend("b", "127.0.0.1:0"),
        ];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_admin_address_collision() {
        let mut config = minimal_config();
        config.global.admin.address = "127.0.0.1:8080".parse().unwrap();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("admin address"));

        config.global.admin.enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        config.global.admin.metrics_path = "metrics".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("invalid log level"));
        assert!(err.contains("must start with '/'"));
    }
}
