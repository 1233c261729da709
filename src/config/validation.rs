use crate::config::types::{
    BrowserConfig, Config, CrawlerConfig, GuardrailConfig, OutputConfig, StagingConfig,
    UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_output_config(&config.output)?;
    validate_browser_config(&config.browser, &config.crawler)?;
    validate_guardrail_config(&config.guardrails)?;
    validate_staging_config(&config.staging)?;

    if config.rank.host_aggregation_threshold == 0 {
        return Err(ConfigError::Validation(
            "host_aggregation_threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_concurrency < 1 || config.max_concurrency > 256 {
        return Err(ConfigError::Validation(format!(
            "max_concurrency must be between 1 and 256, got {}",
            config.max_concurrency
        )));
    }

    if !(config.requests_per_second > 0.0) {
        return Err(ConfigError::Validation(format!(
            "requests_per_second must be > 0, got {}",
            config.requests_per_second
        )));
    }

    if config.burst < 1 {
        return Err(ConfigError::Validation(format!(
            "burst must be >= 1, got {}",
            config.burst
        )));
    }

    if config.page_budget < 1 {
        return Err(ConfigError::Validation(format!(
            "page_budget must be >= 1, got {}",
            config.page_budget
        )));
    }

    if !(0.0..=1.0).contains(&config.browser_ratio_advisory) {
        return Err(ConfigError::Validation(format!(
            "browser_ratio_advisory must be within 0.0..=1.0, got {}",
            config.browser_ratio_advisory
        )));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// The browser pool must be strictly smaller than the HTTP pool
fn validate_browser_config(
    config: &BrowserConfig,
    crawler: &CrawlerConfig,
) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }

    if config.max_sessions < 1 {
        return Err(ConfigError::Validation(
            "max_sessions must be >= 1".to_string(),
        ));
    }

    if crawler.max_concurrency > 1 && config.max_sessions >= crawler.max_concurrency {
        return Err(ConfigError::Validation(format!(
            "max_sessions ({}) must be smaller than max_concurrency ({})",
            config.max_sessions, crawler.max_concurrency
        )));
    }

    if config.session_page_quota < 1 {
        return Err(ConfigError::Validation(
            "session_page_quota must be >= 1".to_string(),
        ));
    }

    if config.page_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "page_timeout_ms must be >= 100ms, got {}ms",
            config.page_timeout_ms
        )));
    }

    if config.max_session_lifetime_secs * 1000 <= config.page_timeout_ms {
        return Err(ConfigError::Validation(
            "max_session_lifetime_secs must exceed page_timeout_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_guardrail_config(config: &GuardrailConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("cpu_soft_percent", config.cpu_soft_percent),
        ("memory_soft_percent", config.memory_soft_percent),
        ("memory_hard_percent", config.memory_hard_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "{} must be within 0..=100, got {}",
                name, value
            )));
        }
    }

    if config.memory_hard_percent < config.memory_soft_percent {
        return Err(ConfigError::Validation(
            "memory_hard_percent must be >= memory_soft_percent".to_string(),
        ));
    }

    if config.window < 1 {
        return Err(ConfigError::Validation("window must be >= 1".to_string()));
    }

    Ok(())
}

fn validate_staging_config(config: &StagingConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "batch_size must be >= 1".to_string(),
        ));
    }

    if config.queue_capacity < config.batch_size {
        return Err(ConfigError::Validation(format!(
            "queue_capacity ({}) must be >= batch_size ({})",
            config.queue_capacity, config.batch_size
        )));
    }

    if config.max_commit_failures < 1 {
        return Err(ConfigError::Validation(
            "max_commit_failures must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("admin@sub.example.com").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("invalid").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@").is_err());
        assert!(validate_email("user@domain").is_err());
    }

    #[test]
    fn test_browser_pool_must_be_smaller() {
        let crawler = CrawlerConfig {
            max_concurrency: 4,
            ..CrawlerConfig::default()
        };
        let mut browser = BrowserConfig {
            max_sessions: 4,
            ..BrowserConfig::default()
        };
        assert!(validate_browser_config(&browser, &crawler).is_err());

        browser.max_sessions = 2;
        assert!(validate_browser_config(&browser, &crawler).is_ok());

        browser.enabled = false;
        browser.max_sessions = 10;
        assert!(validate_browser_config(&browser, &crawler).is_ok());
    }

    #[test]
    fn test_staging_capacity_covers_batch() {
        let mut staging = StagingConfig::default();
        assert!(validate_staging_config(&staging).is_ok());

        staging.queue_capacity = staging.batch_size - 1;
        assert!(validate_staging_config(&staging).is_err());
    }

    #[test]
    fn test_guardrail_percent_range() {
        let mut guardrails = GuardrailConfig::default();
        assert!(validate_guardrail_config(&guardrails).is_ok());

        guardrails.cpu_soft_percent = 150.0;
        assert!(validate_guardrail_config(&guardrails).is_err());

        guardrails.cpu_soft_percent = 80.0;
        guardrails.memory_hard_percent = 50.0;
        assert!(validate_guardrail_config(&guardrails).is_err());
    }

    #[test]
    fn test_rate_must_be_positive() {
        let crawler = CrawlerConfig {
            requests_per_second: 0.0,
            ..CrawlerConfig::default()
        };
        assert!(validate_crawler_config(&crawler).is_err());
    }
}
