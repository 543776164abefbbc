use std::time::Duration;

use crate::{ConfigError, Limit};

/// Environment variable holding the initial concurrency limit.
pub const LIMIT_ENV: &str = "ADMISSION_LIMIT";

/// Environment variable holding the job timeout, in whole seconds.
pub const JOB_TIMEOUT_ENV: &str = "ADMISSION_JOB_TIMEOUT_SECS";

/// Configuration for an [AdmissionController](crate::AdmissionController).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerConfig {
    limit: Limit,
    job_timeout: Option<Duration>,
}

impl ControllerConfig {
    /// Configuration with the given initial limit and no job timeout.
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            job_timeout: None,
        }
    }

    /// The initial concurrency limit.
    pub fn with_limit(self, limit: Limit) -> Self {
        Self { limit, ..self }
    }

    /// Cancel jobs created through
    /// [releasing_job](crate::AdmissionController::releasing_job) after this long, releasing
    /// their slot.
    ///
    /// Without a timeout, a job which never finishes holds its slot forever.
    pub fn with_job_timeout(self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "job timeout must be non-zero");
        Self {
            job_timeout: Some(timeout),
            ..self
        }
    }

    /// Reads `ADMISSION_LIMIT` and `ADMISSION_JOB_TIMEOUT_SECS`, falling back to the defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [from_env](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(limit) = lookup(LIMIT_ENV) {
            config = config.with_limit(limit.parse()?);
        }

        if let Some(timeout) = lookup(JOB_TIMEOUT_ENV) {
            let secs = timeout
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidTimeout(timeout))?;
            config = config.with_job_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// The initial concurrency limit.
    pub fn limit(&self) -> Limit {
        self.limit
    }

    /// The job timeout, if any.
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout
    }
}
