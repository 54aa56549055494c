use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("worker_count must be positive")]
    NoWorkers,

    #[error("queue_capacity must be positive")]
    EmptyQueue,

    #[error("max_execution_time_secs must be positive")]
    InvalidExecutionTime,

    #[error("allowed_script_kinds must not be empty")]
    NoScriptKinds,

    #[error("script kind '{kind}' has no container image configured")]
    MissingImage { kind: String },

    #[error("noise_epsilon must be positive when enable_noise is set: {value}")]
    InvalidEpsilon { value: f64 },

    #[error("min_cohort_size must be non-negative: {value}")]
    InvalidCohortSize { value: i64 },

    #[error("data_root must not be empty")]
    EmptyDataRoot,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_execution(config)?;
    validate_privacy(config)?;
    validate_data(config)?;
    Ok(())
}

fn validate_execution(config: &Config) -> Result<(), ValidationError> {
    let exec = &config.execution;

    if exec.worker_count == 0 {
        return Err(ValidationError::NoWorkers);
    }
    if exec.queue_capacity == 0 {
        return Err(ValidationError::EmptyQueue);
    }
    if exec.max_execution_time_secs == 0 {
        return Err(ValidationError::InvalidExecutionTime);
    }
    if exec.allowed_script_kinds.is_empty() {
        return Err(ValidationError::NoScriptKinds);
    }

    // Every admitted kind needs an image so container mode can launch it.
    for kind in &exec.allowed_script_kinds {
        if !exec.images.contains_key(kind.as_str()) {
            return Err(ValidationError::MissingImage {
                kind: kind.as_str().to_string(),
            });
        }
    }

    Ok(())
}

fn validate_privacy(config: &Config) -> Result<(), ValidationError> {
    let privacy = &config.privacy;

    if privacy.min_cohort_size < 0 {
        return Err(ValidationError::InvalidCohortSize {
            value: privacy.min_cohort_size,
        });
    }
    if privacy.enable_noise && privacy.noise_epsilon <= 0.0 {
        return Err(ValidationError::InvalidEpsilon {
            value: privacy.noise_epsilon,
        });
    }

    Ok(())
}

fn validate_data(config: &Config) -> Result<(), ValidationError> {
    if config.data.data_root.as_os_str().is_empty() {
        return Err(ValidationError::EmptyDataRoot);
    }
    Ok(())
}
