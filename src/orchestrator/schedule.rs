//! Recurring job requests.
//!
//! The simple path schedules a job daily at an hour of the day; the advanced
//! path takes a full cron expression (seconds, minutes, hours, day of month,
//! month, day of week, optional year). Both are validated locally so a bad
//! request never reaches the executor.

use serde::{Deserialize, Serialize};

use crate::backend::ScheduleSpec;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTiming {
    DailyAt { hour: u32 },
    Cron { expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub config_id: String,
    pub job_name: String,
    pub is_dry_run: bool,
    pub batch_size: u32,
    pub timing: ScheduleTiming,
}

/// Cron expression firing once a day at `hour`:00:00.
pub fn daily_cron(hour: u32) -> EngineResult<String> {
    if hour > 23 {
        return Err(EngineError::validation(format!(
            "Hour must be between 0 and 23, got {}",
            hour
        ))
        .with_fields(["hour"]));
    }
    Ok(format!("0 0 {} * * ?", hour))
}

/// Check the shape of a cron expression and normalize its whitespace.
pub fn validate_cron(expression: &str) -> EngineResult<String> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if !(6..=7).contains(&parts.len()) {
        return Err(EngineError::validation(format!(
            "Cron expression needs 6 or 7 fields, got {}",
            parts.len()
        ))
        .with_fields(["cronExpression"]));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "*?,-/#LW".contains(c);
    if let Some(bad) = parts.iter().find(|p| !p.chars().all(allowed)) {
        return Err(EngineError::validation(format!(
            "Invalid cron field: {}",
            bad
        ))
        .with_fields(["cronExpression"]));
    }
    Ok(parts.join(" "))
}

impl ScheduleRequest {
    pub fn daily(
        config_id: impl Into<String>,
        job_name: impl Into<String>,
        hour: u32,
        is_dry_run: bool,
        batch_size: u32,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            job_name: job_name.into(),
            is_dry_run,
            batch_size,
            timing: ScheduleTiming::DailyAt { hour },
        }
    }

    /// Validate and produce the executor request.
    pub fn to_spec(&self, max_batch_size: u32) -> EngineResult<ScheduleSpec> {
        let mut missing = Vec::new();
        if self.config_id.trim().is_empty() {
            missing.push("configId".to_string());
        }
        if self.job_name.trim().is_empty() {
            missing.push("jobName".to_string());
        }
        if !missing.is_empty() {
            return Err(EngineError::missing_fields(&missing));
        }
        validate_batch_size(self.batch_size, max_batch_size)?;

        let cron_expression = match &self.timing {
            ScheduleTiming::DailyAt { hour } => daily_cron(*hour)?,
            ScheduleTiming::Cron { expression } => validate_cron(expression)?,
        };
        Ok(ScheduleSpec {
            config_id: self.config_id.clone(),
            cron_expression,
            job_name: self.job_name.trim().to_string(),
            is_dry_run: self.is_dry_run,
            batch_size: self.batch_size,
        })
    }
}

pub fn validate_batch_size(batch_size: u32, max: u32) -> EngineResult<()> {
    if batch_size == 0 || batch_size > max {
        return Err(EngineError::validation(format!(
            "Batch size must be between 1 and {}, got {}",
            max, batch_size
        ))
        .with_fields(["batchSize"]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_cron() {
        assert_eq!(daily_cron(0).unwrap(), "0 0 0 * * ?");
        assert_eq!(daily_cron(23).unwrap(), "0 0 23 * * ?");
        let err = daily_cron(25).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.fields, vec!["hour"]);
    }

    #[test]
    fn test_validate_cron() {
        assert_eq!(validate_cron(" 0  30 2 ? * MON-FRI ").unwrap(), "0 30 2 ? * MON-FRI");
        assert!(validate_cron("0 0 3 * * ? 2030").is_ok());
        assert!(validate_cron("0 0 3 * *").is_err());
        assert!(validate_cron("0 0 3 * * ; rm").is_err());
    }

    #[test]
    fn test_to_spec() {
        let spec = ScheduleRequest::daily("acct", " nightly ", 3, true, 200)
            .to_spec(2_000)
            .unwrap();
        assert_eq!(spec.cron_expression, "0 0 3 * * ?");
        assert_eq!(spec.job_name, "nightly");

        let err = ScheduleRequest::daily("", "", 3, true, 200)
            .to_spec(2_000)
            .unwrap_err();
        assert_eq!(err.fields, vec!["configId", "jobName"]);

        assert!(
            ScheduleRequest::daily("acct", "n", 3, true, 0)
                .to_spec(2_000)
                .is_err()
        );
    }
}
