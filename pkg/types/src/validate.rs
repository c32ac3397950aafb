use anyhow::{Result, bail};

use crate::instance::InstanceRecord;
use pkg_constants::lease::MAX_LEASE_DURATION_SECS;

const MAX_NAME_LEN: usize = 255;

/// Validate an application name.
/// Rules: `[A-Za-z0-9._-]`, max 255 chars, must start with a letter or digit.
pub fn validate_app_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("application name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!(
            "application name '{}' exceeds {} characters (got {})",
            name,
            MAX_NAME_LEN,
            name.len()
        );
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        bail!("application name '{}' must start with a letter or digit", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(
            "application name '{}' must contain only letters, digits, '.', '_' and '-'",
            name
        );
    }
    Ok(())
}

/// Validate an instance id: non-empty, no whitespace or path separators.
pub fn validate_instance_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("instance id must not be empty");
    }
    if id.len() > MAX_NAME_LEN {
        bail!("instance id '{}' exceeds {} characters", id, MAX_NAME_LEN);
    }
    if id.chars().any(|c| c.is_whitespace() || c == '/' || c.is_control()) {
        bail!("instance id '{}' must not contain whitespace or '/'", id);
    }
    Ok(())
}

/// Validate a requested lease duration: non-zero and at most
/// `MAX_LEASE_DURATION_SECS`.
pub fn validate_lease_duration(instance_id: &str, duration_secs: u64) -> Result<()> {
    if duration_secs == 0 {
        bail!("instance '{}' requested a zero lease duration", instance_id);
    }
    if duration_secs > MAX_LEASE_DURATION_SECS {
        bail!(
            "instance '{}' requested a {}s lease, the maximum is {}s",
            instance_id,
            duration_secs,
            MAX_LEASE_DURATION_SECS
        );
    }
    Ok(())
}

/// Validate a record submitted for registration.
pub fn validate_record(record: &InstanceRecord) -> Result<()> {
    validate_app_name(&record.app_name)?;
    validate_instance_id(&record.instance_id)?;
    if record.host_name.trim().is_empty() {
        bail!("instance '{}' has an empty host name", record.instance_id);
    }
    validate_lease_duration(&record.instance_id, record.lease_info.duration_secs)?;
    if record.lease_info.renewal_interval_secs == 0 {
        bail!(
            "instance '{}' requested a zero renewal interval",
            record.instance_id
        );
    }
    Ok(())
}
