// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Validates dyno names and normalises API base URLs.

use serde::Deserialize;

use crate::types::DynoName;

pub fn deserialize_dyno_name<'de, D>(deserializer: D) -> Result<DynoName, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DynoName::new(&s).map_err(serde::de::Error::custom)
}

pub fn deserialize_url<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let trimmed = s.trim().trim_end_matches('/');
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(serde::de::Error::custom(format!(
            "URL must start with http:// or https://: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}
