// ABOUTME: Confirms remote access is enabled for an app and fetches its feature config.
// ABOUTME: A disabled feature stops the pipeline before any credential request.

use super::ControlPlane;
use crate::error::{Error, Result};
use crate::types::Target;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Configuration variables needed to reach the remote-access backend.
///
/// Only variables belonging to the feature (sharing the exec URL variable's
/// prefix) are kept; the rest of the app's config never leaves the
/// negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureConfig {
    vars: BTreeMap<String, String>,
    exec_url_var: String,
}

impl FeatureConfig {
    /// Build from raw config vars. Fails with `FeatureNotEnabled` when the
    /// exec URL variable is missing.
    pub fn from_vars(
        target: &Target,
        vars: HashMap<String, String>,
        exec_url_var: &str,
    ) -> Result<Self> {
        let prefix = feature_prefix(exec_url_var);
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| name == exec_url_var || name.starts_with(prefix))
            .collect();

        match vars.get(exec_url_var) {
            Some(url) if !url.trim().is_empty() => Ok(Self {
                vars,
                exec_url_var: exec_url_var.to_string(),
            }),
            _ => Err(Error::FeatureNotEnabled {
                target: target.to_string(),
                hint: format!(
                    "{exec_url_var} is not set; the app's dynos may need to be restarted"
                ),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// URL of the exec service that issues credentials.
    pub fn exec_url(&self) -> &str {
        self.vars
            .get(&self.exec_url_var)
            .map(|url| url.trim().trim_end_matches('/'))
            .unwrap_or_default()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// `HEROKU_EXEC_URL` -> `HEROKU_EXEC_`.
fn feature_prefix(exec_url_var: &str) -> &str {
    match exec_url_var.rfind('_') {
        Some(pos) => &exec_url_var[..=pos],
        None => exec_url_var,
    }
}

pub struct ConfigNegotiator {
    control: Arc<dyn ControlPlane>,
    feature: String,
    exec_url_var: String,
}

impl ConfigNegotiator {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        feature: impl Into<String>,
        exec_url_var: impl Into<String>,
    ) -> Self {
        Self {
            control,
            feature: feature.into(),
            exec_url_var: exec_url_var.into(),
        }
    }

    pub async fn fetch_config(&self, target: &Target) -> Result<FeatureConfig> {
        let state = self
            .control
            .feature_state(target.app(), &self.feature)
            .await?;

        if !state.enabled {
            tracing::debug!("feature {} disabled for {}", self.feature, target.app());
            return Err(Error::FeatureNotEnabled {
                target: target.to_string(),
                hint: format!(
                    "enable it with `heroku features:enable {} -a {}` and restart the app",
                    self.feature,
                    target.app()
                ),
            });
        }

        let vars = self.control.config_vars(target.app()).await?;
        FeatureConfig::from_vars(target, vars, &self.exec_url_var)
    }
}
