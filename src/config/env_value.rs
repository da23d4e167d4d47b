// ABOUTME: Secret values that may be written literally or pulled from the environment.
// ABOUTME: Keeps API tokens out of config files via `{env: NAME}` references.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use zeroize::Zeroizing;

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    pub fn resolve(&self) -> Result<Zeroizing<String>> {
        match self {
            EnvValue::Literal(s) => Ok(Zeroizing::new(s.clone())),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(Zeroizing::new(val)),
                Err(_) => default
                    .clone()
                    .map(Zeroizing::new)
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

// Literal secrets never reach log output.
impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Literal(_) => f.write_str("Literal(<redacted>)"),
            EnvValue::FromEnv { var, .. } => f.debug_struct("FromEnv").field("var", var).finish(),
        }
    }
}
