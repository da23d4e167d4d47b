// ABOUTME: Validated domain types for remote-access targets.
// ABOUTME: App and dyno names are checked before any network request is made.

mod app_name;
mod target;

pub use app_name::{AppName, AppNameError};
pub use target::{DynoName, DynoNameError, Target, TargetError};
