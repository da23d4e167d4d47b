// ABOUTME: Test support utilities.
// ABOUTME: Wires an in-process gateway and fake control plane into a RemoteAccess.

use dyno_exec::commands::RemoteAccess;
use dyno_exec::config::{EnvValue, ExecConfig};
use dyno_exec::types::Target;
use std::sync::{Arc, Once};
use std::time::Duration;

// Each test binary only uses some of these modules, so allow dead_code.
#[allow(dead_code)]
pub mod control_plane;
#[allow(dead_code)]
pub mod gateway;

use control_plane::{FakeControlPlane, Scenario};
use gateway::Gateway;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("dyno_exec=debug".parse().unwrap())
            .add_directive("russh=info".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A gateway, a control plane pointing at it, and a configured entry point.
#[allow(dead_code)]
pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub control: FakeControlPlane,
    pub access: RemoteAccess,
    pub target: Target,
}

/// Config for tests: short timeouts, loopback everything.
#[allow(dead_code)]
pub fn test_config(api_url: String) -> ExecConfig {
    ExecConfig {
        api_url,
        api_token: Some(EnvValue::Literal("test-token".to_string())),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
        ..ExecConfig::default()
    }
}

#[allow(dead_code)]
pub async fn harness(scenario: Scenario) -> Harness {
    harness_with(scenario, |config| config).await
}

/// Like `harness`, with a hook to adjust the config.
#[allow(dead_code)]
pub async fn harness_with(
    scenario: Scenario,
    adjust: impl FnOnce(ExecConfig) -> ExecConfig,
) -> Harness {
    init_tracing();
    let gateway = Arc::new(Gateway::start().await);
    harness_on(gateway, scenario, adjust).await
}

/// Build a harness around an already running gateway.
#[allow(dead_code)]
pub async fn harness_on(
    gateway: Arc<Gateway>,
    scenario: Scenario,
    adjust: impl FnOnce(ExecConfig) -> ExecConfig,
) -> Harness {
    init_tracing();
    let control = FakeControlPlane::start(scenario, Arc::clone(&gateway)).await;
    let config = adjust(test_config(control.api_url()));
    let access = RemoteAccess::new(config).expect("remote access context");
    let target = Target::parse("my-app", "web.1").expect("valid target");

    Harness {
        gateway,
        control,
        access,
        target,
    }
}
