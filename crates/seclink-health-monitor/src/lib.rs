mod controller;
mod monitor;
mod types;

use std::sync::Arc;

use seclink_commons::ConnectionHealth;
use tokio::sync::broadcast;

pub use controller::HealthMonitorController;
pub use monitor::{
    ChannelDirectory,
    ConnectionProbe,
    HealthMonitor,
};
pub use types::{
    HealthMonitorError,
    MonitorConfig,
};

static CONTROLLER: tokio::sync::OnceCell<HealthMonitorController> =
    tokio::sync::OnceCell::const_new();

/// Install the process-wide monitor instance. Call once during startup,
/// before `start`.
pub fn install(
    directory: Arc<dyn ChannelDirectory>, probe: Arc<dyn ConnectionProbe>, config: MonitorConfig,
) -> Result<(), HealthMonitorError> {
    let monitor = Arc::new(HealthMonitor::new(directory, probe, config));
    CONTROLLER
        .set(HealthMonitorController::new(monitor))
        .map_err(|_| HealthMonitorError::AlreadyInstalled)
}

fn installed() -> Result<&'static HealthMonitorController, HealthMonitorError> {
    CONTROLLER.get().ok_or(HealthMonitorError::NotInstalled)
}

pub async fn start() -> Result<(), HealthMonitorError> {
    installed()?.start().await
}

pub async fn stop() -> Result<(), HealthMonitorError> {
    installed()?.stop().await
}

pub async fn restart() -> Result<(), HealthMonitorError> {
    installed()?.restart().await
}

pub async fn is_running() -> bool {
    match installed() {
        Ok(controller) => controller.is_running().await,
        Err(_) => false,
    }
}

/// Health-change stream for the installed monitor, for the session manager
/// to consume via `attach_health_stream`.
pub fn subscribe() -> Result<broadcast::Receiver<ConnectionHealth>, HealthMonitorError> {
    Ok(installed()?.subscribe())
}
