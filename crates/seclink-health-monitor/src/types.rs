use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Spacing between probe sweeps.
    pub check_interval: Duration,
    /// Ceiling on a single probe; an overrun counts as Failed.
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum HealthMonitorError {
    AlreadyRunning,
    NotRunning,
    NotInstalled,
    AlreadyInstalled,
}

impl fmt::Display for HealthMonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthMonitorError::AlreadyRunning => write!(f, "Health monitor is already running"),
            HealthMonitorError::NotRunning => write!(f, "Health monitor is not running"),
            HealthMonitorError::NotInstalled => write!(f, "Health monitor is not installed"),
            HealthMonitorError::AlreadyInstalled => {
                write!(f, "Health monitor is already installed")
            }
        }
    }
}

impl std::error::Error for HealthMonitorError {}
