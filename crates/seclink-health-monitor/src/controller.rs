use std::sync::Arc;

use log::info;
use seclink_commons::ConnectionHealth;
use tokio::sync::{
    broadcast,
    Mutex,
    RwLock,
};
use tokio::task::JoinHandle;

use crate::monitor::HealthMonitor;
use crate::types::HealthMonitorError;

/// Owns the monitor task: at most one sweep loop runs at a time.
pub struct HealthMonitorController {
    monitor: Arc<HealthMonitor>,
    state: Arc<ControllerState>,
}

struct ControllerState {
    task_handle: RwLock<Option<JoinHandle<()>>>,
    is_running: Mutex<bool>,
}

impl HealthMonitorController {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self {
            monitor,
            state: Arc::new(ControllerState {
                task_handle: RwLock::new(None),
                is_running: Mutex::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionHealth> {
        self.monitor.subscribe()
    }

    pub async fn start(&self) -> Result<(), HealthMonitorError> {
        let mut running = self.state.is_running.lock().await;
        if *running {
            return Err(HealthMonitorError::AlreadyRunning);
        }

        info!("starting health monitor");

        let handle = tokio::spawn(self.monitor.clone().run());

        let mut task_handle = self.state.task_handle.write().await;
        *task_handle = Some(handle);
        *running = true;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HealthMonitorError> {
        let mut running = self.state.is_running.lock().await;
        if !*running {
            return Err(HealthMonitorError::NotRunning);
        }

        info!("stopping health monitor");

        let handle = {
            let mut task_handle = self.state.task_handle.write().await;
            task_handle.take()
        };

        if let Some(handle) = handle {
            handle.abort();
            if (handle.await).is_err() {}
        }
        *running = false;
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), HealthMonitorError> {
        if self.is_running().await {
            self.stop().await?;
        }
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.is_running.lock().await
    }
}
