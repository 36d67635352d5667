use std::sync::Arc;

use crate::config::{AgentIdentity, ConfigCache};
use crate::dispatch::{DispatchMonitor, TaskQueue};
use crate::supervisor::HostProcessSupervisor;
use crate::task::TaskManager;

pub struct AppState {
    pub config: Arc<ConfigCache>,
    pub identity: AgentIdentity,
    pub tasks: Arc<TaskManager>,
    pub queue: Arc<TaskQueue>,
    pub monitor: Arc<DispatchMonitor>,
    pub supervisor: Arc<HostProcessSupervisor>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigCache>,
        identity: AgentIdentity,
        tasks: Arc<TaskManager>,
        queue: Arc<TaskQueue>,
        monitor: Arc<DispatchMonitor>,
        supervisor: Arc<HostProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            identity,
            tasks,
            queue,
            monitor,
            supervisor,
        }
    }
}
