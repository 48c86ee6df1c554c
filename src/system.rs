//! Top-level wiring of the orchestration core.
//!
//! [`LegionSystem`] assembles the coordinator with the routing and
//! scheduling components in dependency order, runs initialization, and
//! owns the background tasks. The transport shell (HTTP/WebSocket or a
//! test harness) talks to the system through the coordinator, the
//! router, and the overseer controller.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::LegionConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::Result;
use crate::legion::{CommRouter, OverseerController};
use crate::scheduler::SchedulerService;
use crate::sdk::SdkFactory;

/// The assembled orchestration core.
pub struct LegionSystem {
    pub coordinator: Arc<SessionCoordinator>,
    pub comm_router: Arc<CommRouter>,
    pub overseer: Arc<OverseerController>,
    pub scheduler: Arc<SchedulerService>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl LegionSystem {
    /// Wire all components over one configuration and SDK factory.
    pub fn new(config: LegionConfig, sdk_factory: Arc<dyn SdkFactory>) -> Self {
        let tick_secs = config.scheduler_tick_secs;
        let coordinator = SessionCoordinator::new(config, sdk_factory);
        let comm_router = Arc::new(CommRouter::new(
            Arc::clone(&coordinator),
            Arc::clone(coordinator.channels()),
        ));
        let overseer = Arc::new(OverseerController::new(
            Arc::clone(&coordinator),
            Arc::clone(&comm_router),
            Arc::clone(coordinator.channels()),
            Arc::clone(coordinator.capabilities()),
            Arc::clone(coordinator.hordes()),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            Arc::clone(coordinator.schedules()),
            Arc::clone(&coordinator),
            tick_secs,
        ));

        Self {
            coordinator,
            comm_router,
            overseer,
            scheduler,
            background_tasks: Vec::new(),
        }
    }

    /// Load persisted state and start the background loops.
    pub async fn start(&mut self) -> Result<()> {
        self.coordinator.initialize().await?;
        self.background_tasks
            .push(self.coordinator.start_delivery_loop());
        self.background_tasks.push(self.scheduler.start());
        info!(target: "coordinator", "legion system started");
        Ok(())
    }

    /// Graceful shutdown: stop loops, drain permissions, disconnect
    /// every SDK.
    pub async fn shutdown(&mut self) {
        self.scheduler.stop();
        self.coordinator.shutdown().await;
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        info!(target: "coordinator", "legion system shut down");
    }
}
