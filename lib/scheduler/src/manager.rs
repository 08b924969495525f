//! Starts and stops the agents of one process.

use crate::agent::{Agent, AgentKind, AgentRunner};
use crate::agents::{Clerk, Finisher, Poller, Submitter, Trigger};
use crate::config::{AgentConfig, AgentSettings};
use crate::schedule::PollSchedule;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use workweave_carrier::Carrier;

/// The running agents and their shutdown signal.
pub struct AgentManager {
    shutdown: watch::Sender<bool>,
    handles: Vec<(AgentKind, JoinHandle<()>)>,
}

impl AgentManager {
    /// Spawns every enabled agent on the current runtime.
    #[must_use]
    pub fn start(carrier: Arc<Carrier>, config: &AgentConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut manager = Self {
            shutdown,
            handles: Vec::new(),
        };
        let lease = config.lock_lease();

        manager.spawn(
            Clerk::new(Arc::clone(&carrier), lease)
                .with_dependency_cycles_allowed(config.allow_dependency_cycles),
            &config.clerk,
        );
        manager.spawn(Submitter::new(Arc::clone(&carrier), lease), &config.submitter);
        manager.spawn(Poller::new(Arc::clone(&carrier), lease), &config.poller);
        manager.spawn(Trigger::new(Arc::clone(&carrier), lease), &config.trigger);
        manager.spawn(Finisher::new(carrier, lease), &config.finisher);

        info!(agents = manager.handles.len(), "agents started");
        manager
    }

    fn spawn<A: Agent>(&mut self, agent: A, settings: &AgentSettings) {
        let kind = agent.kind();
        if !settings.enabled {
            info!(agent = %kind, "agent disabled");
            return;
        }
        let runner = AgentRunner::new(
            agent,
            settings.workers,
            settings.batch_size,
            PollSchedule::new(settings.poll_period()),
        );
        let handle = tokio::spawn(runner.run(self.shutdown.subscribe()));
        self.handles.push((kind, handle));
    }

    /// Kinds of the agents that were started.
    #[must_use]
    pub fn running(&self) -> Vec<AgentKind> {
        self.handles.iter().map(|(kind, _)| *kind).collect()
    }

    /// Signals every agent to stop after its current round and waits for
    /// them.
    pub async fn shutdown(self) {
        // Receivers only go away once their agents have stopped.
        let _ = self.shutdown.send(true);
        for (kind, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(agent = %kind, error = %e, "agent task failed");
            }
        }
        info!("agents stopped");
    }

    /// Runs until Ctrl-C, then shuts down.
    pub async fn run_until_ctrl_c(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::deployment;
    use std::time::Duration;
    use workweave_carrier::CarrierConfig;

    #[tokio::test]
    async fn disabled_agents_are_not_started() {
        let d = deployment(CarrierConfig::default());
        let mut config = AgentConfig::default();
        config.trigger.enabled = false;

        let manager = AgentManager::start(d.carrier.clone(), &config);
        assert_eq!(
            manager.running(),
            vec![
                AgentKind::Clerk,
                AgentKind::Submitter,
                AgentKind::Poller,
                AgentKind::Finisher,
            ]
        );
        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_poll_sleep() {
        let d = deployment(CarrierConfig::default());
        let mut config = AgentConfig::default();
        config.poller.poll_period_secs = 3600;

        let manager = AgentManager::start(d.carrier.clone(), &config);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .unwrap();
    }
}
