// # Controller
//
// Schedules reconciliation cycles for every sync spec in the config store.
//
// ## Scheduling
//
// - One loop per sync spec name, started for every spec listed at startup
//   and for every spec that later shows up in a change event
// - A cycle needs a worker permit; at most `workers` cycles run at once
// - After a cycle the loop waits for the requeue delay (success or failure),
//   an early trigger, or shutdown
// - A change to a source or target triggers every spec referencing it
// - A loop ends when its spec is no longer found
//
// ## Shutdown
//
// Shutdown is a `watch` channel. Every cycle's SyncContext observes it, so
// in-flight external calls are cancelled, and `run` returns once every loop
// has exited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::SyncContext;
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::status::{AggregateStatus, CyclePhase};
use crate::traits::{ChangeEvent, ConfigStore};

struct SpecLoop {
    trigger: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives [`SyncEngine`] cycles for every sync spec
pub struct Controller {
    engine: Arc<SyncEngine>,
    store: Arc<dyn ConfigStore>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
}

impl Controller {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<dyn ConfigStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.workers));
        Ok(Self {
            engine,
            store,
            config,
            permits,
        })
    }

    /// Delay before the next cycle after `status`
    pub fn requeue_after(&self, status: &AggregateStatus) -> Duration {
        requeue_after(&self.config, status)
    }

    /// Run one cycle for a named spec and persist its status
    pub async fn reconcile_now(&self, name: &str, shutdown: watch::Receiver<bool>) -> Result<AggregateStatus> {
        let spec = self.store.sync_spec(name).await?;
        let ctx = SyncContext::new(shutdown).with_timeout(self.config.cycle_timeout());
        let status = self.engine.reconcile(&ctx, &spec).await;
        self.store.write_status(name, &status).await?;
        Ok(status)
    }

    /// Run until `shutdown` carries `true`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let stop = SyncContext::new(shutdown.clone());
        let mut changes = BroadcastStream::new(self.store.watch());
        let mut loops: HashMap<String, SpecLoop> = HashMap::new();
        let mut watching = true;

        for name in self.store.list_sync_specs().await? {
            self.ensure_loop(&mut loops, &name, &shutdown);
        }
        info!(specs = loops.len(), workers = self.config.workers, "Controller started");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }

                event = changes.next(), if watching => match event {
                    Some(Ok(event)) => self.handle_change(&mut loops, event, &shutdown).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        warn!(missed, "Change notifications lagged, triggering every sync spec");
                        self.resync(&mut loops, &shutdown).await;
                    }
                    None => {
                        debug!("Change notifications closed");
                        watching = false;
                    }
                },
            }
        }

        for (name, spec_loop) in loops {
            if let Err(e) = spec_loop.handle.await {
                error!(spec = %name, "Sync loop panicked: {}", e);
            }
        }
        info!("Controller stopped");
        Ok(())
    }

    async fn handle_change(
        &self,
        loops: &mut HashMap<String, SpecLoop>,
        event: ChangeEvent,
        shutdown: &watch::Receiver<bool>,
    ) {
        debug!(?event, "Config change");
        match event {
            ChangeEvent::SyncSpec(name) => self.ensure_loop(loops, &name, shutdown),
            ChangeEvent::Source(name) => {
                for spec in self.affected_specs(|s| s.references_source(&name)).await {
                    self.ensure_loop(loops, &spec, shutdown);
                }
            }
            ChangeEvent::Target(name) => {
                for spec in self.affected_specs(|s| s.references_target(&name)).await {
                    self.ensure_loop(loops, &spec, shutdown);
                }
            }
        }
    }

    /// Trigger every spec, starting loops for any that are new
    async fn resync(&self, loops: &mut HashMap<String, SpecLoop>, shutdown: &watch::Receiver<bool>) {
        match self.store.list_sync_specs().await {
            Ok(names) => {
                for name in names {
                    self.ensure_loop(loops, &name, shutdown);
                }
            }
            Err(e) => warn!("Failed to list sync specs: {}", e),
        }
    }

    async fn affected_specs(&self, references: impl Fn(&crate::config::SyncSpec) -> bool) -> Vec<String> {
        let names = match self.store.list_sync_specs().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list sync specs: {}", e);
                return Vec::new();
            }
        };

        let mut affected = Vec::new();
        for name in names {
            match self.store.sync_spec(&name).await {
                Ok(spec) if references(&spec) => affected.push(name),
                Ok(_) => {}
                Err(e) => debug!(spec = %name, "Skipping unreadable sync spec: {}", e),
            }
        }
        affected
    }

    /// Trigger the loop for `name`, spawning it if absent or finished
    fn ensure_loop(&self, loops: &mut HashMap<String, SpecLoop>, name: &str, shutdown: &watch::Receiver<bool>) {
        if let Some(existing) = loops.get(name) {
            if !existing.handle.is_finished() {
                // A full buffer already holds a pending trigger
                let _ = existing.trigger.try_send(());
                return;
            }
        }

        let (trigger, triggers) = mpsc::channel(1);
        let handle = tokio::spawn(spec_loop(
            name.to_string(),
            Arc::clone(&self.engine),
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.permits),
            triggers,
            shutdown.clone(),
        ));
        debug!(spec = %name, "Started sync loop");
        loops.insert(name.to_string(), SpecLoop { trigger, handle });
    }
}

fn requeue_after(config: &EngineConfig, status: &AggregateStatus) -> Duration {
    match status.phase {
        CyclePhase::Completed => config.success_requeue(),
        CyclePhase::Aborted => config.failure_requeue(),
    }
}

async fn spec_loop(
    name: String,
    engine: Arc<SyncEngine>,
    store: Arc<dyn ConfigStore>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    mut triggers: mpsc::Receiver<()>,
    shutdown: watch::Receiver<bool>,
) {
    let stop = SyncContext::new(shutdown.clone());

    loop {
        let permit = tokio::select! {
            _ = stop.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delay = match store.sync_spec(&name).await {
            Ok(spec) => {
                let ctx = SyncContext::new(shutdown.clone()).with_timeout(config.cycle_timeout());
                let status = engine.reconcile(&ctx, &spec).await;
                drop(permit);

                if let Err(e) = store.write_status(&name, &status).await {
                    warn!(spec = %name, "Failed to write status: {}", e);
                }
                requeue_after(&config, &status)
            }
            Err(Error::NotFound(_)) => {
                info!(spec = %name, "Sync spec removed, stopping its loop");
                break;
            }
            Err(e) => {
                drop(permit);
                warn!(spec = %name, "Failed to read sync spec: {}", e);
                config.failure_requeue()
            }
        };

        debug!(spec = %name, delay_secs = delay.as_secs(), "Requeued");
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                debug!(spec = %name, "Triggered early");
            }
        }
    }
}
