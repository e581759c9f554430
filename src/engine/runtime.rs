// src/engine/runtime.rs

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::host::TaskHost;
use super::{RuntimeEvent, RuntimeOptions};

/// The single consumer of [`RuntimeEvent`]s.
///
/// Run requests, process exits, display changes and shutdown all arrive on
/// one channel, so scheduler state is only ever touched from this loop.
pub struct Runtime {
    host: TaskHost,
    options: RuntimeOptions,
    events_rx: mpsc::Receiver<RuntimeEvent>,
}

impl Runtime {
    pub fn new(host: TaskHost, options: RuntimeOptions, events_rx: mpsc::Receiver<RuntimeEvent>) -> Self {
        Self {
            host,
            options,
            events_rx,
        }
    }

    /// Main event loop. Returns the host so callers can inspect it.
    pub async fn run(mut self) -> Result<TaskHost> {
        info!("taskhost runtime started");

        while let Some(event) = self.events_rx.recv().await {
            debug!(?event, "runtime received event");

            let keep_running = match event {
                RuntimeEvent::RunRequested { request, reply } => {
                    let unit = request.unit;
                    let outcome = self.host.run_unit(request).await;
                    debug!(unit = %unit, ?outcome, "run request handled");
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                    true
                }
                RuntimeEvent::TaskExited { task_id, exit_code } => {
                    self.host
                        .scheduler_mut()
                        .on_process_exited(task_id, exit_code)
                        .await;
                    true
                }
                RuntimeEvent::DisplayChanged => {
                    self.host.scheduler_mut().on_display_changed();
                    true
                }
                RuntimeEvent::ShutdownRequested => {
                    info!("shutdown requested, stopping runtime");
                    self.host.scheduler_mut().shutdown();
                    false
                }
            };

            if !keep_running {
                break;
            }

            if self.events_rx.is_empty() {
                if self.options.detach {
                    info!("requests handled; leaving started tasks running");
                    break;
                }
                if self.options.exit_when_idle && self.host.scheduler().is_idle() {
                    info!("runtime idle and exit_when_idle=true, stopping");
                    break;
                }
            }
        }

        info!("taskhost runtime exiting");
        Ok(self.host)
    }
}
