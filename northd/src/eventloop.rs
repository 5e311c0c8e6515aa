//! The orchestration loop: single-threaded, cooperative, driven by store
//! changes, the control socket and a periodic timer.

use crate::control::{self, Command, Control};
use crate::store::Store;
use anyhow::Result;
use northd_engine::Engine;
use std::time::{Duration, Instant};

pub struct Eventloop {
    store: Store,
    engine: Engine,
    poll_interval: Duration,
    paused: bool,
    active: bool,
    last_digest: Option<u64>,
}

impl Eventloop {
    pub fn new(store: Store, poll_interval: Duration) -> Self {
        Self {
            store,
            engine: Engine::new(),
            poll_interval,
            paused: false,
            active: false,
            last_digest: None,
        }
    }

    pub async fn run(mut self, control: Control) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        // Nothing here is fatal; the next tick rebuilds from
                        // scratch.
                        tracing::warn!("Reconciliation pass failed: {e:#}");
                        self.last_digest = None;
                    }
                }
                stream = control.accept() => {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!("Control socket accept failed: {e}");
                            continue;
                        }
                    };

                    let was_paused = self.paused;

                    if let Some(command) = control::handle(stream, &mut self.paused).await {
                        match command {
                            Command::Exit => {
                                tracing::info!("Exiting on control request");
                                return Ok(());
                            }
                            Command::Pause if !was_paused => {
                                tracing::info!("Paused; tracking state without writing");
                            }
                            Command::Resume if was_paused => {
                                // Resume takes effect immediately.
                                tracing::info!("Resumed");
                                self.last_digest = None;
                            }
                            _ => {}
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Exiting on interrupt");
                    return Ok(());
                }
            }
        }
    }

    fn tick(&mut self) -> Result<()> {
        let leader = self.store.try_lock();

        if leader != self.active {
            self.active = leader;
            self.last_digest = None;

            match leader {
                true => tracing::info!("ovn-northd lock acquired. This ovn-northd instance is now active."),
                false => tracing::info!("ovn-northd lock lost. This ovn-northd instance is now on standby."),
            }
        }

        // Skip work when nothing changed since the last converged pass.
        let digest = self.store.digest();

        if self.last_digest == Some(digest) {
            return Ok(());
        }

        // Snapshots are loaded even while paused or on standby so the
        // in-memory picture stays warm and resume is immediate.
        let (mut nb, mut sb) = self.store.load()?;

        if !self.active || self.paused {
            self.last_digest = Some(digest);
            return Ok(());
        }

        let outcome = self.engine.run_pass(&nb, &sb, Instant::now());

        if outcome.sb_ops.is_empty() && outcome.nb_ops.is_empty() {
            self.last_digest = Some(digest);
            return Ok(());
        }

        tracing::debug!(
            sb_writes = outcome.sb_ops.len(),
            nb_writes = outcome.nb_ops.len(),
            "Committing reconciliation pass"
        );

        self.store.commit(&mut nb, &mut sb, &outcome)?;
        self.last_digest = Some(self.store.digest());

        Ok(())
    }
}
