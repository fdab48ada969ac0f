//! Allocation, configuration, start-up and shutdown.

use std::{sync::atomic::Ordering, time::Instant};

use tracing::{debug, info, warn};

use crate::{
    adapter::{
        machine::{AdapterCore, ReconfigReason, SurfacePoll},
        message::Notification,
        state::AdapterState,
    },
    buffer::Ownership,
    common::errors::AdapterError,
    engine::EngineEvents,
    format::{ParameterUpdate, StreamParams},
    surface::Recycler,
};

impl AdapterCore {
    pub(super) fn allocate(&mut self) {
        match self.engine.allocate(EngineEvents::new(self.inbox.clone())) {
            Ok(handle) => {
                info!("[{}] bound {} engine {}", self.name, self.engine.name(), handle);
                self.engine_handle = Some(handle);
                self.set_state(AdapterState::Initialized);
                self.notify(Notification::Allocated);
            }
            Err(e) => self.notify(Notification::Error(e)),
        }
    }

    pub(super) fn configure(&mut self, mut params: StreamParams) {
        params
            .input_buffer_count
            .get_or_insert(self.config.input_buffer_count);
        params
            .output_buffer_count
            .get_or_insert(self.config.output_buffer_count);

        match self.engine.configure(&params) {
            Ok(formats) => {
                info!(
                    "[{}] configured: input {} / output {}",
                    self.name, formats.input, formats.output
                );
                self.formats = Some(formats);
                self.params = Some(params);
                self.set_state(AdapterState::Configured);
                self.notify(Notification::Configured {
                    input: formats.input,
                    output: formats.output,
                });
            }
            Err(e) => self.notify(Notification::Error(e)),
        }
    }

    /// Allocate both ports and ask the engine to run.
    pub(super) fn start(&mut self) {
        let Some(formats) = self.formats else {
            self.notify(Notification::Error(AdapterError::state(
                self.state, "Start",
            )));
            return;
        };
        self.set_state(AdapterState::LoadedToActive);

        let graphic = self.surface.is_some();
        if let Err(e) = self.input.allocate(
            formats.input,
            false,
            &mut self.next_buffer_id,
            &self.pool,
            self.generation,
        ) {
            return self.roll_back(e);
        }
        if let Err(e) = self.output.allocate(
            formats.output,
            graphic,
            &mut self.next_buffer_id,
            &self.pool,
            self.generation,
        ) {
            return self.roll_back(e);
        }
        if let Err(e) = self.attach_surface() {
            return self.roll_back(e);
        }
        if let Err(e) = self.engine.start() {
            return self.roll_back(e);
        }
        debug!(
            "[{}] ports ready ({} in / {} out), waiting for engine",
            self.name,
            self.input.len(),
            self.output.len()
        );
    }

    pub(super) fn on_started(&mut self) {
        if self.state != AdapterState::LoadedToActive {
            debug!("[{}] ignoring engine start in {}", self.name, self.state);
            return;
        }
        self.set_state(AdapterState::Active);
    }

    /// Roll a failed start, flush or reconfiguration back to `Initialized`.
    ///
    /// Every buffer is taken back and both ports are freed, so the client
    /// must configure and start again. Nothing is latched.
    pub(super) fn roll_back(&mut self, err: AdapterError) {
        warn!("[{}] {} failed, rolling back: {}", self.name, self.state, err);
        if let Err(e) = self.engine.stop() {
            debug!("[{}] engine stop during rollback: {}", self.name, e);
        }
        self.generation.bump();
        self.detach_surface();
        for owner in [Ownership::Engine, Ownership::UpstreamClient] {
            self.input.reclaim_all(owner);
        }
        for owner in [
            Ownership::Engine,
            Ownership::DownstreamClient,
            Ownership::DisplaySurface,
        ] {
            self.output.reclaim_all(owner);
        }
        self.input.clear_parked();
        self.output.clear_parked();
        self.free_ports();

        if let Some(ReconfigReason::SinkChange(sink)) = self.reconfig.take() {
            // The client asked for this sink; the next start attaches it.
            self.surface = sink;
        }
        self.formats = None;
        self.params = None;
        self.format_change_after_flush = None;
        self.fence_check = None;
        self.input_eos_pending = false;
        self.input_eos_submitted = false;
        self.eos_notified = false;
        let deferred = self.output.take_deferred();
        self.pending.extend(deferred);

        self.set_state(AdapterState::Initialized);
        self.notify(Notification::Error(err));
    }

    pub(super) fn set_parameters(&mut self, update: ParameterUpdate) {
        if update.is_empty() {
            return;
        }
        debug!("[{}] parameters {:?}", self.name, update.present());
        match self.engine.set_parameters(&update) {
            Ok(()) => {
                if let Some(params) = self.params.as_mut() {
                    params.tuning.merge_from(update);
                }
            }
            Err(e) if self.state == AdapterState::Active => self.fail(e),
            Err(e) => self.notify(Notification::Error(e)),
        }
    }

    pub(super) fn shutdown(&mut self, keep_allocated: bool) {
        self.keep_engine_allocated = keep_allocated;
        match self.state {
            AdapterState::Uninitialized => {
                self.pending_fatal = None;
                self.notify(Notification::ShutdownCompleted);
            }
            AdapterState::Initialized => {
                if !keep_allocated {
                    self.release_engine();
                }
                self.pending_fatal = None;
                self.set_state(if keep_allocated {
                    AdapterState::Initialized
                } else {
                    AdapterState::Uninitialized
                });
                self.notify(Notification::ShutdownCompleted);
            }
            _ => self.begin_shutdown(),
        }
    }

    /// Cancel everything in flight and wait for the engine to stop.
    fn begin_shutdown(&mut self) {
        info!(
            "[{}] shutting down (keep engine: {})",
            self.name, self.keep_engine_allocated
        );
        self.generation.bump();
        self.input.reclaim_all(Ownership::UpstreamClient);
        self.output.reclaim_all(Ownership::DownstreamClient);
        self.input.clear_parked();
        self.output.clear_parked();
        self.input_eos_pending = false;
        self.set_state(AdapterState::ActiveToIdle);

        if let Err(e) = self.engine.stop() {
            self.report_once(e);
            self.enter_idle_to_loaded();
        }
    }

    pub(super) fn on_stopped(&mut self) {
        if self.state != AdapterState::ActiveToIdle {
            debug!("[{}] ignoring engine stop in {}", self.name, self.state);
            return;
        }
        self.enter_idle_to_loaded();
    }

    /// The engine holds nothing any more; wait for the surface.
    pub(super) fn enter_idle_to_loaded(&mut self) {
        self.input.reclaim_all(Ownership::Engine);
        self.output.reclaim_all(Ownership::Engine);
        self.set_state(AdapterState::IdleToLoaded);
        self.surface_poll = Some(SurfacePoll {
            attempts: 0,
            deadline: Instant::now() + self.config.surface_poll_interval(),
        });
        self.check_shutdown_progress();
    }

    pub(super) fn check_shutdown_progress(&mut self) {
        if self.state == AdapterState::IdleToLoaded
            && self.output.count_owned_by(Ownership::DisplaySurface) == 0
        {
            self.finish_shutdown();
        }
    }

    /// One tick of the bounded wait for surface-held buffers.
    pub(super) fn poll_surface(&mut self) {
        if self.state != AdapterState::IdleToLoaded {
            self.surface_poll = None;
            return;
        }
        let Some(mut poll) = self.surface_poll else {
            return;
        };

        let held = self.output.count_owned_by(Ownership::DisplaySurface);
        if held == 0 {
            return self.finish_shutdown();
        }

        poll.attempts += 1;
        if poll.attempts < self.config.surface_poll_retries {
            debug!(
                "[{}] {} buffers still on the surface (poll {}/{})",
                self.name, held, poll.attempts, self.config.surface_poll_retries
            );
            poll.deadline = Instant::now() + self.config.surface_poll_interval();
            self.surface_poll = Some(poll);
            return;
        }

        let reclaimed = self.output.reclaim_all(Ownership::DisplaySurface);
        self.stats
            .surface_force_reclaimed
            .fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
        warn!(
            "[{}] surface kept {} buffers past {:?}, reclaiming",
            self.name,
            reclaimed.len(),
            self.config.surface_poll_budget()
        );
        self.notify(Notification::Error(AdapterError::surface(format!(
            "{} buffers not returned within {:?}",
            reclaimed.len(),
            self.config.surface_poll_budget()
        ))));
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        self.surface_poll = None;
        self.detach_surface();
        self.free_ports();
        self.formats = None;
        self.params = None;
        self.reconfig = None;
        self.format_change_after_flush = None;
        self.input_eos_pending = false;
        self.input_eos_submitted = false;
        self.eos_notified = false;
        self.pending_fatal = None;

        if self.keep_engine_allocated {
            self.set_state(AdapterState::Initialized);
        } else {
            self.release_engine();
            self.set_state(AdapterState::Uninitialized);
        }
        self.notify(Notification::ShutdownCompleted);
    }

    fn release_engine(&mut self) {
        if self.engine_handle.take().is_none() {
            return;
        }
        if let Err(e) = self.engine.release() {
            warn!("[{}] engine release failed: {}", self.name, e);
        }
        let pooled = self.pool.stats();
        self.pool.clear();
        debug!(
            "[{}] dropped {} pooled regions ({} bytes)",
            self.name, pooled.entries, pooled.total_bytes
        );
    }

    pub(super) fn free_ports(&mut self) {
        for port in [&mut self.input, &mut self.output] {
            port.set_end_of_stream_seen(false);
            if let Err(e) = port.free(&self.pool) {
                warn!("[{}] {}", self.name, e);
            }
        }
    }

    /// Register the output buffers with the surface, if there is one.
    pub(super) fn attach_surface(&mut self) -> Result<(), AdapterError> {
        let Some(surface) = self.surface.as_mut() else {
            return Ok(());
        };
        surface.attach(self.output.buffers(), Recycler::new(self.inbox.clone()))?;
        self.surface_attached = true;
        Ok(())
    }

    pub(super) fn detach_surface(&mut self) {
        if let Some(surface) = self.surface.as_mut() {
            if self.surface_attached {
                surface.detach();
            }
        }
        self.surface_attached = false;
    }
}
