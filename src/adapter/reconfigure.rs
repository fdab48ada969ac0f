//! Flush and output port reconfiguration.

use tracing::{debug, info, warn};

use crate::{
    adapter::{
        machine::{AdapterCore, ReconfigReason},
        message::Notification,
        state::{AdapterState, AdapterStats},
    },
    buffer::Ownership,
    common::{
        errors::AdapterError,
        types::{BufferId, Generation},
    },
    format::PortFormat,
    surface::BoxedSurface,
};

impl AdapterCore {
    /// Cancel everything in flight. Completes on [`EngineEvent::FlushCompleted`].
    ///
    /// [`EngineEvent::FlushCompleted`]: crate::engine::EngineEvent::FlushCompleted
    pub(super) fn flush(&mut self) {
        info!("[{}] flushing at {}", self.name, self.generation);
        AdapterStats::bump(&self.stats.flushes);

        self.input.reclaim_all(Ownership::UpstreamClient);
        self.output.reclaim_all(Ownership::DownstreamClient);
        self.input.clear_parked();
        self.output.clear_parked();
        self.input_eos_pending = false;
        self.set_state(AdapterState::Flushing);

        if let Err(e) = self.engine.flush() {
            let fatal = e.kind().is_fatal_in_steady_state();
            self.fail(e);
            if !fatal {
                // The engine refused the request, so it holds nothing to return.
                self.on_flush_completed();
            }
        }
    }

    pub(super) fn on_flush_completed(&mut self) {
        if self.state != AdapterState::Flushing {
            debug!("[{}] ignoring flush completion in {}", self.name, self.state);
            return;
        }

        let reclaimed =
            self.input.reclaim_all(Ownership::Engine).len() + self.output.reclaim_all(Ownership::Engine).len();
        self.generation.bump();
        self.input.set_end_of_stream_seen(false);
        self.output.set_end_of_stream_seen(false);
        self.eos_notified = false;
        self.input_eos_pending = false;
        self.input_eos_submitted = false;
        debug!(
            "[{}] flush reclaimed {} engine buffers, now at {}",
            self.name, reclaimed, self.generation
        );

        self.set_state(AdapterState::Active);
        self.notify(Notification::FlushCompleted);

        if let Some(format) = self.format_change_after_flush.take() {
            self.begin_reconfigure(ReconfigReason::FormatChange(format));
        }
    }

    pub(super) fn on_output_format_changed(
        &mut self,
        id: BufferId,
        generation: Generation,
        format: PortFormat,
    ) {
        let returned = self
            .output
            .get(id)
            .is_some_and(|d| d.is_owned_by(Ownership::Engine) && d.generation == generation);
        if returned {
            let _ = self.output.transition(id, Ownership::Adapter);
        }

        match self.state {
            AdapterState::Active if self.pending_fatal.is_none() => {
                info!("[{}] engine switched output to {}", self.name, format);
                self.begin_reconfigure(ReconfigReason::FormatChange(format));
            }
            AdapterState::Flushing => {
                debug!("[{}] format change to {} held until flush completes", self.name, format);
                self.format_change_after_flush = Some(format);
            }
            AdapterState::OutputPortReconfiguring => {
                if let Some(ReconfigReason::FormatChange(current)) = self.reconfig.as_mut() {
                    *current = format;
                }
                self.check_reconfigure_progress();
            }
            state => debug!("[{}] ignoring format change in {}", self.name, state),
        }
    }

    pub(super) fn set_output_sink(&mut self, sink: Option<BoxedSurface>) {
        if self.state == AdapterState::Active {
            self.begin_reconfigure(ReconfigReason::SinkChange(sink));
            return;
        }
        self.detach_surface();
        debug!(
            "[{}] output sink set to {}",
            self.name,
            sink.as_ref().map_or("client", |s| s.name())
        );
        self.surface = sink;
    }

    /// Stop feeding the output port and wait for every buffer to come home.
    pub(super) fn begin_reconfigure(&mut self, reason: ReconfigReason) {
        AdapterStats::bump(&self.stats.reconfigurations);
        self.output.clear_parked();
        self.reconfig = Some(reason);
        self.set_state(AdapterState::OutputPortReconfiguring);

        if let Err(e) = self.engine.drain_output() {
            if e.kind().is_fatal_in_steady_state() {
                return self.fail(e);
            }
            warn!("[{}] engine refused drain ({}), reclaiming outputs", self.name, e);
            self.output.reclaim_all(Ownership::Engine);
        }
        self.check_reconfigure_progress();
    }

    pub(super) fn check_reconfigure_progress(&mut self) {
        if self.state != AdapterState::OutputPortReconfiguring {
            return;
        }
        if !self.output.all_owned_by_adapter() {
            debug!(
                "[{}] waiting on output buffers: engine {}, client {}, surface {}",
                self.name,
                self.output.count_owned_by(Ownership::Engine),
                self.output.count_owned_by(Ownership::DownstreamClient),
                self.output.count_owned_by(Ownership::DisplaySurface)
            );
            return;
        }
        self.finish_reconfigure();
    }

    /// Free the output port, rebuild it for the engine's current format and
    /// resume with whatever arrived in the meantime.
    fn finish_reconfigure(&mut self) {
        let Some(reason) = self.reconfig.take() else {
            return;
        };
        let previous = self.output.format();
        let announce = matches!(reason, ReconfigReason::FormatChange(_));

        self.detach_surface();
        if let Err(e) = self.output.free(&self.pool) {
            return self.fail_reconfigure(e);
        }
        if let ReconfigReason::SinkChange(sink) = reason {
            self.surface = sink;
        }

        let format = match self.engine.output_format() {
            Ok(format) => format,
            Err(e) => return self.fail_reconfigure(e),
        };
        let graphic = self.surface.is_some();
        if let Err(e) = self.output.allocate(
            format,
            graphic,
            &mut self.next_buffer_id,
            &self.pool,
            self.generation,
        ) {
            return self.fail_reconfigure(e);
        }
        if let Err(e) = self.attach_surface() {
            return self.fail_reconfigure(e);
        }
        if let Some(formats) = self.formats.as_mut() {
            formats.output = format;
        }

        info!(
            "[{}] output port rebuilt: {} buffers of {}",
            self.name,
            self.output.len(),
            format
        );
        self.set_state(AdapterState::Active);
        if announce || previous != Some(format) {
            self.notify(Notification::OutputFormatChanged(format));
        }

        let deferred = self.output.take_deferred();
        if !deferred.is_empty() {
            debug!("[{}] replaying {} deferred requests", self.name, deferred.len());
        }
        self.pending.extend(deferred);
    }

    /// A rebuild that cannot finish leaves the output port unusable.
    fn fail_reconfigure(&mut self, err: AdapterError) {
        let err = if err.kind().is_fatal_in_steady_state() {
            err
        } else {
            AdapterError::allocation(err)
        };
        self.fail(err);
    }
}
