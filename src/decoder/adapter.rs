// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode session lifecycle and output ordering.
//!
//! The [`DecodeSessionAdapter`] owns a hardware session opened through a [`DecoderBackend`]. Every
//! sample it submits gets a [`FrameReference`], queued in submission order until the hardware
//! reports the sample's result. Results are paired with references in that same order, reordered
//! by presentation timestamp, and handed to the client's [`DecoderOutput`].
//!
//! Caller-facing operations must be issued from a single context, but hardware results arrive on
//! whatever thread the backend uses. Both sides meet in a monitor protecting the adapter state,
//! the current generation, the pending references and the reorder queue. Each flush starts a new
//! generation, and results tagged with an older one are dropped: nothing submitted before a flush
//! can reach the output after the flush returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use crate::backend::CallbackTarget;
use crate::backend::DecodeSession;
use crate::backend::DecoderBackend;
use crate::backend::HwDecodeResult;
use crate::backend::SessionCallback;
use crate::backend::SubmissionTag;
use crate::decoder::ConfigError;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderOutput;
use crate::decoder::EncodedSample;
use crate::decoder::Error;
use crate::decoder::FrameReference;
use crate::decoder::ReorderQueue;
use crate::decoder::Result;
use crate::decoder::SubmitError;

/// State of a [`DecodeSessionAdapter`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdapterState {
    /// No session has been opened yet.
    Created,
    /// The session is open but no sample has been submitted.
    Initialized,
    /// Samples are being decoded.
    Running,
    /// A flush is discarding in-flight work.
    Flushing,
    /// A drain is waiting for the hardware to complete all submitted work.
    Draining,
    /// Terminal, the session has been released.
    ShutDown,
    /// Initialization failed or the session was lost. Only [`DecodeSessionAdapter::shutdown`] is
    /// valid.
    Error,
}

/// State shared between the caller-facing operations and the hardware callback.
struct Monitor<P> {
    state: AdapterState,
    /// Incremented by every flush and by shutdown.
    generation: u64,
    /// References of the submitted samples whose result has not been reported yet, in submission
    /// order.
    pending: VecDeque<FrameReference>,
    queue: ReorderQueue<P>,
    output: Box<dyn DecoderOutput<P>>,
}

impl<P> Monitor<P> {
    /// Marks the session as lost and reports it to the client. Everything in flight is discarded.
    fn fail(&mut self, error: anyhow::Error) {
        log::error!("decode session lost in state {:?}: {:#}", self.state, error);
        self.state = AdapterState::Error;
        self.pending.clear();
        self.queue.flush();
        self.output.on_decode_error(DecodeError::SessionLost(error));
    }

    /// Forwards every picture the reorder queue is ready to release.
    fn release_ready(&mut self) {
        while let Some((reference, picture)) = self.queue.pop() {
            self.output.on_decoded_frame(picture, reference);
        }
    }
}

struct Shared<P>(Mutex<Monitor<P>>);

impl<P> Shared<P> {
    // A panicking output sink leaves the monitor consistent.
    fn lock(&self) -> MutexGuard<'_, Monitor<P>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Send + 'static> CallbackTarget<P> for Shared<P> {
    fn on_result(&self, tag: SubmissionTag, result: HwDecodeResult<P>) {
        let mut guard = self.lock();
        let monitor = &mut *guard;

        if tag.generation() != monitor.generation {
            log::debug!(
                "dropping result from generation {}, current is {}",
                tag.generation(),
                monitor.generation
            );
            return;
        }

        match monitor.state {
            AdapterState::Running | AdapterState::Draining => (),
            state => {
                log::debug!("dropping result received in state {:?}", state);
                return;
            }
        }

        let Some(reference) = monitor.pending.pop_front() else {
            log::warn!("hardware reported a result with no pending frame, dropping it");
            return;
        };

        match result {
            HwDecodeResult::Decoded(picture) => {
                monitor.queue.push(reference, picture);
                monitor.release_ready();
            }
            HwDecodeResult::Failed(source) => {
                log::warn!(
                    "failed to decode frame at {}: {:#}",
                    reference.presentation_timestamp,
                    source
                );
                monitor
                    .output
                    .on_decode_error(DecodeError::Failed { reference, source });
            }
            HwDecodeResult::Fatal(error) => monitor.fail(error),
        }
    }
}

/// Adapter between a sample source and an asynchronous hardware decode session, delivering
/// decoded pictures in presentation order.
///
/// ```text
/// Created --initialize--> Initialized --input--> Running
/// Running --flush--> Running (in-flight work discarded)
/// Running --drain--> Running (buffered output delivered, then end of stream)
/// any --shutdown--> ShutDown
/// ```
///
/// A failed initialization or a lost session moves the adapter to [`AdapterState::Error`], after
/// which every operation but [`shutdown`](Self::shutdown) fails with [`Error::Lifecycle`].
pub struct DecodeSessionAdapter<B: DecoderBackend> {
    backend: B,
    session: Option<B::Session>,
    config: Option<DecoderConfig>,
    shared: Arc<Shared<B::Picture>>,
}

impl<B: DecoderBackend> DecodeSessionAdapter<B> {
    /// Creates an adapter for `backend`, delivering its output to `output`. No hardware resource
    /// is allocated until [`initialize`](Self::initialize) is called.
    pub fn new<O>(backend: B, output: O) -> Self
    where
        O: DecoderOutput<B::Picture> + 'static,
    {
        Self {
            backend,
            session: None,
            config: None,
            shared: Arc::new(Shared(Mutex::new(Monitor {
                state: AdapterState::Created,
                generation: 0,
                pending: VecDeque::new(),
                queue: ReorderQueue::default(),
                output: Box::new(output),
            }))),
        }
    }

    /// Returns an initialized adapter for `config`, or `None` if `backend` cannot decode it.
    pub fn create<O>(backend: B, config: DecoderConfig, output: O) -> Option<Self>
    where
        O: DecoderOutput<B::Picture> + 'static,
    {
        if !backend.supports(&config) {
            log::debug!("backend does not support {:?}", config.format);
            return None;
        }

        let mut adapter = Self::new(backend, output);
        match adapter.initialize(config) {
            Ok(()) => Some(adapter),
            Err(e) => {
                log::debug!("failed to initialize decoder: {}", e);
                None
            }
        }
    }

    pub fn state(&self) -> AdapterState {
        self.shared.lock().state
    }

    /// The configuration passed to a successful [`initialize`](Self::initialize).
    pub fn config(&self) -> Option<&DecoderConfig> {
        self.config.as_ref()
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.backend.is_hardware_accelerated()
    }

    /// Number of submitted samples whose result has not been reported yet.
    pub fn num_pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Builds the error for `operation` being called in `state`. If the session has been lost, it
    /// is released on the way.
    fn lifecycle_error(&mut self, operation: &'static str, state: AdapterState) -> Error {
        if state == AdapterState::Error {
            if let Some(mut session) = self.session.take() {
                log::debug!("closing lost session");
                session.close();
            }
        }

        Error::Lifecycle { operation, state }
    }

    fn open_session(
        &mut self,
        config: &DecoderConfig,
    ) -> std::result::Result<B::Session, ConfigError> {
        config.validate()?;
        if !self.backend.supports(config) {
            return Err(ConfigError::Unsupported(config.format));
        }

        let weak = Arc::downgrade(&self.shared);
        let target: Weak<dyn CallbackTarget<B::Picture>> = weak;
        let session = self
            .backend
            .open_session(config, SessionCallback::new(target))?;

        Ok(session)
    }

    /// Opens the hardware session for `config`.
    ///
    /// Only valid once. On failure the adapter cannot be used anymore and a new one must be
    /// created.
    pub fn initialize(&mut self, config: DecoderConfig) -> Result<()> {
        let state = self.state();
        if state != AdapterState::Created {
            return Err(self.lifecycle_error("initialize", state));
        }

        match self.open_session(&config) {
            Ok(session) => {
                log::debug!(
                    "opened {:?} session, {} coded, {} display, reorder depth {}",
                    config.format,
                    config.coded_resolution,
                    config.display_resolution,
                    config.reorder_depth()
                );
                let mut monitor = self.shared.lock();
                monitor.queue.set_depth(config.reorder_depth());
                monitor.state = AdapterState::Initialized;
                self.session = Some(session);
                self.config = Some(config);
                Ok(())
            }
            Err(e) => {
                log::debug!("failed to open {:?} session: {}", config.format, e);
                self.shared.lock().state = AdapterState::Error;
                Err(e.into())
            }
        }
    }

    /// Submits `sample` for decoding. Its picture, or the error preventing it, is reported later
    /// through the output.
    ///
    /// May block while the hardware's submission queue is full. A sample refused by the hardware
    /// is reported as [`Error::Submission`] and leaves the adapter usable.
    pub fn input(&mut self, sample: &EncodedSample) -> Result<()> {
        let reference = FrameReference::from(sample);

        let (tag, previous) = {
            let mut monitor = self.shared.lock();
            let state = monitor.state;
            match state {
                AdapterState::Initialized | AdapterState::Running if self.session.is_some() => (),
                state => {
                    drop(monitor);
                    return Err(self.lifecycle_error("input", state));
                }
            }
            monitor.state = AdapterState::Running;
            monitor.pending.push_back(reference);
            (SubmissionTag::new(monitor.generation), state)
        };

        // The monitor is not held while submitting: the hardware may need to report earlier
        // results before it accepts more input.
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Lifecycle {
                operation: "input",
                state: AdapterState::ShutDown,
            });
        };

        if let Err(source) = session.submit(sample, tag) {
            log::warn!(
                "sample at {} rejected: {}",
                reference.decode_timestamp,
                source
            );
            let mut monitor = self.shared.lock();
            if monitor.generation == tag.generation() {
                monitor.pending.pop_back();
                if monitor.state == AdapterState::Running {
                    monitor.state = previous;
                }
            }
            return Err(SubmitError::Rejected { reference, source }.into());
        }

        Ok(())
    }

    /// Discards all in-flight and buffered output. No result of a sample submitted before this
    /// call reaches the output after it returns.
    pub fn flush(&mut self) -> Result<()> {
        let previous = {
            let mut monitor = self.shared.lock();
            let previous = monitor.state;
            match previous {
                AdapterState::Initialized | AdapterState::Running => (),
                state => {
                    drop(monitor);
                    return Err(self.lifecycle_error("flush", state));
                }
            }

            log::debug!(
                "flushing {} pending and {} queued frames",
                monitor.pending.len(),
                monitor.queue.len()
            );
            monitor.state = AdapterState::Flushing;
            monitor.generation += 1;
            monitor.pending.clear();
            monitor.queue.flush();
            previous
        };

        let reset = match self.session.as_mut() {
            Some(session) => session.reset(),
            None => Ok(()),
        };

        let mut monitor = self.shared.lock();
        if let Err(e) = reset {
            monitor.fail(anyhow::Error::new(e).context("failed to reset session"));
            drop(monitor);
            return Err(self.lifecycle_error("flush", AdapterState::Error));
        }
        if monitor.state == AdapterState::Flushing {
            monitor.state = previous;
        }

        Ok(())
    }

    /// Waits for the hardware to complete every submitted sample, delivers all buffered pictures
    /// in presentation order, then signals [`DecoderOutput::on_drain_complete`].
    ///
    /// Decoding can resume afterwards.
    pub fn drain(&mut self) -> Result<()> {
        let previous = {
            let mut monitor = self.shared.lock();
            let previous = monitor.state;
            match previous {
                AdapterState::Initialized | AdapterState::Running => (),
                state => {
                    drop(monitor);
                    return Err(self.lifecycle_error("drain", state));
                }
            }

            log::debug!("draining {} pending frames", monitor.pending.len());
            monitor.state = AdapterState::Draining;
            previous
        };

        // Results keep coming in through the callback while we wait.
        let drained = match self.session.as_mut() {
            Some(session) => session.drain(),
            None => Ok(()),
        };

        let mut guard = self.shared.lock();
        let monitor = &mut *guard;

        if let Err(e) = drained {
            if monitor.state == AdapterState::Draining {
                monitor.fail(anyhow::Error::new(e).context("failed to drain session"));
            }
        }
        if monitor.state != AdapterState::Draining {
            let state = monitor.state;
            drop(guard);
            return Err(self.lifecycle_error("drain", state));
        }

        for reference in monitor.pending.drain(..) {
            log::warn!(
                "no result for frame at {} after drain",
                reference.presentation_timestamp
            );
            monitor
                .output
                .on_decode_error(DecodeError::MissingOutput(reference));
        }
        for (reference, picture) in monitor.queue.drain_all() {
            monitor.output.on_decoded_frame(picture, reference);
        }
        monitor.output.on_drain_complete();
        monitor.state = previous;
        log::debug!("drain complete");

        Ok(())
    }

    /// Releases the hardware session. Buffered output is discarded and results arriving later are
    /// ignored. No operation is valid afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        {
            let mut monitor = self.shared.lock();
            if monitor.state == AdapterState::ShutDown {
                return Err(Error::Lifecycle {
                    operation: "shutdown",
                    state: AdapterState::ShutDown,
                });
            }

            log::debug!("shutting down from state {:?}", monitor.state);
            monitor.state = AdapterState::ShutDown;
            monitor.generation += 1;
            monitor.pending.clear();
            monitor.queue.flush();
        }

        if let Some(mut session) = self.session.take() {
            session.close();
        }

        Ok(())
    }
}

// Instead of requiring an explicit release, we implement Drop and use RAII to close the session.
impl<B: DecoderBackend> Drop for DecodeSessionAdapter<B> {
    fn drop(&mut self) {
        if self.state() != AdapterState::ShutDown {
            let _ = self.shutdown();
        }
    }
}
