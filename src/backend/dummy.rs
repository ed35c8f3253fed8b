// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the adapter run so we can test
//! it in isolation.
//!
//! Submitted samples are queued until the test decides to report them through the [`Controller`],
//! from any thread and at any time, which allows simulating late or out-of-band hardware
//! callbacks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DecodeSession;
use crate::backend::DecoderBackend;
use crate::backend::HwDecodeResult;
use crate::backend::SessionCallback;
use crate::backend::SubmissionTag;
use crate::decoder::DecoderConfig;
use crate::decoder::EncodedSample;
use crate::EncodedFormat;

/// The "decoded" picture is the compressed payload.
pub(crate) type Picture = Bytes;

#[derive(Default)]
struct State {
    callback: Option<SessionCallback<Picture>>,
    queued: VecDeque<(SubmissionTag, EncodedSample)>,
    reject_next: bool,
    lose_on_drain: bool,
    num_submitted: usize,
    num_resets: usize,
    num_opened: usize,
    closed: bool,
}

/// Test-side handle on the sessions of a dummy [`Backend`].
#[derive(Clone, Default)]
pub(crate) struct Controller(Arc<Mutex<State>>);

impl Controller {
    /// Reports the oldest queued sample as decoded. Returns `false` if nothing was queued.
    pub(crate) fn fire_next(&self) -> bool {
        self.fire_next_with(|sample| HwDecodeResult::Decoded(sample.data.clone()))
    }

    /// Reports the oldest queued sample with the result built by `f`.
    pub(crate) fn fire_next_with<F>(&self, f: F) -> bool
    where
        F: FnOnce(&EncodedSample) -> HwDecodeResult<Picture>,
    {
        let (next, callback) = {
            let mut state = self.0.lock().unwrap();
            (state.queued.pop_front(), state.callback.clone())
        };

        match (next, callback) {
            (Some((tag, sample)), Some(callback)) => {
                callback.deliver(tag, f(&sample));
                true
            }
            _ => false,
        }
    }

    /// Reports every queued sample as decoded, oldest first.
    pub(crate) fn fire_all(&self) -> usize {
        let mut count = 0;
        while self.fire_next() {
            count += 1;
        }
        count
    }

    /// Takes the queued samples away from the session, so the test can report them later.
    pub(crate) fn take_queued(&self) -> Vec<(SubmissionTag, EncodedSample)> {
        self.0.lock().unwrap().queued.drain(..).collect()
    }

    /// Reports `result` for `tag` through the session's callback.
    pub(crate) fn deliver(&self, tag: SubmissionTag, result: HwDecodeResult<Picture>) {
        let callback = self.0.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback.deliver(tag, result);
        }
    }

    /// Makes the next submission fail.
    pub(crate) fn reject_next(&self) {
        self.0.lock().unwrap().reject_next = true;
    }

    /// Makes the next drain report the oldest queued sample as a session-fatal error.
    pub(crate) fn lose_session_on_drain(&self) {
        self.0.lock().unwrap().lose_on_drain = true;
    }

    pub(crate) fn num_queued(&self) -> usize {
        self.0.lock().unwrap().queued.len()
    }

    pub(crate) fn num_submitted(&self) -> usize {
        self.0.lock().unwrap().num_submitted
    }

    pub(crate) fn num_resets(&self) -> usize {
        self.0.lock().unwrap().num_resets
    }

    pub(crate) fn num_opened(&self) -> usize {
        self.0.lock().unwrap().num_opened
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

/// Dummy backend that can be used for any codec except AV1, which it pretends not to support.
pub(crate) struct Backend {
    controller: Controller,
    fail_open: bool,
}

impl Backend {
    pub(crate) fn new() -> (Self, Controller) {
        let controller = Controller::default();
        (
            Self {
                controller: controller.clone(),
                fail_open: false,
            },
            controller,
        )
    }

    /// A backend whose sessions cannot be opened, as if the hardware was busy.
    pub(crate) fn new_failing() -> (Self, Controller) {
        let (mut backend, controller) = Self::new();
        backend.fail_open = true;
        (backend, controller)
    }
}

pub(crate) struct Session {
    controller: Controller,
}

impl DecodeSession for Session {
    fn submit(&mut self, sample: &EncodedSample, tag: SubmissionTag) -> BackendResult<()> {
        let mut state = self.controller.0.lock().unwrap();
        if std::mem::take(&mut state.reject_next) {
            return Err(BackendError::Rejected("malformed sample".into()));
        }
        state.num_submitted += 1;
        state.queued.push_back((tag, sample.clone()));
        Ok(())
    }

    fn drain(&mut self) -> BackendResult<()> {
        let lose = std::mem::take(&mut self.controller.0.lock().unwrap().lose_on_drain);
        if lose {
            self.controller
                .fire_next_with(|_| HwDecodeResult::Fatal(anyhow::anyhow!("device lost")));
        }
        self.controller.fire_all();
        Ok(())
    }

    fn reset(&mut self) -> BackendResult<()> {
        let mut state = self.controller.0.lock().unwrap();
        state.queued.clear();
        state.num_resets += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.controller.0.lock().unwrap();
        state.queued.clear();
        state.callback = None;
        state.closed = true;
    }
}

impl DecoderBackend for Backend {
    type Picture = Picture;
    type Session = Session;

    fn supports(&self, config: &DecoderConfig) -> bool {
        config.format != EncodedFormat::AV1
    }

    fn open_session(
        &mut self,
        _config: &DecoderConfig,
        callback: SessionCallback<Self::Picture>,
    ) -> BackendResult<Self::Session> {
        if self.fail_open {
            return Err(BackendError::OutOfResources);
        }

        let mut state = self.controller.0.lock().unwrap();
        state.callback = Some(callback);
        state.closed = false;
        state.num_opened += 1;

        Ok(Session {
            controller: self.controller.clone(),
        })
    }
}
