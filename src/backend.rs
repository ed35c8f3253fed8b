// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decode session boundary.
//!
//! A backend is a provider of hardware-accelerated decoding. It opens sessions for a given
//! [`DecoderConfig`], accepts compressed samples, and reports every decoded picture through a
//! [`SessionCallback`], usually from a thread it controls. This module defines the interface the
//! [adapter](crate::decoder::DecodeSessionAdapter) expects from backends, along with the backends
//! provided by this crate.

#[cfg(test)]
pub(crate) mod dummy;
pub mod threaded;

use std::sync::Weak;

use thiserror::Error;

use crate::decoder::DecoderConfig;
use crate::decoder::EncodedSample;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("this configuration is not supported")]
    UnsupportedConfig,
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error("sample rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Opaque value attached to every submitted sample, that the backend must hand back unchanged with
/// the sample's result.
///
/// It carries the generation of the submission, which lets the adapter recognize callbacks for
/// samples submitted before a flush.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubmissionTag {
    generation: u64,
}

impl SubmissionTag {
    pub(crate) fn new(generation: u64) -> Self {
        Self { generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of decoding one sample, as reported by the hardware.
#[derive(Debug)]
pub enum HwDecodeResult<P> {
    Decoded(P),
    /// This sample could not be decoded, the session remains usable.
    Failed(anyhow::Error),
    /// The session is unusable.
    Fatal(anyhow::Error),
}

/// Receiver of the results reported through a [`SessionCallback`].
pub(crate) trait CallbackTarget<P>: Send + Sync {
    fn on_result(&self, tag: SubmissionTag, result: HwDecodeResult<P>);
}

/// Handle given to a session at creation time, through which it reports decoded samples.
///
/// Results must be reported in submission order, exactly once per submitted sample. The handle can
/// be cloned and invoked from any thread. Results reported after the receiving decoder is gone are
/// ignored.
pub struct SessionCallback<P> {
    target: Weak<dyn CallbackTarget<P>>,
}

impl<P> Clone for SessionCallback<P> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
        }
    }
}

impl<P> SessionCallback<P> {
    pub(crate) fn new(target: Weak<dyn CallbackTarget<P>>) -> Self {
        Self { target }
    }

    /// Reports the result of the sample submitted with `tag`.
    pub fn deliver(&self, tag: SubmissionTag, result: HwDecodeResult<P>) {
        match self.target.upgrade() {
            Some(target) => target.on_result(tag, result),
            None => log::debug!("decoder is gone, dropping result for {:?}", tag),
        }
    }
}

/// An open hardware decode session.
pub trait DecodeSession: Send {
    /// Queues `sample` for decoding. The result is reported asynchronously through the session's
    /// callback, with `tag`.
    ///
    /// May block while the hardware's submission queue is full.
    fn submit(&mut self, sample: &EncodedSample, tag: SubmissionTag) -> BackendResult<()>;

    /// Blocks until the result of every submitted sample has been reported.
    fn drain(&mut self) -> BackendResult<()>;

    /// Abandons the samples that are waiting to be decoded. Samples the hardware is already working
    /// on may still be reported after this returns.
    fn reset(&mut self) -> BackendResult<()>;

    /// Releases the session. No result is reported after this returns.
    fn close(&mut self);
}

/// A family of decode sessions, e.g. one hardware API.
pub trait DecoderBackend {
    /// Type of the decoded pictures.
    type Picture: Send + 'static;
    type Session: DecodeSession;

    fn is_hardware_accelerated(&self) -> bool {
        true
    }

    /// Whether the backend can decode streams described by `config`.
    fn supports(&self, config: &DecoderConfig) -> bool;

    /// Opens a session for `config`, reporting results through `callback`.
    fn open_session(
        &mut self,
        config: &DecoderConfig,
        callback: SessionCallback<Self::Picture>,
    ) -> BackendResult<Self::Session>;
}
