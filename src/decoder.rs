// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types shared by the reorder queue and the session adapter.
//!
//! A compressed [`EncodedSample`] submitted to the decoder produces exactly one
//! [`FrameReference`], which travels alongside the sample until the hardware hands back the
//! matching picture. Pictures then go through a [`ReorderQueue`] and are delivered to a
//! [`DecoderOutput`] in presentation order.

pub mod adapter;
pub mod reorder;

use bytes::Bytes;
use thiserror::Error;

pub use adapter::AdapterState;
pub use adapter::DecodeSessionAdapter;
pub use reorder::ReorderQueue;

use crate::backend::BackendError;
use crate::EncodedFormat;
use crate::Resolution;
use crate::TimeUnit;

/// Largest reorder depth accepted in a [`DecoderConfig`]. H.264 and H.265 cap their DPB at 16
/// frames, the other supported codecs use fewer references.
pub const MAX_REORDER_DEPTH: u32 = 16;

/// A compressed sample, as produced by a container reader.
#[derive(Debug, Clone, Default)]
pub struct EncodedSample {
    /// Compressed payload, forwarded untouched to the hardware.
    pub data: Bytes,
    /// Decode timestamp.
    pub timecode: TimeUnit,
    /// Presentation timestamp.
    pub time: TimeUnit,
    pub duration: TimeUnit,
    /// Position of the sample in its source, informational only.
    pub offset: i64,
    pub keyframe: bool,
}

impl EncodedSample {
    pub fn new(data: impl Into<Bytes>, timecode: TimeUnit, time: TimeUnit) -> Self {
        Self {
            data: data.into(),
            timecode,
            time,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: TimeUnit) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }
}

/// Metadata of one submitted sample, attached to its decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReference {
    pub decode_timestamp: TimeUnit,
    pub presentation_timestamp: TimeUnit,
    pub duration: TimeUnit,
    pub byte_offset: i64,
    /// Whether the frame can be decoded without any previous frame.
    pub is_sync_point: bool,
}

impl FrameReference {
    pub fn new(
        decode_timestamp: TimeUnit,
        presentation_timestamp: TimeUnit,
        duration: TimeUnit,
        byte_offset: i64,
        is_sync_point: bool,
    ) -> Self {
        Self {
            decode_timestamp,
            presentation_timestamp,
            duration,
            byte_offset,
            is_sync_point,
        }
    }

    /// Presentation time at which the frame stops being displayed.
    pub fn end_timestamp(&self) -> TimeUnit {
        self.presentation_timestamp + self.duration
    }
}

impl From<&EncodedSample> for FrameReference {
    fn from(sample: &EncodedSample) -> Self {
        Self::new(
            sample.timecode,
            sample.time,
            sample.duration,
            sample.offset,
            sample.keyframe,
        )
    }
}

/// Parameters of the stream to decode.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub format: EncodedFormat,
    /// Size of the decoded pictures.
    pub coded_resolution: Resolution,
    /// Size at which the pictures are meant to be displayed.
    pub display_resolution: Resolution,
    /// Maximum distance, in frames, between a frame and the frames it references. Used as the
    /// reorder depth.
    pub max_ref_frames: u32,
    /// Codec-specific initialization data (e.g. avcC for H.264), passed opaquely to the backend.
    pub extra_data: Bytes,
}

impl DecoderConfig {
    pub fn new(format: EncodedFormat, coded_resolution: Resolution) -> Self {
        Self {
            format,
            coded_resolution,
            display_resolution: coded_resolution,
            max_ref_frames: 0,
            extra_data: Bytes::new(),
        }
    }

    pub fn with_display_resolution(mut self, display_resolution: Resolution) -> Self {
        self.display_resolution = display_resolution;
        self
    }

    pub fn with_max_ref_frames(mut self, max_ref_frames: u32) -> Self {
        self.max_ref_frames = max_ref_frames;
        self
    }

    pub fn with_extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = extra_data.into();
        self
    }

    /// Number of pictures the reorder queue may withhold for this stream.
    pub fn reorder_depth(&self) -> usize {
        self.max_ref_frames as usize
    }

    /// Checks the parameters that do not depend on the backend.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.coded_resolution.is_empty() {
            return Err(ConfigError::InvalidResolution(self.coded_resolution));
        }
        if self.display_resolution.is_empty() {
            return Err(ConfigError::InvalidResolution(self.display_resolution));
        }
        if self.max_ref_frames > MAX_REORDER_DEPTH {
            return Err(ConfigError::ReorderDepthTooLarge(self.max_ref_frames));
        }

        Ok(())
    }
}

/// Receiver of the decoder's output.
///
/// Frames are delivered from whichever context releases them: the hardware callback thread in
/// steady state, the caller of [`DecodeSessionAdapter::drain`] for the frames released at the end
/// of a drain. The adapter's internal lock is held during delivery, so implementations must not
/// call back into the adapter.
pub trait DecoderOutput<P>: Send {
    /// A picture is ready, in presentation order.
    fn on_decoded_frame(&mut self, picture: P, reference: FrameReference);

    /// All the output of a [`DecodeSessionAdapter::drain`] call has been delivered.
    fn on_drain_complete(&mut self);

    /// A previously accepted sample could not be decoded, or the session was lost.
    fn on_decode_error(&mut self, error: DecodeError);
}

/// Errors that make a configuration unusable. Never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("format {0:?} is not supported by the backend")]
    Unsupported(EncodedFormat),
    #[error("invalid resolution {0}")]
    InvalidResolution(Resolution),
    #[error("reorder depth {0} exceeds the maximum of {}", MAX_REORDER_DEPTH)]
    ReorderDepthTooLarge(u32),
    #[error("failed to open decode session: {0}")]
    Backend(#[from] BackendError),
}

/// A single sample was refused by the hardware. The adapter remains usable.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("sample at {} rejected: {source}", .reference.decode_timestamp)]
    Rejected {
        reference: FrameReference,
        #[source]
        source: BackendError,
    },
}

/// Errors delivered asynchronously through [`DecoderOutput::on_decode_error`].
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The frame is lost, the stream continues.
    #[error("failed to decode frame at {}: {source}", .reference.presentation_timestamp)]
    Failed {
        reference: FrameReference,
        #[source]
        source: anyhow::Error,
    },
    /// The hardware returned without producing a result for this frame.
    #[error("no output received for frame at {}", .0.presentation_timestamp)]
    MissingOutput(FrameReference),
    /// The session is unusable, the adapter must be replaced.
    #[error("decode session lost: {0}")]
    SessionLost(anyhow::Error),
}

/// Errors returned synchronously by the [`DecodeSessionAdapter`] operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Submission(#[from] SubmitError),
    #[error("{operation} is not valid in state {state:?}")]
    Lifecycle {
        operation: &'static str,
        state: AdapterState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
