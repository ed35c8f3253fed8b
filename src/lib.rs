// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation-order reordering and session lifecycle for asynchronous hardware video decoders.
//!
//! Hardware decoders return pictures in decode order, through a callback that usually runs on a
//! thread owned by the hardware subsystem. The [`decoder::DecodeSessionAdapter`] sits between a
//! sample source and such a [backend](crate::backend): it tags every submitted sample with a
//! [`decoder::FrameReference`], pairs each callback with its reference, and releases pictures in
//! presentation order through a [`decoder::ReorderQueue`].

pub mod backend;
pub mod decoder;

use std::fmt;
use std::ops::Add;
use std::ops::Sub;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Codec of the compressed samples fed to a decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    H264,
    H265,
    VP8,
    VP9,
    AV1,
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" => Ok(EncodedFormat::H265),
            "vp8" | "VP8" => Ok(EncodedFormat::VP8),
            "vp9" | "VP9" => Ok(EncodedFormat::VP9),
            "av1" | "AV1" => Ok(EncodedFormat::AV1),
            _ => Err("unrecognized input format. Valid values: h264, h265, vp8, vp9, av1"),
        }
    }
}

/// A point in (or span of) media time, in microseconds.
///
/// Values can be negative: decode timestamps of streams with B-frames commonly start before zero.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeUnit(i64);

impl TimeUnit {
    pub const ZERO: TimeUnit = TimeUnit(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }
}

impl Add for TimeUnit {
    type Output = TimeUnit;

    fn add(self, rhs: TimeUnit) -> TimeUnit {
        TimeUnit(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TimeUnit {
    type Output = TimeUnit;

    fn sub(self, rhs: TimeUnit) -> TimeUnit {
        TimeUnit(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}
