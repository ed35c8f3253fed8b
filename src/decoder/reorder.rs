// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded-delay reordering of decoded pictures.
//!
//! Pictures enter the queue in decode order and leave it in presentation order. The queue can only
//! reorder pictures that arrive at most `depth` positions late: it withholds up to `depth`
//! pictures, and releases the earliest one as soon as it holds more than that. Once a drain is
//! requested the depth no longer applies, so the end of a stream is never held back.

use std::collections::VecDeque;

use crate::decoder::FrameReference;
use crate::TimeUnit;

struct Entry<P> {
    reference: FrameReference,
    picture: P,
    /// Arrival order, i.e. decode order. Breaks presentation timestamp ties.
    seq: u64,
}

impl<P> Entry<P> {
    fn key(&self) -> (TimeUnit, u64) {
        (self.reference.presentation_timestamp, self.seq)
    }
}

/// Queue of decoded pictures sorted by presentation timestamp.
pub struct ReorderQueue<P> {
    /// Sorted by `Entry::key`, smallest first.
    entries: VecDeque<Entry<P>>,
    depth: usize,
    next_seq: u64,
    draining: bool,
}

impl<P> ReorderQueue<P> {
    pub fn new(depth: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(depth + 1),
            depth,
            next_seq: 0,
            draining: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Changes the number of pictures the queue may withhold. Applies to the next `pop`.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Whether a drain has been requested and not completed yet.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Presentation timestamp of the next picture to be released.
    pub fn peek_timestamp(&self) -> Option<TimeUnit> {
        self.entries
            .front()
            .map(|e| e.reference.presentation_timestamp)
    }

    /// Inserts `picture` among the held pictures according to its presentation timestamp. Pictures
    /// sharing a timestamp keep their arrival order.
    pub fn push(&mut self, reference: FrameReference, picture: P) {
        let entry = Entry {
            reference,
            picture,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let key = entry.key();
        let pos = self.entries.partition_point(|e| e.key() <= key);
        self.entries.insert(pos, entry);
    }

    /// Releases the picture with the earliest presentation timestamp, if the queue holds more than
    /// `depth` pictures or a drain has been requested.
    pub fn pop(&mut self) -> Option<(FrameReference, P)> {
        if !self.draining && self.entries.len() <= self.depth {
            return None;
        }

        self.entries
            .pop_front()
            .map(|e| (e.reference, e.picture))
    }

    /// Makes every subsequent `pop` release pictures regardless of the depth, until the queue is
    /// flushed or drained.
    pub fn request_drain(&mut self) {
        self.draining = true;
    }

    /// Drops all the held pictures without releasing them.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.draining = false;
    }

    /// Releases all the held pictures in presentation order.
    pub fn drain_all(&mut self) -> Vec<(FrameReference, P)> {
        self.draining = false;
        self.entries
            .drain(..)
            .map(|e| (e.reference, e.picture))
            .collect()
    }
}

impl<P> Default for ReorderQueue<P> {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(dts: i64, pts: i64) -> FrameReference {
        FrameReference::new(
            TimeUnit::from_micros(dts),
            TimeUnit::from_micros(pts),
            TimeUnit::from_micros(1),
            0,
            dts == 0,
        )
    }

    /// Pushes `(dts, pts)` pairs and collects everything released, drained at the end.
    fn run(depth: usize, frames: &[(i64, i64)]) -> Vec<i64> {
        let mut queue = ReorderQueue::new(depth);
        let mut out = vec![];

        for &(dts, pts) in frames {
            queue.push(reference(dts, pts), dts);
            while let Some((r, _)) = queue.pop() {
                out.push(r.presentation_timestamp.as_micros());
            }
        }
        out.extend(
            queue
                .drain_all()
                .into_iter()
                .map(|(r, _)| r.presentation_timestamp.as_micros()),
        );

        out
    }

    #[test]
    fn single_reordered_pair() {
        assert_eq!(run(2, &[(0, 0), (1, 2), (2, 1), (3, 3)]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn hierarchical_b_frames() {
        // I0 P8 B4 b2 b1 b3 b6 b5 b7, a typical 3-level B pyramid.
        let frames = [
            (0, 0),
            (1, 8),
            (2, 4),
            (3, 2),
            (4, 1),
            (5, 3),
            (6, 6),
            (7, 5),
            (8, 7),
        ];
        assert_eq!(run(4, &frames), (0..=8).collect::<Vec<_>>());
    }

    #[test]
    fn withholds_up_to_depth() {
        let mut queue = ReorderQueue::new(2);

        queue.push(reference(0, 0), ());
        assert!(queue.pop().is_none());
        queue.push(reference(1, 2), ());
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 2);

        queue.push(reference(2, 1), ());
        let (r, ()) = queue.pop().unwrap();
        assert_eq!(r.presentation_timestamp, TimeUnit::from_micros(0));
        assert!(queue.pop().is_none());
        assert_eq!(queue.peek_timestamp(), Some(TimeUnit::from_micros(1)));
    }

    #[test]
    fn zero_depth_releases_immediately() {
        let mut queue = ReorderQueue::new(0);
        queue.push(reference(0, 5), 'a');
        assert_eq!(queue.pop().map(|(_, p)| p), Some('a'));
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_timestamps_keep_decode_order() {
        let mut queue = ReorderQueue::new(8);
        for (i, c) in ['a', 'b', 'c'].into_iter().enumerate() {
            queue.push(reference(i as i64, 7), c);
        }
        queue.push(reference(3, 6), 'z');

        let released = queue
            .drain_all()
            .into_iter()
            .map(|(_, p)| p)
            .collect::<String>();
        assert_eq!(released, "zabc");
    }

    #[test]
    fn requested_drain_ignores_depth() {
        let mut queue = ReorderQueue::new(4);
        queue.push(reference(0, 3), ());
        queue.push(reference(1, 1), ());
        assert!(queue.pop().is_none());

        queue.request_drain();
        assert!(queue.is_draining());
        assert_eq!(
            queue.pop().map(|(r, _)| r.presentation_timestamp),
            Some(TimeUnit::from_micros(1))
        );
        assert_eq!(
            queue.pop().map(|(r, _)| r.presentation_timestamp),
            Some(TimeUnit::from_micros(3))
        );
        assert!(queue.pop().is_none());

        // Completing the drain restores the depth.
        assert!(queue.drain_all().is_empty());
        queue.push(reference(2, 4), ());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn flush_discards_everything() {
        let mut queue = ReorderQueue::new(3);
        for i in 0..3 {
            queue.push(reference(i, i), ());
        }
        queue.request_drain();
        queue.flush();

        assert!(queue.is_empty());
        assert!(!queue.is_draining());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn depth_change_applies_to_next_pop() {
        let mut queue = ReorderQueue::new(3);
        queue.push(reference(0, 0), ());
        queue.push(reference(1, 1), ());
        assert!(queue.pop().is_none());

        queue.set_depth(1);
        assert_eq!(queue.depth(), 1);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn released_timestamps_never_decrease_within_depth() {
        // Every window of `depth + 1` frames is presented in reverse decode order, so no frame
        // arrives more than `depth` positions late.
        for depth in [0, 1, 2, 4, 16] {
            let frames = (0..100i64)
                .collect::<Vec<_>>()
                .chunks(depth + 1)
                .flat_map(|w| w.iter().rev().copied().collect::<Vec<_>>())
                .enumerate()
                .map(|(dts, pts)| (dts as i64, pts))
                .collect::<Vec<_>>();

            assert_eq!(run(depth, &frames), (0..100).collect::<Vec<_>>(), "depth {depth}");
        }
    }

    #[test]
    fn released_picture_precedes_held_ones() {
        // Pseudo-random timestamps, deterministic across runs.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut queue = ReorderQueue::new(4);

        for dts in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            queue.push(reference(dts, (state % 1000) as i64), ());

            while let Some((r, ())) = queue.pop() {
                if let Some(next) = queue.peek_timestamp() {
                    assert!(r.presentation_timestamp <= next);
                }
            }
        }

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 4);
        assert!(drained
            .windows(2)
            .all(|w| w[0].0.presentation_timestamp <= w[1].0.presentation_timestamp));
    }
}
