#![no_main]

use hwdec_reorder::decoder::FrameReference;
use hwdec_reorder::decoder::ReorderQueue;
use hwdec_reorder::decoder::MAX_REORDER_DEPTH;
use hwdec_reorder::TimeUnit;
use libfuzzer_sys::fuzz_target;

// The first byte selects the depth, every following byte is the presentation timestamp of one
// picture. A zero byte requests a drain instead.
fuzz_target!(|data: &[u8]| {
    let Some((&depth, timestamps)) = data.split_first() else {
        return;
    };
    let mut queue = ReorderQueue::new(depth as usize % (MAX_REORDER_DEPTH as usize + 1));
    let mut pushed = 0usize;
    let mut released = 0usize;

    for (dts, &pts) in timestamps.iter().enumerate() {
        if pts == 0 {
            queue.request_drain();
        } else {
            let reference = FrameReference::new(
                TimeUnit::from_micros(dts as i64),
                TimeUnit::from_micros(pts as i64),
                TimeUnit::ZERO,
                dts as i64,
                false,
            );
            queue.push(reference, dts);
            pushed += 1;
        }

        while let Some((reference, _)) = queue.pop() {
            released += 1;
            if let Some(next) = queue.peek_timestamp() {
                assert!(reference.presentation_timestamp <= next);
            }
        }
        if !queue.is_draining() {
            assert!(queue.len() <= queue.depth());
        } else {
            assert!(queue.is_empty());
        }
    }

    let drained = queue.drain_all();
    assert!(drained
        .windows(2)
        .all(|w| w[0].0.presentation_timestamp <= w[1].0.presentation_timestamp));
    assert_eq!(pushed, released + drained.len());
});
