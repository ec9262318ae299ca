//! Concurrency stress and interleaving properties.
//!
//! Frames are filled with a single byte value derived from their arrival
//! index and tagged with the same index in their LTC user bits, so a torn
//! frame or a frame paired with the wrong timecode is detectable on fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use deckbridge::capture::{RawTimecode, SoftwareConverter, TimecodeFormat};
use deckbridge::device::CompletionResult;
use deckbridge::loopback::{LoopbackDevice, LoopbackInput, LoopbackOutput, SyntheticFrame};
use deckbridge::{
    CaptureChannel, CaptureConfig, DeviceContext, DisplayMode, DisplayModeId, Frame,
    OutputChannel, OutputConfig, PixelFormat, Resolution, TimecodeBundle,
};

const ITERATIONS: u64 = 10_000;
const WIDTH: u32 = 8;
const HEIGHT: u32 = 4;

fn value_for(index: u64) -> u8 {
    (index % 250 + 1) as u8
}

fn tagged_frame(index: u64) -> SyntheticFrame {
    let tc = RawTimecode {
        frames: (index % 30) as u8,
        user_bits: index as u32,
        ..RawTimecode::default()
    };
    SyntheticFrame::solid(WIDTH, HEIGHT, value_for(index)).with_timecode(TimecodeFormat::Rp188Ltc, tc)
}

fn capture_rig() -> (DeviceContext, Arc<LoopbackInput>, CaptureChannel) {
    let context = DeviceContext::new(Arc::new(SoftwareConverter));
    let device = LoopbackDevice::builder("Loopback").output(false).build();
    let input = device.input_handle().unwrap();
    let config = CaptureConfig {
        convert: false,
        ..CaptureConfig::default()
    };
    let capture = CaptureChannel::new(&context, &device, &config).unwrap();
    (context, input, capture)
}

/// Check a fetched frame is whole and paired with its own timecode.
/// Returns the arrival index it was tagged with.
fn check_fetched(frame: &Frame, timecodes: &TimecodeBundle) -> u64 {
    let bytes = frame.as_bytes();
    let value = bytes[0];
    assert_ne!(value, 0, "no-signal data reached the consumer");
    assert!(bytes.iter().all(|b| *b == value), "torn frame");

    let user_bits = &timecodes.get(TimecodeFormat::Rp188Ltc).user_bits;
    let index = u64::from_str_radix(user_bits.trim_start_matches("0x"), 16).unwrap();
    assert_eq!(value_for(index), value, "timecode from a different frame");
    index
}

#[test]
fn concurrent_delivery_and_fetch() {
    let (_context, input, capture) = capture_rig();
    assert!(capture.start(DisplayModeId::HD1080P30, false));
    let done = AtomicBool::new(false);

    let fetched = std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ITERATIONS {
                if i % 7 == 3 {
                    input.deliver(&SyntheticFrame::no_signal(WIDTH, HEIGHT));
                } else {
                    input.deliver(&tagged_frame(i));
                }
            }
            done.store(true, Ordering::Release);
        });

        let consumer = s.spawn(|| {
            let mut frame = Frame::default();
            let mut timecodes = TimecodeBundle::default();
            let mut last_sequence = 0;
            let mut last_index = None;
            let mut fetched = 0u64;
            loop {
                let finished = done.load(Ordering::Acquire);
                if capture.fetch_frame(&mut frame, Some(&mut timecodes)) {
                    let index = check_fetched(&frame, &timecodes);
                    assert!(frame.sequence() > last_sequence, "out of order");
                    assert!(last_index.map_or(true, |last| index > last));
                    last_sequence = frame.sequence();
                    last_index = Some(index);
                    fetched += 1;
                } else if finished {
                    break;
                }
            }
            fetched
        });
        consumer.join().unwrap()
    });

    let stats = capture.stats();
    assert!(fetched >= 1);
    assert_eq!(stats.slot.fetched, fetched);
    assert_eq!(stats.arrived, ITERATIONS);
    assert_eq!(stats.slot.published + stats.no_signal, ITERATIONS);
    assert_eq!(
        stats.slot.published,
        stats.slot.fetched + stats.slot.overwritten
    );
}

#[test]
fn start_stop_and_format_changes_race_with_delivery() {
    let (_context, input, capture) = capture_rig();
    assert!(capture.start(DisplayModeId::HD1080P30, true));
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ITERATIONS {
                input.deliver(&tagged_frame(i));
            }
            done.store(true, Ordering::Release);
        });

        s.spawn(|| {
            let modes = [DisplayModeId::PAL, DisplayModeId::HD1080P30];
            let mut n = 0usize;
            while !done.load(Ordering::Acquire) {
                input.change_format(modes[n % 2], Default::default());
                n += 1;
            }
        });

        s.spawn(|| {
            let mut n = 0u32;
            while !done.load(Ordering::Acquire) {
                if n % 2 == 0 {
                    capture.stop();
                } else {
                    capture.start(DisplayModeId::HD1080P30, true);
                }
                n += 1;
            }
        });

        let mut frame = Frame::default();
        let mut timecodes = TimecodeBundle::default();
        while !done.load(Ordering::Acquire) {
            if capture.fetch_frame(&mut frame, Some(&mut timecodes)) {
                check_fetched(&frame, &timecodes);
            }
        }
    });

    // whatever state the race ended in, the channel still works
    capture.stop();
    assert!(capture.start(DisplayModeId::PAL, true));
    assert!(input.deliver(&tagged_frame(1)));
    let mut frame = Frame::default();
    let mut timecodes = TimecodeBundle::default();
    assert!(capture.fetch_frame(&mut frame, Some(&mut timecodes)));
    assert_eq!(check_fetched(&frame, &timecodes), 1);
}

fn tiny_output() -> (Arc<LoopbackOutput>, OutputChannel) {
    let mode = DisplayMode {
        id: DisplayModeId::from_fourcc(b"tiny"),
        name: "Tiny".into(),
        resolution: Resolution::new(4, 2),
        frame_duration: 1000,
        time_scale: 25000,
    };
    let id = mode.id;
    let device = LoopbackDevice::builder("Playout")
        .input(false)
        .modes(vec![mode])
        .build();
    let output = device.output_handle().unwrap();
    let channel = OutputChannel::new(&device, &OutputConfig::default()).unwrap();
    assert!(channel.start(id));
    (output, channel)
}

fn uniform_surface(value: u8) -> Frame {
    let mut frame = Frame::new(4, 2, PixelFormat::Bgra8Bit);
    frame.as_bytes_mut().fill(value);
    frame
}

#[test]
fn concurrent_submit_and_completion() {
    let (output, channel) = tiny_output();
    assert!(channel.submit(&uniform_surface(1)));
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ITERATIONS {
                assert!(channel.submit(&uniform_surface(value_for(i))));
            }
            done.store(true, Ordering::Release);
        });

        let mut completions = 0u64;
        while !done.load(Ordering::Acquire) {
            assert!(output.complete_next(CompletionResult::Completed));
            completions += 1;
            let bytes = output.last_scheduled_bytes().unwrap();
            assert!(bytes.iter().all(|b| *b == bytes[0]), "torn surface");
        }
        assert_eq!(channel.frames_scheduled(), 3 + completions);
        assert_eq!(output.scheduled_len(), 3);
    });
}

// ── Interleaving properties ──────────────────────────────────────────

#[derive(Debug, Clone)]
enum CaptureOp {
    Deliver(u8),
    NoSignal,
    Fetch,
    Stop,
    Start,
}

fn capture_op() -> impl Strategy<Value = CaptureOp> {
    prop_oneof![
        4 => (1u8..=250).prop_map(CaptureOp::Deliver),
        1 => Just(CaptureOp::NoSignal),
        4 => Just(CaptureOp::Fetch),
        1 => Just(CaptureOp::Stop),
        1 => Just(CaptureOp::Start),
    ]
}

#[derive(Debug, Clone)]
enum OutputOp {
    Submit(u8),
    Complete,
}

fn output_op() -> impl Strategy<Value = OutputOp> {
    prop_oneof![
        (0u8..=255).prop_map(OutputOp::Submit),
        Just(OutputOp::Complete),
    ]
}

proptest! {
    #[test]
    fn fetch_sees_exactly_the_latest_unread_frame(ops in prop::collection::vec(capture_op(), 1..64)) {
        let (_context, input, capture) = capture_rig();
        prop_assert!(capture.start(DisplayModeId::PAL, false));

        let mut capturing = true;
        let mut unread: Option<u8> = None;
        let mut out = Frame::default();

        for op in ops {
            match op {
                CaptureOp::Deliver(value) => {
                    let delivered = input.deliver(&SyntheticFrame::solid(2, 1, value));
                    prop_assert_eq!(delivered, capturing);
                    if capturing {
                        unread = Some(value);
                    }
                }
                CaptureOp::NoSignal => {
                    input.deliver(&SyntheticFrame::no_signal(2, 1));
                }
                CaptureOp::Fetch => {
                    let fetched = capture.fetch_frame(&mut out, None);
                    prop_assert_eq!(fetched, unread.is_some());
                    if let Some(value) = unread.take() {
                        prop_assert!(out.as_bytes().iter().all(|b| *b == value));
                    }
                }
                CaptureOp::Stop => {
                    capture.stop();
                    capturing = false;
                }
                CaptureOp::Start => {
                    let started = capture.start(DisplayModeId::PAL, false);
                    prop_assert_eq!(started, !capturing);
                    if started {
                        unread = None;
                    }
                    capturing = true;
                }
            }
        }
    }

    #[test]
    fn completions_always_carry_the_latest_surface(ops in prop::collection::vec(output_op(), 1..64)) {
        let (output, channel) = tiny_output();
        let mut latest: Option<u8> = None;
        let mut expected_scheduled = 3u64;

        for op in ops {
            match op {
                OutputOp::Submit(value) => {
                    prop_assert!(channel.submit(&uniform_surface(value)));
                    latest = Some(value);
                }
                OutputOp::Complete => {
                    prop_assert!(output.complete_next(CompletionResult::Completed));
                    if let Some(value) = latest {
                        expected_scheduled += 1;
                        prop_assert_eq!(output.last_scheduled_bytes(), Some(vec![value; 32]));
                    }
                }
            }
            prop_assert_eq!(channel.frames_scheduled(), expected_scheduled);
            if output.scheduled_len() == 0 {
                // every buffer was returned without a surface to refill it
                break;
            }
        }
    }
}
