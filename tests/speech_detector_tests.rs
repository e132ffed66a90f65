//! End-to-end detection through the speech detector facade

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use parking_lot::Mutex;
use speech_trigger::detector::EpdState;
use speech_trigger::device::{DeviceRoute, DeviceRouter, ProcessMessage, ProcessSubtype, SimulatedDevice};
use speech_trigger::models::{energy_pipeline_factory, EnergyConfig};
use speech_trigger::{SpeechDetector, SpeechDetectorConfig, SpeechDetectorEvent, SpeechDetectorListener};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const INPUT: DeviceRoute = DeviceRoute::new(0, 0);
const DSP: DeviceRoute = DeviceRoute::new(0, 1);
const SAMPLE_RATE: u32 = 16000;

struct ChannelListener {
    tx: Mutex<mpsc::Sender<SpeechDetectorEvent>>,
}

impl SpeechDetectorListener for ChannelListener {
    fn on_event(&self, event: SpeechDetectorEvent) {
        let _ = self.tx.lock().send(event);
    }
}

fn listener() -> (Arc<dyn SpeechDetectorListener>, mpsc::Receiver<SpeechDetectorEvent>) {
    let (tx, rx) = mpsc::channel();
    let listener: Arc<dyn SpeechDetectorListener> = Arc::new(ChannelListener { tx: Mutex::new(tx) });
    (listener, rx)
}

fn config(delivery_bytes: usize) -> SpeechDetectorConfig {
    SpeechDetectorConfig {
        delivery_bytes,
        process_msg_timeout_ms: 10,
        ..SpeechDetectorConfig::default()
    }
}

fn software_detector(delivery_bytes: usize) -> SpeechDetector {
    let router: Arc<dyn DeviceRouter> = Arc::new(SimulatedDevice::new(INPUT));
    SpeechDetector::new(
        &config(delivery_bytes),
        router,
        energy_pipeline_factory(EnergyConfig::default()),
    )
    .unwrap()
}

/// Half a second of tone followed by a second of silence
fn utterance() -> Vec<i16> {
    let tone = (0..SAMPLE_RATE / 2).map(|n| {
        let t = n as f32 / SAMPLE_RATE as f32;
        ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3 * i16::MAX as f32) as i16
    });
    tone.chain(std::iter::repeat(0).take(SAMPLE_RATE as usize)).collect()
}

fn to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn wait_for(
    rx: &mpsc::Receiver<SpeechDetectorEvent>,
    wanted: SpeechDetectorEvent,
) -> Vec<SpeechDetectorEvent> {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
            seen.push(event);
            if event == wanted {
                break;
            }
        }
    }
    seen
}

#[test_log::test]
fn test_software_end_point_from_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterance.wav");
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec).unwrap();
    for sample in utterance() {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();

    let samples: Vec<i16> = WavReader::open(&path)
        .unwrap()
        .samples()
        .collect::<Result<_, _>>()
        .unwrap();
    let audio = to_bytes(&samples);

    let mut detector = software_detector(1024);
    let (handle, events) = listener();
    assert!(detector.add_listener(&handle));
    assert!(detector.init_end_point_detect());
    assert_eq!(detector.audio_buffer_size(), 1024);

    assert!(detector.start_end_point_detect(-1));
    for chunk in audio.chunks(1024) {
        assert!(detector.detect_end_point(chunk));
    }
    assert!(detector.wait_idle());

    let seen: Vec<_> = events.try_iter().collect();
    let end = seen
        .iter()
        .position(|e| *e == SpeechDetectorEvent::EndPointDetected)
        .expect("no end point detected");
    assert!(seen[..end].contains(&SpeechDetectorEvent::SpeechDetected));
    assert_eq!(
        seen.iter()
            .filter(|e| **e == SpeechDetectorEvent::EndPointDetected)
            .count(),
        1
    );

    assert!(detector.stop_end_point_detect());
    assert_eq!(detector.end_point_state(), EpdState::Stop);
    detector.shutdown();
}

#[test_log::test]
fn test_audio_before_start_is_ignored() {
    let detector = software_detector(512);
    let (handle, events) = listener();
    detector.add_listener(&handle);
    assert!(detector.init_end_point_detect());

    let audio = to_bytes(&utterance());
    for chunk in audio.chunks(512) {
        detector.detect_end_point(chunk);
    }
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::Idle);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_short_delivery_fails_init() {
    // 256 bytes cannot fill a 512-byte inference window
    let detector = software_detector(256);
    assert!(!detector.init_end_point_detect());
    assert_eq!(detector.audio_buffer_size(), 0);
    assert!(!detector.stop_end_point_detect());
}

#[test]
fn test_padded_buffer_size() {
    let detector = software_detector(700);
    assert!(detector.init_end_point_detect());
    assert_eq!(detector.audio_buffer_size(), 89600);
}

#[test]
fn test_removed_listener_gets_nothing() {
    let detector = software_detector(512);
    let (handle, events) = listener();
    assert!(detector.add_listener(&handle));
    assert!(!detector.add_listener(&handle));
    assert!(detector.remove_listener(&handle));
    assert!(!detector.remove_listener(&handle));

    assert!(detector.init_end_point_detect());
    detector.start_end_point_detect(0);
    for chunk in to_bytes(&utterance()).chunks(512) {
        detector.detect_end_point(chunk);
    }
    assert!(detector.wait_idle());
    assert!(events.try_recv().is_err());
}

#[test_log::test]
fn test_stop_cancels_queued_audio() {
    let detector = software_detector(512);
    assert!(detector.init_end_point_detect());
    assert!(detector.start_end_point_detect(0));
    // The start itself must not be cancelled
    assert!(detector.wait_idle());
    for chunk in to_bytes(&utterance()).chunks(512) {
        detector.detect_end_point(chunk);
    }

    assert!(detector.stop_end_point_detect());
    assert_eq!(detector.end_point_state(), EpdState::Stop);
    assert!(!detector.stop_end_point_detect());

    // Restart is allowed from Stop
    assert!(detector.start_end_point_detect(0));
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::InProgress);
}

#[test_log::test]
fn test_hardware_keyword_and_local_commands() {
    let device = Arc::new(
        SimulatedDevice::new(INPUT)
            .with_speech_detect(DSP, &[ProcessSubtype::Keyword, ProcessSubtype::EndPoint]),
    );
    let router: Arc<dyn DeviceRouter> = device.clone();
    let mut detector = SpeechDetector::new(
        &config(1024),
        router,
        energy_pipeline_factory(EnergyConfig::default()),
    )
    .unwrap();
    assert_eq!(detector.capabilities().hardware_keyword, Some(DSP));

    let (handle, events) = listener();
    detector.add_listener(&handle);

    assert!(detector.init_keyword_detect());
    assert_eq!(device.stream_in_device(), DSP);
    assert!(detector.start_keyword_detect());
    assert!(detector.wait_idle());
    assert!(detector.is_keyword_detecting());

    assert!(device.inject(DSP, ProcessMessage::Keyword));
    assert_eq!(
        wait_for(&events, SpeechDetectorEvent::KeywordDetected).last(),
        Some(&SpeechDetectorEvent::KeywordDetected)
    );

    assert!(device.inject(DSP, ProcessMessage::Local(3)));
    assert_eq!(
        wait_for(&events, SpeechDetectorEvent::LocalCommand(3)).last(),
        Some(&SpeechDetectorEvent::LocalCommand(3))
    );

    assert!(detector.stop_keyword_detect());
    assert!(detector.wait_idle());
    assert!(!detector.is_keyword_detecting());

    assert!(detector.deinit_keyword_detect());
    assert_eq!(device.stream_in_device(), INPUT);
    detector.shutdown();
    assert_eq!(device.handler_refcount(DSP), 0);
}

#[test_log::test]
fn test_hardware_end_point_wait() {
    let device = Arc::new(SimulatedDevice::new(INPUT).with_speech_detect(DSP, &[ProcessSubtype::EndPoint]));
    let router: Arc<dyn DeviceRouter> = device.clone();
    let detector = SpeechDetector::new(
        &config(1024),
        router,
        energy_pipeline_factory(EnergyConfig::default()),
    )
    .unwrap();
    assert_eq!(detector.capabilities().hardware_end_point, Some(DSP));
    assert_eq!(detector.audio_buffer_size(), 0);

    let (handle, events) = listener();
    detector.add_listener(&handle);
    assert!(detector.init_end_point_detect());
    assert!(detector.start_end_point_detect(3000));

    let feeder = {
        let device = device.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !device.inject(DSP, ProcessMessage::Speech) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            device.inject(DSP, ProcessMessage::EndPoint)
        })
    };
    assert!(feeder.join().unwrap());

    let seen = wait_for(&events, SpeechDetectorEvent::EndPointDetected);
    assert_eq!(
        seen,
        vec![
            SpeechDetectorEvent::SpeechDetected,
            SpeechDetectorEvent::EndPointDetected
        ]
    );
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::Idle);
}

#[test]
fn test_forced_software_skips_dsp() {
    let device = Arc::new(SimulatedDevice::new(INPUT).with_speech_detect(DSP, &[ProcessSubtype::EndPoint]));
    let router: Arc<dyn DeviceRouter> = device.clone();
    let config = SpeechDetectorConfig {
        force_software: true,
        ..config(1024)
    };
    let detector =
        SpeechDetector::new(&config, router, energy_pipeline_factory(EnergyConfig::default())).unwrap();

    assert_eq!(detector.capabilities().hardware_end_point, None);
    assert!(detector.init_end_point_detect());
    assert_eq!(device.stream_in_device(), INPUT);
    assert_eq!(detector.audio_buffer_size(), 1024);
}

fn hardware_detector(subtypes: &[ProcessSubtype]) -> (Arc<SimulatedDevice>, SpeechDetector) {
    let device = Arc::new(SimulatedDevice::new(INPUT).with_speech_detect(DSP, subtypes));
    let router: Arc<dyn DeviceRouter> = device.clone();
    let detector = SpeechDetector::new(
        &config(1024),
        router,
        energy_pipeline_factory(EnergyConfig::default()),
    )
    .unwrap();
    (device, detector)
}

#[test_log::test]
fn test_stop_interrupts_hardware_end_point_wait() {
    let (device, detector) = hardware_detector(&[ProcessSubtype::EndPoint]);
    assert!(detector.init_end_point_detect());
    assert!(detector.start_end_point_detect(-1));
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::InProgress);

    // Stop from another thread, as a capture or UI thread would
    let detector = Arc::new(detector);
    let stopper = {
        let detector = detector.clone();
        thread::spawn(move || {
            let started = Instant::now();
            (detector.stop_end_point_detect(), started.elapsed())
        })
    };
    let (stopped, elapsed) = stopper.join().unwrap();
    assert!(stopped);
    assert!(elapsed < Duration::from_millis(500), "stop took {:?}", elapsed);
    assert_eq!(detector.end_point_state(), EpdState::Stop);
    assert!(!device.is_process_started(DSP, ProcessSubtype::EndPoint));
    assert!(!detector.stop_end_point_detect());
}

#[test_log::test]
fn test_keyword_during_hardware_end_point_wait() {
    let (device, detector) =
        hardware_detector(&[ProcessSubtype::Keyword, ProcessSubtype::EndPoint]);
    let (handle, events) = listener();
    detector.add_listener(&handle);

    assert!(detector.init_keyword_detect());
    assert!(detector.init_end_point_detect());
    assert!(detector.start_keyword_detect());
    assert!(detector.start_end_point_detect(-1));
    assert!(detector.wait_idle());

    assert!(device.inject(DSP, ProcessMessage::Keyword));
    assert_eq!(
        wait_for(&events, SpeechDetectorEvent::KeywordDetected).last(),
        Some(&SpeechDetectorEvent::KeywordDetected)
    );
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::InProgress);

    assert!(device.inject(DSP, ProcessMessage::EndPoint));
    assert_eq!(
        wait_for(&events, SpeechDetectorEvent::EndPointDetected).last(),
        Some(&SpeechDetectorEvent::EndPointDetected)
    );
    assert!(detector.wait_idle());
    assert_eq!(detector.end_point_state(), EpdState::Idle);
    assert!(detector.is_keyword_detecting());
}
