// WAV-backed capture and playback devices

mod common;

use std::time::Duration;

use duplex_voice::audio::{sample_time, CaptureBackend, OutputDevice, WavCapture, WavSink};
use duplex_voice::{AudioDevices, DeviceError, WavDevices};

#[tokio::test]
async fn test_capture_replays_file_then_silence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mic.wav");
    common::write_wav(&path, 0.1, 1000);

    let mut capture = WavCapture::new(&path).with_buffer_duration(Duration::from_millis(20));
    let mut rx = capture.start().await.unwrap();
    assert!(capture.is_capturing());

    let mut buffers = Vec::new();
    for _ in 0..8 {
        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.sample_rate, 24_000);
        assert_eq!(raw.channels, 1);
        buffers.push(raw);
    }

    // 100ms of tone in 20ms buffers, then silence
    assert!(buffers[..5].iter().all(|b| b.samples.iter().any(|&s| s != 0)));
    assert!(buffers[6..].iter().all(|b| b.samples.iter().all(|&s| s == 0)));

    capture.stop().await.unwrap();
    assert!(!capture.is_capturing());
}

#[tokio::test]
async fn test_capture_rejects_float_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("float.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    writer.write_sample(0.5f32).unwrap();
    writer.finalize().unwrap();

    let mut capture = WavCapture::new(&path);
    assert!(capture.start().await.is_err());
}

#[tokio::test]
async fn test_capture_rejects_rate_it_cannot_decimate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mic16k.wav");
    common::write_wav_at(&path, 16_000, 1, 0.2, 200);

    let mut capture = WavCapture::new(&path);
    let err = capture.start().await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::UnsupportedFormat {
            sample_rate: 16_000,
            channels: 1
        }
    ));
    assert!(!capture.is_capturing());
}

#[tokio::test]
async fn test_capture_accepts_48khz_stereo() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mic48k.wav");
    common::write_wav_at(&path, 48_000, 2, 0.2, 200);

    let mut capture = WavCapture::new(&path);
    let mut rx = capture.start().await.unwrap();
    let raw = rx.recv().await.unwrap();
    assert_eq!(raw.sample_rate, 48_000);
    assert_eq!(raw.channels, 2);
    capture.stop().await.unwrap();
}

#[test]
fn test_sink_writes_scheduled_audio() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.wav");

    let mut sink = WavSink::create(&path).unwrap();
    sink.schedule(&[0.5; 2400], Duration::from_millis(100)).unwrap();
    sink.close().unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().sample_rate, 24_000);
    assert_eq!(reader.spec().channels, 1);

    let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    // 100ms of leading silence, then the chunk
    assert_eq!(samples.len(), 4800);
    assert!(samples[..2400].iter().all(|&s| s == 0));
    assert!(samples[2400..].iter().all(|&s| s == 16384));
}

#[test]
fn test_sink_keeps_every_sample_of_back_to_back_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.wav");

    // 2401 samples do not last a whole number of microseconds
    let mut sink = WavSink::create(&path).unwrap();
    for k in 0..4u64 {
        sink.schedule(&[0.25; 2401], sample_time(k * 2401)).unwrap();
    }
    sink.close().unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 4 * 2401);
    assert!(samples.iter().all(|&s| s == 8192));
}

#[test]
fn test_sink_mixes_overlapping_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.wav");

    let mut sink = WavSink::create(&path).unwrap();
    sink.schedule(&[0.25; 2400], Duration::ZERO).unwrap();
    sink.schedule(&[0.25; 2400], Duration::from_millis(50)).unwrap();
    sink.close().unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 3600);
    assert!(samples[..1200].iter().all(|&s| s == 8192));
    assert!(samples[1200..2400].iter().all(|&s| s == 16384));
    assert!(samples[2400..].iter().all(|&s| s == 8192));
}

#[test]
fn test_sink_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.wav");

    let mut sink = WavSink::create(&path).unwrap();
    sink.close().unwrap();
    sink.close().unwrap();
    assert!(sink.schedule(&[0.1; 10], Duration::ZERO).is_err());
}

#[test]
fn test_devices_report_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let devices = WavDevices {
        input: dir.path().join("nope.wav"),
        output: dir.path().join("agent.wav"),
    };

    assert!(matches!(devices.open_capture(), Err(DeviceError::Unavailable(_))));
    assert!(devices.open_output().is_ok());
}

#[test]
fn test_sink_requires_existing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let result = WavSink::create(dir.path().join("missing").join("agent.wav"));
    assert!(matches!(result, Err(DeviceError::Unavailable(_))));
}
