use anyhow::{bail, Context};
use clap::Parser;
use hound::{SampleFormat, WavReader};
use log::info;
use speech_trigger::detector::PipelineFactory;
use speech_trigger::device::{DeviceRoute, DeviceRouter, SimulatedDevice};
use speech_trigger::models::{energy_pipeline_factory, EnergyConfig};
use speech_trigger::{load_config, SpeechDetector, SpeechDetectorEvent, SpeechDetectorListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "speech-trigger")]
#[command(about = "Stream a WAV file through speech end-point detection")]
struct Args {
    /// 16-bit mono WAV file to stream
    #[arg(short, long)]
    wav: PathBuf,

    /// Bytes per simulated capture callback (overrides SPEECH_DELIVERY_BYTES)
    #[arg(short, long)]
    delivery_bytes: Option<usize>,

    /// Skip hardware capability discovery
    #[arg(long)]
    software: bool,

    /// End-point timeout in milliseconds, negative waits forever
    #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
    timeout_ms: i32,

    /// TensorFlow Lite end-point model instead of the energy model
    #[cfg(feature = "tflite")]
    #[arg(long)]
    model: Option<String>,
}

#[derive(Default)]
struct PrintListener {
    end_points: AtomicUsize,
    speech: AtomicUsize,
}

impl SpeechDetectorListener for PrintListener {
    fn on_event(&self, event: SpeechDetectorEvent) {
        match event {
            SpeechDetectorEvent::EndPointDetected => {
                self.end_points.fetch_add(1, Ordering::Relaxed);
                println!("🛑 End point detected");
            }
            SpeechDetectorEvent::SpeechDetected => {
                // One per inference window while talking; keep the console quiet
                if self.speech.fetch_add(1, Ordering::Relaxed) == 0 {
                    println!("🗣️ Speech detected");
                }
            }
            SpeechDetectorEvent::KeywordDetected => println!("🎯 Keyword detected"),
            SpeechDetectorEvent::LocalCommand(slot) => println!("📋 Local command {}", slot),
        }
    }
}

fn read_pcm16(path: &PathBuf) -> anyhow::Result<(Vec<u8>, u32)> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        bail!(
            "Expected 16-bit mono PCM, got {} channel(s) of {}-bit {:?}",
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );
    }

    let samples: Result<Vec<i16>, _> = reader.samples().collect();
    let samples = samples.context("Failed to read WAV samples")?;

    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Ok((bytes, spec.sample_rate))
}

#[cfg_attr(not(feature = "tflite"), allow(unused_variables))]
fn pipeline_factory(args: &Args) -> PipelineFactory {
    #[cfg(feature = "tflite")]
    {
        if let Some(path) = &args.model {
            return speech_trigger::models::tflite_pipeline_factory(path.clone());
        }
    }
    energy_pipeline_factory(EnergyConfig::default())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let mut config = load_config()?;
    if let Some(delivery) = args.delivery_bytes {
        if delivery == 0 || delivery % 2 != 0 {
            bail!("--delivery-bytes must be a positive even number, got {}", delivery);
        }
        config.delivery_bytes = delivery;
        config.max_stream_buffer_bytes = config.max_stream_buffer_bytes.max(delivery);
    }
    config.force_software |= args.software;

    let (audio, sample_rate) = read_pcm16(&args.wav)?;
    info!(
        "🎵 Loaded {} ({} bytes, {:.2}s at {}Hz)",
        args.wav.display(),
        audio.len(),
        audio.len() as f32 / 2.0 / sample_rate as f32,
        sample_rate
    );

    let router: Arc<dyn DeviceRouter> = Arc::new(SimulatedDevice::new(DeviceRoute::new(
        config.input_card,
        config.input_device,
    )));
    let mut detector = SpeechDetector::new(&config, router, pipeline_factory(&args))?;

    let printer = Arc::new(PrintListener::default());
    let listener: Arc<dyn SpeechDetectorListener> = printer.clone();
    detector.add_listener(&listener);

    if !detector.init_end_point_detect() {
        bail!(
            "End point detection could not be initialised for {}-byte deliveries",
            config.delivery_bytes
        );
    }
    info!("📦 Stream buffer holds {} bytes", detector.audio_buffer_size());

    detector.start_end_point_detect(args.timeout_ms);
    for chunk in audio.chunks(config.delivery_bytes) {
        detector.detect_end_point(chunk);
    }
    detector.wait_idle();

    detector.stop_end_point_detect();
    detector.deinit_end_point_detect();
    detector.shutdown();

    println!(
        "✅ Done: {} end point(s), {} speech window(s)",
        printer.end_points.load(Ordering::Relaxed),
        printer.speech.load(Ordering::Relaxed)
    );
    Ok(())
}
