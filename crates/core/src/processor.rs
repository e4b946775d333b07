//! Drives an external transcoder (FFmpeg-equivalent) child process and
//! exposes its stdout as an asynchronous sequence of `StreamChunk`s.
//!
//! Grounded on the original `StreamProcessor`: filter-chain construction
//! (loudness normalization, denoise, high/low-pass), the liveness check
//! after spawn, and the close-stdin/terminate/wait-5s/kill teardown are
//! all carried over with the same constants.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::{MediaKind, StreamChunk};
use crate::transport::SourceProducer;

/// Output codec family the processor asks the transcoder to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputFormat {
    /// Raw PCM audio, as consumed by `FastStreamBuffer`.
    PcmAudio,
    /// Raw video frames.
    RawVideo,
}

/// Parameters governing the transcoder invocation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessorConfig {
    /// Audio sample rate in Hz.
    pub audio_sample_rate: u32,
    /// Audio channel count.
    pub audio_channels: u8,
    /// Audio bitrate in bits/sec.
    pub audio_bitrate: u32,
    /// Audio codec name passed to the transcoder.
    pub audio_codec: String,
    /// Video width in pixels.
    pub video_width: u32,
    /// Video height in pixels.
    pub video_height: u32,
    /// Video frame rate.
    pub video_fps: u32,
    /// Whether to apply the audio filter chain at all.
    pub enable_filters: bool,
    /// Apply loudness normalization (`loudnorm`).
    pub normalize_audio: bool,
    /// Apply noise reduction (`afftdn`).
    pub denoise_audio: bool,
    /// Request hardware acceleration from the transcoder, if available.
    pub use_hardware_acceleration: bool,
    /// Bytes read per `stdout` read call.
    pub buffer_size: usize,
    /// Path to the transcoder executable.
    pub transcoder_path: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bitrate: 128_000,
            audio_codec: "pcm_s16le".to_string(),
            video_width: 1280,
            video_height: 720,
            video_fps: 30,
            enable_filters: true,
            normalize_audio: true,
            denoise_audio: false,
            use_hardware_acceleration: true,
            buffer_size: 8192,
            transcoder_path: "ffmpeg".to_string(),
        }
    }
}

impl ProcessorConfig {
    /// Build the `-af` filter-chain argument, matching the original exactly:
    /// loudness normalization, then denoise, then a fixed high/low-pass pair.
    pub fn audio_filter_chain(&self) -> Option<String> {
        if !self.enable_filters {
            return None;
        }
        let mut filters = Vec::new();
        if self.normalize_audio {
            filters.push("loudnorm=I=-16:TP=-1.5:LRA=11".to_string());
        }
        if self.denoise_audio {
            filters.push("afftdn=nf=-25".to_string());
        }
        filters.push("highpass=f=80".to_string());
        filters.push("lowpass=f=15000".to_string());
        Some(filters.join(","))
    }

    fn build_args(&self, output_format: OutputFormat) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            "-ac".to_string(),
            self.audio_channels.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ];
        if self.use_hardware_acceleration {
            args.push("-hwaccel".to_string());
            args.push("auto".to_string());
        }
        if let Some(chain) = self.audio_filter_chain() {
            args.push("-af".to_string());
            args.push(chain);
        }
        match output_format {
            OutputFormat::PcmAudio => {
                args.push("-f".to_string());
                args.push("s16le".to_string());
                args.push("-acodec".to_string());
                args.push(self.audio_codec.clone());
            }
            OutputFormat::RawVideo => {
                args.push("-f".to_string());
                args.push("rawvideo".to_string());
                args.push("-s".to_string());
                args.push(format!("{}x{}", self.video_width, self.video_height));
                args.push("-r".to_string());
                args.push(self.video_fps.to_string());
            }
        }
        args.push("pipe:1".to_string());
        args
    }
}

/// Point-in-time processor statistics.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    /// Output chunks produced.
    pub chunks_processed: u64,
    /// Bytes read from the transcoder's stdout.
    pub bytes_processed: u64,
    /// Sum of per-read processing time, in milliseconds.
    pub processing_time_ms_sum: f64,
    /// EMA of per-read processing time, in milliseconds.
    pub processing_time_ms_ema: f64,
    /// Errors encountered (failed writes, short reads, non-zero exit).
    pub errors: u64,
}

impl ProcessorStats {
    /// `chunks_processed / (chunks_processed + errors) * 100`.
    pub fn processing_efficiency(&self) -> f64 {
        let denom = self.chunks_processed + self.errors;
        if denom == 0 {
            return 100.0;
        }
        (self.chunks_processed as f64 / denom as f64) * 100.0
    }

    /// Mean output chunk size in bytes.
    pub fn avg_chunk_size(&self) -> f64 {
        if self.chunks_processed == 0 {
            return 0.0;
        }
        self.bytes_processed as f64 / self.chunks_processed as f64
    }
}

/// Drives an external transcoder child process.
pub struct StreamProcessor {
    config: ProcessorConfig,
    sequence: AtomicU64,
    stats: parking_lot::Mutex<ProcessorStats>,
}

impl StreamProcessor {
    /// Construct a processor under `config`.
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
            stats: parking_lot::Mutex::new(ProcessorStats::default()),
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().clone()
    }

    fn spawn_child(&self, output_format: OutputFormat) -> Result<Child> {
        let args = self.config.build_args(output_format);
        Command::new(&self.config.transcoder_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::Media(format!("failed to spawn transcoder: {err}")))
    }

    /// Lazily transcode `source` into `StreamChunk`s via the configured
    /// transcoder, pushing results onto `chunk_tx`. Consuming the channel
    /// drives the pipeline; the task finishes when either end closes.
    ///
    /// Returns once the child process and both pump tasks have wound down.
    pub async fn process(
        &self,
        mut source: Box<dyn SourceProducer>,
        output_format: OutputFormat,
        chunk_tx: tokio::sync::mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let mut child = self.spawn_child(output_format)?;

        // Verify liveness: wait briefly, then check the child hasn't already exited.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::Media(format!(
                "transcoder exited immediately with status {status}"
            )));
        }

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Error::Internal("transcoder stdin not piped".to_string())
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            Error::Internal("transcoder stdout not piped".to_string())
        })?;

        let writer = async move {
            loop {
                match source.next_block().await {
                    Ok(Some(block)) => {
                        if stdin.write_all(&block).await.is_err() {
                            break;
                        }
                        if stdin.flush().await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "source producer failed while feeding transcoder");
                        break;
                    }
                }
            }
            drop(stdin);
        };

        let buffer_size = self.config.buffer_size;
        let reader = async {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let read_started = Instant::now();
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        error!(%err, "transcoder stdout read failed");
                        self.stats.lock().errors += 1;
                        break;
                    }
                };
                let elapsed_ms = read_started.elapsed().as_secs_f64() * 1000.0;
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                let chunk = StreamChunk::new(
                    bytes::Bytes::copy_from_slice(&buf[..n]),
                    seq,
                    MediaKind::Audio,
                    20,
                    Instant::now(),
                );
                {
                    let mut stats = self.stats.lock();
                    stats.chunks_processed += 1;
                    stats.bytes_processed += n as u64;
                    stats.processing_time_ms_sum += elapsed_ms;
                    let alpha = 0.1;
                    stats.processing_time_ms_ema = if stats.chunks_processed <= 1 {
                        elapsed_ms
                    } else {
                        alpha * elapsed_ms + (1.0 - alpha) * stats.processing_time_ms_ema
                    };
                }
                if chunk_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        };

        tokio::join!(writer, reader);

        let status = self.teardown(&mut child).await?;
        debug!(?status, "transcoder teardown complete");
        if !status.success() {
            return Err(Error::Media(format!("transcoder exited with {status}")));
        }
        Ok(())
    }

    /// Close stdin, signal terminate, wait up to 5s, then force-kill.
    async fn teardown(&self, child: &mut Child) -> Result<std::process::ExitStatus> {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        match timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(err)) => Err(Error::Io(err)),
            Err(_) => {
                warn!("transcoder did not exit within 5s, killing");
                child.kill().await.map_err(Error::Io)?;
                child.wait().await.map_err(Error::Io)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_filter_chain_matches_expected_order() {
        let cfg = ProcessorConfig {
            normalize_audio: true,
            denoise_audio: true,
            ..ProcessorConfig::default()
        };
        assert_eq!(
            cfg.audio_filter_chain().unwrap(),
            "loudnorm=I=-16:TP=-1.5:LRA=11,afftdn=nf=-25,highpass=f=80,lowpass=f=15000"
        );
    }

    #[test]
    fn filters_disabled_yields_no_chain() {
        let cfg = ProcessorConfig {
            enable_filters: false,
            ..ProcessorConfig::default()
        };
        assert!(cfg.audio_filter_chain().is_none());
    }

    #[test]
    fn processing_efficiency_formula() {
        let stats = ProcessorStats {
            chunks_processed: 9,
            errors: 1,
            ..ProcessorStats::default()
        };
        assert!((stats.processing_efficiency() - 90.0).abs() < 1e-9);
    }
}
