//! Microphone capture feeding the local audio track.
//!
//! Capture runs on the audio host's own callback thread and hands fixed
//! size f32 frames over a channel; a writer task converts them to media
//! samples for the outgoing track. Device problems (no microphone,
//! stream setup failure) are terminal for the call attempt and surface
//! as user-facing errors, never as a retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// Whether the host has a usable capture device.
pub fn input_device_available() -> bool {
    use cpal::traits::HostTrait;
    cpal::default_host().default_input_device().is_some()
}

pub struct AudioCapture {
    config: AudioConfig,
    is_capturing: bool,
    /// Cleared by `toggle_audio`; the capture callback substitutes
    /// silence so frame timing stays intact.
    enabled: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            is_capturing: false,
            enabled: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.is_capturing
    }

    pub fn start_capture(
        &mut self,
        frame_tx: mpsc::Sender<Vec<f32>>,
    ) -> Result<(), AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        info!(device = ?device.name(), "Using input device");

        let config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_size = self.config.frame_size_samples();
        let mut buffer = Vec::with_capacity(frame_size);
        let enabled = self.enabled.clone();
        let active = self.active.clone();

        active.store(true, Ordering::SeqCst);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !active.load(Ordering::Relaxed) {
                        return;
                    }
                    if enabled.load(Ordering::Relaxed) {
                        buffer.extend_from_slice(data);
                    } else {
                        // Send silence while disabled so playback stays in sync
                        buffer.extend(std::iter::repeat(0.0f32).take(data.len()));
                    }
                    while buffer.len() >= frame_size {
                        let frame: Vec<f32> = buffer.drain(..frame_size).collect();
                        if frame_tx.try_send(frame).is_err() {
                            warn!("Audio frame channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("Audio input error: {err}");
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        // Keep stream alive (cleaned up via active flag — callback becomes no-op)
        std::mem::forget(stream);

        self.is_capturing = true;
        debug!("Audio capture started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.is_capturing = false;
        debug!("Audio capture stopped");
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new(AudioConfig::default())
    }
}

/// Forward captured frames to an outgoing track as timed media samples.
pub fn spawn_track_writer(
    track: Arc<TrackLocalStaticSample>,
    mut frame_rx: mpsc::Receiver<Vec<f32>>,
    config: AudioConfig,
) -> tokio::task::JoinHandle<()> {
    let duration = Duration::from_millis(config.frame_size_ms as u64);

    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let mut data = Vec::with_capacity(frame.len() * 2);
            for sample in &frame {
                let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                data.extend_from_slice(&clamped.to_le_bytes());
            }

            let sample = Sample {
                data: Bytes::from(data),
                duration,
                ..Default::default()
            };

            if let Err(e) = track.write_sample(&sample).await {
                debug!(error = %e, "Track writer stopping");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let config = AudioConfig::default();
        assert_eq!(config.frame_size_samples(), 960);
    }

    #[test]
    fn test_enabled_flag_shared() {
        let capture = AudioCapture::default();
        let flag = capture.enabled_flag();
        assert!(flag.load(Ordering::Relaxed));
        flag.store(false, Ordering::Relaxed);
        assert!(!capture.enabled.load(Ordering::Relaxed));
    }
}
