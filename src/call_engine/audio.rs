//! Audio Handler - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Jeder cpal-Stream lebt auf
//! einem eigenen Thread (Echtzeit-Domäne), die Control-Flow-Seite sieht nur
//! Channels und Handles.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, wie der Browser-AudioContext)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Blockgröße in Samples (ein Render-Quantum)
pub const BLOCK_SIZE: usize = 128;

/// Wie viele Capture-Blöcke zwischen Echtzeit- und Control-Domäne warten dürfen
const CAPTURE_QUEUE_BLOCKS: usize = 64;

/// Playback-Ring (1 Sekunde)
const RING_BUFFER_SIZE: usize = SAMPLE_RATE as usize;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("device no longer available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } if is_permission_error(&err.description) => {
                AudioError::PermissionDenied(err.description)
            }
            other => AudioError::StreamBuildError(other.to_string()),
        }
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        match err {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("device no longer available".to_string())
            }
            cpal::SupportedStreamConfigsError::BackendSpecific { err }
                if is_permission_error(&err.description) =>
            {
                AudioError::PermissionDenied(err.description)
            }
            other => AudioError::UnsupportedConfig(other.to_string()),
        }
    }
}

/// Backends melden verweigerte Mikrofon-Rechte nur als Text
fn is_permission_error(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
}

// ============================================================================
// DEVICE HANDLES
// ============================================================================

/// Ein belegtes Audio-Gerät. `release` gibt es frei und darf mehrfach
/// aufgerufen werden.
pub trait DeviceHandle: Send {
    fn release(&mut self);
}

/// Ausgabe-Seite eines geöffneten Output-Geräts
pub trait PlaybackOutput: Send {
    /// Reiht einen Block zur sofortigen Wiedergabe ein
    fn schedule(&mut self, block: &[f32]);

    /// Stoppt die Wiedergabe und gibt das Gerät frei
    fn release(&mut self);
}

/// Quelle für Audio-Geräte
///
/// Produktiv ist das `CpalBackend`, Tests setzen eigene Implementierungen ein.
pub trait AudioBackend: Send + Sync {
    /// Öffnet das Mikrofon und liefert Blöcke fester Größe
    fn open_capture(&self, block_size: usize) -> Result<CaptureStream, AudioError>;

    /// Öffnet das Ausgabegerät
    fn open_sink(&self) -> Result<AudioSink, AudioError>;
}

// ============================================================================
// CAPTURE STREAM
// ============================================================================

/// Geöffnetes Mikrofon
///
/// Die Blöcke sind eine einmalige, nicht neu startbare Sequenz. Das Gerät
/// wird genau einmal freigegeben: durch `close()` oder spätestens beim Drop.
pub struct CaptureStream {
    blocks: Option<mpsc::Receiver<Vec<f32>>>,
    device: Option<Box<dyn DeviceHandle>>,
}

impl CaptureStream {
    pub fn new(blocks: mpsc::Receiver<Vec<f32>>, device: Box<dyn DeviceHandle>) -> Self {
        Self {
            blocks: Some(blocks),
            device: Some(device),
        }
    }

    /// Nimmt die Block-Sequenz heraus (z.B. für einen Pump-Task).
    /// Danach liefert `next_block` nichts mehr.
    pub fn take_blocks(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.blocks.take()
    }

    /// Wartet auf den nächsten Block
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        match self.blocks.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Gibt das Mikrofon frei
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            tracing::debug!("Capture device released");
        }
        self.blocks = None;
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// AUDIO SINK
// ============================================================================

/// Geöffnetes Ausgabegerät
///
/// Jeder `schedule`-Aufruf startet sofort; es gibt keinen Jitter-Buffer,
/// Lücken oder Überlappungen zwischen Blöcken sind möglich.
pub struct AudioSink {
    output: Option<Box<dyn PlaybackOutput>>,
    scheduled: u64,
}

impl AudioSink {
    pub fn new(output: Box<dyn PlaybackOutput>) -> Self {
        Self {
            output: Some(output),
            scheduled: 0,
        }
    }

    pub fn schedule(&mut self, block: &[f32]) {
        match self.output.as_mut() {
            Some(output) => {
                output.schedule(block);
                self.scheduled += 1;
            }
            None => tracing::trace!("Sink closed, dropping {} samples", block.len()),
        }
    }

    /// Anzahl bisher eingereihter Blöcke
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    pub fn is_open(&self) -> bool {
        self.output.is_some()
    }

    pub fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.release();
            tracing::debug!("Output device released after {} blocks", self.scheduled);
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for AudioSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSink")
            .field("open", &self.is_open())
            .field("scheduled", &self.scheduled)
            .finish()
    }
}

// ============================================================================
// BLOCK ASSEMBLER
// ============================================================================

/// Schneidet beliebig große Callback-Puffer in Blöcke fester Größe.
///
/// Mehrkanal-Input wird auf den ersten Kanal reduziert.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize, channels: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            channels: channels.max(1),
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Nimmt interleavte Samples auf und ruft `emit` für jeden vollen Block
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        for frame in interleaved.chunks(self.channels) {
            self.pending.push(frame[0]);
            if self.pending.len() == self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                emit(block);
            }
        }
    }

    /// Samples, die noch auf einen vollen Block warten
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Thread, der einen cpal-Stream besitzt
///
/// `cpal::Stream` ist nicht Send, deshalb bleibt er auf seinem Thread und
/// wird dort gedroppt, sobald der Stop-Sender wegfällt.
struct DeviceThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Startet den Thread und wartet, bis der Stream läuft oder scheitert
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blockiert bis release() den Sender droppt
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamBuildError("audio thread exited".to_string())));

        match ready {
            Ok(()) => Ok(Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }
}

impl DeviceHandle for DeviceThread {
    fn release(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Audio thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.release();
    }
}

/// cpal-Ausgabe: Producer-Seite des Playback-Rings plus Geräte-Thread
struct CpalOutput {
    producer: HeapProd<f32>,
    device: DeviceThread,
}

impl PlaybackOutput for CpalOutput {
    fn schedule(&mut self, block: &[f32]) {
        let written = self.producer.push_slice(block);
        if written < block.len() {
            tracing::debug!(
                "Playback ring full, dropped {} of {} samples",
                block.len() - written,
                block.len()
            );
        }
    }

    fn release(&mut self) {
        self.device.release();
    }
}

/// Produktives Backend über das cpal Default-Host
#[derive(Debug, Clone)]
pub struct CpalBackend {
    sample_rate: u32,
}

impl CpalBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device, rate: u32) -> Result<StreamConfig, AudioError> {
        let configs = device.supported_input_configs()?;
        Self::select_best_config(configs.collect(), rate)
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(device: &Device, rate: u32) -> Result<StreamConfig, AudioError> {
        let configs = device.supported_output_configs()?;
        Self::select_best_config(configs.collect(), rate)
    }

    /// Wählt eine F32-Konfiguration mit genau der Ziel-Rate, bevorzugt Mono.
    /// Kein Resampling: ohne passende Rate gibt es `UnsupportedConfig`.
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
        rate: u32,
    ) -> Result<StreamConfig, AudioError> {
        let target_rate = cpal::SampleRate(rate);
        let at_rate = configs.into_iter().filter(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= target_rate
                && c.max_sample_rate() >= target_rate
        });

        let mut fallback: Option<StreamConfig> = None;
        for config in at_rate {
            if config.channels() == CHANNELS {
                return Ok(config.with_sample_rate(target_rate).into());
            }
            if fallback.is_none() {
                fallback = Some(config.with_sample_rate(target_rate).into());
            }
        }

        fallback.ok_or_else(|| {
            AudioError::UnsupportedConfig(format!("no f32 stream configuration at {} Hz", rate))
        })
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(&self, block_size: usize) -> Result<CaptureStream, AudioError> {
        let (tx, rx) = mpsc::channel::<Vec<f32>>(CAPTURE_QUEUE_BLOCKS);
        let rate = self.sample_rate;

        let device = DeviceThread::spawn("audio-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceUnavailable("no audio input device".to_string()))?;

            let config = Self::find_best_input_config(&device, rate)?;
            tracing::info!(
                "Starting audio capture: {} Hz, {} channels, {} samples/block",
                config.sample_rate.0,
                config.channels,
                block_size
            );

            let mut assembler = BlockAssembler::new(block_size, config.channels as usize);
            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.push(data, |block| {
                        // Nie im Echtzeit-Callback blockieren
                        if tx.try_send(block).is_err() {
                            tracing::trace!("Capture queue full, dropping block");
                        }
                    });
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )?;

            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
            Ok(stream)
        })?;

        Ok(CaptureStream::new(rx, Box::new(device)))
    }

    fn open_sink(&self) -> Result<AudioSink, AudioError> {
        let (producer, mut consumer) = HeapRb::<f32>::new(RING_BUFFER_SIZE).split();
        let rate = self.sample_rate;

        let device = DeviceThread::spawn("audio-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceUnavailable("no audio output device".to_string()))?;

            let config = Self::find_best_output_config(&device, rate)?;
            tracing::info!(
                "Starting audio playback: {} Hz, {} channels",
                config.sample_rate.0,
                config.channels
            );

            let channels = config.channels as usize;
            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // Mono auf alle Kanäle verteilen, Unterlauf spielt Stille
                    for frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )?;

            stream
                .play()
                .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
            Ok(stream)
        })?;

        Ok(AudioSink::new(Box::new(CpalOutput { producer, device })))
    }
}
