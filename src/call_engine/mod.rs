//! Call Engine Module - Audio und Session-Steuerung
//!
//! Dieses Modul verwaltet:
//! - Sample-Konvertierung (f32 <-> PCM16)
//! - Audio Capture (Mikrofon)
//! - Audio Playback (Lautsprecher)
//! - Call-Session Zustandsmaschine

pub mod codec;

mod audio;
mod engine;

pub use audio::{
    AudioBackend, AudioError, AudioSink, BlockAssembler, CaptureStream, CpalBackend, DeviceHandle,
    PlaybackOutput, BLOCK_SIZE, CHANNELS, SAMPLE_RATE,
};
pub use engine::{
    CallEngine, CallEngineError, CallEvent, CallPhase, CallRole, CallSession, RemoteParty,
};
