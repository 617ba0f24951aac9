//! Sample Codec - Float <-> PCM16 Konvertierung
//!
//! Die Capture/Playback-Seite arbeitet mit normalisierten f32-Samples,
//! auf der Leitung liegen vorzeichenbehaftete 16-Bit Samples (Little Endian).
//! Kein Resampling, kein Dithering.

// ============================================================================
// CONSTANTS
// ============================================================================

/// Skalierungsfaktor (symmetrisch, daher 32767 und nicht 32768)
pub const PCM_SCALE: f32 = i16::MAX as f32;

/// Bytes pro Sample auf der Leitung
pub const BYTES_PER_SAMPLE: usize = 2;

// ============================================================================
// FLOAT <-> PCM16
// ============================================================================

/// Wandelt einen Block normalisierter Samples in PCM16.
///
/// Werte außerhalb von [-1.0, 1.0] werden vorher geclampt, NaN wird zu 0.
/// Danach wird Richtung Null abgeschnitten, der Fehler bleibt unter einem
/// Quantisierungsschritt.
pub fn encode(block: &[f32]) -> Vec<i16> {
    block
        .iter()
        .map(|&sample| {
            if sample.is_nan() {
                0
            } else {
                (sample.clamp(-1.0, 1.0) * PCM_SCALE) as i16
            }
        })
        .collect()
}

/// Wandelt PCM16 zurück in normalisierte Samples.
///
/// `i16::MIN` landet knapp unter -1.0, alles andere in [-1.0, 1.0].
pub fn decode(block: &[i16]) -> Vec<f32> {
    block.iter().map(|&sample| sample as f32 / PCM_SCALE).collect()
}

// ============================================================================
// WIRE BYTES
// ============================================================================

/// Serialisiert PCM16-Samples als Little-Endian Bytes
pub fn to_wire_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Interpretiert einen Byte-Chunk als Little-Endian PCM16.
///
/// Ein überzähliges letztes Byte wird verworfen.
pub fn from_wire_bytes(bytes: &[u8]) -> Vec<i16> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        tracing::trace!("Dropping trailing byte of odd-sized audio chunk ({} bytes)", bytes.len());
    }
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
