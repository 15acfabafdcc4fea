use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Sample rate shared by the recognition and synthesis endpoints.
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per PCM frame (80 ms at 24 kHz).
pub const SAMPLES_PER_FRAME: usize = 1920;

const WAV_SCALE: f32 = 32767.0;

/// Wall-clock duration of one frame.
#[must_use]
pub fn frame_duration() -> Duration {
    Duration::from_micros(SAMPLES_PER_FRAME as u64 * 1_000_000 / u64::from(SAMPLE_RATE))
}

/// Duration in seconds of a mono PCM buffer at [`SAMPLE_RATE`].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn duration_secs(pcm: &[f32]) -> f64 {
    pcm.len() as f64 / f64::from(SAMPLE_RATE)
}

/// A frame of zeros.
#[must_use]
pub fn silence_frame() -> Vec<f32> {
    vec![0.0; SAMPLES_PER_FRAME]
}

/// Split `pcm` into fixed-size frames, zero-padding the final one.
#[must_use]
pub fn frames(pcm: &[f32]) -> Vec<Vec<f32>> {
    pcm.chunks(SAMPLES_PER_FRAME)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(SAMPLES_PER_FRAME, 0.0);
            frame
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * WAV_SCALE) as i16
}

const fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write `pcm` as a mono 16-bit WAV file.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_wav(path: impl AsRef<Path>, pcm: &[f32]) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec())?;
    for &sample in pcm {
        writer.write_sample(to_i16(sample))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Encode `pcm` as an in-memory mono 16-bit WAV file.
///
/// # Errors
/// Returns an error if encoding fails.
pub fn encode_wav(pcm: &[f32]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec())?;
        for &sample in pcm {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
