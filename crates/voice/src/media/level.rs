//! Audio energy helpers
//!
//! Levels travel on the wire as RFC 6464 `-dBov` bytes (0 loudest, 127
//! silence). The speaking monitor compares linear levels, so both
//! directions of the conversion live here.

/// Floor used for digital silence
pub const SILENCE_DBOV: u8 = 127;

/// Root-mean-square energy of a PCM frame in `[-1.0, 1.0]`
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// Convert linear amplitude to dB (0 = full scale), floored at the
/// silence level
pub fn to_db(amplitude: f64) -> f64 {
    let floor = -f64::from(SILENCE_DBOV);
    if amplitude <= 0.0 {
        floor
    } else {
        (20.0 * amplitude.log10()).max(floor)
    }
}

/// RMS amplitude to an RFC 6464 level byte
pub fn rms_to_dbov(rms: f64) -> u8 {
    if rms <= 0.0 {
        return SILENCE_DBOV;
    }
    let db = to_db(rms.min(1.0));
    (-db).round().clamp(0.0, f64::from(SILENCE_DBOV)) as u8
}

/// RFC 6464 level byte (voice-activity bit ignored) to linear amplitude
pub fn dbov_to_linear(level: u8) -> f64 {
    let dbov = f64::from(level & 0x7F);
    10f64.powf(-dbov / 20.0)
}
