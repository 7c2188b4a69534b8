//! Input level metering for the microphone check flow.

/// Level measurements over one chunk of 16-bit PCM, in dBFS.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioLevel {
    pub rms_db: f32,
    pub peak_db: f32,
}

/// Floor applied instead of -infinity for silence.
const DB_FLOOR: f32 = -60.0;

impl AudioLevel {
    /// Compute levels from little-endian 16-bit PCM bytes.
    pub fn from_pcm16(bytes: &[u8]) -> Self {
        let mut sum_sq = 0.0f32;
        let mut peak = 0.0f32;
        let mut count = 0usize;

        for pair in bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
            let abs = sample.abs();
            sum_sq += sample * sample;
            if abs > peak {
                peak = abs;
            }
            count += 1;
        }

        if count == 0 {
            return Self {
                rms_db: DB_FLOOR,
                peak_db: DB_FLOOR,
            };
        }

        Self {
            rms_db: linear_to_db((sum_sq / count as f32).sqrt()),
            peak_db: linear_to_db(peak),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.rms_db <= DB_FLOOR + 1.0
    }
}

fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * linear.log10()).max(DB_FLOOR)
    }
}

/// Smoothed level meter: exponential smoothing on RMS, instant attack and
/// slow release on peaks, so a display tracks speech without flickering.
#[derive(Clone, Debug)]
pub struct LevelMeter {
    smoothing: f32,
    rms_db: f32,
    peak_db: f32,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl LevelMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.99),
            rms_db: DB_FLOOR,
            peak_db: DB_FLOOR,
        }
    }

    pub fn process(&mut self, pcm16: &[u8]) -> AudioLevel {
        let level = AudioLevel::from_pcm16(pcm16);

        self.rms_db = self.smoothing * self.rms_db + (1.0 - self.smoothing) * level.rms_db;

        if level.peak_db > self.peak_db {
            self.peak_db = level.peak_db;
        } else {
            self.peak_db = self.smoothing * self.peak_db + (1.0 - self.smoothing) * level.peak_db;
        }

        AudioLevel {
            rms_db: self.rms_db,
            peak_db: self.peak_db,
        }
    }

    pub fn reset(&mut self) {
        self.rms_db = DB_FLOOR;
        self.peak_db = DB_FLOOR;
    }
}
