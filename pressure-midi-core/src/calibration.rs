//! RC oscillator calibration against the host's frame timing.
//!
//! The internal oscillator is only good to a few percent out of the factory,
//! far outside what low-speed USB tolerates. At every bus reset the trim is
//! tuned against the 1 ms keep-alive interval of the host and stored so the
//! next boot starts close to the right value.

use crate::config::CPU_KHZ;

/// Value of a never-written EEPROM cell.
pub const ERASED: u8 = 0xFF;

/// CPU cycles per iteration of the frame measuring loop: `in`, `andi`,
/// `breq`, `adiw`, `brne`.
pub const MEASURE_LOOP_CYCLES: u32 = 7;

/// Low-speed bit times from the end of one keep-alive pulse to the start of
/// the next.
const FRAME_BIT_TIMES: u32 = 1499;

/// Loop count expected over one frame at the nominal clock.
pub const fn frame_target(cpu_khz: u32) -> u16 {
    // Bit rate is 1500 kbit/s
    let divisor = 1500 * MEASURE_LOOP_CYCLES;
    ((FRAME_BIT_TIMES * cpu_khz + divisor / 2) / divisor) as u16
}

/// Persisted trim byte.
pub trait TrimStore {
    fn read(&mut self) -> u8;
    fn write(&mut self, value: u8);
}

/// The oscillator trim register.
pub trait Oscillator {
    fn trim(&self) -> u8;
    fn set_trim(&mut self, value: u8);
}

/// Measures the time between two frame markers on the bus, in loop counts.
/// Zero means no marker showed up.
pub trait FrameTimer {
    fn measure_frame(&mut self) -> u16;
}

/// Loads and saves the trim.
pub struct Calibration<S> {
    store: S,
}

impl<S: TrimStore> Calibration<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Apply the stored trim, if there is one.
    pub fn read(&mut self, oscillator: &mut impl Oscillator) {
        let stored = self.store.read();
        if stored != ERASED {
            oscillator.set_trim(stored);
        }
    }

    /// Persist the current trim. Skips the write when nothing changed to
    /// spare the EEPROM.
    pub fn store(&mut self, oscillator: &impl Oscillator) -> bool {
        let trim = oscillator.trim();
        if self.store.read() == trim {
            return false;
        }
        self.store.write(trim);
        true
    }

    /// Tune against the bus and persist the result. Nothing is stored when
    /// the bus went quiet during tuning.
    pub fn recalibrate(
        &mut self,
        tuner: &OscillatorTuner,
        oscillator: &mut impl Oscillator,
        timer: &mut impl FrameTimer,
    ) -> bool {
        if tuner.tune(oscillator, timer).is_none() {
            return false;
        }
        self.store(&*oscillator)
    }
}

/// Binary search over the trim followed by a local search for the value
/// with the smallest deviation.
pub struct OscillatorTuner {
    target: u16,
    /// Half-width of the local search
    neighbourhood: u8,
}

impl OscillatorTuner {
    pub const fn new() -> Self {
        Self {
            target: frame_target(CPU_KHZ),
            neighbourhood: 4,
        }
    }

    pub const fn with_target(target: u16) -> Self {
        Self {
            target,
            neighbourhood: 4,
        }
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    fn measure(&self, oscillator: &mut impl Oscillator, timer: &mut impl FrameTimer, trim: u8) -> Option<u16> {
        oscillator.set_trim(trim);
        match timer.measure_frame() {
            0 => None,
            count => Some(count),
        }
    }

    fn search(&self, oscillator: &mut impl Oscillator, timer: &mut impl FrameTimer) -> Option<u8> {
        let mut trial: u8 = 0;
        let mut step: u8 = 128;
        while step > 0 {
            if self.measure(oscillator, timer, trial + step)? < self.target {
                trial += step;
            }
            step >>= 1;
        }

        let mut best = trial;
        let mut best_deviation = self.measure(oscillator, timer, trial)?.abs_diff(self.target);
        let low = trial.saturating_sub(self.neighbourhood);
        let high = trial.saturating_add(self.neighbourhood);
        for trim in low..=high {
            let deviation = self.measure(oscillator, timer, trim)?.abs_diff(self.target);
            if deviation < best_deviation {
                best = trim;
                best_deviation = deviation;
            }
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("osccal: trim {=u8} off by {=u16}", best, best_deviation);
        Some(best)
    }

    /// Leave the oscillator at the trim whose frame length is closest to
    /// the target and return it.
    ///
    /// A measurement without frame markers aborts the search and puts the
    /// trim back to where it was.
    pub fn tune(&self, oscillator: &mut impl Oscillator, timer: &mut impl FrameTimer) -> Option<u8> {
        let original = oscillator.trim();
        match self.search(oscillator, timer) {
            Some(best) => {
                oscillator.set_trim(best);
                Some(best)
            }
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("osccal: no keep-alives, trim left at {=u8}", original);
                oscillator.set_trim(original);
                None
            }
        }
    }
}

impl Default for OscillatorTuner {
    fn default() -> Self {
        Self::new()
    }
}
