//! Voice activity detection: smoothed energy with hysteresis and hold
//! timers, producing one event per speaking/silence transition.

use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Interval between level updates.
    pub tick: Duration,
    /// Exponential smoothing factor for the running level.
    pub smooth: f32,
    /// Level that must be sustained to enter the speaking state.
    pub start_threshold: f32,
    /// Subtracted from `start_threshold` for the exit threshold, so the
    /// detector does not chatter around a single level.
    pub hysteresis: f32,
    /// How long the level must stay high before `Started` fires.
    pub start_hold: Duration,
    /// How long the level must stay low before `Ended` fires.
    pub end_hold: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            smooth: 0.85,
            start_threshold: 0.05,
            hysteresis: 0.02,
            start_hold: Duration::from_millis(150),
            end_hold: Duration::from_millis(600),
        }
    }
}

/// A speaking-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechTransition {
    Started,
    Ended,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct VoiceActivityDetector {
    cfg: VadConfig,
    level: f32,
    speaking: bool,
    last_tick: Option<Instant>,
    /// Peak instant energy observed since the last tick.
    peak_since_tick: f32,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            cfg,
            level: 0.0,
            speaking: false,
            last_tick: None,
            peak_since_tick: 0.0,
            above_since: None,
            below_since: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    /// Feed one instant energy measurement (typically the RMS of a
    /// captured audio frame). The running level only updates on tick
    /// boundaries; calls in between record the peak so short bursts are
    /// not lost. Returns a transition at most once per state change.
    pub fn update(&mut self, instant_energy: f32, now: Instant) -> Option<SpeechTransition> {
        self.peak_since_tick = self.peak_since_tick.max(instant_energy);

        match self.last_tick {
            Some(t) if now.duration_since(t) < self.cfg.tick => return None,
            _ => self.last_tick = Some(now),
        }

        let energy = self.peak_since_tick;
        self.peak_since_tick = 0.0;
        self.level = self.level * self.cfg.smooth + energy * (1.0 - self.cfg.smooth);

        if self.speaking {
            let stop_threshold = self.cfg.start_threshold - self.cfg.hysteresis;
            if self.level <= stop_threshold {
                let since = *self.below_since.get_or_insert(now);
                if now.duration_since(since) >= self.cfg.end_hold {
                    self.speaking = false;
                    self.below_since = None;
                    return Some(SpeechTransition::Ended);
                }
            } else {
                self.below_since = None;
            }
        } else if self.level >= self.cfg.start_threshold {
            let since = *self.above_since.get_or_insert(now);
            if now.duration_since(since) >= self.cfg.start_hold {
                self.speaking = true;
                self.above_since = None;
                return Some(SpeechTransition::Started);
            }
        } else {
            self.above_since = None;
        }

        None
    }
}

/// RMS energy of one block of samples, the instant measure fed to the
/// detector by capture sessions.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
