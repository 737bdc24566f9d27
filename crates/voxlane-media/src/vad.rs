//! Energy-based Voice Activity Detection (VAD), used for local barge-in
//! detection when the remote service's detector is not trusted.

use voxlane_core::config::VadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    /// Enough trailing silence to call the utterance finished.
    SpeechEnded,
}

/// Voice Activity Detector using RMS energy threshold on 16-bit PCM.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    min_silent_frames: usize,
    frame_size: usize,
    speech_active: bool,
    silent_count: usize,
    /// Samples left over from the last call that did not fill a frame.
    carry: Vec<i16>,
    /// Low byte of a sample split across two calls.
    odd_byte: Option<u8>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, min_silent_frames: usize, frame_size: usize) -> Self {
        Self {
            threshold,
            min_silent_frames: min_silent_frames.max(1),
            frame_size: frame_size.max(1),
            speech_active: false,
            silent_count: 0,
            carry: Vec::new(),
            odd_byte: None,
        }
    }

    /// Build from config with the user's 0-100 sensitivity.
    pub fn from_config(config: &VadConfig, sensitivity: u8) -> Self {
        Self::new(
            config.threshold_for(sensitivity),
            config.silence_frames,
            config.samples_per_frame(),
        )
    }

    /// Re-map the threshold after a preference change. Detection state is kept.
    pub fn set_sensitivity(&mut self, config: &VadConfig, sensitivity: u8) {
        self.threshold = config.threshold_for(sensitivity);
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compute RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Classify a single frame.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadEvent> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if is_speech {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadEvent::SpeechStarted);
            }
        } else if self.speech_active {
            self.silent_count += 1;
            if self.silent_count >= self.min_silent_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadEvent::SpeechEnded);
            }
        }

        None
    }

    /// Feed raw little-endian 16-bit PCM of any length. Partial frames are
    /// held until the next call.
    pub fn process_bytes(&mut self, raw: &[u8]) -> Vec<VadEvent> {
        let mut raw = raw;
        if let Some(low) = self.odd_byte.take() {
            match raw.split_first() {
                Some((&high, rest)) => {
                    self.carry.push(i16::from_le_bytes([low, high]));
                    raw = rest;
                }
                None => self.odd_byte = Some(low),
            }
        }
        let pairs = raw.chunks_exact(2);
        if let [last] = pairs.remainder() {
            self.odd_byte = Some(*last);
        }
        self.carry
            .extend(pairs.map(|pair| i16::from_le_bytes([pair[0], pair[1]])));

        let mut events = Vec::new();
        let mut offset = 0;
        while self.carry.len() - offset >= self.frame_size {
            let end = offset + self.frame_size;
            let frame: Vec<i16> = self.carry[offset..end].to_vec();
            if let Some(event) = self.process_frame(&frame) {
                events.push(event);
            }
            offset = end;
        }
        self.carry.drain(..offset);
        events
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silent_count = 0;
        self.carry.clear();
        self.odd_byte = None;
    }
}
