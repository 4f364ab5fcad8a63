//! Signal Processor
//!
//! Smooths the BPM stream with an exponential moving average and maps it
//! onto a 1..=100 control value that a DAW can automate.

use thiserror::Error;

/// Lower bound of the BPM range mapped onto the control baseline
pub const SOURCE_MIN_BPM: f64 = 40.0;
/// Width of the mapped BPM range (40..=140)
pub const SOURCE_SPAN_BPM: f64 = 100.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignalError {
    #[error("smoothing factor must be a finite value above zero, got {0}")]
    InvalidSmoothing(f64),
}

/// Which value drives the control mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSource {
    #[default]
    Smoothed,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalOutput {
    /// Raw BPM plus the heart-rate offset
    pub adjusted: f64,
    pub smoothed: f64,
    pub control: f64,
}

/// Readout describing how aggressive the current smoothing is
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingMetrics {
    pub alpha: f64,
    pub half_life_samples: f64,
    pub effective_window: u32,
}

#[derive(Debug, Clone)]
pub struct SignalProcessor {
    smoothing: f64,
    offset: i32,
    control_offset: i32,
    source: ControlSource,
    smoothed: Option<f64>,
}

impl SignalProcessor {
    pub fn new(smoothing: f64) -> Result<Self, SignalError> {
        let mut processor = Self {
            smoothing: 1.0,
            offset: 0,
            control_offset: 0,
            source: ControlSource::default(),
            smoothed: None,
        };
        processor.set_smoothing(smoothing)?;
        Ok(processor)
    }

    pub fn set_smoothing(&mut self, smoothing: f64) -> Result<(), SignalError> {
        if !smoothing.is_finite() || smoothing <= 0.0 {
            return Err(SignalError::InvalidSmoothing(smoothing));
        }
        self.smoothing = smoothing;
        Ok(())
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Offset added to every raw BPM before smoothing
    pub fn set_offset(&mut self, offset: i32) {
        self.offset = offset;
    }

    /// Offset added to the control value before clamping, limited to -100..=100
    pub fn set_control_offset(&mut self, offset: i32) {
        self.control_offset = offset.clamp(-100, 100);
    }

    pub fn set_source(&mut self, source: ControlSource) {
        self.source = source;
    }

    /// EMA weight of the newest sample, fully determined by the smoothing factor
    pub fn alpha(&self) -> f64 {
        1.0 / (1.0 + self.smoothing)
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Forget the accumulator; the next sample re-initialises it
    pub fn reset(&mut self) {
        self.smoothed = None;
    }

    /// Feed one raw BPM reading
    pub fn push(&mut self, raw_bpm: f64) -> SignalOutput {
        let adjusted = raw_bpm + self.offset as f64;
        let alpha = self.alpha();

        let smoothed = match self.smoothed {
            None => adjusted,
            Some(previous) => alpha * adjusted + (1.0 - alpha) * previous,
        };
        self.smoothed = Some(smoothed);

        let source = match self.source {
            ControlSource::Smoothed => smoothed,
            ControlSource::Raw => adjusted,
        };

        SignalOutput {
            adjusted,
            smoothed,
            control: control_value(source, self.control_offset),
        }
    }

    pub fn metrics(&self) -> SmoothingMetrics {
        let alpha = self.alpha();
        let half_life_samples = if alpha >= 1.0 {
            0.0
        } else {
            0.5f64.ln() / (1.0 - alpha).ln()
        };
        SmoothingMetrics {
            alpha,
            half_life_samples,
            effective_window: (half_life_samples * 5.0).round() as u32,
        }
    }
}

/// Map a BPM source onto the 1..=100 control range
pub fn control_value(source_bpm: f64, control_offset: i32) -> f64 {
    let baseline = ((source_bpm - SOURCE_MIN_BPM) / SOURCE_SPAN_BPM).clamp(0.0, 1.0);
    (10.0 + baseline * 80.0 + control_offset as f64).clamp(1.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_first_sample_initialises_directly() {
        let mut processor = SignalProcessor::new(1.0 / 9.0).unwrap();
        assert!((processor.alpha() - 0.9).abs() < EPS);

        let out = processor.push(70.0);
        assert_eq!(out.smoothed, 70.0);
        for _ in 0..100 {
            assert!((processor.push(70.0).smoothed - 70.0).abs() < EPS);
        }
    }

    #[test]
    fn test_constant_input_converges() {
        let mut processor = SignalProcessor::new(4.0).unwrap();
        processor.push(120.0);
        let mut last_error = f64::MAX;
        for _ in 0..200 {
            let error = (processor.push(60.0).smoothed - 60.0).abs();
            assert!(error <= last_error + 1e-12);
            last_error = error;
        }
        assert!(last_error < 1e-6);
    }

    #[test]
    fn test_update_rule() {
        let mut processor = SignalProcessor::new(1.0).unwrap();
        processor.push(60.0);
        let out = processor.push(80.0);
        assert!((out.smoothed - 70.0).abs() < EPS);
    }

    #[test]
    fn test_offset_applies_before_smoothing() {
        let mut processor = SignalProcessor::new(1.0).unwrap();
        processor.set_offset(5);
        let out = processor.push(70.0);
        assert_eq!(out.adjusted, 75.0);
        assert_eq!(out.smoothed, 75.0);
    }

    #[test]
    fn test_control_mapping_bounds() {
        assert_eq!(control_value(40.0, 0), 10.0);
        assert_eq!(control_value(20.0, 0), 10.0);
        assert_eq!(control_value(140.0, 0), 90.0);
        assert_eq!(control_value(200.0, 0), 90.0);
        assert_eq!(control_value(90.0, 0), 50.0);
        assert_eq!(control_value(140.0, 25), 100.0);
        assert_eq!(control_value(40.0, -50), 1.0);
        assert_eq!(control_value(40.0, 5), 15.0);
    }

    #[test]
    fn test_control_source_toggle() {
        let mut processor = SignalProcessor::new(1.0).unwrap();
        processor.push(40.0);
        let smoothed = processor.push(140.0);
        assert_eq!(smoothed.control, control_value(90.0, 0));

        processor.set_source(ControlSource::Raw);
        let raw = processor.push(140.0);
        assert_eq!(raw.control, 90.0);
    }

    #[test]
    fn test_invalid_smoothing_rejected() {
        assert!(SignalProcessor::new(0.0).is_err());
        assert!(SignalProcessor::new(-1.0).is_err());
        assert!(SignalProcessor::new(f64::NAN).is_err());
    }

    #[test]
    fn test_reset_reinitialises() {
        let mut processor = SignalProcessor::new(3.0).unwrap();
        processor.push(100.0);
        processor.reset();
        assert_eq!(processor.push(50.0).smoothed, 50.0);
    }

    #[test]
    fn test_metrics() {
        let processor = SignalProcessor::new(1.0).unwrap();
        let metrics = processor.metrics();
        assert!((metrics.alpha - 0.5).abs() < EPS);
        assert!((metrics.half_life_samples - 1.0).abs() < EPS);
        assert_eq!(metrics.effective_window, 5);
    }
}
