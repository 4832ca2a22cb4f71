//! Train/validation/test splitting and (context, horizon) window slicing.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::forecast::FrequencyClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

impl SplitKind {
    pub const ALL: [SplitKind; 3] = [Self::Train, Self::Validation, Self::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Index ranges partitioning `[0, len)`; computed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRanges {
    pub len: usize,
    pub train: Range<usize>,
    pub validation: Range<usize>,
    pub test: Range<usize>,
}

impl SplitRanges {
    pub fn range(&self, kind: SplitKind) -> Range<usize> {
        match kind {
            SplitKind::Train => self.train.clone(),
            SplitKind::Validation => self.validation.clone(),
            SplitKind::Test => self.test.clone(),
        }
    }

    /// The split's own range extended backwards by up to `context_len` rows
    /// borrowed from the preceding split. Train has nothing to borrow from.
    pub fn with_lookback(&self, kind: SplitKind, context_len: usize) -> Range<usize> {
        let own = self.range(kind);
        match kind {
            SplitKind::Train => own,
            SplitKind::Validation | SplitKind::Test => {
                own.start.saturating_sub(context_len)..own.end
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPair {
    pub start: usize,
    pub context: Vec<f32>,
    pub horizon: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSet {
    pub split: SplitKind,
    pub source: Range<usize>,
    pub own: Range<usize>,
    pub context_len: usize,
    pub horizon_len: usize,
    pub windows: Vec<WindowPair>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Row-major `(rows, context_len)` / `(rows, horizon_len)` buffers plus a
    /// per-row frequency code, the layout sequence models train on.
    pub fn to_tensors(&self, frequency: FrequencyClass) -> WindowTensors {
        let rows = self.windows.len();
        let mut past = Vec::with_capacity(rows * self.context_len);
        let mut future = Vec::with_capacity(rows * self.horizon_len);
        for window in &self.windows {
            past.extend_from_slice(&window.context);
            future.extend_from_slice(&window.horizon);
        }

        WindowTensors {
            rows,
            context_len: self.context_len,
            horizon_len: self.horizon_len,
            past,
            future,
            freq: vec![frequency.code(); rows],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowTensors {
    pub rows: usize,
    pub context_len: usize,
    pub horizon_len: usize,
    pub past: Vec<f32>,
    pub future: Vec<f32>,
    pub freq: Vec<i64>,
}

#[derive(Debug)]
pub struct SplitWindows {
    pub ranges: SplitRanges,
    pub train: Result<WindowSet, WindowError>,
    pub validation: Result<WindowSet, WindowError>,
    pub test: Result<WindowSet, WindowError>,
}

impl SplitWindows {
    pub fn get(&self, kind: SplitKind) -> &Result<WindowSet, WindowError> {
        match kind {
            SplitKind::Train => &self.train,
            SplitKind::Validation => &self.validation,
            SplitKind::Test => &self.test,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    #[error("invalid split fractions: {0}")]
    InvalidFractions(String),
    #[error("context_len and horizon_len must be > 0 (got {context_len} and {horizon_len})")]
    InvalidLength {
        context_len: usize,
        horizon_len: usize,
    },
    #[error("series has {actual} values but the split ranges cover {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("insufficient data for {split} split: {available} rows available, {required} required")]
    InsufficientData {
        split: SplitKind,
        available: usize,
        required: usize,
    },
}

/// Partitions `[0, len)` by index position:
/// `train_end = floor(len * (1 - val - test))`, `val_end = floor(len * (1 - test))`.
pub fn split(len: usize, val_frac: f64, test_frac: f64) -> Result<SplitRanges, WindowError> {
    for (name, frac) in [("val_frac", val_frac), ("test_frac", test_frac)] {
        if !frac.is_finite() || !(0.0..1.0).contains(&frac) {
            return Err(WindowError::InvalidFractions(format!(
                "{name} must be in [0, 1), got {frac}"
            )));
        }
    }
    if val_frac + test_frac >= 1.0 {
        return Err(WindowError::InvalidFractions(format!(
            "val_frac + test_frac must be < 1, got {}",
            val_frac + test_frac
        )));
    }

    let total = len as f64;
    let train_end = ((total * (1.0 - val_frac - test_frac)).floor() as usize).min(len);
    let val_end = ((total * (1.0 - test_frac)).floor() as usize).clamp(train_end, len);

    Ok(SplitRanges {
        len,
        train: 0..train_end,
        validation: train_end..val_end,
        test: val_end..len,
    })
}

/// Slides a unit stride over `values`, yielding `max(0, N - c - h + 1)` pairs
/// where pair `k` has context `[k, k + c)` and horizon `[k + c, k + c + h)`.
pub fn windowize(
    values: &[f32],
    context_len: usize,
    horizon_len: usize,
) -> Result<Vec<WindowPair>, WindowError> {
    validate_lengths(context_len, horizon_len)?;
    Ok(windows_in(values, 0..values.len(), 0, context_len, horizon_len))
}

/// Builds the window set of every split. Invalid lengths fail the whole call;
/// a split that is too short fails only its own entry.
pub fn build_split_windows(
    values: &[f32],
    ranges: &SplitRanges,
    context_len: usize,
    horizon_len: usize,
) -> Result<SplitWindows, WindowError> {
    validate_lengths(context_len, horizon_len)?;
    if values.len() != ranges.len {
        return Err(WindowError::LengthMismatch {
            expected: ranges.len,
            actual: values.len(),
        });
    }

    let build = |kind| build_window_set(values, ranges, kind, context_len, horizon_len);
    Ok(SplitWindows {
        ranges: ranges.clone(),
        train: build(SplitKind::Train),
        validation: build(SplitKind::Validation),
        test: build(SplitKind::Test),
    })
}

fn build_window_set(
    values: &[f32],
    ranges: &SplitRanges,
    split: SplitKind,
    context_len: usize,
    horizon_len: usize,
) -> Result<WindowSet, WindowError> {
    let own = ranges.range(split);
    let source = ranges.with_lookback(split, context_len);
    let required = context_len + horizon_len;

    if source.len() < required {
        warn!(
            component = "windows",
            event = "windows.split.insufficient",
            split = split.as_str(),
            available = source.len(),
            required = required
        );
        return Err(WindowError::InsufficientData {
            split,
            available: source.len(),
            required,
        });
    }

    let windows = windows_in(values, source.clone(), own.start, context_len, horizon_len);
    info!(
        component = "windows",
        event = "windows.split.built",
        split = split.as_str(),
        source_start = source.start,
        source_end = source.end,
        own_start = own.start,
        windows = windows.len()
    );

    Ok(WindowSet {
        split,
        source,
        own,
        context_len,
        horizon_len,
        windows,
    })
}

/// Windows fully inside `source` whose horizon starts at or after `horizon_floor`.
fn windows_in(
    values: &[f32],
    source: Range<usize>,
    horizon_floor: usize,
    context_len: usize,
    horizon_len: usize,
) -> Vec<WindowPair> {
    let span = context_len + horizon_len;
    if source.len() < span {
        return Vec::new();
    }

    (source.start..=source.end - span)
        .filter(|&start| start + context_len >= horizon_floor)
        .map(|start| WindowPair {
            start,
            context: values[start..start + context_len].to_vec(),
            horizon: values[start + context_len..start + span].to_vec(),
        })
        .collect()
}

fn validate_lengths(context_len: usize, horizon_len: usize) -> Result<(), WindowError> {
    if context_len == 0 || horizon_len == 0 {
        return Err(WindowError::InvalidLength {
            context_len,
            horizon_len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32).collect()
    }

    #[test]
    fn windows_in_respects_horizon_floor() {
        let values = ramp(12);
        let windows = windows_in(&values, 2..12, 6, 3, 2);
        // Candidate starts 2..=7; the horizon must begin at index 6 or later.
        assert_eq!(
            windows.iter().map(|w| w.start).collect::<Vec<_>>(),
            vec![3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn lookback_saturates_at_series_start() {
        let ranges = split(20, 0.25, 0.25).unwrap();
        assert_eq!(ranges.validation, 10..15);
        assert_eq!(ranges.with_lookback(SplitKind::Validation, 4), 6..15);
        assert_eq!(ranges.with_lookback(SplitKind::Validation, 50), 0..15);
        assert_eq!(ranges.with_lookback(SplitKind::Train, 4), 0..10);
    }

    #[test]
    fn zero_lengths_are_rejected() {
        assert!(matches!(
            windowize(&ramp(5), 0, 1),
            Err(WindowError::InvalidLength { .. })
        ));
        assert!(matches!(
            windowize(&ramp(5), 1, 0),
            Err(WindowError::InvalidLength { .. })
        ));
    }

    #[test]
    fn fractions_are_validated() {
        assert!(split(10, 0.5, 0.5).is_err());
        assert!(split(10, -0.1, 0.2).is_err());
        assert!(split(10, f64::NAN, 0.2).is_err());
        assert!(split(10, 0.0, 0.0).is_ok());
    }

    #[test]
    fn tensors_flatten_row_major() {
        let set = WindowSet {
            split: SplitKind::Train,
            source: 0..4,
            own: 0..4,
            context_len: 2,
            horizon_len: 1,
            windows: windowize(&ramp(4), 2, 1).unwrap(),
        };

        let tensors = set.to_tensors(FrequencyClass::High);
        assert_eq!(tensors.rows, 2);
        assert_eq!(tensors.past, vec![0.0, 1.0, 1.0, 2.0]);
        assert_eq!(tensors.future, vec![2.0, 3.0]);
        assert_eq!(tensors.freq, vec![0, 0]);
    }
}
