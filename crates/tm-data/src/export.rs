use crate::store::KlineStore;
use arrow::array::{ArrayRef, FixedSizeListArray, Float32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rust_decimal::prelude::ToPrimitive;
use std::path::Path;
use std::sync::Arc;
use tm_types::{Candle, ExportError, Interval, TmResult};

/// Features per time step: open, high, low, close, volume, quote_volume.
pub const FEATURE_COUNT: usize = 6;

/// Column index of `close` within a feature row; the prediction target.
const CLOSE_IDX: usize = 3;

pub const DEFAULT_SEQUENCE_LENGTH: usize = 60;

/// Fixed-length windows over a stored series, paired with next-close targets.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    pub sequence_length: usize,
    /// Row-major flattened windows, each `sequence_length * FEATURE_COUNT`
    /// values long.
    pub sequences: Vec<Vec<f32>>,
    /// Normalized close of the bar immediately following each window.
    pub targets: Vec<f32>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Offline transformer from stored candles to fixed-length training windows.
///
/// Windowing is deterministic: the series is loaded ordered by open time,
/// z-score normalized per feature, and sliced into overlapping windows of
/// `sequence_length` steps with the next bar's close as the target.
#[derive(Debug, Clone)]
pub struct SequenceExporter {
    store: KlineStore,
    sequence_length: usize,
}

impl SequenceExporter {
    pub fn new(store: KlineStore) -> Self {
        Self {
            store,
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
        }
    }

    pub fn with_sequence_length(mut self, sequence_length: usize) -> Self {
        self.sequence_length = sequence_length;
        self
    }

    /// Build windows for a pair from everything stored.
    pub fn build_windows(&self, symbol: &str, interval: &Interval) -> TmResult<WindowSet> {
        let series = self.store.load_series(symbol, interval, None, None)?;
        let frame = to_feature_frame(&series);
        Ok(make_windows(frame, self.sequence_length))
    }

    /// Build windows and write them to a Parquet file as rows of
    /// `{sequence: FixedSizeList<Float32>, target: Float32}`.
    /// Returns the number of windows written.
    pub fn export_parquet<P: AsRef<Path>>(
        &self,
        symbol: &str,
        interval: &Interval,
        path: P,
    ) -> TmResult<usize> {
        let windows = self.build_windows(symbol, interval)?;
        if windows.is_empty() {
            let have = self.store.count(symbol, interval)? as usize;
            return Err(ExportError::InsufficientData {
                have,
                need: self.sequence_length,
            }
            .into());
        }
        let count = windows.len();

        write_parquet(&windows, path.as_ref())?;

        tracing::info!(
            symbol = %symbol,
            interval = %interval,
            windows = count,
            path = %path.as_ref().display(),
            "exported sequence windows"
        );
        Ok(count)
    }
}

/// Convert candles to `f64` feature rows in series order.
fn to_feature_frame(series: &[Candle]) -> Vec<[f64; FEATURE_COUNT]> {
    series
        .iter()
        .map(|c| {
            [
                c.open.to_f64().unwrap_or(0.0),
                c.high.to_f64().unwrap_or(0.0),
                c.low.to_f64().unwrap_or(0.0),
                c.close.to_f64().unwrap_or(0.0),
                c.volume.to_f64().unwrap_or(0.0),
                c.quote_volume.to_f64().unwrap_or(0.0),
            ]
        })
        .collect()
}

/// Z-score each feature column in place, using the sample standard deviation.
/// A zero-variance column normalizes to all zeros instead of dividing by zero.
fn normalize(frame: &mut [[f64; FEATURE_COUNT]]) {
    let n = frame.len();
    if n < 2 {
        return;
    }

    for col in 0..FEATURE_COUNT {
        let mean = frame.iter().map(|row| row[col]).sum::<f64>() / n as f64;
        let var = frame
            .iter()
            .map(|row| (row[col] - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std = var.sqrt();

        for row in frame.iter_mut() {
            row[col] = if std > 0.0 { (row[col] - mean) / std } else { 0.0 };
        }
    }
}

fn make_windows(mut frame: Vec<[f64; FEATURE_COUNT]>, sequence_length: usize) -> WindowSet {
    normalize(&mut frame);

    let mut sequences = Vec::new();
    let mut targets = Vec::new();

    // A series of length <= sequence_length yields no windows: every window
    // needs one additional bar for its target.
    if frame.len() > sequence_length {
        for start in 0..(frame.len() - sequence_length) {
            let mut flat = Vec::with_capacity(sequence_length * FEATURE_COUNT);
            for row in &frame[start..start + sequence_length] {
                flat.extend(row.iter().map(|v| *v as f32));
            }
            sequences.push(flat);
            targets.push(frame[start + sequence_length][CLOSE_IDX] as f32);
        }
    }

    WindowSet {
        sequence_length,
        sequences,
        targets,
    }
}

fn write_parquet(windows: &WindowSet, path: &Path) -> Result<(), ExportError> {
    let width = (windows.sequence_length * FEATURE_COUNT) as i32;
    let item_field = Arc::new(Field::new("item", DataType::Float32, false));

    let flat: Vec<f32> = windows.sequences.iter().flatten().copied().collect();
    let values: ArrayRef = Arc::new(Float32Array::from(flat));
    let sequences = FixedSizeListArray::new(item_field.clone(), width, values, None);
    let targets = Float32Array::from(windows.targets.clone());

    let schema = Arc::new(Schema::new(vec![
        Field::new(
            "sequence",
            DataType::FixedSizeList(item_field, width),
            false,
        ),
        Field::new("target", DataType::Float32, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(sequences), Arc::new(targets)],
    )
    .map_err(|e| ExportError::WriteFailed {
        message: e.to_string(),
    })?;

    let file = std::fs::File::create(path).map_err(|e| ExportError::WriteFailed {
        message: format!("create {}: {e}", path.display()),
    })?;

    let props = WriterProperties::builder().build();
    let mut writer =
        ArrowWriter::try_new(file, schema, Some(props)).map_err(|e| ExportError::WriteFailed {
            message: e.to_string(),
        })?;
    writer.write(&batch).map_err(|e| ExportError::WriteFailed {
        message: e.to_string(),
    })?;
    writer.close().map_err(|e| ExportError::WriteFailed {
        message: e.to_string(),
    })?;

    Ok(())
}
