//! Output post-processing — pulls quantities of interest out of solver output.

use std::path::Path;

use gt_types::PostProcessingError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result alias for post-processing operations.
pub type PostProcessResult<T> = Result<T, PostProcessingError>;

/// Extracts result values from a finished job's output file.
pub trait PostProcessor: Send + Sync {
    /// Parse `output_path` and return the selected values in row-major order.
    fn extract(&self, output_path: &Path) -> PostProcessResult<Vec<f64>>;
}

fn default_use_cols() -> Vec<usize> {
    vec![0]
}

/// Reads numeric columns from a CSV (or whitespace-free delimited) file.
///
/// Rows are read top to bottom and the selected columns of each row are
/// appended in order, so a single-column selection over N rows yields N
/// values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvColumnReader {
    /// Zero-based column indices to extract.
    #[serde(default = "default_use_cols")]
    pub use_cols: Vec<usize>,
    /// Treat the first line as a header and skip it.
    #[serde(default)]
    pub has_header: bool,
    /// Data rows to skip after the header.
    #[serde(default)]
    pub skip_rows: usize,
}

impl Default for CsvColumnReader {
    fn default() -> Self {
        Self {
            use_cols: default_use_cols(),
            has_header: false,
            skip_rows: 0,
        }
    }
}

impl CsvColumnReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_use_cols(mut self, use_cols: Vec<usize>) -> Self {
        self.use_cols = use_cols;
        self
    }

    pub fn with_header(mut self) -> Self {
        self.has_header = true;
        self
    }

    pub fn with_skip_rows(mut self, skip_rows: usize) -> Self {
        self.skip_rows = skip_rows;
        self
    }
}

impl PostProcessor for CsvColumnReader {
    fn extract(&self, output_path: &Path) -> PostProcessResult<Vec<f64>> {
        if !output_path.exists() {
            return Err(PostProcessingError::OutputMissing {
                path: output_path.display().to_string(),
            });
        }
        let path = output_path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.has_header)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(output_path)
            .map_err(|err| PostProcessingError::Unparseable {
                path: path.clone(),
                message: err.to_string(),
            })?;

        let mut values = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(|err| PostProcessingError::Unparseable {
                path: path.clone(),
                message: err.to_string(),
            })?;
            if row < self.skip_rows || record.iter().all(str::is_empty) {
                continue;
            }
            for &col in &self.use_cols {
                let field = record
                    .get(col)
                    .ok_or_else(|| PostProcessingError::Unparseable {
                        path: path.clone(),
                        message: format!("row {row} has no column {col}"),
                    })?;
                let value = field
                    .parse::<f64>()
                    .map_err(|_| PostProcessingError::Unparseable {
                        path: path.clone(),
                        message: format!("row {row}, column {col}: not a number: {field:?}"),
                    })?;
                values.push(value);
            }
        }

        if values.is_empty() {
            return Err(PostProcessingError::EmptySelection { path });
        }
        debug!(path = %output_path.display(), count = values.len(), "extracted output values");
        Ok(values)
    }
}
