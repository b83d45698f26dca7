//! Embedding normalization: any accepted embedding shape to a flat `Vec<f32>`.

use thiserror::Error;

use crate::value::{Tensor, Value};

/// Why a value could not be normalized. The resolver attaches the speaker id.
#[derive(Debug, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("unsupported embedding type: {0}")]
    Unsupported(String),

    #[error("element {index} ({value}) is not a finite f32")]
    NonFinite { index: usize, value: f64 },
}

/// The two embedding shapes the exporter accepts.
#[derive(Debug, Clone, Copy)]
pub enum Embedding<'a> {
    /// A materialized tensor with a numeric dtype.
    Tensor(&'a Tensor),
    /// A list or tuple of numbers, possibly nested.
    Sequence(&'a [Value]),
}

impl<'a> Embedding<'a> {
    /// Classifies `value` by capability, or rejects it with its type.
    pub fn classify(value: &'a Value) -> Result<Self, EmbeddingError> {
        match value {
            Value::Tensor(t) if t.dtype.is_numeric() => Ok(Embedding::Tensor(t)),
            Value::List(items) | Value::Tuple(items) => Ok(Embedding::Sequence(items)),
            other => Err(EmbeddingError::Unsupported(other.kind())),
        }
    }

    /// Flattens the embedding into `out` in traversal order.
    fn flatten_into(self, out: &mut Vec<f32>) -> Result<(), EmbeddingError> {
        match self {
            Embedding::Tensor(t) => {
                out.reserve(t.numel());
                for &v in t.flatten() {
                    push_checked(out, v)?;
                }
            }
            Embedding::Sequence(items) => {
                for item in items {
                    match item {
                        Value::Int(n) => push_checked(out, *n as f64)?,
                        Value::Float(f) => push_checked(out, *f)?,
                        nested => Embedding::classify(nested)?.flatten_into(out)?,
                    }
                }
            }
        }
        Ok(())
    }
}

fn push_checked(out: &mut Vec<f32>, value: f64) -> Result<(), EmbeddingError> {
    let narrowed = value as f32;
    if !value.is_finite() || !narrowed.is_finite() {
        return Err(EmbeddingError::NonFinite {
            index: out.len(),
            value,
        });
    }
    out.push(narrowed);
    Ok(())
}

/// Normalizes an embedding-like value to a flat `f32` vector.
///
/// Tensors are flattened in row-major order; sequences are flattened fully,
/// so `[[1, 2], [3, 4]]` becomes `[1, 2, 3, 4]`. Strings, mappings, bools,
/// `None`, opaque objects and non-numeric tensors are rejected.
pub fn normalize(value: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let mut out = Vec::new();
    Embedding::classify(value)?.flatten_into(&mut out)?;
    Ok(out)
}
