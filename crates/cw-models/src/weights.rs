// SPDX-License-Identifier: AGPL-3.0-only

//! Weight blob persistence
//!
//! Layout (all integers and floats little-endian):
//!
//! ```text
//! magic    b"CWM1"
//! kind     u8      0 = linear, 1 = mlp
//! height   u32
//! width    u32
//! channels u32
//! classes  u32
//! hidden   u32     mlp only
//! tensors  f32...  row-major, in declaration order
//! ```

use crate::error::{ModelError, Result};
use crate::linear::LinearClassifier;
use crate::mlp::Mlp;
use crate::model::AnyClassifier;
use crate::shapes::ImageShape;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::{Array1, Array2};
use std::path::Path;

/// Blob magic bytes
pub const MAGIC: &[u8; 4] = b"CWM1";

const KIND_LINEAR: u8 = 0;
const KIND_MLP: u8 = 1;

/// Encode a classifier into a weight blob
#[must_use]
pub fn to_bytes(model: &AnyClassifier) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    match model {
        AnyClassifier::Linear(m) => {
            buf.put_u8(KIND_LINEAR);
            put_header(&mut buf, crate::Classifier::input_shape(m), m.weights().nrows());
            put_tensor(&mut buf, m.weights().iter());
            put_tensor(&mut buf, m.bias().iter());
        }
        AnyClassifier::Mlp(m) => {
            let (w1, b1, w2, b2) = m.layers();
            buf.put_u8(KIND_MLP);
            put_header(&mut buf, crate::Classifier::input_shape(m), w2.nrows());
            buf.put_u32_le(dim_u32(w1.nrows()));
            put_tensor(&mut buf, w1.iter());
            put_tensor(&mut buf, b1.iter());
            put_tensor(&mut buf, w2.iter());
            put_tensor(&mut buf, b2.iter());
        }
    }
    buf.freeze()
}

/// Decode a weight blob
///
/// # Errors
///
/// Returns a parse error for bad magic, unknown kinds, truncation or
/// trailing bytes, and an invalid-weights error if the decoded tensors
/// do not chain.
pub fn from_bytes(data: &[u8]) -> Result<AnyClassifier> {
    let mut buf = data;
    if buf.remaining() < MAGIC.len() + 1 || &buf[..MAGIC.len()] != MAGIC {
        return Err(ModelError::parse_error("missing CWM1 magic"));
    }
    buf.advance(MAGIC.len());
    let kind = buf.get_u8();
    let height = get_dim(&mut buf)?;
    let width = get_dim(&mut buf)?;
    let channels = get_dim(&mut buf)?;
    let classes = get_dim(&mut buf)?;
    let shape = ImageShape::new(height, width, channels);
    let pixels = shape
        .checked_pixels()
        .ok_or_else(|| ModelError::parse_error("tensor size overflows"))?;
    tracing::debug!("Decoding {} bytes: kind={kind} shape={shape} classes={classes}", data.len());

    let model = match kind {
        KIND_LINEAR => {
            let weights = get_matrix(&mut buf, classes, pixels)?;
            let bias = get_vector(&mut buf, classes)?;
            AnyClassifier::Linear(LinearClassifier::new(shape, weights, bias)?)
        }
        KIND_MLP => {
            let hidden = get_dim(&mut buf)?;
            let w1 = get_matrix(&mut buf, hidden, pixels)?;
            let b1 = get_vector(&mut buf, hidden)?;
            let w2 = get_matrix(&mut buf, classes, hidden)?;
            let b2 = get_vector(&mut buf, classes)?;
            AnyClassifier::Mlp(Mlp::new(shape, w1, b1, w2, b2)?)
        }
        other => {
            return Err(ModelError::parse_error(format!(
                "unknown classifier kind {other}"
            )))
        }
    };

    if buf.has_remaining() {
        return Err(ModelError::parse_error(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(model)
}

/// Write a classifier to disk
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn save(model: &AnyClassifier, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let blob = to_bytes(model);
    std::fs::write(path, &blob)?;
    tracing::info!("Saved {} classifier to {} ({} bytes)", model.kind(), path.display(), blob.len());
    Ok(())
}

/// Read a classifier from disk
///
/// # Errors
///
/// Returns error if the file is missing, unreadable or malformed.
pub fn load(path: impl AsRef<Path>) -> Result<AnyClassifier> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let data = std::fs::read(path)?;
    from_bytes(&data)
}

impl AnyClassifier {
    /// Encode into a weight blob
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        to_bytes(self)
    }

    /// Decode from a weight blob
    ///
    /// # Errors
    ///
    /// See [`from_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        from_bytes(data)
    }

    /// Write to disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save(self, path)
    }

    /// Read from disk
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, unreadable or malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load(path)
    }
}

// ── Encoding helpers ──

fn dim_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn put_header(buf: &mut BytesMut, shape: ImageShape, classes: usize) {
    buf.put_u32_le(dim_u32(shape.height));
    buf.put_u32_le(dim_u32(shape.width));
    buf.put_u32_le(dim_u32(shape.channels));
    buf.put_u32_le(dim_u32(classes));
}

fn put_tensor<'a>(buf: &mut BytesMut, values: impl Iterator<Item = &'a f32>) {
    for v in values {
        buf.put_f32_le(*v);
    }
}

fn get_dim(buf: &mut &[u8]) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(ModelError::parse_error("truncated header"));
    }
    Ok(buf.get_u32_le() as usize)
}

fn get_floats(buf: &mut &[u8], count: usize) -> Result<Vec<f32>> {
    let needed = count
        .checked_mul(4)
        .ok_or_else(|| ModelError::parse_error("tensor size overflows"))?;
    if buf.remaining() < needed {
        return Err(ModelError::parse_error(format!(
            "truncated tensor: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok((0..count).map(|_| buf.get_f32_le()).collect())
}

fn get_matrix(buf: &mut &[u8], rows: usize, cols: usize) -> Result<Array2<f32>> {
    let count = rows
        .checked_mul(cols)
        .ok_or_else(|| ModelError::parse_error("tensor size overflows"))?;
    let data = get_floats(buf, count)?;
    Array2::from_shape_vec((rows, cols), data).map_err(|e| ModelError::parse_error(e.to_string()))
}

fn get_vector(buf: &mut &[u8], len: usize) -> Result<Array1<f32>> {
    Ok(Array1::from(get_floats(buf, len)?))
}
