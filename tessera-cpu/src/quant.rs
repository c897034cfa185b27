//! Low-precision storage and scale factors
//!
//! Weights are held in inference layout `[N, K]` (one row per output
//! channel). FP8 weights carry one scale per output channel; FP8
//! activations are quantized per row at GEMM time. Half-precision operands
//! use a unit per-tensor scale.

#![allow(clippy::cast_possible_truncation)]

use std::sync::OnceLock;

use half::{bf16, f16};
use tessera::fp8::F8E4M3;
use tessera::{DType, Error, Result, TensorDType};

use crate::sparse;

/// Multiplier mapping stored values back to real values.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleFactor {
    PerTensor(f32),
    /// One factor per row of the owning tensor.
    PerChannel(Vec<f32>),
}

impl ScaleFactor {
    /// # Errors
    /// Returns `Precision` unless `scale` is finite and strictly positive.
    pub fn per_tensor(scale: f32) -> Result<Self> {
        check_scale(scale, 0)?;
        Ok(Self::PerTensor(scale))
    }

    /// # Errors
    /// Returns `Precision` unless every scale is finite and strictly positive.
    pub fn per_channel(scales: Vec<f32>) -> Result<Self> {
        for (i, &s) in scales.iter().enumerate() {
            check_scale(s, i)?;
        }
        Ok(Self::PerChannel(scales))
    }

    /// Unit scale.
    #[must_use]
    pub fn unit() -> Self {
        Self::PerTensor(1.0)
    }

    /// Factor for row `channel`.
    #[must_use]
    pub fn get(&self, channel: usize) -> f32 {
        match self {
            Self::PerTensor(s) => *s,
            Self::PerChannel(s) => s[channel],
        }
    }

    /// Check the factor covers `channels` rows.
    ///
    /// # Errors
    /// Returns `Precision` on a per-channel length mismatch.
    pub fn check_channels(&self, channels: usize) -> Result<()> {
        match self {
            Self::PerChannel(s) if s.len() != channels => Err(Error::Precision(format!(
                "{} channel scales for {channels} channels",
                s.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Scale that maps `absmax` onto the largest FP8 magnitude.
    #[must_use]
    pub fn fp8_absmax(absmax: f32) -> f32 {
        if absmax > 0.0 && absmax.is_finite() {
            absmax / F8E4M3::MAX
        } else {
            1.0
        }
    }
}

fn check_scale(scale: f32, index: usize) -> Result<()> {
    if scale > 0.0 && scale.is_finite() {
        Ok(())
    } else {
        Err(Error::Precision(format!(
            "scale factor {index} must be finite and positive, got {scale}"
        )))
    }
}

fn fp8_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (bits, slot) in table.iter_mut().enumerate() {
            *slot = F8E4M3(bits as u8).to_f32();
        }
        table
    })
}

/// Encoded element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F8(Vec<F8E4M3>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
}

impl Storage {
    /// Encode `values` into `dtype`.
    ///
    /// # Errors
    /// Returns `Precision` for a dtype without an encoder.
    pub fn encode(values: &[f32], dtype: DType) -> Result<Self> {
        match dtype {
            DType::F8E4M3 => Ok(Self::F8(tessera::fp8::encode_slice(values))),
            DType::F16 => Ok(Self::F16(values.iter().map(|&v| f16::from_f32(v)).collect())),
            DType::BF16 => Ok(Self::Bf16(
                values.iter().map(|&v| bf16::from_f32(v)).collect(),
            )),
            other => Err(Error::Precision(format!("no storage encoder for {other}"))),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F8(_) => F8E4M3::DTYPE,
            Self::F16(_) => f16::DTYPE,
            Self::Bf16(_) => bf16::DTYPE,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F8(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::Bf16(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Decode every element.
    #[must_use]
    pub fn decode(&self) -> Vec<f32> {
        match self {
            Self::F8(v) => {
                let table = fp8_table();
                let raw: &[u8] = bytemuck::cast_slice(v);
                raw.iter().map(|&b| table[usize::from(b)]).collect()
            }
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::Bf16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    /// Raw value at `index`, without any scale applied.
    #[must_use]
    pub fn get(&self, index: usize) -> f32 {
        match self {
            Self::F8(v) => fp8_table()[usize::from(v[index].0)],
            Self::F16(v) => v[index].to_f32(),
            Self::Bf16(v) => v[index].to_f32(),
        }
    }

    /// New storage holding the elements at `indices`, in order.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            Self::F8(v) => Self::F8(indices.iter().map(|&i| v[i]).collect()),
            Self::F16(v) => Self::F16(indices.iter().map(|&i| v[i]).collect()),
            Self::Bf16(v) => Self::Bf16(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// Round `value` through `dtype` and back.
#[must_use]
pub fn round_to(value: f32, dtype: DType) -> f32 {
    match dtype {
        DType::F8E4M3 => F8E4M3::from_f32(value).to_f32(),
        DType::F16 => f16::from_f32(value).to_f32(),
        DType::BF16 => bf16::from_f32(value).to_f32(),
        _ => value,
    }
}

/// Transpose a row-major `(rows, cols)` matrix.
#[must_use]
pub fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// A weight matrix in inference layout `[N, K]`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    n: usize,
    k: usize,
    storage: Storage,
    scale: ScaleFactor,
    /// 2:4 metadata, one byte per group of four input positions. When set,
    /// `storage` holds `N * K / 2` kept values.
    sparsity: Option<Vec<u8>>,
}

impl QuantizedMatrix {
    /// Encode a transposed `[N, K]` matrix. FP8 gets per-row absmax scales;
    /// half formats get a unit scale.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` on a length mismatch or `Precision` for an
    /// unsupported dtype.
    pub fn from_rows(n: usize, k: usize, data: &[f32], dtype: DType) -> Result<Self> {
        if data.len() != n * k {
            return Err(Error::ShapeMismatch {
                key: "weight".into(),
                expected: format!("[{n}, {k}]"),
                got: vec![data.len()],
            });
        }
        let scale = if dtype == DType::F8E4M3 {
            let scales = data
                .chunks(k.max(1))
                .map(|row| ScaleFactor::fp8_absmax(row.iter().fold(0.0f32, |m, v| m.max(v.abs()))))
                .collect();
            ScaleFactor::per_channel(scales)?
        } else {
            ScaleFactor::unit()
        };
        Self::with_scale(n, k, data, dtype, scale)
    }

    /// Encode a transposed `[N, K]` matrix with a caller-chosen scale.
    ///
    /// # Errors
    /// Returns `ShapeMismatch`/`Precision` as for [`Self::from_rows`].
    pub fn with_scale(
        n: usize,
        k: usize,
        data: &[f32],
        dtype: DType,
        scale: ScaleFactor,
    ) -> Result<Self> {
        scale.check_channels(n)?;
        if data.len() != n * k {
            return Err(Error::ShapeMismatch {
                key: "weight".into(),
                expected: format!("[{n}, {k}]"),
                got: vec![data.len()],
            });
        }
        let scaled: Vec<f32> = if k == 0 {
            Vec::new()
        } else {
            data.chunks(k)
                .enumerate()
                .flat_map(|(row, values)| {
                    let s = scale.get(row);
                    values.iter().map(move |v| v / s)
                })
                .collect()
        };
        Ok(Self {
            n,
            k,
            storage: Storage::encode(&scaled, dtype)?,
            scale,
            sparsity: None,
        })
    }

    /// Encode a checkpoint-layout `[K, N]` matrix, transposing it first.
    ///
    /// # Errors
    /// See [`Self::from_rows`].
    pub fn from_checkpoint(k: usize, n: usize, data: &[f32], dtype: DType) -> Result<Self> {
        if data.len() != n * k {
            return Err(Error::ShapeMismatch {
                key: "weight".into(),
                expected: format!("[{k}, {n}]"),
                got: vec![data.len()],
            });
        }
        Self::from_rows(n, k, &transpose(data, k, n), dtype)
    }

    /// Number of output channels.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.n
    }

    /// Input dimension.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn scale(&self) -> &ScaleFactor {
        &self.scale
    }

    #[must_use]
    pub fn sparsity(&self) -> Option<&[u8]> {
        self.sparsity.as_deref()
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.sparsity.is_some()
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        let scales = match &self.scale {
            ScaleFactor::PerTensor(_) => 4,
            ScaleFactor::PerChannel(s) => s.len() * 4,
        };
        self.storage.size_in_bytes() + scales + self.sparsity.as_ref().map_or(0, Vec::len)
    }

    /// Keep the two largest-magnitude values of every four along `K`.
    ///
    /// # Errors
    /// Returns `LayoutState` if already compressed and `InvalidConfig` if
    /// `K` is not a multiple of four.
    pub fn compress_2_4(&self) -> Result<Self> {
        if self.is_sparse() {
            return Err(Error::LayoutState("matrix is already 2:4 compressed".into()));
        }
        let raw = self.storage.decode();
        let (kept, meta) = sparse::select_2_4(&raw, self.n, self.k)?;
        Ok(Self {
            n: self.n,
            k: self.k,
            storage: self.storage.select(&kept),
            scale: self.scale.clone(),
            sparsity: Some(meta),
        })
    }

    /// Real-valued `[N, K]` matrix, with pruned positions as zero.
    #[must_use]
    pub fn dequantize(&self) -> Vec<f32> {
        let raw = self.storage.decode();
        let dense = match &self.sparsity {
            Some(meta) => sparse::expand_2_4(&raw, meta, self.n, self.k),
            None => raw,
        };
        let mut out = dense;
        if self.k > 0 {
            for (row, values) in out.chunks_mut(self.k).enumerate() {
                let s = self.scale.get(row);
                for v in values {
                    *v *= s;
                }
            }
        }
        out
    }
}

/// Activations in an operand format with one scale per row.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedActivations {
    pub rows: usize,
    pub cols: usize,
    pub storage: Storage,
    pub scale: ScaleFactor,
}

impl QuantizedActivations {
    /// Quantize a row-major `[rows, cols]` matrix into `dtype`.
    ///
    /// With `scale == None`, FP8 uses a dynamic per-row absmax scale and
    /// half formats a unit scale.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` or `Precision`.
    pub fn quantize(
        data: &[f32],
        rows: usize,
        cols: usize,
        dtype: DType,
        scale: Option<ScaleFactor>,
    ) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::ShapeMismatch {
                key: "activations".into(),
                expected: format!("[{rows}, {cols}]"),
                got: vec![data.len()],
            });
        }
        let scale = match scale {
            Some(s) => s,
            None if dtype == DType::F8E4M3 && cols > 0 => ScaleFactor::per_channel(
                data.chunks(cols)
                    .map(|row| {
                        ScaleFactor::fp8_absmax(row.iter().fold(0.0f32, |m, v| m.max(v.abs())))
                    })
                    .collect(),
            )?,
            None => ScaleFactor::unit(),
        };
        scale.check_channels(rows)?;
        let scaled: Vec<f32> = if cols == 0 {
            Vec::new()
        } else {
            data.chunks(cols)
                .enumerate()
                .flat_map(|(row, values)| {
                    let s = scale.get(row);
                    values.iter().map(move |v| v / s)
                })
                .collect()
        };
        Ok(Self {
            rows,
            cols,
            storage: Storage::encode(&scaled, dtype)?,
            scale,
        })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }
}
