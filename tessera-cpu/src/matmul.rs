//! Quantized matmul engine
//!
//! `C (M,N) = A (M,K) × Wᵀ` where `W` is stored `[N, K]`. Every output
//! element is accumulated in f32 over `k = 0..K` in order, multiplied by the
//! activation row scale and the weight channel scale, then rounded to the
//! profile's output format. The algorithm choice only changes how output
//! elements are partitioned across workers, never the arithmetic, so all
//! algorithms produce bit-identical results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;
use tessera::{DType, Error, PrecisionProfile, Result};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::quant::{round_to, QuantizedActivations, QuantizedMatrix};
use crate::sparse;

/// Work partitioning for one GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GemmAlgorithm {
    Serial,
    /// One task per output row.
    RowParallel,
    /// One task per output element; used for single-row (GEMV) problems.
    ColumnParallel,
}

/// Key of the algorithm cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct GemmShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    #[serde(default)]
    pub sparse: bool,
}

#[derive(Deserialize)]
struct AlgorithmEntry {
    #[serde(flatten)]
    shape: GemmShape,
    algorithm: GemmAlgorithm,
}

/// Per-shape algorithm cache. Misses are filled from a size heuristic and
/// remembered.
#[derive(Debug, Default)]
pub struct AlgorithmMap {
    entries: HashMap<GemmShape, GemmAlgorithm>,
    hits: u64,
    misses: u64,
}

impl AlgorithmMap {
    /// Parse a JSON list of `{m, n, k, sparse?, algorithm}` entries.
    ///
    /// # Errors
    /// Returns a JSON error for malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<AlgorithmEntry> = serde_json::from_str(json)?;
        let mut map = Self::default();
        for e in entries {
            map.insert(e.shape, e.algorithm);
        }
        Ok(map)
    }

    pub fn insert(&mut self, shape: GemmShape, algorithm: GemmAlgorithm) {
        self.entries.insert(shape, algorithm);
    }

    /// Cached algorithm for `shape`, choosing and caching one on a miss.
    pub fn select(&mut self, shape: GemmShape) -> GemmAlgorithm {
        if let Some(&algo) = self.entries.get(&shape) {
            self.hits += 1;
            return algo;
        }
        self.misses += 1;
        let algo = Self::heuristic(shape);
        self.entries.insert(shape, algo);
        algo
    }

    fn heuristic(shape: GemmShape) -> GemmAlgorithm {
        if shape.m * shape.n * shape.k < 32 * 1024 {
            GemmAlgorithm::Serial
        } else if shape.m == 1 {
            GemmAlgorithm::ColumnParallel
        } else {
            GemmAlgorithm::RowParallel
        }
    }

    #[must_use]
    pub fn get(&self, shape: &GemmShape) -> Option<GemmAlgorithm> {
        self.entries.get(shape).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// One precision variant of the GEMM.
pub trait GemmKernel: Send + Sync {
    fn profile(&self) -> PrecisionProfile;

    /// Operand format for activations multiplied against a weight stored
    /// as `weight`.
    ///
    /// # Errors
    /// Returns `Precision` if this kernel cannot consume `weight`.
    fn activation_format(&self, weight: DType) -> Result<DType>;

    /// Round an f32 result to the output format.
    fn round_output(&self, value: f32) -> f32 {
        round_to(value, self.profile().output_type())
    }
}

/// FP8 E4M3 layer weights, bf16 LM head, bf16 output.
struct Fp8Bf16Kernel;

impl GemmKernel for Fp8Bf16Kernel {
    fn profile(&self) -> PrecisionProfile {
        PrecisionProfile::Fp8Bf16
    }

    fn activation_format(&self, weight: DType) -> Result<DType> {
        match weight {
            DType::F8E4M3 | DType::BF16 => Ok(weight),
            other => Err(unsupported(self.profile(), other)),
        }
    }
}

struct F16Kernel;

impl GemmKernel for F16Kernel {
    fn profile(&self) -> PrecisionProfile {
        PrecisionProfile::F16
    }

    fn activation_format(&self, weight: DType) -> Result<DType> {
        match weight {
            DType::F16 => Ok(DType::F16),
            other => Err(unsupported(self.profile(), other)),
        }
    }
}

struct Bf16Kernel;

impl GemmKernel for Bf16Kernel {
    fn profile(&self) -> PrecisionProfile {
        PrecisionProfile::Bf16
    }

    fn activation_format(&self, weight: DType) -> Result<DType> {
        match weight {
            DType::BF16 => Ok(DType::BF16),
            other => Err(unsupported(self.profile(), other)),
        }
    }
}

fn unsupported(profile: PrecisionProfile, weight: DType) -> Error {
    Error::Precision(format!("{profile:?} GEMM cannot consume {weight} weights"))
}

fn kernel_for(profile: PrecisionProfile) -> Box<dyn GemmKernel> {
    match profile {
        PrecisionProfile::Fp8Bf16 => Box::new(Fp8Bf16Kernel),
        PrecisionProfile::F16 => Box::new(F16Kernel),
        PrecisionProfile::Bf16 => Box::new(Bf16Kernel),
    }
}

/// GEMM front end for one rank.
pub struct MatmulEngine {
    context: Arc<ExecutionContext>,
    kernel: Box<dyn GemmKernel>,
}

impl MatmulEngine {
    #[must_use]
    pub fn new(context: Arc<ExecutionContext>, profile: PrecisionProfile) -> Self {
        Self {
            context,
            kernel: kernel_for(profile),
        }
    }

    /// Select the kernel family for `(input, output, compute)`.
    ///
    /// # Errors
    /// Returns `Precision` for an unsupported combination.
    pub fn set_precision_profile(
        &mut self,
        input: DType,
        output: DType,
        compute: DType,
    ) -> Result<()> {
        let profile = PrecisionProfile::from_types(input, output, compute)?;
        self.kernel = kernel_for(profile);
        Ok(())
    }

    #[must_use]
    pub fn profile(&self) -> PrecisionProfile {
        self.kernel.profile()
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Preload algorithm choices from a JSON file. Returns the number of
    /// entries now cached.
    ///
    /// # Errors
    /// Returns I/O, JSON or lock errors.
    pub fn load_algorithm_map(&self, path: impl AsRef<Path>) -> Result<usize> {
        let loaded = AlgorithmMap::from_json(&std::fs::read_to_string(path)?)?;
        let mut map = self.context.lock_gemm()?;
        for (shape, algo) in loaded.entries {
            map.insert(shape, algo);
        }
        Ok(map.len())
    }

    /// Pin the algorithm for one problem shape.
    ///
    /// # Errors
    /// Returns `DeviceExecution` if the handle is poisoned.
    pub fn set_algorithm(&self, shape: GemmShape, algorithm: GemmAlgorithm) -> Result<()> {
        self.context.lock_gemm()?.insert(shape, algorithm);
        Ok(())
    }

    /// `A (m, K)` in f32 against `weight`; activations are quantized to the
    /// kernel's operand format with dynamic per-row scales.
    ///
    /// # Errors
    /// `ShapeMismatch` for inconsistent sizes, `Precision` for a weight the
    /// kernel cannot consume, `DeviceExecution` for a poisoned handle.
    pub fn gemm(&self, a: &[f32], m: usize, weight: &QuantizedMatrix) -> Result<Vec<f32>> {
        let format = self.kernel.activation_format(weight.dtype())?;
        let act = QuantizedActivations::quantize(a, m, weight.cols(), format, None)?;
        self.gemm_quantized(&act, weight)
    }

    /// GEMM over pre-quantized activations. Output is real-valued: both
    /// scales are applied to the f32 accumulator.
    ///
    /// # Errors
    /// As for [`Self::gemm`].
    pub fn gemm_quantized(
        &self,
        a: &QuantizedActivations,
        weight: &QuantizedMatrix,
    ) -> Result<Vec<f32>> {
        let (m, n, k) = (a.rows, weight.rows(), weight.cols());
        if a.cols != k {
            return Err(Error::ShapeMismatch {
                key: "gemm".into(),
                expected: format!("K = {k}"),
                got: vec![a.rows, a.cols],
            });
        }
        let expected = self.kernel.activation_format(weight.dtype())?;
        if a.dtype() != expected {
            return Err(Error::Precision(format!(
                "activations are {}, kernel expects {expected}",
                a.dtype()
            )));
        }

        let shape = GemmShape {
            m,
            n,
            k,
            sparse: weight.is_sparse(),
        };
        let mut handle = self.context.lock_gemm()?;
        let algorithm = handle.select(shape);

        let a_vals = a.storage.decode();
        let w_vals = weight.storage().decode();
        let problem = Problem {
            a: &a_vals,
            w: &w_vals,
            meta: weight.sparsity(),
            a_scale: &a.scale,
            w_scale: weight.scale(),
            kernel: self.kernel.as_ref(),
            n,
            k,
        };
        let mut out = self.context.buffers().acquire(m * n);
        self.context.install(|| problem.run(algorithm, &mut out));
        drop(handle);
        Ok(out)
    }

    /// 2:4-compress a weight for the sparse kernel.
    ///
    /// # Errors
    /// See [`QuantizedMatrix::compress_2_4`].
    pub fn compress_matrix(&self, weight: &QuantizedMatrix) -> Result<QuantizedMatrix> {
        let compressed = weight.compress_2_4()?;
        debug!(
            n = weight.rows(),
            k = weight.cols(),
            bytes_before = weight.size_in_bytes(),
            bytes_after = compressed.size_in_bytes(),
            "compressed weight to 2:4"
        );
        Ok(compressed)
    }
}

struct Problem<'a> {
    a: &'a [f32],
    w: &'a [f32],
    meta: Option<&'a [u8]>,
    a_scale: &'a crate::quant::ScaleFactor,
    w_scale: &'a crate::quant::ScaleFactor,
    kernel: &'a dyn GemmKernel,
    n: usize,
    k: usize,
}

impl Problem<'_> {
    fn element(&self, row: usize, col: usize) -> f32 {
        let a_row = &self.a[row * self.k..(row + 1) * self.k];
        let mut acc = 0.0f32;
        match self.meta {
            None => {
                let w_row = &self.w[col * self.k..(col + 1) * self.k];
                for (x, y) in a_row.iter().zip(w_row) {
                    acc += x * y;
                }
            }
            Some(meta) => {
                let groups = self.k / 4;
                let kept = &self.w[col * groups * 2..(col + 1) * groups * 2];
                let meta = &meta[col * groups..(col + 1) * groups];
                for (g, &m) in meta.iter().enumerate() {
                    let (lo, hi) = sparse::positions(m);
                    acc += a_row[g * 4 + lo] * kept[g * 2];
                    acc += a_row[g * 4 + hi] * kept[g * 2 + 1];
                }
            }
        }
        self.kernel
            .round_output(acc * self.a_scale.get(row) * self.w_scale.get(col))
    }

    fn run(&self, algorithm: GemmAlgorithm, out: &mut [f32]) {
        let n = self.n;
        if n == 0 {
            return;
        }
        match algorithm {
            GemmAlgorithm::Serial => {
                for (row, c_row) in out.chunks_mut(n).enumerate() {
                    for (col, c) in c_row.iter_mut().enumerate() {
                        *c = self.element(row, col);
                    }
                }
            }
            GemmAlgorithm::RowParallel => {
                out.par_chunks_mut(n).enumerate().for_each(|(row, c_row)| {
                    for (col, c) in c_row.iter_mut().enumerate() {
                        *c = self.element(row, col);
                    }
                });
            }
            GemmAlgorithm::ColumnParallel => {
                out.par_iter_mut().enumerate().for_each(|(idx, c)| {
                    *c = self.element(idx / n, idx % n);
                });
            }
        }
    }
}
