//! Named-tensor request/response protocol
//!
//! A [`TensorMap`] is a non-owning, string-keyed view over caller buffers.
//! Payloads are a tagged variant over the element types the protocol uses,
//! and a [`Schema`] checks presence, dtype and shape once at the boundary so
//! the decode loop can read fields without re-checking.

use std::collections::BTreeMap;

use crate::dtype::{DType, TensorDType};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Where a tensor's buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpace {
    Host,
    Device,
}

/// Borrowed, read-only tensor payload.
#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
    I32(&'a [i32]),
    U32(&'a [u32]),
    U64(&'a [u64]),
    F32(&'a [f32]),
}

impl TensorData<'_> {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::I32(_) => DType::I32,
            Self::U32(_) => DType::U32,
            Self::U64(_) => DType::U64,
            Self::F32(_) => DType::F32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I32(d) => d.len(),
            Self::U32(d) => d.len(),
            Self::U64(d) => d.len(),
            Self::F32(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Borrowed, writable tensor payload.
///
/// `Unallocated` declares an output the caller does not want filled; the
/// engine validates its dtype and shape but skips writing it.
#[derive(Debug)]
pub enum TensorDataMut<'a> {
    I32(&'a mut [i32]),
    F32(&'a mut [f32]),
    Unallocated(DType),
}

impl TensorDataMut<'_> {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::I32(_) => DType::I32,
            Self::F32(_) => DType::F32,
            Self::Unallocated(dtype) => *dtype,
        }
    }

    /// Element count, or `None` when no buffer is attached.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::I32(d) => Some(d.len()),
            Self::F32(d) => Some(d.len()),
            Self::Unallocated(_) => None,
        }
    }
}

/// Element types that can be read out of a protocol tensor.
pub trait ProtocolElement: TensorDType {
    fn view<'a>(data: &TensorData<'a>) -> Option<&'a [Self]>;

    fn view_mut<'b>(_data: &'b mut TensorDataMut<'_>) -> Option<&'b mut [Self]> {
        None
    }
}

impl ProtocolElement for i32 {
    fn view<'a>(data: &TensorData<'a>) -> Option<&'a [Self]> {
        match *data {
            TensorData::I32(d) => Some(d),
            _ => None,
        }
    }

    fn view_mut<'b>(data: &'b mut TensorDataMut<'_>) -> Option<&'b mut [Self]> {
        match data {
            TensorDataMut::I32(d) => Some(&mut **d),
            _ => None,
        }
    }
}

impl ProtocolElement for u32 {
    fn view<'a>(data: &TensorData<'a>) -> Option<&'a [Self]> {
        match *data {
            TensorData::U32(d) => Some(d),
            _ => None,
        }
    }
}

impl ProtocolElement for u64 {
    fn view<'a>(data: &TensorData<'a>) -> Option<&'a [Self]> {
        match *data {
            TensorData::U64(d) => Some(d),
            _ => None,
        }
    }
}

impl ProtocolElement for f32 {
    fn view<'a>(data: &TensorData<'a>) -> Option<&'a [Self]> {
        match *data {
            TensorData::F32(d) => Some(d),
            _ => None,
        }
    }

    fn view_mut<'b>(data: &'b mut TensorDataMut<'_>) -> Option<&'b mut [Self]> {
        match data {
            TensorDataMut::F32(d) => Some(&mut **d),
            _ => None,
        }
    }
}

/// A named, read-only tensor view.
#[derive(Debug, Clone)]
pub struct NamedTensor<'a> {
    pub name: String,
    pub memory_space: MemorySpace,
    pub shape: Vec<usize>,
    pub data: TensorData<'a>,
}

impl<'a> NamedTensor<'a> {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        memory_space: MemorySpace,
        shape: Vec<usize>,
        data: TensorData<'a>,
    ) -> Self {
        Self {
            name: name.into(),
            memory_space,
            shape,
            data,
        }
    }

    /// Host-resident tensor.
    #[must_use]
    pub fn host(name: impl Into<String>, shape: Vec<usize>, data: TensorData<'a>) -> Self {
        Self::new(name, MemorySpace::Host, shape, data)
    }
}

impl Tensor for NamedTensor<'_> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

/// A named, writable tensor view.
#[derive(Debug)]
pub struct NamedTensorMut<'a> {
    pub name: String,
    pub memory_space: MemorySpace,
    pub shape: Vec<usize>,
    pub data: TensorDataMut<'a>,
}

impl<'a> NamedTensorMut<'a> {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        memory_space: MemorySpace,
        shape: Vec<usize>,
        data: TensorDataMut<'a>,
    ) -> Self {
        Self {
            name: name.into(),
            memory_space,
            shape,
            data,
        }
    }

    #[must_use]
    pub fn host(name: impl Into<String>, shape: Vec<usize>, data: TensorDataMut<'a>) -> Self {
        Self::new(name, MemorySpace::Host, shape, data)
    }
}

impl Tensor for NamedTensorMut<'_> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.data.dtype()
    }
}

/// Read-only request map.
#[derive(Debug, Clone, Default)]
pub struct TensorMap<'a> {
    tensors: BTreeMap<String, NamedTensor<'a>>,
}

impl<'a> TensorMap<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor under its own name, returning any tensor it replaced.
    pub fn insert(&mut self, tensor: NamedTensor<'a>) -> Option<NamedTensor<'a>> {
        self.tensors.insert(tensor.name.clone(), tensor)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, tensor: NamedTensor<'a>) -> Self {
        self.insert(tensor);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<NamedTensor<'a>> {
        self.tensors.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&NamedTensor<'a>> {
        self.tensors.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Typed payload of `key`.
    ///
    /// # Errors
    /// `MissingKey` if absent, `TypeMismatch` if stored with another dtype.
    pub fn data<T: ProtocolElement>(&self, key: &str) -> Result<&'a [T]> {
        let tensor = self
            .tensors
            .get(key)
            .ok_or_else(|| Error::MissingKey(key.to_string()))?;
        T::view(&tensor.data).ok_or_else(|| Error::TypeMismatch {
            key: key.to_string(),
            expected: T::DTYPE,
            got: tensor.data.dtype(),
        })
    }

    /// First element of `key`, or `None` when the key is absent.
    ///
    /// # Errors
    /// `TypeMismatch` on a dtype mismatch, `ShapeMismatch` if empty.
    pub fn scalar<T: ProtocolElement>(&self, key: &str) -> Result<Option<T>> {
        if !self.contains(key) {
            return Ok(None);
        }
        let data = self.data::<T>(key)?;
        data.first().copied().map(Some).ok_or_else(|| Error::ShapeMismatch {
            key: key.to_string(),
            expected: "[1]".to_string(),
            got: vec![0],
        })
    }
}

/// Writable response map.
#[derive(Debug, Default)]
pub struct TensorMapMut<'a> {
    tensors: BTreeMap<String, NamedTensorMut<'a>>,
}

impl<'a> TensorMapMut<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: NamedTensorMut<'a>) -> Option<NamedTensorMut<'a>> {
        self.tensors.insert(tensor.name.clone(), tensor)
    }

    #[must_use]
    pub fn with(mut self, tensor: NamedTensorMut<'a>) -> Self {
        self.insert(tensor);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&NamedTensorMut<'a>> {
        self.tensors.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Writable payload of `key`; `Ok(None)` for an unallocated output.
    ///
    /// # Errors
    /// `MissingKey` if absent, `TypeMismatch` on a dtype mismatch.
    pub fn data_mut<T: ProtocolElement>(&mut self, key: &str) -> Result<Option<&mut [T]>> {
        let tensor = self
            .tensors
            .get_mut(key)
            .ok_or_else(|| Error::MissingKey(key.to_string()))?;
        let got = tensor.data.dtype();
        if got != T::DTYPE {
            return Err(Error::TypeMismatch {
                key: key.to_string(),
                expected: T::DTYPE,
                got,
            });
        }
        if matches!(tensor.data, TensorDataMut::Unallocated(_)) {
            return Ok(None);
        }
        T::view_mut(&mut tensor.data)
            .map(Some)
            .ok_or_else(|| Error::TypeMismatch {
                key: key.to_string(),
                expected: T::DTYPE,
                got,
            })
    }
}

/// Shape, dtype and (when attached) element count of a map entry.
pub trait TensorLookup {
    fn lookup(&self, key: &str) -> Option<(&[usize], DType, Option<usize>)>;
}

impl TensorLookup for TensorMap<'_> {
    fn lookup(&self, key: &str) -> Option<(&[usize], DType, Option<usize>)> {
        self.get(key)
            .map(|t| (t.shape.as_slice(), t.data.dtype(), Some(t.data.len())))
    }
}

impl TensorLookup for TensorMapMut<'_> {
    fn lookup(&self, key: &str) -> Option<(&[usize], DType, Option<usize>)> {
        self.get(key)
            .map(|t| (t.shape.as_slice(), t.data.dtype(), t.data.len()))
    }
}

/// One dimension of a schema shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    /// Named size that must agree across every field using it.
    Symbol(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub key: &'static str,
    pub dtype: DType,
    pub shape: Vec<Dim>,
    pub presence: Presence,
}

impl FieldSpec {
    #[must_use]
    pub fn required(key: &'static str, dtype: DType, shape: Vec<Dim>) -> Self {
        Self {
            key,
            dtype,
            shape,
            presence: Presence::Required,
        }
    }

    #[must_use]
    pub fn optional(key: &'static str, dtype: DType, shape: Vec<Dim>) -> Self {
        Self {
            key,
            dtype,
            shape,
            presence: Presence::Optional,
        }
    }
}

/// Cross-field presence rules.
#[derive(Debug, Clone, Copy)]
pub enum Constraint {
    /// Both keys present or both absent.
    Together(&'static str, &'static str),
    /// Exactly one of the two keys present.
    ExactlyOne(&'static str, &'static str),
    /// The keys may not both be present.
    Excludes(&'static str, &'static str),
    /// If the first key is present the second must be.
    Requires(&'static str, &'static str),
}

/// Symbol values resolved during validation.
pub type Bindings = BTreeMap<&'static str, usize>;

/// Declarative description of a tensor map.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
    constraints: Vec<Constraint>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Validate `map` with no pre-bound symbols.
    ///
    /// # Errors
    /// See [`Schema::validate_with`].
    pub fn validate<M: TensorLookup>(&self, map: &M) -> Result<Bindings> {
        self.validate_with(map, Bindings::new())
    }

    /// Validate `map`, starting from `bindings`, and return the symbol
    /// values the map fixes.
    ///
    /// # Errors
    /// `MissingKey`, `TypeMismatch`, `ShapeMismatch` per field, and
    /// `ConflictingDecodeMode` when an exclusivity rule is broken.
    pub fn validate_with<M: TensorLookup>(
        &self,
        map: &M,
        mut bindings: Bindings,
    ) -> Result<Bindings> {
        let present = |key: &str| map.lookup(key).is_some();
        for constraint in &self.constraints {
            match *constraint {
                Constraint::Together(a, b) => match (present(a), present(b)) {
                    (true, false) => return Err(Error::MissingKey(b.to_string())),
                    (false, true) => return Err(Error::MissingKey(a.to_string())),
                    _ => {}
                },
                Constraint::ExactlyOne(a, b) => match (present(a), present(b)) {
                    (true, true) => {
                        return Err(Error::ConflictingDecodeMode(format!(
                            "'{a}' and '{b}' are mutually exclusive"
                        )))
                    }
                    (false, false) => return Err(Error::MissingKey(format!("{a} or {b}"))),
                    _ => {}
                },
                Constraint::Excludes(a, b) => {
                    if present(a) && present(b) {
                        return Err(Error::ConflictingDecodeMode(format!(
                            "'{a}' cannot be combined with '{b}'"
                        )));
                    }
                }
                Constraint::Requires(a, b) => {
                    if present(a) && !present(b) {
                        return Err(Error::MissingKey(b.to_string()));
                    }
                }
            }
        }

        for spec in &self.fields {
            let Some((shape, dtype, len)) = map.lookup(spec.key) else {
                if spec.presence == Presence::Required {
                    return Err(Error::MissingKey(spec.key.to_string()));
                }
                continue;
            };
            if dtype != spec.dtype {
                return Err(Error::TypeMismatch {
                    key: spec.key.to_string(),
                    expected: spec.dtype,
                    got: dtype,
                });
            }
            check_shape(spec, shape, &mut bindings)?;
            let numel: usize = shape.iter().product();
            if len.is_some_and(|n| n != numel) {
                return Err(Error::ShapeMismatch {
                    key: spec.key.to_string(),
                    expected: format!("{numel} elements"),
                    got: shape.to_vec(),
                });
            }
        }
        Ok(bindings)
    }
}

fn check_shape(spec: &FieldSpec, shape: &[usize], bindings: &mut Bindings) -> Result<()> {
    let mismatch = |bindings: &Bindings| Error::ShapeMismatch {
        key: spec.key.to_string(),
        expected: describe_shape(&spec.shape, bindings),
        got: shape.to_vec(),
    };
    if shape.len() != spec.shape.len() {
        return Err(mismatch(bindings));
    }
    for (dim, &size) in spec.shape.iter().zip(shape) {
        match *dim {
            Dim::Fixed(n) if n != size => return Err(mismatch(bindings)),
            Dim::Fixed(_) => {}
            Dim::Symbol(sym) => match bindings.get(sym) {
                Some(&bound) if bound != size => return Err(mismatch(bindings)),
                Some(_) => {}
                None => {
                    bindings.insert(sym, size);
                }
            },
        }
    }
    Ok(())
}

fn describe_shape(dims: &[Dim], bindings: &Bindings) -> String {
    let parts: Vec<String> = dims
        .iter()
        .map(|d| match *d {
            Dim::Fixed(n) => n.to_string(),
            Dim::Symbol(s) => match bindings.get(s) {
                Some(n) => format!("{s}={n}"),
                None => s.to_string(),
            },
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

/// Symbol names shared by the request and response schemas.
pub mod dims {
    pub const BATCH: &str = "batch";
    pub const MAX_INPUT_LEN: &str = "max_input_len";
    pub const BEAM: &str = "beam_width";
    pub const TOTAL_OUTPUT_LEN: &str = "total_output_len";
    pub const REQUEST_OUTPUT_LEN: &str = "request_output_len";
}

/// Request and response keys.
pub mod keys {
    pub const INPUT_IDS: &str = "input_ids";
    pub const INPUT_LENGTHS: &str = "input_lengths";
    pub const OUTPUT_SEQ_LEN: &str = "output_seq_len";
    pub const TEMPERATURE: &str = "temperature";
    pub const LEN_PENALTY: &str = "len_penalty";
    pub const REPETITION_PENALTY: &str = "repetition_penalty";
    pub const BEAM_SEARCH_DIVERSITY_RATE: &str = "beam_search_diversity_rate";
    pub const RANDOM_SEED: &str = "random_seed";
    pub const RUNTIME_TOP_P: &str = "runtime_top_p";
    pub const RUNTIME_TOP_K: &str = "runtime_top_k";

    pub const OUTPUT_IDS: &str = "output_ids";
    pub const SEQUENCE_LENGTH: &str = "sequence_length";
    pub const OUTPUT_CUM_LOG_PROBS: &str = "output_cum_log_probs";
}

/// Schema every decode request must satisfy.
#[must_use]
pub fn request_schema() -> Schema {
    use dims::{BATCH, MAX_INPUT_LEN};
    use keys::*;
    let scalar = || vec![Dim::Fixed(1)];
    Schema::new()
        .field(FieldSpec::optional(
            INPUT_IDS,
            DType::I32,
            vec![Dim::Symbol(BATCH), Dim::Symbol(MAX_INPUT_LEN)],
        ))
        .field(FieldSpec::optional(
            INPUT_LENGTHS,
            DType::I32,
            vec![Dim::Symbol(BATCH)],
        ))
        .field(FieldSpec::required(
            OUTPUT_SEQ_LEN,
            DType::U32,
            vec![Dim::Symbol(BATCH)],
        ))
        .field(FieldSpec::required(TEMPERATURE, DType::F32, scalar()))
        .field(FieldSpec::required(LEN_PENALTY, DType::F32, scalar()))
        .field(FieldSpec::required(REPETITION_PENALTY, DType::F32, scalar()))
        .field(FieldSpec::optional(
            BEAM_SEARCH_DIVERSITY_RATE,
            DType::F32,
            scalar(),
        ))
        .field(FieldSpec::optional(RANDOM_SEED, DType::U64, scalar()))
        .field(FieldSpec::optional(RUNTIME_TOP_P, DType::F32, scalar()))
        .field(FieldSpec::optional(RUNTIME_TOP_K, DType::I32, scalar()))
        .constraint(Constraint::Together(INPUT_IDS, INPUT_LENGTHS))
        .constraint(Constraint::ExactlyOne(BEAM_SEARCH_DIVERSITY_RATE, RANDOM_SEED))
        .constraint(Constraint::Excludes(BEAM_SEARCH_DIVERSITY_RATE, RUNTIME_TOP_P))
        .constraint(Constraint::Excludes(BEAM_SEARCH_DIVERSITY_RATE, RUNTIME_TOP_K))
        .constraint(Constraint::Requires(RUNTIME_TOP_P, RANDOM_SEED))
        .constraint(Constraint::Requires(RUNTIME_TOP_K, RANDOM_SEED))
}

/// Schema of the map the engine writes into.
#[must_use]
pub fn response_schema() -> Schema {
    use dims::{BATCH, BEAM, REQUEST_OUTPUT_LEN, TOTAL_OUTPUT_LEN};
    use keys::{OUTPUT_CUM_LOG_PROBS, OUTPUT_IDS, SEQUENCE_LENGTH};
    Schema::new()
        .field(FieldSpec::required(
            OUTPUT_IDS,
            DType::I32,
            vec![
                Dim::Symbol(BATCH),
                Dim::Symbol(BEAM),
                Dim::Symbol(TOTAL_OUTPUT_LEN),
            ],
        ))
        .field(FieldSpec::required(
            SEQUENCE_LENGTH,
            DType::I32,
            vec![Dim::Symbol(BATCH), Dim::Symbol(BEAM)],
        ))
        .field(FieldSpec::required(
            OUTPUT_CUM_LOG_PROBS,
            DType::F32,
            vec![
                Dim::Symbol(REQUEST_OUTPUT_LEN),
                Dim::Symbol(BATCH),
                Dim::Symbol(BEAM),
            ],
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn base_request<'a>(
        output_seq_len: &'a [u32],
        scalars: &'a [f32; 3],
    ) -> TensorMap<'a> {
        TensorMap::new()
            .with(NamedTensor::host(
                keys::OUTPUT_SEQ_LEN,
                vec![output_seq_len.len()],
                TensorData::U32(output_seq_len),
            ))
            .with(NamedTensor::host(
                keys::TEMPERATURE,
                vec![1],
                TensorData::F32(&scalars[0..1]),
            ))
            .with(NamedTensor::host(
                keys::LEN_PENALTY,
                vec![1],
                TensorData::F32(&scalars[1..2]),
            ))
            .with(NamedTensor::host(
                keys::REPETITION_PENALTY,
                vec![1],
                TensorData::F32(&scalars[2..3]),
            ))
    }

    #[test]
    fn test_valid_sampling_request() {
        let seq = [8u32, 8];
        let scalars = [1.0f32, 1.0, 1.0];
        let ids = [1i32, 2, 3, 4];
        let lens = [2i32, 1];
        let seed = [7u64];
        let map = base_request(&seq, &scalars)
            .with(NamedTensor::host(keys::INPUT_IDS, vec![2, 2], TensorData::I32(&ids)))
            .with(NamedTensor::host(keys::INPUT_LENGTHS, vec![2], TensorData::I32(&lens)))
            .with(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seed)));
        let bindings = request_schema().validate(&map).unwrap();
        assert_eq!(bindings[dims::BATCH], 2);
        assert_eq!(bindings[dims::MAX_INPUT_LEN], 2);
    }

    #[test]
    fn test_missing_output_seq_len() {
        let scalars = [1.0f32];
        let seed = [0u64];
        let map = TensorMap::new()
            .with(NamedTensor::host(keys::TEMPERATURE, vec![1], TensorData::F32(&scalars)))
            .with(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seed)));
        let err = request_schema().validate(&map).unwrap_err();
        assert!(matches!(err, Error::MissingKey(ref k) if k == keys::OUTPUT_SEQ_LEN));
    }

    #[test]
    fn test_both_modes_rejected() {
        let seq = [4u32];
        let scalars = [1.0f32, 1.0, 1.0];
        let rate = [0.0f32];
        let seed = [0u64];
        let map = base_request(&seq, &scalars)
            .with(NamedTensor::host(
                keys::BEAM_SEARCH_DIVERSITY_RATE,
                vec![1],
                TensorData::F32(&rate),
            ))
            .with(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seed)));
        let err = request_schema().validate(&map).unwrap_err();
        assert!(matches!(err, Error::ConflictingDecodeMode(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_beam_with_top_k_rejected() {
        let seq = [4u32];
        let scalars = [1.0f32, 1.0, 1.0];
        let rate = [0.0f32];
        let k = [4i32];
        let map = base_request(&seq, &scalars)
            .with(NamedTensor::host(
                keys::BEAM_SEARCH_DIVERSITY_RATE,
                vec![1],
                TensorData::F32(&rate),
            ))
            .with(NamedTensor::host(keys::RUNTIME_TOP_K, vec![1], TensorData::I32(&k)));
        let err = request_schema().validate(&map).unwrap_err();
        assert!(matches!(err, Error::ConflictingDecodeMode(_)));
    }

    #[test]
    fn test_unpaired_input_ids() {
        let seq = [4u32];
        let scalars = [1.0f32, 1.0, 1.0];
        let ids = [1i32];
        let seed = [0u64];
        let map = base_request(&seq, &scalars)
            .with(NamedTensor::host(keys::INPUT_IDS, vec![1, 1], TensorData::I32(&ids)))
            .with(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seed)));
        let err = request_schema().validate(&map).unwrap_err();
        assert!(matches!(err, Error::MissingKey(ref k) if k == keys::INPUT_LENGTHS));
    }

    #[test]
    fn test_type_mismatch() {
        let seq = [4i32];
        let map = TensorMap::new().with(NamedTensor::host(
            keys::OUTPUT_SEQ_LEN,
            vec![1],
            TensorData::I32(&seq),
        ));
        let schema = Schema::new().field(FieldSpec::required(
            keys::OUTPUT_SEQ_LEN,
            DType::U32,
            vec![Dim::Symbol(dims::BATCH)],
        ));
        let err = schema.validate(&map).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: DType::U32,
                got: DType::I32,
                ..
            }
        ));
    }

    #[test]
    fn test_batch_symbol_must_agree() {
        let seq = [8u32, 8, 8];
        let scalars = [1.0f32, 1.0, 1.0];
        let ids = [1i32, 2, 3, 4];
        let lens = [2i32, 2];
        let seed = [0u64];
        let map = base_request(&seq, &scalars)
            .with(NamedTensor::host(keys::INPUT_IDS, vec![2, 2], TensorData::I32(&ids)))
            .with(NamedTensor::host(keys::INPUT_LENGTHS, vec![2], TensorData::I32(&lens)))
            .with(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seed)));
        let err = request_schema().validate(&map).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_payload_length_checked() {
        let ids = [1i32, 2, 3];
        let map = TensorMap::new().with(NamedTensor::host(
            keys::INPUT_IDS,
            vec![2, 2],
            TensorData::I32(&ids),
        ));
        let schema = Schema::new().field(FieldSpec::required(
            keys::INPUT_IDS,
            DType::I32,
            vec![Dim::Symbol(dims::BATCH), Dim::Symbol(dims::MAX_INPUT_LEN)],
        ));
        assert!(matches!(
            schema.validate(&map).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_response_with_prebound_dims() {
        let mut ids = vec![0i32; 2 * 3 * 5];
        let mut lens = vec![0i32; 2 * 3];
        let outputs = TensorMapMut::new()
            .with(NamedTensorMut::host(
                keys::OUTPUT_IDS,
                vec![2, 3, 5],
                TensorDataMut::I32(&mut ids),
            ))
            .with(NamedTensorMut::host(
                keys::SEQUENCE_LENGTH,
                vec![2, 3],
                TensorDataMut::I32(&mut lens),
            ))
            .with(NamedTensorMut::host(
                keys::OUTPUT_CUM_LOG_PROBS,
                vec![3, 2, 3],
                TensorDataMut::Unallocated(DType::F32),
            ));
        let mut bindings = Bindings::new();
        bindings.insert(dims::BATCH, 2);
        bindings.insert(dims::BEAM, 3);
        bindings.insert(dims::TOTAL_OUTPUT_LEN, 5);
        bindings.insert(dims::REQUEST_OUTPUT_LEN, 3);
        assert!(response_schema().validate_with(&outputs, bindings.clone()).is_ok());

        bindings.insert(dims::TOTAL_OUTPUT_LEN, 6);
        assert!(response_schema().validate_with(&outputs, bindings).is_err());
    }

    #[test]
    fn test_typed_access() {
        let temp = [0.7f32];
        let map = TensorMap::new().with(NamedTensor::host(
            keys::TEMPERATURE,
            vec![1],
            TensorData::F32(&temp),
        ));
        assert_eq!(map.scalar::<f32>(keys::TEMPERATURE).unwrap(), Some(0.7));
        assert_eq!(map.scalar::<f32>(keys::LEN_PENALTY).unwrap(), None);
        assert!(map.data::<i32>(keys::TEMPERATURE).is_err());
        assert_eq!(map.get(keys::TEMPERATURE).unwrap().size_in_bytes(), 4);
    }

    #[test]
    fn test_unallocated_output_skipped() {
        let mut outputs = TensorMapMut::new().with(NamedTensorMut::host(
            keys::OUTPUT_CUM_LOG_PROBS,
            vec![1, 1, 1],
            TensorDataMut::Unallocated(DType::F32),
        ));
        assert!(outputs
            .data_mut::<f32>(keys::OUTPUT_CUM_LOG_PROBS)
            .unwrap()
            .is_none());
        assert!(outputs.data_mut::<i32>(keys::OUTPUT_CUM_LOG_PROBS).is_err());
    }
}
