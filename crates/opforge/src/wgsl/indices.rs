use super::{to_u32, ScalarType};
use crate::error::Result;
use crate::shape;
use opforge_api::DataType;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableUsage {
    Input,
    Output,
}

/// A tensor binding in a generated shader plus the index helpers that go with it.
///
/// For a variable `x` of rank `r` the module gets `o2i_x` (flat offset to
/// coordinates), `i2o_x` (coordinates to flat offset) and `get_x(d0, .., dr-1)`,
/// all row-major over the dims given at construction and consistent with
/// [`shape::offset_to_indices`] / [`shape::indices_to_offset`]. Rank-0 tensors are
/// treated as `[1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicesHelper {
    name: String,
    usage: VariableUsage,
    ty: ScalarType,
    dims: Vec<u32>,
    strides: Vec<u32>,
}

impl IndicesHelper {
    pub fn input(name: &str, data_type: DataType, dims: &[usize]) -> Result<Self> {
        Self::new(name, VariableUsage::Input, data_type, dims)
    }

    pub fn output(name: &str, data_type: DataType, dims: &[usize]) -> Result<Self> {
        Self::new(name, VariableUsage::Output, data_type, dims)
    }

    fn new(name: &str, usage: VariableUsage, data_type: DataType, dims: &[usize]) -> Result<Self> {
        debug_assert!(
            name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "invalid WGSL identifier {name}"
        );
        let dims: Vec<usize> = if dims.is_empty() {
            vec![1]
        } else {
            dims.to_vec()
        };
        // Every offset must be addressable as u32.
        let total = shape::checked_size(&dims).unwrap_or(usize::MAX);
        to_u32("tensor size", total)?;
        let strides = shape::compute_strides(&dims)
            .into_iter()
            .map(|s| to_u32("stride", s))
            .collect::<Result<Vec<_>>>()?;
        let dims = dims
            .into_iter()
            .map(|d| to_u32("dim", d))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            usage,
            ty: ScalarType::from_data_type(data_type)?,
            dims,
            strides,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> VariableUsage {
        self.usage
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn value_type(&self) -> ScalarType {
        self.ty
    }

    /// WGSL type holding one coordinate tuple of this variable.
    pub fn indices_type(&self) -> String {
        match self.rank() {
            1 => "u32".to_string(),
            r @ 2..=4 => format!("vec{r}<u32>"),
            r => format!("array<u32, {r}>"),
        }
    }

    /// Expression decoding `offset` into coordinates.
    pub fn offset_to_indices(&self, offset: &str) -> String {
        format!("o2i_{}({offset})", self.name)
    }

    /// Expression encoding a coordinate tuple into a flat offset.
    pub fn indices_to_offset(&self, indices: &str) -> String {
        format!("i2o_{}({indices})", self.name)
    }

    /// Expression reading the element at the given per-axis coordinates.
    pub fn get(&self, indices: &[&str]) -> String {
        debug_assert_eq!(indices.len(), self.rank(), "rank mismatch for {}", self.name);
        format!("get_{}({})", self.name, indices.join(", "))
    }

    pub fn get_by_offset(&self, offset: &str) -> String {
        format!("{}[{offset}]", self.name)
    }

    /// Statement storing `value` at `offset`.
    pub fn set_by_offset(&self, offset: &str, value: &str) -> String {
        format!("{}[{offset}] = {value};", self.name)
    }

    pub(crate) fn declaration(&self, binding: u32) -> String {
        let access = match self.usage {
            VariableUsage::Input => "read",
            VariableUsage::Output => "read_write",
        };
        format!(
            "@group(0) @binding({binding}) var<storage, {access}> {}: array<{}>;",
            self.name,
            self.ty.as_str()
        )
    }

    pub(crate) fn impl_functions(&self) -> String {
        let name = &self.name;
        let it = self.indices_type();
        let rank = self.rank();
        let mut out = String::new();

        if rank == 1 {
            let _ = writeln!(out, "fn o2i_{name}(offset: u32) -> u32 {{ return offset; }}");
            let _ = writeln!(out, "fn i2o_{name}(indices: u32) -> u32 {{ return indices; }}");
        } else {
            let _ = writeln!(out, "fn o2i_{name}(offset: u32) -> {it} {{");
            let _ = writeln!(out, "  var indices: {it};");
            let _ = writeln!(out, "  var current = offset;");
            for axis in (1..rank).rev() {
                let dim = self.dims[axis];
                let _ = writeln!(out, "  let q{axis} = current / {dim}u;");
                let _ = writeln!(out, "  indices[{axis}] = current - q{axis} * {dim}u;");
                let _ = writeln!(out, "  current = q{axis};");
            }
            let _ = writeln!(out, "  indices[0] = current;");
            let _ = writeln!(out, "  return indices;");
            let _ = writeln!(out, "}}");

            let terms: Vec<String> = (0..rank)
                .map(|axis| self.offset_term(&format!("indices[{axis}]"), axis))
                .collect();
            let _ = writeln!(
                out,
                "fn i2o_{name}(indices: {it}) -> u32 {{ return {}; }}",
                terms.join(" + ")
            );
        }

        let params: Vec<String> = (0..rank).map(|axis| format!("d{axis}: u32")).collect();
        let terms: Vec<String> = (0..rank)
            .map(|axis| self.offset_term(&format!("d{axis}"), axis))
            .collect();
        let _ = writeln!(
            out,
            "fn get_{name}({}) -> {} {{ return {name}[{}]; }}",
            params.join(", "),
            self.ty.as_str(),
            terms.join(" + ")
        );
        out
    }

    fn offset_term(&self, index: &str, axis: usize) -> String {
        match self.strides[axis] {
            1 => index.to_string(),
            stride => format!("{index} * {stride}u"),
        }
    }
}
