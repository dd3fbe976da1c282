use super::indices::{IndicesHelper, VariableUsage};
use super::ScalarType;
use crate::program::DispatchGroup;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupSize {
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn total(&self) -> u32 {
        self.x * self.y * self.z
    }
}

/// Emits the boilerplate every generated module shares: bindings, per-variable index
/// helpers and the entry point header. Bound to the normalized dispatch so that the
/// flat workgroup index can be rebuilt from `workgroup_id`.
#[derive(Debug, Clone)]
pub struct ShaderHelper {
    dispatch: DispatchGroup,
}

impl ShaderHelper {
    pub fn new(dispatch: DispatchGroup) -> Self {
        Self { dispatch }
    }

    pub fn dispatch(&self) -> DispatchGroup {
        self.dispatch
    }

    /// Binding declarations for `variables`: inputs in the given order, then outputs,
    /// numbered from 0 in group 0. Index helpers for every variable follow.
    pub fn declare_variables(&self, variables: &[&IndicesHelper]) -> String {
        let mut out = String::new();
        if variables
            .iter()
            .any(|v| v.value_type() == ScalarType::F16)
        {
            out.push_str("enable f16;\n\n");
        }
        let ordered = variables
            .iter()
            .filter(|v| v.usage() == VariableUsage::Input)
            .chain(
                variables
                    .iter()
                    .filter(|v| v.usage() == VariableUsage::Output),
            );
        for (binding, var) in ordered.enumerate() {
            out.push_str(&var.declaration(binding as u32));
            out.push('\n');
        }
        out.push('\n');
        for var in variables {
            out.push_str(&var.impl_functions());
        }
        out
    }

    /// Entry point header up to and including `global_idx`. The caller closes the
    /// function body.
    pub fn main_start(&self, workgroup_size: WorkgroupSize) -> String {
        let [x, y, _] = self.dispatch.dims();
        let workgroup_index = match (self.dispatch.y, self.dispatch.z) {
            (None, None) => "workgroup_id.x".to_string(),
            (_, None) => format!("workgroup_id.y * {x}u + workgroup_id.x"),
            (_, Some(_)) => format!(
                "workgroup_id.z * {}u + workgroup_id.y * {x}u + workgroup_id.x",
                x * y
            ),
        };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "@compute @workgroup_size({}, {}, {})",
            workgroup_size.x, workgroup_size.y, workgroup_size.z
        );
        let _ = writeln!(
            out,
            "fn main(@builtin(local_invocation_index) local_idx: u32, @builtin(workgroup_id) workgroup_id: vec3<u32>) {{"
        );
        let _ = writeln!(out, "  let workgroup_index = {workgroup_index};");
        let _ = writeln!(
            out,
            "  let global_idx = workgroup_index * {}u + local_idx;",
            workgroup_size.total()
        );
        out
    }

    pub fn guard_against_out_of_bounds_workgroup_sizes(&self, size: u32) -> String {
        format!("  if (global_idx >= {size}u) {{ return; }}\n")
    }
}
