//! opforge - inspect generated WGSL kernels
//!
//! Builds a convolution or softmax program from shapes and attributes given on the
//! command line, prints its WGSL and dispatch metadata, and optionally evaluates it
//! on the host reference executor.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use opforge::cache::{load_program, ProgramCache};
use opforge::{
    ComputeContext, GeneratorOptions, HostExecutor, Operator, ProgramArtifact, ProgramInfoLoader,
};
use opforge_api::{
    ConvAttributes, DataType, RawConvAttributes, SoftmaxAttributes, TensorHandle, TensorView,
};
use opforge_logging::{init_logging, LoggingOptions};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "opforge",
    version = env!("CARGO_PKG_VERSION"),
    about = "Generate and inspect WGSL kernels for tensor operators"
)]
struct Cli {
    /// Write each generated program to this directory as <hash>.wgsl + <hash>.json
    #[arg(long, global = true, env = "OPFORGE_SHADER_DUMP_DIR")]
    dump_dir: Option<PathBuf>,

    /// Per-dimension workgroup limit used when folding large dispatches
    #[arg(long, global = true, env = "OPFORGE_MAX_DISPATCH", default_value_t = 65_535)]
    max_dispatch: u32,

    /// What to print
    #[arg(long, global = true, value_enum, default_value_t = Emit::Both)]
    emit: Emit,

    /// Evaluate the program on the host executor with generated input data
    #[arg(long, global = true)]
    execute: bool,

    /// Enable debug logging (overridden by OPFORGE_LOG / RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Emit {
    Wgsl,
    Json,
    Both,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Dtype {
    F32,
    F16,
}

impl From<Dtype> for DataType {
    fn from(value: Dtype) -> Self {
        match value {
            Dtype::F32 => DataType::Float32,
            Dtype::F16 => DataType::Float16,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Grouped 1-D or 2-D convolution
    Conv {
        /// Input shape, e.g. 1,3,32,32
        #[arg(long, value_delimiter = ',', required = true)]
        x: Vec<usize>,
        /// Weight shape [out_channels, in_channels/group, k...]
        #[arg(long, value_delimiter = ',', required = true)]
        w: Vec<usize>,
        /// Add a bias operand of length out_channels
        #[arg(long)]
        bias: bool,
        #[arg(long, default_value_t = 1)]
        group: i64,
        #[arg(long, value_delimiter = ',')]
        strides: Vec<i64>,
        #[arg(long, value_delimiter = ',')]
        pads: Vec<i64>,
        #[arg(long, value_delimiter = ',')]
        dilations: Vec<i64>,
        /// NOTSET, VALID, SAME_UPPER or SAME_LOWER
        #[arg(long, default_value = "NOTSET")]
        auto_pad: String,
        /// NCHW or NHWC
        #[arg(long, default_value = "NCHW")]
        format: String,
        /// Relu, Sigmoid, Clip, LeakyRelu or HardSigmoid
        #[arg(long, default_value = "")]
        activation: String,
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        activation_params: Vec<f32>,
        #[arg(long, value_enum, default_value_t = Dtype::F32)]
        dtype: Dtype,
    },
    /// Softmax over the last axis
    Softmax {
        /// Input shape, e.g. 4,128
        #[arg(long, value_delimiter = ',', required = true)]
        dims: Vec<usize>,
        #[arg(long, default_value_t = SoftmaxAttributes::DEFAULT_AXIS, allow_negative_numbers = true)]
        axis: i64,
        #[arg(long, value_enum, default_value_t = Dtype::F32)]
        dtype: Dtype,
    },
}

/// Context that generates programs without running them.
struct GenerateOnly<'a> {
    options: &'a GeneratorOptions,
    cache: &'a ProgramCache<Arc<ProgramArtifact>>,
    inputs: Vec<TensorView>,
    programs: Vec<Arc<ProgramArtifact>>,
}

impl ComputeContext for GenerateOnly<'_> {
    fn inputs(&self) -> &[TensorView] {
        &self.inputs
    }

    fn compute(&mut self, loader: ProgramInfoLoader) -> opforge::Result<Vec<TensorView>> {
        let artifact = load_program(self.cache, self.options, &loader, Ok)?;
        let views = artifact
            .info
            .outputs
            .iter()
            .enumerate()
            .map(|(i, o)| TensorView::new(o.dims.clone(), o.data_type, TensorHandle(i as u64)))
            .collect();
        self.programs.push(artifact);
        Ok(views)
    }
}

/// Deterministic sample values in [-3, 3].
fn sample_data(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 7) as f32 - 3.0).collect()
}

fn build_operator(command: &Commands) -> Result<(Operator, Vec<(Vec<usize>, DataType)>)> {
    match command {
        Commands::Conv {
            x,
            w,
            bias,
            group,
            strides,
            pads,
            dilations,
            auto_pad,
            format,
            activation,
            activation_params,
            dtype,
        } => {
            let raw = RawConvAttributes {
                auto_pad: auto_pad.clone(),
                dilations: dilations.clone(),
                format: format.clone(),
                group: Some(*group),
                kernel_shape: Vec::new(),
                pads: pads.clone(),
                strides: strides.clone(),
                activation: activation.clone(),
                activation_params: activation_params.clone(),
            };
            let attributes =
                ConvAttributes::parse(&raw).context("invalid convolution attributes")?;
            if !attributes.activation().is_none() {
                debug!("fused activation: {}", attributes.activation().cache_key());
            }
            let dt = DataType::from(*dtype);
            let mut operands = vec![(x.clone(), dt), (w.clone(), dt)];
            if *bias {
                let Some(&out_channels) = w.first() else {
                    bail!("--bias needs a non-empty weight shape");
                };
                operands.push((vec![out_channels], dt));
            }
            Ok((Operator::Conv(attributes), operands))
        }
        Commands::Softmax { dims, axis, dtype } => Ok((
            Operator::Softmax(SoftmaxAttributes::new(*axis)),
            vec![(dims.clone(), DataType::from(*dtype))],
        )),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logging = init_logging(LoggingOptions {
        default_filter: if cli.debug { "debug" } else { "warn" }.to_string(),
        ..LoggingOptions::default()
    });

    let options = GeneratorOptions {
        cache_enabled: true,
        dump_dir: cli.dump_dir.clone(),
        max_dispatch_workgroups: cli.max_dispatch,
    };
    let (operator, operands) = build_operator(&cli.command)?;
    info!("generating {} for {} operands", operator.name(), operands.len());

    let cache = ProgramCache::new(true);
    let mut context = GenerateOnly {
        options: &options,
        cache: &cache,
        inputs: operands
            .iter()
            .enumerate()
            .map(|(i, (dims, dt))| TensorView::new(dims.clone(), *dt, TensorHandle(i as u64)))
            .collect(),
        programs: Vec::new(),
    };
    operator
        .run(&mut context)
        .with_context(|| format!("failed to generate {}", operator.name()))?;

    let mut summary: Vec<Value> = context
        .programs
        .iter()
        .map(|p| {
            json!({
                "name": p.name(),
                "key": p.key.to_string(),
                "key_hash": format!("{:016x}", p.key_hash),
                "workgroup_size": p.workgroup_size(),
                "dispatch": p.dispatch,
                "outputs": p.info.outputs,
            })
        })
        .collect();

    if cli.execute {
        let mut executor = HostExecutor::with_options(options.clone());
        let mut inputs = Vec::with_capacity(operands.len());
        for (dims, dt) in &operands {
            let len = dims.iter().product();
            inputs.push(executor.upload(dims, *dt, &sample_data(len))?);
        }
        let outputs = executor
            .run(&operator, &inputs)
            .with_context(|| format!("failed to execute {}", operator.name()))?;
        let mut values = Vec::with_capacity(outputs.len());
        for view in &outputs {
            values.push(executor.download(view)?);
        }
        if let Some(Value::Object(first)) = summary.first_mut() {
            first.insert("values".to_string(), json!(values));
        }
    }

    if matches!(cli.emit, Emit::Wgsl | Emit::Both) {
        for program in &context.programs {
            println!("// {} {:016x}", program.name(), program.key_hash);
            println!("{}", program.shader_source);
        }
    }
    if matches!(cli.emit, Emit::Json | Emit::Both) {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_api::Activation;

    #[test]
    fn conv_arguments_parse_into_attributes() {
        let cli = Cli::try_parse_from([
            "opforge", "conv", "--x", "1,2,8,8", "--w", "4,1,3,3", "--group", "2", "--pads",
            "1,1,1,1", "--bias", "--activation", "Clip", "--activation-params", "-1,1",
        ])
        .unwrap();
        let (operator, operands) = build_operator(&cli.command).unwrap();
        let Operator::Conv(attributes) = operator else {
            panic!("expected conv");
        };
        assert_eq!(attributes.group(), 2);
        assert_eq!(attributes.pads(), &[1, 1, 1, 1]);
        assert_eq!(
            *attributes.activation(),
            Activation::Clip { min: -1.0, max: 1.0 }
        );
        assert_eq!(operands.len(), 3);
        assert_eq!(operands[2].0, vec![4]);
    }

    #[test]
    fn softmax_generation_produces_one_program() {
        let cli = Cli::try_parse_from(["opforge", "softmax", "--dims", "2,5"]).unwrap();
        let (operator, operands) = build_operator(&cli.command).unwrap();
        let options = GeneratorOptions::default();
        let cache = ProgramCache::new(true);
        let mut context = GenerateOnly {
            options: &options,
            cache: &cache,
            inputs: vec![TensorView::new(operands[0].0.clone(), operands[0].1, TensorHandle(0))],
            programs: Vec::new(),
        };
        operator.run(&mut context).unwrap();
        assert_eq!(context.programs.len(), 1);
        assert_eq!(context.programs[0].name(), "Softmax");
    }
}
