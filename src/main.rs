//! `mind-conv` command-line driver.
//!
//! Loads a convolution description from TOML and prints its loop nest, emits
//! MLIR, runs it on seeded data, or runs the built-in conformance suite.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::ArrayD;
use num_traits::ToPrimitive;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mind_conv::conformance::{run_conformance, seeded_tensor, ConformanceOptions, ConformanceProfile};
use mind_conv::exec::ConvInputs;
use mind_conv::instrument::InstrumentContext;
use mind_conv::ops::{load_conv_op, ConvOp};
use mind_conv::pipeline::{lower_conv, run_conv, InstrumentOptions, LowerOptions};
use mind_conv::runtime::HostRuntime;
use mind_conv::types::{DType, Element, ShapeDim};

/// Convolution lowering toolchain.
#[derive(Parser, Debug)]
#[command(name = "mind-conv")]
#[command(about = "Lower N-d convolutions to boundary-safe loop nests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the symbolic loop nest for an operator
    Plan {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Emit the loop nest as MLIR
    Mlir {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Run the operator on seeded random data
    Run {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Concrete image shape, e.g. `1,3,32,32`; defaults to the declared shape
        #[arg(long, value_delimiter = ',')]
        image_shape: Option<Vec<usize>>,

        /// Seed for generated operand data
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Run output planes on the calling thread
        #[arg(long)]
        serial: bool,

        /// Attach before/after instrumentation marks
        #[arg(long)]
        instrument: bool,
    },

    /// Run the built-in conformance suite
    Conformance {
        /// Include the larger cases
        #[arg(long)]
        full: bool,

        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match dispatch(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Plan { input } => {
            let op = load_conv_op(&input)?;
            let nest = lower_conv(&op, &LowerOptions::default())?;
            print!("{nest}");
        }
        Commands::Mlir { input } => emit_mlir(&load_conv_op(&input)?)?,
        Commands::Run {
            input,
            image_shape,
            seed,
            serial,
            instrument,
        } => {
            let op = load_conv_op(&input)?;
            let shape = match image_shape {
                Some(shape) => shape,
                None => op
                    .image
                    .shape
                    .iter()
                    .map(ShapeDim::known)
                    .collect::<Option<Vec<_>>>()
                    .context("image has unknown axes; pass --image-shape")?,
            };
            let opts = LowerOptions {
                parallel: !serial,
                instrument: if instrument {
                    InstrumentOptions::all()
                } else {
                    InstrumentOptions::default()
                },
                ..LowerOptions::default()
            };
            match op.dtype {
                DType::F32 => run_seeded::<f32>(&op, &opts, &shape, seed)?,
                DType::F64 => run_seeded::<f64>(&op, &opts, &shape, seed)?,
            }
        }
        Commands::Conformance { full, seed } => {
            let profile = if full {
                ConformanceProfile::Full
            } else {
                ConformanceProfile::Quick
            };
            if let Err(failure) = run_conformance(ConformanceOptions { profile, seed }) {
                for line in &failure.0 {
                    eprintln!("FAIL {line}");
                }
                bail!("{} conformance case(s) failed", failure.0.len());
            }
            println!("conformance: ok");
        }
    }
    Ok(())
}

#[cfg(feature = "mlir-lowering")]
fn emit_mlir(op: &ConvOp) -> Result<()> {
    let text = mind_conv::pipeline::lower_conv_to_mlir(op, &LowerOptions::default())?;
    print!("{text}");
    Ok(())
}

#[cfg(not(feature = "mlir-lowering"))]
fn emit_mlir(_op: &ConvOp) -> Result<()> {
    bail!("MLIR emission requires the `mlir-lowering` feature")
}

fn run_seeded<T: Element>(op: &ConvOp, opts: &LowerOptions, image_shape: &[usize], seed: u64) -> Result<()> {
    let known = |what: &str, shape: &[ShapeDim]| {
        shape
            .iter()
            .map(ShapeDim::known)
            .collect::<Option<Vec<_>>>()
            .with_context(|| format!("{what} shape must be fully known"))
    };
    let image = seeded_tensor::<T>(image_shape, seed);
    let filter = seeded_tensor::<T>(&known("filter", &op.filter.shape)?, seed.wrapping_add(1));
    let bias: Option<ArrayD<T>> = match &op.bias {
        Some(decl) => Some(seeded_tensor::<T>(&known("bias", &decl.shape)?, seed.wrapping_add(2))),
        None => None,
    };

    let mut inputs = ConvInputs::new(image.view(), filter.view());
    if let Some(bias) = &bias {
        inputs = inputs.with_bias(bias.view());
    }

    let nest = lower_conv(op, opts)?;
    let ctx = InstrumentContext::from_env();
    let output = run_conv(&nest, &inputs, &HostRuntime::default(), &ctx)?;
    let marks = ctx.finish();

    let sum = output.iter().fold(0.0f64, |acc, v| acc + v.to_f64().unwrap_or(f64::NAN));
    info!(op = %op.name, marks, "run complete");
    println!("output shape {:?}", output.shape());
    println!("checksum {sum:.6}");
    Ok(())
}
