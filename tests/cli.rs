// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

fn mind_conv(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mind-conv"))
        .args(args)
        .env("MIND_NO_INSTRUMENT", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to spawn mind-conv")
}

const INSTRUMENT_VARS: [&str; 4] = [
    "MIND_NO_INSTRUMENT",
    "MIND_NO_INSTRUMENT_TIME",
    "MIND_NO_INSTRUMENT_MEMORY",
    "MIND_INSTRUMENT_FILE",
];

fn mind_conv_instrumented(args: &[&str], vars: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mind-conv"));
    cmd.args(args).env_remove("RUST_LOG");
    for name in INSTRUMENT_VARS {
        cmd.env_remove(name);
    }
    for (name, value) in vars {
        cmd.env(name, value);
    }
    cmd.output().expect("failed to spawn mind-conv")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn plan_prints_loop_nest() {
    let path = fixture("conv2d_grouped.toml");
    let output = mind_conv(&["plan", path.to_str().expect("utf8 path")]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.starts_with("conv @conv1 : f32 image[1x9x32x64] filter[6x3x6x7] bias[6] group 3 -> output[1x6x14x29]"));
    assert!(text.contains("for icg in [0, 3) {"));
    assert!(text.contains("acc += bias[g * 2 + ocg]"));
}

#[test]
fn plan_keeps_deferred_extents_symbolic() {
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv(&["plan", path.to_str().expect("utf8 path")]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("for n in [0, dim(image, 0)) {"));
    assert!(text.contains("pads SAME_UPPER"));
}

#[cfg(feature = "mlir-lowering")]
#[test]
fn mlir_subcommand_emits_module() {
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv(&["mlir", path.to_str().expect("utf8 path")]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.starts_with("module {"));
    assert!(text.contains("func.func @stem(%image: memref<?x3x?x?xf32>"));
    assert!(text.contains("memref.dim %image"));
}

#[test]
fn run_reports_output_shape() {
    let path = fixture("conv2d_deferred.toml");
    let path = path.to_str().expect("utf8 path");
    let parallel = mind_conv(&["run", path, "--image-shape", "2,3,9,10", "--seed", "4"]);
    let serial = mind_conv(&["run", path, "--image-shape", "2,3,9,10", "--seed", "4", "--serial"]);
    assert!(parallel.status.success(), "stderr: {}", String::from_utf8_lossy(&parallel.stderr));
    assert!(serial.status.success());
    assert!(stdout(&parallel).contains("output shape [2, 4, 5, 5]"));
    assert_eq!(stdout(&parallel), stdout(&serial));
}

#[test]
fn run_requires_shape_for_deferred_image() {
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv(&["run", path.to_str().expect("utf8 path")]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--image-shape"));
}

#[test]
fn unsupported_padding_fails_cleanly() {
    let path = fixture("conv1d_bad_pad.toml");
    let output = mind_conv(&["plan", path.to_str().expect("utf8 path")]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown auto_pad mode `REFLECT`"));
}

#[test]
fn conformance_subcommand_passes() {
    let output = mind_conv(&["conformance"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("conformance: ok"));
}

#[test]
fn instrument_file_receives_time_reports_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("reports.log");
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv_instrumented(
        &["run", path.to_str().expect("utf8 path"), "--image-shape", "1,3,8,8", "--instrument"],
        &[
            ("MIND_INSTRUMENT_FILE", report.to_str().expect("utf8 path")),
            ("MIND_NO_INSTRUMENT_MEMORY", "1"),
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(!stdout(&output).contains("==PERF-REPORT=="));

    let text = fs::read_to_string(&report).expect("report file");
    let perf: Vec<_> = text.lines().filter(|l| l.starts_with("==PERF-REPORT==")).collect();
    assert_eq!(perf.len(), 2, "{text}");
    assert!(perf[0].starts_with("==PERF-REPORT==, conv, stem, before, "));
    assert!(perf[1].starts_with("==PERF-REPORT==, conv, stem, after, "));
    assert!(!text.contains("==MEM-REPORT=="));
}

#[cfg(target_os = "linux")]
#[test]
fn time_reports_can_be_suppressed_from_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("mem.log");
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv_instrumented(
        &["run", path.to_str().expect("utf8 path"), "--image-shape", "1,3,8,8", "--instrument"],
        &[
            ("MIND_INSTRUMENT_FILE", report.to_str().expect("utf8 path")),
            ("MIND_NO_INSTRUMENT_TIME", "1"),
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let text = fs::read_to_string(&report).expect("report file");
    assert!(!text.contains("==PERF-REPORT=="));
    assert_eq!(text.lines().filter(|l| l.starts_with("==MEM-REPORT==")).count(), 2, "{text}");
}

#[test]
fn no_instrument_env_leaves_file_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("quiet.log");
    let path = fixture("conv2d_deferred.toml");
    let output = mind_conv_instrumented(
        &["run", path.to_str().expect("utf8 path"), "--image-shape", "1,3,8,8", "--instrument"],
        &[
            ("MIND_INSTRUMENT_FILE", report.to_str().expect("utf8 path")),
            ("MIND_NO_INSTRUMENT", "1"),
        ],
    );
    assert!(output.status.success());
    assert!(fs::read_to_string(&report).unwrap_or_default().is_empty());
    assert!(stdout(&output).contains("output shape [1, 4, 4, 4]"));
}
