// src/commands/test.rs
//
// Drives the assert_eq assertions that follow modules in a source
// file: each invokes an export with constant arguments and compares
// the result against a constant.

use std::path::Path;
use std::process::ExitCode;

use crate::ast::expr::Literal;
use crate::runtime::Instance;

use super::common::{jit_options, load_file, render_diagnostics};

pub fn test_file(path: &Path, release: bool) -> ExitCode {
    match execute(path, release) {
        Ok((passed, 0)) => {
            println!("{} assertion(s) passed", passed);
            ExitCode::SUCCESS
        }
        Ok((passed, failed)) => {
            println!("{} assertion(s) passed, {} failed", passed, failed);
            ExitCode::FAILURE
        }
        Err(e) => {
            if !e.is_empty() {
                eprintln!("error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn execute(path: &Path, release: bool) -> Result<(usize, usize), String> {
    let (source, file) = load_file(path)?;
    if !file.errors.is_empty() {
        render_diagnostics(path, &source, &file);
        return Err(String::new());
    }

    let options = jit_options(release);
    let instances: Vec<Instance> = file
        .modules
        .into_iter()
        .map(|module| Instance::instantiate(module, &options))
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;

    let mut passed = 0;
    let mut failed = 0;
    for assertion in &file.assert_eqs {
        let instance = &instances[assertion.module_index];
        match instance.invoke_function(assertion.function_index, &assertion.args) {
            Ok(Some(actual)) if literal_eq(actual, assertion.expected) => passed += 1,
            Ok(actual) => {
                failed += 1;
                eprintln!(
                    "{}:{}: assertion failed: expected {:?}, got {:?}",
                    path.display(),
                    assertion.locus,
                    assertion.expected,
                    actual
                );
            }
            Err(e) => {
                failed += 1;
                eprintln!(
                    "{}:{}: assertion trapped: {}",
                    path.display(),
                    assertion.locus,
                    e
                );
            }
        }
    }
    Ok((passed, failed))
}

/// Bit-exact comparison, so a NaN expectation can still match.
fn literal_eq(left: Literal, right: Literal) -> bool {
    match (left, right) {
        (Literal::F32(a), Literal::F32(b)) => a.to_bits() == b.to_bits(),
        (Literal::F64(a), Literal::F64(b)) => a.to_bits() == b.to_bits(),
        _ => left == right,
    }
}
