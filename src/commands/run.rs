// src/commands/run.rs

use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use tracing::info;

use crate::ast::expr::Literal;
use crate::runtime::Instance;

use super::common::{jit_options, load_file, render_diagnostics};

/// Compile a module file and invoke the named export with no
/// arguments. The return value prints as an unsigned 32-bit integer.
pub fn run_file(path: &Path, function_name: &str, release: bool) -> ExitCode {
    match execute(path, function_name, release) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.is_empty() {
                eprintln!("error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn execute(path: &Path, function_name: &str, release: bool) -> Result<(), String> {
    let (source, file) = load_file(path)?;
    if !file.errors.is_empty() {
        render_diagnostics(path, &source, &file);
        return Err(String::new());
    }
    let Some(module) = file.modules.into_iter().next() else {
        return Err("file contains no module".to_string());
    };

    info!(
        arena_kb = module.arena.total_allocated_bytes() / 1024,
        "loaded module"
    );

    let instance =
        Instance::instantiate(module, &jit_options(release)).map_err(|e| e.to_string())?;

    let start = Instant::now();
    let result = instance
        .invoke(function_name, &[])
        .map_err(|e| e.to_string())?;
    let elapsed = start.elapsed();

    println!("Program returned: {}", return_code(result));
    println!("Execution time: {:.3}ms", elapsed.as_secs_f64() * 1e3);
    Ok(())
}

/// The exported function's result as an unsigned 32-bit integer.
fn return_code(result: Option<Literal>) -> u32 {
    match result {
        None => 0,
        Some(Literal::I8(v)) => v as u32,
        Some(Literal::I16(v)) => v as u32,
        Some(Literal::I32(v)) => v,
        Some(Literal::I64(v)) => v as u32,
        Some(Literal::F32(v)) => v.to_bits(),
        Some(Literal::F64(v)) => v.to_bits() as u32,
        Some(Literal::Bool(v)) => v as u32,
    }
}
