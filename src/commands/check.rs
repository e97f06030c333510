// src/commands/check.rs

use std::path::Path;
use std::process::ExitCode;

use crate::runtime::Instance;

use super::common::{jit_options, load_file, render_diagnostics};

/// Parse and compile every module in a file without invoking anything.
pub fn check_file(path: &Path, release: bool) -> ExitCode {
    let (source, file) = match load_file(path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !file.errors.is_empty() {
        render_diagnostics(path, &source, &file);
        eprintln!("{}: {} error(s)", path.display(), file.errors.len());
        return ExitCode::FAILURE;
    }

    let options = jit_options(release);
    for module in file.modules {
        if let Err(e) = Instance::instantiate(module, &options) {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    println!("{}: ok", path.display());
    ExitCode::SUCCESS
}
