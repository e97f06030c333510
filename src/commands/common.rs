// src/commands/common.rs

use std::fs;
use std::path::Path;

use miette::NamedSource;

use crate::ast::module::File;
use crate::codegen::JitOptions;
use crate::frontend::parse_file;

/// Read and parse a source file. Returns the source text along with
/// the parse result so diagnostics can be rendered against it.
pub fn load_file(path: &Path) -> Result<(String, File), String> {
    let source = fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    let file = parse_file(&source);
    Ok((source, file))
}

/// Render every recorded parse diagnostic against the source.
pub fn render_diagnostics(path: &Path, source: &str, file: &File) {
    for error in &file.errors {
        let report = miette::Report::new(error.clone())
            .with_source_code(NamedSource::new(path.display().to_string(), source.to_string()));
        eprintln!("{:?}", report);
    }
}

pub fn jit_options(release: bool) -> JitOptions {
    JitOptions {
        release,
        ..JitOptions::default()
    }
}
