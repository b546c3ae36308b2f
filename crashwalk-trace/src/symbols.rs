// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Address-to-symbol resolution.

use std::collections::HashMap;
use std::path::Path;

use crashwalk::ModuleMap;
use tracing::debug;

use crate::sym_file::{SymbolError, SymbolFile};

/// What symbolication knows about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSymbol {
    /// The name of the module containing the address.
    pub module: Option<String>,
    /// The module's load address.
    pub module_base: Option<u64>,
    /// The function name, if debug symbols cover the address.
    pub function: Option<String>,
    /// The function's start address.
    pub function_base: Option<u64>,
    /// The source file that produced the instruction.
    pub source_file: Option<String>,
    /// The (1-based) line number in `source_file`.
    pub source_line: Option<u32>,
}

/// Resolve an address to module/function/source information.
///
/// Implementations are consulted once per collected frame by the trace
/// formatter; returning `None` degrades that frame's line to a raw address,
/// it never aborts the trace.
pub trait SymbolProvider {
    fn resolve(&self, address: u64) -> Option<FrameSymbol>;
}

/// A provider with no information at all; every frame falls back to its raw
/// address.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolProvider for NoSymbols {
    fn resolve(&self, _address: u64) -> Option<FrameSymbol> {
        None
    }
}

/// Chains several providers, taking the first answer.
#[derive(Default)]
pub struct MultiSymbolProvider {
    providers: Vec<Box<dyn SymbolProvider>>,
}

impl MultiSymbolProvider {
    pub fn new() -> MultiSymbolProvider {
        Default::default()
    }

    pub fn add(&mut self, provider: Box<dyn SymbolProvider>) {
        self.providers.push(provider);
    }
}

impl SymbolProvider for MultiSymbolProvider {
    fn resolve(&self, address: u64) -> Option<FrameSymbol> {
        self.providers.iter().find_map(|p| p.resolve(address))
    }
}

/// The standard provider: a module map plus per-module Breakpad symbol
/// files.
///
/// An address resolves to its module by range lookup; if a [`SymbolFile`]
/// was registered for that module, the module-relative address is further
/// resolved to a function and source line, settling for a `PUBLIC` symbol
/// when no `FUNC` record covers it. An address outside every known module
/// resolves to nothing.
pub struct Symbolizer {
    modules: ModuleMap,
    files: HashMap<String, SymbolFile>,
}

impl Symbolizer {
    pub fn new(modules: ModuleMap) -> Symbolizer {
        Symbolizer {
            modules,
            files: HashMap::new(),
        }
    }

    /// Register a parsed symbol file for the module named `module_name`
    /// (as reported by the module map's `code_file`).
    pub fn add_symbol_file<S: Into<String>>(&mut self, module_name: S, file: SymbolFile) {
        self.files.insert(module_name.into(), file);
    }

    /// Load a symbol file from disk for `module_name`.
    pub fn load_symbol_file<S: Into<String>, P: AsRef<Path>>(
        &mut self,
        module_name: S,
        path: P,
    ) -> Result<(), SymbolError> {
        let file = SymbolFile::from_file(path)?;
        self.add_symbol_file(module_name, file);
        Ok(())
    }
}

impl SymbolProvider for Symbolizer {
    fn resolve(&self, address: u64) -> Option<FrameSymbol> {
        let module = self.modules.module_at_address(address)?;
        let mut symbol = FrameSymbol {
            module: Some(basename(module.code_file()).to_string()),
            module_base: Some(module.base_address()),
            ..FrameSymbol::default()
        };

        let sym_file = match self.files.get(module.code_file()) {
            Some(f) => f,
            None => {
                debug!("no symbol file for {}", module.code_file());
                return Some(symbol);
            }
        };

        let rel = address - module.base_address();
        if let Some(func) = sym_file.functions.get(rel) {
            symbol.function = Some(func.name.clone());
            symbol.function_base = Some(func.address + module.base_address());
            if let Some(line) = func.lines.get(rel) {
                if let Some(file) = sym_file.files.get(&line.file) {
                    symbol.source_file = Some(file.clone());
                    symbol.source_line = Some(line.line);
                }
            }
        } else if let Some(public) = sym_file.find_nearest_public(rel) {
            // Settle for a PUBLIC.
            symbol.function = Some(public.name.clone());
            symbol.function_base = Some(public.address + module.base_address());
        }
        Some(symbol)
    }
}

/// The file-name portion of a path, for either kind of separator.
pub(crate) fn basename(path: &str) -> &str {
    match path.rfind(|c| c == '/' || c == '\\') {
        None => path,
        Some(index) => &path[(index + 1)..],
    }
}
