// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Breakpad-format symbol files.
//!
//! A `.sym` file is a line-oriented text dump of a module's debug info:
//! `MODULE`/`FILE`/`FUNC`/`PUBLIC` records plus bare line records attaching
//! source lines to the preceding `FUNC`. Only the records needed to turn an
//! address into a (function, file, line) triple are kept; `STACK` and
//! `INFO` records are skipped.

use std::collections::HashMap;
use std::path::Path;

use nom::bytes::complete::tag;
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::combinator::{map, map_res, opt, rest};
use nom::sequence::{terminated, tuple};
use nom::IResult;
use range_map::{Range, RangeMap};
use tracing::warn;

/// Errors encountered while loading a symbol file.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("failed to read symbol file")]
    Io(#[from] std::io::Error),
    #[error("malformed {record} record at line {line}")]
    Parse { record: &'static str, line: usize },
    #[error("line record at line {line} appears before any FUNC record")]
    OrphanLineRecord { line: usize },
}

/// A publicly visible linker symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the module's load address.
    pub address: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the symbol.
    pub name: String,
}

/// A mapping from machine code bytes to source line and file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range of instructions in bytes.
    pub size: u32,
    /// The source file that generated this machine code, as an index into
    /// [`SymbolFile::files`].
    pub file: u32,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
}

/// A source-language function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// The function's start address relative to the module's load address.
    pub address: u64,
    /// The size of the function in bytes.
    pub size: u32,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the function as declared in the source.
    pub name: String,
    /// Source line information for this function.
    pub lines: RangeMap<u64, SourceLine>,
}

impl Function {
    fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.address,
            self.address.checked_add(self.size as u64)?.checked_sub(1)?,
        ))
    }
}

/// A parsed symbol file for one module.
#[derive(Debug)]
pub struct SymbolFile {
    /// The module name from the `MODULE` record, if one was present.
    pub module_name: Option<String>,
    /// The debug identifier from the `MODULE` record, if one was present.
    pub debug_id: Option<String>,
    /// The set of source files involved in compilation.
    pub files: HashMap<u32, String>,
    /// Functions, indexed by the address range they cover.
    pub functions: RangeMap<u64, Function>,
    /// Publicly visible symbols, sorted by address.
    pub publics: Vec<PublicSymbol>,
}

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16))(input)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s: &str| u32::from_str_radix(s, 16))(input)
}

fn dec_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

// FILE <number> <name>
fn file_record(input: &str) -> IResult<&str, (u32, String)> {
    map(
        tuple((terminated(tag("FILE"), space1), terminated(dec_u32, space1), rest)),
        |(_, number, name): (_, u32, &str)| (number, name.to_string()),
    )(input)
}

// FUNC [m] <address> <size> <parameter_size> <name>
fn func_record(input: &str) -> IResult<&str, Function> {
    map(
        tuple((
            terminated(tag("FUNC"), space1),
            opt(terminated(tag("m"), space1)),
            terminated(hex_u64, space1),
            terminated(hex_u32, space1),
            terminated(hex_u32, space1),
            rest,
        )),
        |(_, _, address, size, parameter_size, name): (_, _, u64, u32, u32, &str)| Function {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            lines: RangeMap::new(),
        },
    )(input)
}

// PUBLIC [m] <address> <parameter_size> <name>
fn public_record(input: &str) -> IResult<&str, PublicSymbol> {
    map(
        tuple((
            terminated(tag("PUBLIC"), space1),
            opt(terminated(tag("m"), space1)),
            terminated(hex_u64, space1),
            terminated(hex_u32, space1),
            rest,
        )),
        |(_, _, address, parameter_size, name): (_, _, u64, u32, &str)| PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
        },
    )(input)
}

// MODULE <os> <cpu> <debug_id> <name>
fn module_record(input: &str) -> IResult<&str, (String, String)> {
    map(
        tuple((
            terminated(tag("MODULE"), space1),
            terminated(token, space1),
            terminated(token, space1),
            terminated(token, space1),
            rest,
        )),
        |(_, _os, _cpu, debug_id, name): (_, &str, &str, &str, &str)| {
            (debug_id.to_string(), name.to_string())
        },
    )(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    nom::bytes::complete::take_while1(|c: char| !c.is_whitespace())(input)
}

// <address> <size> <line> <file_number>
fn line_record(input: &str) -> IResult<&str, SourceLine> {
    map(
        tuple((
            terminated(hex_u64, space1),
            terminated(hex_u32, space1),
            terminated(dec_u32, space1),
            dec_u32,
        )),
        |(address, size, line, file)| SourceLine {
            address,
            size,
            file,
            line,
        },
    )(input)
}

/// Parse a whole record, requiring the parser to consume the full line.
fn parse_line<'a, T>(
    parser: impl Fn(&'a str) -> IResult<&'a str, T>,
    input: &'a str,
) -> Option<T> {
    match parser(input) {
        Ok(("", value)) => Some(value),
        _ => None,
    }
}

/// Sort ranged entries and drop any that overlap an earlier one; an address
/// can only resolve to one thing.
fn into_rangemap_safe<V: Clone + std::fmt::Debug + Eq>(
    mut entries: Vec<(Range<u64>, V)>,
    what: &str,
) -> RangeMap<u64, V> {
    entries.sort_by_key(|&(range, _)| range);
    let mut vec: Vec<(Range<u64>, V)> = Vec::with_capacity(entries.len());
    for (range, value) in entries {
        if let Some(&(last_range, _)) = vec.last() {
            if range.start <= last_range.end {
                warn!("dropping overlapping {} record at {:#x}", what, range.start);
                continue;
            }
        }
        vec.push((range, value));
    }
    vec.into_iter().collect()
}

impl SymbolFile {
    /// Parse a symbol file from text.
    pub fn parse(text: &str) -> Result<SymbolFile, SymbolError> {
        let mut module_name = None;
        let mut debug_id = None;
        let mut files = HashMap::new();
        let mut publics = Vec::new();
        // Functions under construction: line records attach to the most
        // recent FUNC.
        let mut functions: Vec<(Function, Vec<SourceLine>)> = Vec::new();

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            if line.starts_with("MODULE") {
                let (id, name) = parse_line(module_record, line).ok_or(SymbolError::Parse {
                    record: "MODULE",
                    line: line_no,
                })?;
                debug_id = Some(id);
                module_name = Some(name);
            } else if line.starts_with("FILE") {
                let (number, name) = parse_line(file_record, line).ok_or(SymbolError::Parse {
                    record: "FILE",
                    line: line_no,
                })?;
                files.insert(number, name);
            } else if line.starts_with("FUNC") {
                let func = parse_line(func_record, line).ok_or(SymbolError::Parse {
                    record: "FUNC",
                    line: line_no,
                })?;
                functions.push((func, Vec::new()));
            } else if line.starts_with("PUBLIC") {
                let public = parse_line(public_record, line).ok_or(SymbolError::Parse {
                    record: "PUBLIC",
                    line: line_no,
                })?;
                publics.push(public);
            } else if line.starts_with("INFO") || line.starts_with("STACK") {
                // Not needed for symbolication.
                continue;
            } else {
                let source_line = parse_line(line_record, line).ok_or(SymbolError::Parse {
                    record: "line",
                    line: line_no,
                })?;
                match functions.last_mut() {
                    Some((_, lines)) => lines.push(source_line),
                    None => return Err(SymbolError::OrphanLineRecord { line: line_no }),
                }
            }
        }

        let functions = functions
            .into_iter()
            .map(|(mut func, lines)| {
                let ranged = lines
                    .into_iter()
                    .filter_map(|line| {
                        if line.size == 0 {
                            return None;
                        }
                        let end = line.address.checked_add(line.size as u64)?.checked_sub(1)?;
                        Some((Range::new(line.address, end), line))
                    })
                    .collect();
                func.lines = into_rangemap_safe(ranged, "line");
                func
            })
            .filter_map(|func| func.memory_range().map(|range| (range, func)))
            .collect();

        publics.sort_by(|a: &PublicSymbol, b: &PublicSymbol| a.address.cmp(&b.address));

        Ok(SymbolFile {
            module_name,
            debug_id,
            files,
            functions: into_rangemap_safe(functions, "FUNC"),
            publics,
        })
    }

    /// Parse a symbol file from `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SymbolFile, SymbolError> {
        let text = std::fs::read_to_string(path)?;
        SymbolFile::parse(&text)
    }

    /// Find the nearest public symbol at or below `addr` (module-relative).
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        for public in self.publics.iter().rev() {
            if public.address <= addr {
                return Some(public);
            }
        }

        None
    }
}
