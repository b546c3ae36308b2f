// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Loaded-module maps.

use range_map::{Range, RangeMap};
use tracing::warn;

/// An executable or shared library loaded in the walked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    base_address: u64,
    size: u64,
    name: String,
    /// The debug file associated with this module (a .pdb or the module
    /// itself), when known.
    pub debug_file: Option<String>,
    /// The identifier discriminating builds of `debug_file`, when known.
    pub debug_id: Option<String>,
}

impl ModuleInfo {
    pub fn new<S: Into<String>>(base_address: u64, size: u64, name: S) -> ModuleInfo {
        ModuleInfo {
            base_address,
            size,
            name: name.into(),
            debug_file: None,
            debug_id: None,
        }
    }

    /// The base address of this code module as it was loaded by the process.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The size of the code module.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The path or file name that the code module was loaded from.
    pub fn code_file(&self) -> &str {
        &self.name
    }

    fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.base_address,
            self.base_address.checked_add(self.size)?.checked_sub(1)?,
        ))
    }
}

/// The modules loaded in the walked process, indexed by address range.
#[derive(Debug, Clone)]
pub struct ModuleMap {
    /// The modules, in insertion order.
    modules: Vec<ModuleInfo>,
    /// Map from address range to index in `modules`. Use
    /// [`ModuleMap::module_at_address`].
    by_addr: RangeMap<u64, usize>,
}

impl Default for ModuleMap {
    fn default() -> ModuleMap {
        ModuleMap::new()
    }
}

impl ModuleMap {
    /// An empty map. Every address lookup misses, which makes the walkers
    /// reject every recovered instruction pointer; useful mostly in tests.
    pub fn new() -> ModuleMap {
        ModuleMap {
            modules: vec![],
            by_addr: RangeMap::new(),
        }
    }

    /// Build a map from a list of modules.
    ///
    /// A module overlapping an earlier one is dropped; an address can only
    /// belong to one module.
    pub fn from_modules(modules: Vec<ModuleInfo>) -> ModuleMap {
        let mut ranges: Vec<(Range<u64>, usize)> = modules
            .iter()
            .enumerate()
            .filter_map(|(i, module)| module.memory_range().map(|r| (r, i)))
            .collect();
        ranges.sort_by_key(|&(range, _)| range);

        let mut by_addr: Vec<(Range<u64>, usize)> = Vec::with_capacity(ranges.len());
        for (range, index) in ranges {
            if let Some(&(last_range, last_index)) = by_addr.last() {
                if range.start <= last_range.end {
                    warn!(
                        "module {} overlaps module {}, dropping it",
                        modules[index].code_file(),
                        modules[last_index].code_file(),
                    );
                    continue;
                }
            }
            by_addr.push((range, index));
        }

        ModuleMap {
            by_addr: by_addr.into_iter().collect(),
            modules,
        }
    }

    /// Return the module whose address range covers `address`.
    pub fn module_at_address(&self, address: u64) -> Option<&ModuleInfo> {
        self.by_addr.get(address).map(|&index| &self.modules[index])
    }

    /// Iterate over the modules in order by base address.
    pub fn by_addr(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.by_addr
            .ranges_values()
            .map(move |&(_, index)| &self.modules[index])
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Snapshot the modules currently loaded in this process.
    ///
    /// Each module's range covers its `PT_LOAD` segments. This reads the
    /// dynamic linker's bookkeeping and must run outside any fault handler,
    /// typically once at startup.
    #[cfg(target_os = "linux")]
    pub fn from_loaded_modules() -> ModuleMap {
        use std::ffi::CStr;

        unsafe extern "C" fn each_module(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut libc::c_void,
        ) -> libc::c_int {
            let modules = &mut *(data as *mut Vec<ModuleInfo>);
            let info = &*info;

            let mut start = u64::MAX;
            let mut end = 0u64;
            let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
            for phdr in phdrs {
                if phdr.p_type == libc::PT_LOAD {
                    let seg_start = info.dlpi_addr as u64 + phdr.p_vaddr as u64;
                    let seg_end = seg_start.saturating_add(phdr.p_memsz as u64);
                    start = start.min(seg_start);
                    end = end.max(seg_end);
                }
            }
            if start >= end {
                return 0;
            }

            // The empty name is the main executable.
            let name = if info.dlpi_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
            };
            let name = if name.is_empty() {
                std::env::current_exe()
                    .ok()
                    .and_then(|p| p.to_str().map(String::from))
                    .unwrap_or_else(|| "<main>".to_string())
            } else {
                name
            };

            modules.push(ModuleInfo::new(start, end - start, name));
            0
        }

        let mut modules: Vec<ModuleInfo> = Vec::new();
        unsafe {
            libc::dl_iterate_phdr(
                Some(each_module),
                &mut modules as *mut Vec<ModuleInfo> as *mut libc::c_void,
            );
        }
        ModuleMap::from_modules(modules)
    }
}
