//! ELF inspection and shared-library resolution.

mod parse;
mod resolve;

pub use parse::{parse_elf, read_elf, ElfError, ElfInfo};
pub use resolve::{
    is_system_library, libc_family, real_path, resolve_dependency, scan, scan_recursive,
    DependencyRecord, LibcFamily, ResolverConfig, ScanReport, IMAGE_LIBRARY_DIRS,
};
