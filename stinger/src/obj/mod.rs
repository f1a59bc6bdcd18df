pub mod dwarf;
pub mod elf;

pub use dwarf::{DwarfReader, VarLocation};
pub use elf::{ElfReader, SymbolInfo, SymbolMatchType};
