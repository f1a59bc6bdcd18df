use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};
use memmap2::Mmap;
use object::{Architecture, Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::errors::DeployError;

/// How a probe template's symbol pattern is matched against symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolMatchType {
    Exact,
    Prefix,
    Suffix,
}

impl SymbolMatchType {
    pub fn matches(&self, name: &str, pattern: &str) -> bool {
        match self {
            SymbolMatchType::Exact => name == pattern,
            SymbolMatchType::Prefix => name.starts_with(pattern),
            SymbolMatchType::Suffix => name.ends_with(pattern),
        }
    }
}

/// A function symbol: name, virtual address, size of the body in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Either a memory-mapped file or an owned buffer. Mapping avoids copying
/// whole binaries into the heap just to read their symbol tables.
#[derive(Debug)]
enum BinaryData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl std::ops::Deref for BinaryData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BinaryData::Mapped(m) => m,
            BinaryData::Owned(v) => v,
        }
    }
}

/// Reader over one ELF file's symbol tables and instruction stream.
/// Constructed per binary and discarded once probes are deployed.
#[derive(Debug)]
pub struct ElfReader {
    path: PathBuf,
    data: BinaryData,
}

impl ElfReader {
    pub fn open(path: &Path) -> Result<Self, DeployError> {
        let file = File::open(path).map_err(|e| DeployError::BinaryUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DeployError::BinaryUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let reader = Self {
            path: path.to_path_buf(),
            data: BinaryData::Mapped(mmap),
        };
        // Validate the header up front so a corrupt file fails at open time.
        reader.parse()?;
        Ok(reader)
    }

    pub fn from_bytes(data: Vec<u8>, origin: &Path) -> Result<Self, DeployError> {
        let reader = Self {
            path: origin.to_path_buf(),
            data: BinaryData::Owned(data),
        };
        reader.parse()?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self) -> Result<object::File<'_>, DeployError> {
        object::File::parse(&*self.data).map_err(|e| DeployError::BinaryUnreadable {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// List the defined function symbols matching `pattern`, ordered by
    /// address. Both the static and the dynamic symbol table are searched.
    pub fn list_func_symbols(
        &self,
        pattern: &str,
        match_type: SymbolMatchType,
    ) -> Result<Vec<SymbolInfo>, DeployError> {
        let obj = self.parse()?;

        let mut seen = HashSet::new();
        let mut symbols = Vec::new();
        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if sym.kind() != SymbolKind::Text || !sym.is_definition() {
                continue;
            }
            let name = match sym.name() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !match_type.matches(name, pattern) {
                continue;
            }
            if seen.insert((name.to_string(), sym.address())) {
                symbols.push(SymbolInfo {
                    name: name.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                });
            }
        }
        symbols.sort_by_key(|s| s.address);
        Ok(symbols)
    }

    /// Direct lookup of any symbol's virtual address, regardless of kind.
    /// Used as a presence test for markers like `runtime.buildVersion`.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        let obj = self.parse().ok()?;
        obj.symbols()
            .chain(obj.dynamic_symbols())
            .find(|sym| sym.name().map(|n| n == name).unwrap_or(false))
            .map(|sym| sym.address())
    }

    /// Addresses of the return instructions inside `sym`'s body, found by
    /// disassembly. Return probes on Go binaries are expressed as entry
    /// probes at each of these addresses, since Go's stack handling breaks
    /// ordinary return probes.
    pub fn return_instruction_addrs(&self, sym: &SymbolInfo) -> Result<Vec<u64>, DeployError> {
        let obj = self.parse()?;
        if obj.architecture() != Architecture::X86_64 {
            return Err(DeployError::BinaryUnreadable {
                path: self.path.clone(),
                reason: format!(
                    "return-site discovery not supported for {:?}",
                    obj.architecture()
                ),
            });
        }

        let section_index = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .find(|s| {
                s.address() == sym.address
                    && s.name().map(|n| n == sym.name).unwrap_or(false)
            })
            .and_then(|s| s.section_index())
            .ok_or_else(|| DeployError::BinaryUnreadable {
                path: self.path.clone(),
                reason: format!("symbol {} is not defined in any section", sym.name),
            })?;
        let section =
            obj.section_by_index(section_index)
                .map_err(|e| DeployError::BinaryUnreadable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?;
        let data = section.data().map_err(|e| DeployError::BinaryUnreadable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let start = sym.address.checked_sub(section.address()).ok_or_else(|| {
            DeployError::BinaryUnreadable {
                path: self.path.clone(),
                reason: format!("symbol {} lies below its section", sym.name),
            }
        })? as usize;
        let end = start + sym.size as usize;
        if end > data.len() {
            return Err(DeployError::BinaryUnreadable {
                path: self.path.clone(),
                reason: format!("symbol {} extends past its section", sym.name),
            });
        }

        let mut addrs = Vec::new();
        let mut decoder =
            Decoder::with_ip(64, &data[start..end], sym.address, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            if matches!(instruction.mnemonic(), Mnemonic::Ret | Mnemonic::Retf) {
                addrs.push(instruction.ip());
            }
        }
        Ok(addrs)
    }
}
