use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use gimli::{
    DW_AT_data_member_location, DW_AT_linkage_name, DW_AT_location, DW_AT_name,
    DW_TAG_formal_parameter, DW_TAG_member, DW_TAG_structure_type, DW_TAG_subprogram,
    Reader as GimliReader, RunTimeEndian,
};
use object::{Object, ObjectSection};

use crate::errors::DeployError;

type Reader = gimli::EndianArcSlice<RunTimeEndian>;

/// Where a function argument lives at the probe site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLocation {
    /// Offset from SP at function entry.
    Stack(i32),
    /// DWARF register number.
    Register(u16),
}

/// The frame base of Go (and most -O0 C) functions is the CFA, which on
/// x86-64 sits one return-address slot above SP at function entry.
const FRAME_BASE_SP_OFFSET: i32 = 8;

/// Reader over one binary's DWARF debug info. Parsing debug info is
/// memory-intensive, so the orchestrator only opens this lazily for
/// binaries already confirmed to be Go binaries.
#[derive(Debug)]
pub struct DwarfReader {
    dwarf: gimli::Dwarf<Reader>,
}

impl DwarfReader {
    pub fn open(path: &Path) -> Result<Self, DeployError> {
        let data = std::fs::read(path).map_err(|_| DeployError::DebugInfoMissing {
            path: path.to_path_buf(),
        })?;
        Self::from_bytes(&data, path)
    }

    pub fn from_bytes(data: &[u8], origin: &Path) -> Result<Self, DeployError> {
        let missing = |_| DeployError::DebugInfoMissing {
            path: origin.to_path_buf(),
        };

        let obj = object::File::parse(data).map_err(|_| DeployError::DebugInfoMissing {
            path: origin.to_path_buf(),
        })?;
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section).map_err(missing)?;

        let has_units = {
            let mut units = dwarf.units();
            units.next().map_err(missing)?.is_some()
        };
        if !has_units {
            return Err(DeployError::DebugInfoMissing {
                path: origin.to_path_buf(),
            });
        }
        Ok(Self { dwarf })
    }

    /// Byte offset of `member` inside the struct type named `struct_name`,
    /// or None when either is absent from the debug info.
    pub fn struct_member_offset(&self, struct_name: &str, member: &str) -> Option<u64> {
        self.find_member_offset(struct_name, member).ok().flatten()
    }

    /// Location of the formal parameter `param` of the function named
    /// `function`, or None when the function, the parameter, or a location
    /// expression this reader understands is absent.
    pub fn argument_location(&self, function: &str, param: &str) -> Option<VarLocation> {
        self.find_argument_location(function, param).ok().flatten()
    }

    fn find_member_offset(
        &self,
        struct_name: &str,
        member: &str,
    ) -> Result<Option<u64>, gimli::Error> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut tree = unit.entries_tree(None)?;
            if let Some(offset) =
                self.member_offset_in_node(&unit, tree.root()?, struct_name, member)?
            {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn member_offset_in_node(
        &self,
        unit: &gimli::Unit<Reader>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader>,
        struct_name: &str,
        member: &str,
    ) -> Result<Option<u64>, gimli::Error> {
        let is_target = node.entry().tag() == DW_TAG_structure_type
            && self.entry_name(unit, node.entry())?.as_deref() == Some(struct_name);

        let mut children = node.children();
        if is_target {
            while let Some(child) = children.next()? {
                if child.entry().tag() != DW_TAG_member {
                    continue;
                }
                if self.entry_name(unit, child.entry())?.as_deref() != Some(member) {
                    continue;
                }
                let location = child.entry().attr(DW_AT_data_member_location)?;
                return Ok(location.and_then(|attr| attr.value().udata_value()));
            }
            return Ok(None);
        }

        while let Some(child) = children.next()? {
            if let Some(offset) =
                self.member_offset_in_node(unit, child, struct_name, member)?
            {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn find_argument_location(
        &self,
        function: &str,
        param: &str,
    ) -> Result<Option<VarLocation>, gimli::Error> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut tree = unit.entries_tree(None)?;
            if let Some(location) =
                self.argument_in_node(&unit, tree.root()?, function, param)?
            {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    fn argument_in_node(
        &self,
        unit: &gimli::Unit<Reader>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Reader>,
        function: &str,
        param: &str,
    ) -> Result<Option<VarLocation>, gimli::Error> {
        let entry = node.entry();
        let is_target = entry.tag() == DW_TAG_subprogram
            && (self.entry_name(unit, entry)?.as_deref() == Some(function)
                || self.entry_linkage_name(unit, entry)?.as_deref() == Some(function));

        let mut children = node.children();
        if is_target {
            while let Some(child) = children.next()? {
                if child.entry().tag() != DW_TAG_formal_parameter {
                    continue;
                }
                if self.entry_name(unit, child.entry())?.as_deref() != Some(param) {
                    continue;
                }
                if let Some(attr) = child.entry().attr(DW_AT_location)? {
                    if let gimli::AttributeValue::Exprloc(expr) = attr.value() {
                        let bytes = expr.0.to_slice()?;
                        return Ok(decode_exprloc(&bytes));
                    }
                }
                return Ok(None);
            }
            return Ok(None);
        }

        while let Some(child) = children.next()? {
            if let Some(location) = self.argument_in_node(unit, child, function, param)? {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader>,
    ) -> Result<Option<String>, gimli::Error> {
        self.entry_string_attr(unit, entry, DW_AT_name)
    }

    fn entry_linkage_name(
        &self,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader>,
    ) -> Result<Option<String>, gimli::Error> {
        self.entry_string_attr(unit, entry, DW_AT_linkage_name)
    }

    fn entry_string_attr(
        &self,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Reader>,
        which: gimli::DwAt,
    ) -> Result<Option<String>, gimli::Error> {
        match entry.attr(which)? {
            Some(attr) => match self.dwarf.attr_string(unit, attr.value()) {
                Ok(s) => Ok(Some(s.to_string_lossy()?.into_owned())),
                Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }
}

/// Decode the single-operation location expressions Go and C compilers emit
/// for function arguments. Anything more elaborate (location lists, pieced
/// expressions) comes back as None and the field stays an absent sentinel.
fn decode_exprloc(bytes: &[u8]) -> Option<VarLocation> {
    let (&op, rest) = bytes.split_first()?;
    if op == gimli::DW_OP_fbreg.0 {
        let offset = decode_sleb128(rest)?;
        return Some(VarLocation::Stack(offset as i32 + FRAME_BASE_SP_OFFSET));
    }
    if op == gimli::DW_OP_call_frame_cfa.0 {
        return Some(VarLocation::Stack(FRAME_BASE_SP_OFFSET));
    }
    if (gimli::DW_OP_reg0.0..=gimli::DW_OP_reg31.0).contains(&op) {
        return Some(VarLocation::Register(u16::from(op - gimli::DW_OP_reg0.0)));
    }
    if op == gimli::DW_OP_regx.0 {
        let reg = decode_uleb128(rest)?;
        return Some(VarLocation::Register(reg as u16));
    }
    None
}

fn decode_sleb128(bytes: &[u8]) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    for &byte in bytes {
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some(result);
        }
        if shift >= 64 {
            return None;
        }
    }
    None
}

fn decode_uleb128(bytes: &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for &byte in bytes {
        result |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        if shift >= 64 {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fbreg_locations_are_sp_relative() {
        // DW_OP_fbreg 0 -> one slot above SP.
        assert_eq!(decode_exprloc(&[0x91, 0x00]), Some(VarLocation::Stack(8)));
        // DW_OP_fbreg 8
        assert_eq!(decode_exprloc(&[0x91, 0x08]), Some(VarLocation::Stack(16)));
        // DW_OP_fbreg -8 (sleb128: 0x78)
        assert_eq!(decode_exprloc(&[0x91, 0x78]), Some(VarLocation::Stack(0)));
    }

    #[test]
    fn register_locations_decode() {
        // DW_OP_reg5
        assert_eq!(decode_exprloc(&[0x55]), Some(VarLocation::Register(5)));
        // DW_OP_regx 33
        assert_eq!(decode_exprloc(&[0x90, 33]), Some(VarLocation::Register(33)));
    }

    #[test]
    fn unsupported_expressions_are_absent() {
        // DW_OP_addr
        assert_eq!(decode_exprloc(&[0x03, 0, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(decode_exprloc(&[]), None);
    }
}
