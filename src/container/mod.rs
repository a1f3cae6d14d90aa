//! Container Builder (C7): writes typed, shape-preserving records into an
//! event datagram's payload via an external names/lookup service (§4.7).
//! The binary container format library itself is out of scope (§1) —
//! `NamesLookup` is the trait boundary a real container library binding
//! would implement.

use crate::model::MAX_RANK;
use crate::pv::PvElementType;

/// `xtype[]`-equivalent: maps a PV's wire element type to the container's
/// declared data type (§ SUPPLEMENTED FEATURES).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerDataType {
    Enum,
    Uint8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Charstr,
}

pub fn map_element_type(t: PvElementType) -> ContainerDataType {
    match t {
        PvElementType::Boolean => ContainerDataType::Enum,
        PvElementType::Byte => ContainerDataType::Uint8,
        PvElementType::Short => ContainerDataType::Int16,
        PvElementType::Int => ContainerDataType::Int32,
        PvElementType::Long => ContainerDataType::Int64,
        PvElementType::Float => ContainerDataType::Float32,
        PvElementType::Double => ContainerDataType::Float64,
        PvElementType::String => ContainerDataType::Charstr,
    }
}

/// External collaborator: allocates space for a named, typed record and
/// remembers its declared shape. A real binding wraps the container
/// format library's `NamesId`/`Name` machinery.
pub trait NamesLookup: Send {
    fn declare(&mut self, names_id: u32, data_type: ContainerDataType, rank: u32);
}

/// In-memory stand-in used by the demo binary and tests.
#[derive(Default)]
pub struct MemNamesLookup {
    pub declared: Vec<(u32, ContainerDataType, u32)>,
}

impl NamesLookup for MemNamesLookup {
    fn declare(&mut self, names_id: u32, data_type: ContainerDataType, rank: u32) {
        self.declared.push((names_id, data_type, rank));
    }
}

/// Writes shape then payload bytes into a fresh buffer. Invariant (§4.7):
/// the total bytes written equal the size declared at `alloc` — here,
/// `rank * 4 + payload.len()`, which the caller is responsible for sizing
/// the target pebble/transition buffer to accommodate.
pub struct ContainerBuilder;

impl ContainerBuilder {
    pub fn write(
        names: &mut impl NamesLookup,
        names_id: u32,
        data_type: ContainerDataType,
        shape: [u32; MAX_RANK],
        rank: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        names.declare(names_id, data_type, rank);
        let mut buf = Vec::with_capacity(rank as usize * 4 + payload.len());
        for dim in shape.iter().take(rank as usize) {
            buf.extend_from_slice(&dim.to_le_bytes());
        }
        buf.extend_from_slice(payload);
        buf
    }
}

/// Configure-time record listing every connected PV's alias and name, in
/// declared order (§4.6, §8 property 6). Aliases are comma-delimited,
/// names newline-delimited, neither with a trailing separator.
#[derive(Debug, Clone, Default)]
pub struct InfoRecord {
    pub aliases: String,
    pub names: String,
}

impl InfoRecord {
    pub fn build(pvs: &[(String, String)]) -> Self {
        let aliases = pvs.iter().map(|(alias, _)| alias.as_str()).collect::<Vec<_>>().join(",");
        let names = pvs.iter().map(|(_, name)| name.as_str()).collect::<Vec<_>>().join("\n");
        Self { aliases, names }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_record_has_no_trailing_separator() {
        let pvs = vec![
            ("sig0".to_string(), "XPP:GON:01".to_string()),
            ("sig1".to_string(), "XPP:GON:02".to_string()),
        ];
        let rec = InfoRecord::build(&pvs);
        assert_eq!(rec.aliases, "sig0,sig1");
        assert_eq!(rec.names, "XPP:GON:01\nXPP:GON:02");
    }

    #[test]
    fn info_record_single_pv_has_no_separator_at_all() {
        let pvs = vec![("sig0".to_string(), "XPP:GON:01".to_string())];
        let rec = InfoRecord::build(&pvs);
        assert_eq!(rec.aliases, "sig0");
        assert!(!rec.names.contains('\n'));
    }

    #[test]
    fn container_builder_writes_shape_then_payload() {
        let mut names = MemNamesLookup::default();
        let mut shape = [0u32; MAX_RANK];
        shape[0] = 3;
        let out = ContainerBuilder::write(&mut names, 1, ContainerDataType::Float64, shape, 1, &[1, 2, 3]);
        assert_eq!(&out[0..4], &3u32.to_le_bytes());
        assert_eq!(&out[4..], &[1, 2, 3]);
        assert_eq!(names.declared, vec![(1, ContainerDataType::Float64, 1)]);
    }
}
