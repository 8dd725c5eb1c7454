use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of the buffers an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NumericType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl NumericType {
    pub const ALL: [NumericType; 10] = [
        NumericType::I8,
        NumericType::U8,
        NumericType::I16,
        NumericType::U16,
        NumericType::I32,
        NumericType::U32,
        NumericType::I64,
        NumericType::U64,
        NumericType::F32,
        NumericType::F64,
    ];

    pub fn is_float(self) -> bool {
        matches!(self, NumericType::F32 | NumericType::F64)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            NumericType::I8 | NumericType::U8 => 1,
            NumericType::I16 | NumericType::U16 => 2,
            NumericType::I32 | NumericType::U32 | NumericType::F32 => 4,
            NumericType::I64 | NumericType::U64 | NumericType::F64 => 8,
        }
    }

    /// Scalar type name in generated kernel source.
    pub fn kernel_type_name(self) -> &'static str {
        match self {
            NumericType::I8 => "char",
            NumericType::U8 => "uchar",
            NumericType::I16 => "short",
            NumericType::U16 => "ushort",
            NumericType::I32 => "int",
            NumericType::U32 => "uint",
            NumericType::I64 => "long",
            NumericType::U64 => "ulong",
            NumericType::F32 => "float",
            NumericType::F64 => "double",
        }
    }

    /// Single character used in structural fingerprints.
    pub fn code(self) -> char {
        match self {
            NumericType::I8 => 'c',
            NumericType::U8 => 'C',
            NumericType::I16 => 's',
            NumericType::U16 => 'S',
            NumericType::I32 => 'i',
            NumericType::U32 => 'I',
            NumericType::I64 => 'l',
            NumericType::U64 => 'L',
            NumericType::F32 => 'f',
            NumericType::F64 => 'd',
        }
    }

    /// Name used by model description files. Only floating point kernels can
    /// be reconfigured from a description.
    pub fn description_name(self) -> Option<&'static str> {
        match self {
            NumericType::F32 => Some("float32"),
            NumericType::F64 => Some("float64"),
            _ => None,
        }
    }

    pub fn from_description_name(name: &str) -> Option<Self> {
        match name {
            "float32" => Some(NumericType::F32),
            "float64" => Some(NumericType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_names_cover_only_floats() {
        for dtype in NumericType::ALL {
            let name = dtype.description_name();
            assert_eq!(name.is_some(), dtype.is_float(), "{dtype}");
            if let Some(name) = name {
                assert_eq!(NumericType::from_description_name(name), Some(dtype));
            }
        }
        assert_eq!(NumericType::from_description_name("int32"), None);
    }

    #[test]
    fn fingerprint_codes_are_distinct() {
        let mut codes: Vec<char> = NumericType::ALL.iter().map(|d| d.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), NumericType::ALL.len());
    }
}
