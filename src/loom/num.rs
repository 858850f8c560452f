use derive_more::Display;

/// Numeric type of the elements held by a unit's tensors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    #[default]
    F32,
    F16,
    F64,
    I32,
}

impl DataType {
    /// Returns `true` if the CPU kernels are able to compute on this type.
    pub const fn is_supported(self) -> bool {
        matches!(self, DataType::F32)
    }
}
