use derive_more::Display;

/// Placement of a unit's tensors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Device {
    #[default]
    #[display("cpu")]
    Cpu,
    #[display("cuda:{_0}")]
    Cuda(usize),
}

impl Device {
    /// Returns `true` if units placed on this device can be compiled.
    pub const fn is_supported(self) -> bool {
        matches!(self, Device::Cpu)
    }
}
