//! Runtime resource ceilings enforced inline by the VM and value operations.

/// Execution limits for one VM instance.
///
/// String/bytes ceilings are checked at the opcodes that can grow those
/// values and surface as script-catchable Error values. The instruction
/// budget and stack caps are fatal: exceeding them aborts the run.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum byte length of any string produced by concatenation.
    pub max_string_len: usize,
    /// Maximum byte length of any bytes value produced by concatenation.
    pub max_bytes_len: usize,
    /// Total instruction budget for a run. `None` means unlimited.
    pub max_instructions: Option<u64>,
    /// Operand stack depth cap.
    pub max_stack: usize,
    /// Call frame depth cap.
    pub max_frames: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_string_len: 0x7fff_ffff,
            max_bytes_len: 0x7fff_ffff,
            max_instructions: None,
            max_stack: 2048,
            max_frames: 1024,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }
}
