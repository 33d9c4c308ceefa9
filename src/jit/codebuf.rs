//! Code buffer for building JIT code.
//!
//! Bytes are accumulated here during the single emission pass; branch sites
//! are patched in place by the fixup pass before the buffer is installed.

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Read the 32-bit word at `at`.
    pub fn read_u32(&self, at: usize) -> Option<u32> {
        let bytes = self.code.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite the 32-bit word at `at`.
    pub fn patch_u32(&mut self, at: usize, value: u32) -> bool {
        match self.code.get_mut(at..at + 4) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEADBEEF);
        buf.emit_u64(1);

        assert_eq!(buf.len(), 13);
        assert_eq!(&buf.code()[..5], &[0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_patch() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xE9);
        buf.emit_u32(0);
        assert!(buf.patch_u32(1, 0x11223344));
        assert_eq!(buf.read_u32(1), Some(0x11223344));
        assert!(!buf.patch_u32(3, 0));
    }
}
