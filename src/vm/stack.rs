//! Per-thread operand stack.
//!
//! Compiled code and the interpreter share the same word array and position
//! cursor, so the stack is accessed through raw pointers on both sides.

use super::error::VmError;

/// Extra words past the capacity so compiled code, which does not bounds
/// check its pushes, cannot run off the allocation before the next check.
const GUARD_WORDS: usize = 64;

/// Owner of one thread's operand stack memory.
pub struct StackStorage {
    words: Box<[i64]>,
    pos: Box<i64>,
    capacity: usize,
}

impl StackStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0i64; capacity + GUARD_WORDS].into_boxed_slice(),
            pos: Box::new(0),
            capacity,
        }
    }

    pub fn view(&mut self) -> OperandStack {
        OperandStack {
            base: self.words.as_mut_ptr(),
            pos: &mut *self.pos,
            capacity: self.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Copyable view over an operand stack.
#[derive(Clone, Copy)]
pub struct OperandStack {
    base: *mut i64,
    pos: *mut i64,
    capacity: usize,
}

impl OperandStack {
    /// # Safety
    /// `base` must point to at least `capacity` words and `pos` to the
    /// matching cursor, both outliving the view.
    pub unsafe fn from_raw(base: *mut i64, pos: *mut i64, capacity: usize) -> Self {
        Self {
            base,
            pos,
            capacity,
        }
    }

    pub fn base(&self) -> *mut i64 {
        self.base
    }

    pub fn pos_ptr(&self) -> *mut i64 {
        self.pos
    }

    pub fn len(&self) -> usize {
        // SAFETY: `pos` is valid for the lifetime of the view.
        unsafe { (*self.pos).max(0) as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: i64) -> Result<(), VmError> {
        let pos = self.len();
        if pos >= self.capacity {
            return Err(VmError::overflow());
        }
        // SAFETY: pos < capacity.
        unsafe {
            *self.base.add(pos) = value;
            *self.pos = pos as i64 + 1;
        }
        Ok(())
    }

    pub fn pop(&self) -> Result<i64, VmError> {
        let pos = self.len();
        if pos == 0 {
            return Err(VmError::underflow());
        }
        // SAFETY: 0 < pos <= capacity.
        unsafe {
            *self.pos = pos as i64 - 1;
            Ok(*self.base.add(pos - 1))
        }
    }

    pub fn peek(&self) -> Result<i64, VmError> {
        let pos = self.len();
        if pos == 0 {
            return Err(VmError::underflow());
        }
        // SAFETY: 0 < pos <= capacity.
        unsafe { Ok(*self.base.add(pos - 1)) }
    }

    pub fn push_float(&self, value: f64) -> Result<(), VmError> {
        self.push(value.to_bits() as i64)
    }

    pub fn pop_float(&self) -> Result<f64, VmError> {
        self.pop().map(|bits| f64::from_bits(bits as u64))
    }

    /// Drops everything above `len`.
    pub fn truncate(&self, len: usize) {
        if len < self.len() {
            // SAFETY: len < current position.
            unsafe {
                *self.pos = len as i64;
            }
        }
    }

    pub fn to_vec(&self) -> Vec<i64> {
        let len = self.len().min(self.capacity);
        // SAFETY: the first `len` words are initialised.
        unsafe { std::slice::from_raw_parts(self.base, len).to_vec() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut storage = StackStorage::new(4);
        let stack = storage.view();
        stack.push(1).unwrap();
        stack.push_float(2.5).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop_float().unwrap(), 2.5);
        assert_eq!(stack.pop().unwrap(), 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut storage = StackStorage::new(2);
        let stack = storage.view();
        assert!(matches!(stack.pop(), Err(VmError::StackUnderflow { .. })));
        stack.push(1).unwrap();
        stack.push(2).unwrap();
        assert!(matches!(stack.push(3), Err(VmError::StackOverflow { .. })));
    }}
