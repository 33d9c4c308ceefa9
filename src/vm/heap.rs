//! Word-addressed heap for objects, arrays, closures and static class
//! memory, plus the array and string helpers the runtime calls share.
//!
//! Compiled code reads headers and array extents at fixed offsets from a
//! handle, so the layout below is part of the native contract.

use parking_lot::Mutex;
use tracing::trace;

use super::error::VmError;

/// Raw handle to heap memory: a pointer to the first payload word, stored
/// on the operand stack as an `i64`. Zero is nil.
pub type Handle = *mut i64;

// =============================================================================
// Header Layout
// =============================================================================
//
// Every block starts with two header words placed before the handle:
//
// +-------------------------------+-------------------+
// | word -2: kind (8) | class (56)| word -1: words    |
// +-------------------------------+-------------------+
//
// `class` is the class id for objects and the element kind for arrays.

const HEADER_WORDS: usize = 2;
const KIND_MASK: i64 = 0xFF;
const CLASS_SHIFT: u32 = 8;

/// What a heap block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Object = 1,
    Array = 2,
    Static = 3,
    Closure = 4,
}

impl BlockKind {
    fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            1 => Some(BlockKind::Object),
            2 => Some(BlockKind::Array),
            3 => Some(BlockKind::Static),
            4 => Some(BlockKind::Closure),
            _ => None,
        }
    }
}

// =============================================================================
// Array Layout
// =============================================================================
//
// word 0: element count, word 1: dimension count, words 2..2+d: extents,
// payload from word 2+d. Byte and char arrays keep one extra terminator
// element that is not part of the element count.

/// Array element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElemKind {
    Byte = 0,
    Char = 1,
    Int = 2,
    Float = 3,
}

impl ElemKind {
    /// log2 of the element width in bytes.
    pub fn shift(self) -> u8 {
        match self {
            ElemKind::Byte => 0,
            ElemKind::Char => 2,
            ElemKind::Int | ElemKind::Float => 3,
        }
    }

    pub fn width(self) -> usize {
        1 << self.shift()
    }

    /// Byte and char arrays reserve a terminator element.
    fn reserve(self) -> usize {
        match self {
            ElemKind::Byte | ElemKind::Char => 1,
            ElemKind::Int | ElemKind::Float => 0,
        }
    }
}

/// Word offset of the payload for an array with `dims` dimensions.
pub fn payload_words(dims: usize) -> usize {
    dims + 2
}

/// Reads the element count of an array.
///
/// # Safety
/// `array` must be a live array handle.
pub unsafe fn array_len(array: Handle) -> i64 {
    unsafe { *array }
}

/// Reads the dimension count of an array.
///
/// # Safety
/// `array` must be a live array handle.
pub unsafe fn array_dims(array: Handle) -> usize {
    unsafe { *array.add(1) as usize }
}

/// Reads extent `i` of an array.
///
/// # Safety
/// `array` must be a live array handle with more than `i` dimensions.
pub unsafe fn array_extent(array: Handle, i: usize) -> i64 {
    unsafe { *array.add(2 + i) }
}

/// Address of the first payload byte.
///
/// # Safety
/// `array` must be a live array handle.
pub unsafe fn array_payload(array: Handle) -> *mut u8 {
    unsafe { array.add(payload_words(array_dims(array))) as *mut u8 }
}

/// Heap statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub words: usize,
}

/// Arena allocator for objects, arrays and static class memory.
///
/// Blocks are never freed individually; they live until the heap drops.
/// Reclamation policy belongs to an external collector.
pub struct Heap {
    blocks: Mutex<Vec<Box<[i64]>>>,
    stats: Mutex<HeapStats>,
    limit_words: Option<usize>,
}

// The arena only hands out raw pointers into boxed slices it owns.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(limit_words: Option<usize>) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            stats: Mutex::new(HeapStats::default()),
            limit_words,
        }
    }

    pub fn stats(&self) -> HeapStats {
        *self.stats.lock()
    }

    fn alloc_block(&self, kind: BlockKind, class: usize, words: usize) -> Result<Handle, VmError> {
        {
            let mut stats = self.stats.lock();
            let total = stats.words + words + HEADER_WORDS;
            if let Some(limit) = self.limit_words {
                if total > limit {
                    return Err(VmError::ResourceExhausted {
                        message: format!("heap limit of {} words reached", limit),
                    });
                }
            }
            stats.words = total;
            stats.blocks += 1;
        }

        let mut block = vec![0i64; words + HEADER_WORDS].into_boxed_slice();
        block[0] = (kind as i64) | ((class as i64) << CLASS_SHIFT);
        block[1] = words as i64;
        // SAFETY: the block has HEADER_WORDS leading words.
        let handle = unsafe { block.as_mut_ptr().add(HEADER_WORDS) };
        self.blocks.lock().push(block);
        trace!(target: "heap", ?kind, class, words, "alloc");
        Ok(handle)
    }

    /// Allocates a zeroed object instance of `class`.
    pub fn alloc_object(&self, class: usize, words: usize) -> Result<Handle, VmError> {
        // Thread and mutex objects use words 0 and 1, keep them addressable.
        self.alloc_block(BlockKind::Object, class, words.max(2))
    }

    /// Allocates static memory for a class.
    pub fn alloc_static(&self, class: usize, words: usize) -> Result<Handle, VmError> {
        self.alloc_block(BlockKind::Static, class, words.max(1))
    }

    /// Allocates closure memory for a function value.
    pub fn alloc_closure(&self, words: usize) -> Result<Handle, VmError> {
        self.alloc_block(BlockKind::Closure, 0, words.max(1))
    }

    /// Allocates an array with the given extents, outermost first.
    pub fn alloc_array(&self, kind: ElemKind, extents: &[i64]) -> Result<Handle, VmError> {
        let mut size: i64 = 1;
        for &extent in extents {
            if extent < 0 {
                return Err(VmError::InvalidArraySize {
                    size: extent,
                    trace: Vec::new(),
                });
            }
            size = size.checked_mul(extent).ok_or(VmError::InvalidArraySize {
                size: i64::MAX,
                trace: Vec::new(),
            })?;
        }

        let elems = size as usize + kind.reserve();
        let payload = (elems * kind.width()).div_ceil(8);
        let words = payload_words(extents.len()) + payload;
        let handle = self.alloc_block(BlockKind::Array, kind as usize, words)?;
        // SAFETY: freshly allocated block of `words` words.
        unsafe {
            *handle = size;
            *handle.add(1) = extents.len() as i64;
            for (i, &extent) in extents.iter().enumerate() {
                *handle.add(2 + i) = extent;
            }
        }
        Ok(handle)
    }

    /// Kind of the block behind `handle`.
    ///
    /// # Safety
    /// `handle` must be non-nil and come from this heap.
    pub unsafe fn kind_of(handle: Handle) -> Option<BlockKind> {
        let header = unsafe { *handle.sub(HEADER_WORDS) };
        BlockKind::from_bits(header & KIND_MASK)
    }

    /// Class id of an object, `None` for nil or non-object blocks.
    ///
    /// # Safety
    /// A non-nil `handle` must come from this heap.
    pub unsafe fn class_of(handle: Handle) -> Option<usize> {
        if handle.is_null() {
            return None;
        }
        let header = unsafe { *handle.sub(HEADER_WORDS) };
        match BlockKind::from_bits(header & KIND_MASK) {
            Some(BlockKind::Object) => Some((header >> CLASS_SHIFT) as usize),
            _ => None,
        }
    }

    /// Payload word count of a block.
    ///
    /// # Safety
    /// `handle` must be non-nil and come from this heap.
    pub unsafe fn words_of(handle: Handle) -> usize {
        unsafe { *handle.sub(1) as usize }
    }
}

/// Reads a NUL-terminated char array into a `String`.
///
/// # Safety
/// `array` must be a live char array handle.
pub unsafe fn read_char_array(array: Handle) -> String {
    unsafe {
        let len = array_len(array).max(0) as usize;
        let chars = array_payload(array) as *const u32;
        let mut out = String::with_capacity(len);
        for i in 0..len {
            let code = *chars.add(i);
            if code == 0 {
                break;
            }
            out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        out
    }
}

/// Writes `text` into a char array, truncating to its length.
/// A shorter text is NUL-terminated.
///
/// # Safety
/// `array` must be a live char array handle.
pub unsafe fn write_char_array(array: Handle, text: &str) {
    unsafe {
        let len = array_len(array).max(0) as usize;
        let chars = array_payload(array) as *mut u32;
        let mut written = 0;
        for c in text.chars().take(len) {
            *chars.add(written) = c as u32;
            written += 1;
        }
        if written < len {
            *chars.add(written) = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_array_header() {
        let heap = Heap::new(None);
        let array = heap.alloc_array(ElemKind::Int, &[3, 4]).unwrap();
        unsafe {
            assert_eq!(array_len(array), 12);
            assert_eq!(array_dims(array), 2);
            assert_eq!(array_extent(array, 0), 3);
            assert_eq!(array_extent(array, 1), 4);
            assert_eq!(Heap::kind_of(array), Some(BlockKind::Array));
            assert_eq!(Heap::words_of(array), 4 + 12);
            assert_eq!(array_payload(array), array.add(4) as *mut u8);
        }
    }

    #[test]
    fn test_char_array_reserves_terminator() {
        let heap = Heap::new(None);
        let array = heap.alloc_array(ElemKind::Char, &[3]).unwrap();
        unsafe {
            assert_eq!(array_len(array), 3);
            // 4 chars of 4 bytes = 2 payload words
            assert_eq!(Heap::words_of(array), 3 + 2);
            write_char_array(array, "hello");
            assert_eq!(read_char_array(array), "hel");
        }
    }

    #[test]
    fn test_object_class_tag() {
        let heap = Heap::new(None);
        let obj = heap.alloc_object(7, 3).unwrap();
        unsafe {
            assert_eq!(Heap::class_of(obj), Some(7));
            assert_eq!(Heap::class_of(std::ptr::null_mut()), None);
        }
        let array = heap.alloc_array(ElemKind::Byte, &[2]).unwrap();
        unsafe {
            assert_eq!(Heap::class_of(array), None);
        }
        assert_eq!(heap.stats().blocks, 2);
    }

    #[test]
    fn test_negative_extent_rejected() {
        let heap = Heap::new(None);
        assert!(matches!(
            heap.alloc_array(ElemKind::Int, &[2, -1]),
            Err(VmError::InvalidArraySize { size: -1, .. })
        ));
    }

    #[test]
    fn test_heap_limit() {
        let heap = Heap::new(Some(16));
        assert!(heap.alloc_object(0, 4).is_ok());
        assert!(matches!(
            heap.alloc_object(0, 32),
            Err(VmError::ResourceExhausted { .. })
        ));
    }
}
