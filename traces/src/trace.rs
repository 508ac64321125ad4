//  The frame and trace records held by the storage.

use core::{fmt, mem, ptr::NonNull, slice};

/// A single frame of a call trace, identifying a program location.
///
/// The storage never interprets a frame: it only hashes and copies its raw bytes. The fields below merely give the
/// stack walker somewhere to put what it captured.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CallFrame {
    /// Identifier of the function or method enclosing the location.
    pub function: u64,
    /// Position within the function, as understood by the stack walker.
    pub position: i32,
    /// Discriminant of the frame kind, as understood by the stack walker.
    pub kind: i32,
}

//  The raw bytes of a frame slice are hashed and compared, hence frames must not contain padding.
const _: () = assert!(mem::size_of::<CallFrame>() == 16);
const _: () = assert!(mem::align_of::<CallFrame>() == 8);

//  Returns the raw bytes of a slice of frames.
pub(crate) fn raw_bytes(frames: &[CallFrame]) -> &[u8] {
    let length = mem::size_of_val(frames);

    //  Safety:
    //  -   `frames.as_ptr()` is valid for reads of `length` bytes.
    //  -   `CallFrame` is a padding-free POD, so all `length` bytes are initialized.
    //  -   `length` is not larger than `isize::MAX`, since it's the size of a live slice.
    unsafe { slice::from_raw_parts(frames.as_ptr() as *const u8, length) }
}

/// A call trace: the ordered sequence of frames captured at one sample point.
///
/// Traces are immutable once published, and owned by the storage which created them: a `&CallTrace` lives at most
/// as long as the borrow of the storage it was collected from.
#[repr(C)]
#[derive(PartialEq)]
pub struct CallTrace {
    num_frames: u32,
    frames: [CallFrame],
}

//  Public methods
impl CallTrace {
    /// Returns the number of frames of the trace.
    pub fn num_frames(&self) -> u32 {
        self.num_frames
    }

    /// Returns the frames of the trace, outermost last.
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }
}

//  Crate methods
impl CallTrace {
    //  Offset of the frames within the record: the header, padded to frame alignment.
    const FRAMES_OFFSET: usize = {
        let header = mem::size_of::<u32>();
        let align = mem::align_of::<CallFrame>();

        (header + align - 1) & !(align - 1)
    };

    //  Returns the number of bytes required to store a trace of `num_frames` frames.
    pub(crate) fn bytes_for(num_frames: usize) -> usize {
        Self::FRAMES_OFFSET + num_frames * mem::size_of::<CallFrame>()
    }

    //  Writes a trace into `block`, element by element.
    //
    //  The caller may be inside a signal handler, where library copy routines such as `memcpy` are off-limits.
    //
    //  #   Safety
    //
    //  -   `block` must be valid for writes of `bytes_for(frames.len())` bytes.
    //  -   `block` must be aligned for `CallFrame`.
    //  -   `block` must not be accessed by anything else during the write.
    pub(crate) unsafe fn write(block: NonNull<u8>, frames: &[CallFrame]) {
        debug_assert!(frames.len() <= i32::MAX as usize);

        let pointer = block.as_ptr();

        //  Safety:
        //  -   `pointer` is valid for writes of 4 bytes, and aligned for u32.
        unsafe { (pointer as *mut u32).write(frames.len() as u32) };

        //  Safety:
        //  -   `FRAMES_OFFSET` is within the block.
        let destination = unsafe { pointer.add(Self::FRAMES_OFFSET) } as *mut CallFrame;

        for (index, frame) in frames.iter().enumerate() {
            //  Safety:
            //  -   The block covers `frames.len()` frames past `FRAMES_OFFSET`, all aligned.
            unsafe { destination.add(index).write(*frame) };
        }
    }

    //  Reconstructs a trace reference from the start of its record.
    //
    //  #   Safety
    //
    //  -   `block` must have been fully written by `write`, and not modified since.
    //  -   The record must stay live and unmodified for the lifetime `'a`.
    pub(crate) unsafe fn resolve<'a>(block: NonNull<u8>) -> &'a CallTrace {
        //  Safety:
        //  -   `block` points to an initialized header.
        let num_frames = unsafe { (block.as_ptr() as *const u32).read() } as usize;

        //  The metadata of the fat pointer is the length of the trailing slice; the address is the record start.
        let pointer =
            core::ptr::slice_from_raw_parts(block.as_ptr() as *const CallFrame, num_frames) as *const CallTrace;

        //  Safety:
        //  -   `pointer` covers an initialized record of `num_frames` frames.
        //  -   The record is immutable for `'a`.
        unsafe { &*pointer }
    }
}

impl fmt::Debug for CallTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_list().entries(self.frames().iter()).finish()
    }
}

// mod tests
