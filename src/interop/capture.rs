//! Call-state capture - platform status cells read right after a native call
//!
//! The capture segment is laid out as a struct of `int` fields, one per
//! state supported on the platform, in declaration order.

use crate::error::{InvokeError, LayoutError};
use crate::layout::{MemoryLayout, ValueLayout};
use crate::memory::MemorySegment;
use core::fmt;

/// Platform status cell that can be captured after a downcall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapturedState {
    Errno,
    /// Windows only
    GetLastError,
    /// Windows only
    WsaGetLastError,
}

impl CapturedState {
    /// States the running platform can capture
    pub const fn supported() -> &'static [CapturedState] {
        if cfg!(windows) {
            &[Self::GetLastError, Self::WsaGetLastError, Self::Errno]
        } else {
            &[Self::Errno]
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        Self::supported().iter().copied().find(|s| s.name() == name)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Errno => "errno",
            Self::GetLastError => "GetLastError",
            Self::WsaGetLastError => "WSAGetLastError",
        }
    }

    /// Byte offset of this state in the capture segment
    pub fn offset(self) -> Option<u64> {
        Self::supported()
            .iter()
            .position(|&s| s == self)
            .map(|i| i as u64 * ValueLayout::INT.byte_size())
    }

    /// Read the cell's current value
    fn read(self) -> i32 {
        match self {
            Self::Errno => errno(),
            Self::GetLastError => last_error(),
            Self::WsaGetLastError => wsa_last_error(),
        }
    }
}

impl fmt::Display for CapturedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of the capture segment
pub fn capture_state_layout() -> Result<MemoryLayout, LayoutError> {
    MemoryLayout::struct_layout(
        CapturedState::supported()
            .iter()
            .map(|s| MemoryLayout::from(ValueLayout::INT.with_name(s.name()))),
    )
}

/// Snapshot of the requested cells
///
/// Taken before any other code can clobber them.
pub(crate) struct StateSnapshot {
    values: [(CapturedState, i32); 3],
    len: usize,
}

impl StateSnapshot {
    #[inline]
    pub(crate) fn take(states: &[CapturedState]) -> Self {
        let mut values = [(CapturedState::Errno, 0); 3];
        let len = states.len().min(values.len());
        for (slot, &state) in values.iter_mut().zip(states) {
            *slot = (state, state.read());
        }
        Self { values, len }
    }

    /// Store the snapshot into a capture segment
    pub(crate) fn write_to(&self, segment: &MemorySegment) -> Result<(), InvokeError> {
        for &(state, value) in &self.values[..self.len] {
            if let Some(offset) = state.offset() {
                segment.set::<i32>(offset, value)?;
            }
        }
        Ok(())
    }
}

/// Check a caller's capture segment before the call is made
pub(crate) fn check_capture_segment(
    segment: &MemorySegment,
    layout: &MemoryLayout,
) -> Result<(), InvokeError> {
    if !segment.is_alive() {
        return Err(crate::error::MemoryError::ScopeClosed.into());
    }
    if segment.byte_size() < layout.byte_size() {
        return Err(InvokeError::InvalidCaptureState {
            reason: format!(
                "segment of {} bytes is smaller than {}",
                segment.byte_size(),
                layout
            ),
        });
    }
    if segment.address() as u64 % layout.byte_alignment() != 0 {
        return Err(InvokeError::InvalidCaptureState {
            reason: format!(
                "address {:#x} is not aligned to {}",
                segment.address(),
                layout.byte_alignment()
            ),
        });
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
fn errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
fn errno() -> i32 {
    unsafe { *libc::__errno() }
}

#[cfg(windows)]
fn errno() -> i32 {
    extern "C" {
        fn _errno() -> *mut i32;
    }
    unsafe { *_errno() }
}

#[cfg(not(any(
    windows,
    target_os = "linux",
    target_os = "android",
    target_os = "emscripten",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(windows)]
fn last_error() -> i32 {
    unsafe { winapi::um::errhandlingapi::GetLastError() as i32 }
}

#[cfg(windows)]
fn wsa_last_error() -> i32 {
    unsafe { winapi::um::winsock2::WSAGetLastError() }
}

#[cfg(not(windows))]
fn last_error() -> i32 {
    0
}

#[cfg(not(windows))]
fn wsa_last_error() -> i32 {
    0
}
