//! Downcall handles - cached artifacts bound (or not) to a native target

use crate::descriptor::{FunctionDescriptor, MethodType};
use crate::error::{InvokeError, LinkError};
use crate::interop::{
    capture_state_layout, check_capture_segment, group_return_storage, CallingSequence,
    CapturedState, NativeInvoker, Value,
};
use crate::layout::MemoryLayout;
use crate::memory::{MemorySegment, SegmentAllocator};
use std::sync::Arc;

/// Cached result of a downcall linkage request
///
/// Wraps the platform invoker with the checks every call needs: the capture
/// segment shape and caller-provided storage for struct returns.
#[derive(Debug)]
pub struct DowncallArtifact {
    invoker: NativeInvoker,
    capture_layout: Option<MemoryLayout>,
    requires_allocator: bool,
}

impl DowncallArtifact {
    pub(crate) fn new(invoker: NativeInvoker) -> Result<Self, LinkError> {
        let capture_layout = if invoker.captured_states().is_empty() {
            None
        } else {
            Some(capture_state_layout()?)
        };
        let requires_allocator = invoker.descriptor().returns_group();
        Ok(Self {
            invoker,
            capture_layout,
            requires_allocator,
        })
    }

    pub fn invoker(&self) -> &NativeInvoker {
        &self.invoker
    }

    /// Layout the capture segment must satisfy, if the artifact captures state
    pub fn capture_layout(&self) -> Option<&MemoryLayout> {
        self.capture_layout.as_ref()
    }

    #[inline]
    pub fn requires_allocator(&self) -> bool {
        self.requires_allocator
    }
}

/// Per-call resources a handle may need
#[derive(Default, Clone, Copy)]
pub struct CallContext<'a> {
    allocator: Option<&'a dyn SegmentAllocator>,
    capture_state: Option<&'a MemorySegment>,
}

impl<'a> CallContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage for struct and union return values
    pub fn with_allocator(mut self, allocator: &'a dyn SegmentAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Segment receiving captured call state
    pub fn with_capture_state(mut self, segment: &'a MemorySegment) -> Self {
        self.capture_state = Some(segment);
        self
    }
}

/// Invocable native call bridge
///
/// Handles linked from equal (name-insensitive) requests share one artifact.
#[derive(Debug, Clone)]
pub struct DowncallHandle {
    artifact: Arc<DowncallArtifact>,
    target: Option<usize>,
}

impl DowncallHandle {
    pub(crate) fn unbound(artifact: Arc<DowncallArtifact>) -> Self {
        Self {
            artifact,
            target: None,
        }
    }

    /// Bind a native address so calls no longer pass it
    pub fn bind(&self, symbol: *const ()) -> Result<Self, InvokeError> {
        if symbol.is_null() {
            return Err(InvokeError::NullTarget);
        }
        Ok(Self {
            artifact: self.artifact.clone(),
            target: Some(symbol as usize),
        })
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Check if both handles came from the same linkage
    pub fn shares_artifact(&self, other: &DowncallHandle) -> bool {
        Arc::ptr_eq(&self.artifact, &other.artifact)
    }

    pub fn artifact(&self) -> &Arc<DowncallArtifact> {
        &self.artifact
    }

    /// Native calling shape; an unbound handle additionally takes the target first
    pub fn method_type(&self) -> &MethodType {
        self.artifact.invoker.method_type()
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        self.artifact.invoker.descriptor()
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        self.artifact.invoker.calling_sequence()
    }

    pub fn captured_states(&self) -> &[CapturedState] {
        self.artifact.invoker.captured_states()
    }

    /// Call with no allocator and no capture segment
    ///
    /// # Safety
    /// See [`DowncallHandle::invoke_with`].
    pub unsafe fn invoke(&self, args: &[Value]) -> Result<Value, InvokeError> {
        self.invoke_with(&CallContext::default(), args)
    }

    /// Call the native function
    ///
    /// An unbound handle takes the target address (an `Address` or a
    /// `Segment`) as its first argument. Struct returns are written into
    /// memory from `ctx`'s allocator and returned as a `Segment`.
    ///
    /// # Safety
    /// The target must be a native function matching the descriptor, and
    /// every address argument must be valid for what that function does
    /// with it.
    pub unsafe fn invoke_with(
        &self,
        ctx: &CallContext<'_>,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        let (target, args) = match self.target {
            Some(target) => (target, args),
            None => {
                let (first, rest) = args.split_first().ok_or(InvokeError::ArgCountMismatch {
                    expected: self.descriptor().argument_layouts().len() + 1,
                    got: 0,
                })?;
                let target = first.as_address().ok_or_else(|| InvokeError::ArgumentType {
                    index: 0,
                    expected: "address".to_string(),
                    found: first.type_name().to_string(),
                })?;
                (target, rest)
            }
        };
        if target == 0 {
            return Err(InvokeError::NullTarget);
        }

        let capture = match &self.artifact.capture_layout {
            Some(layout) => {
                let segment = ctx.capture_state.ok_or(InvokeError::MissingCaptureState)?;
                check_capture_segment(segment, layout)?;
                Some(segment)
            }
            None => None,
        };

        let ret_segment = match (self.artifact.requires_allocator, self.descriptor().return_layout()) {
            (true, Some(layout)) => {
                let allocator = ctx.allocator.ok_or(InvokeError::MissingAllocator)?;
                Some(group_return_storage(layout, allocator)?)
            }
            _ => None,
        };

        self.artifact
            .invoker
            .invoke(target, args, ret_segment.as_ref(), capture)
    }
}
