//! Link options - per-request toggles that take part in linkage identity

use crate::descriptor::FunctionDescriptor;
use crate::error::LinkError;
use crate::interop::CapturedState;
use core::fmt;

/// A single linker option as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkOption {
    /// Arguments from this index on are passed as variadic arguments
    FirstVariadicArg(usize),
    /// Save platform status cells into a caller-supplied segment after the call
    CaptureCallState(Vec<CapturedState>),
    /// Trivial native function: no upcalls, no per-call bookkeeping
    Critical { allow_heap_access: bool },
}

impl LinkOption {
    pub fn first_variadic_arg(index: usize) -> Self {
        Self::FirstVariadicArg(index)
    }

    /// Capture the named states (`errno`, and on Windows `GetLastError`, `WSAGetLastError`)
    pub fn capture_call_state<'a, I>(names: I) -> Result<Self, LinkError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut states = names
            .into_iter()
            .map(|name| {
                CapturedState::by_name(name).ok_or_else(|| LinkError::InvalidOption {
                    reason: format!(
                        "unknown name '{}', supported: {}",
                        name,
                        supported_names()
                    ),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        states.sort_unstable();
        states.dedup();
        Ok(Self::CaptureCallState(states))
    }

    pub fn critical(allow_heap_access: bool) -> Self {
        Self::Critical { allow_heap_access }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::FirstVariadicArg(_) => "firstVariadicArg",
            Self::CaptureCallState(_) => "captureCallState",
            Self::Critical { .. } => "critical",
        }
    }
}

impl fmt::Display for LinkOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstVariadicArg(index) => write!(f, "firstVariadicArg({})", index),
            Self::CaptureCallState(states) => {
                f.write_str("captureCallState(")?;
                for (i, s) in states.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", s)?;
                }
                f.write_str(")")
            }
            Self::Critical { allow_heap_access } => write!(f, "critical({})", allow_heap_access),
        }
    }
}

fn supported_names() -> String {
    CapturedState::supported()
        .iter()
        .map(|s| s.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parsed, duplicate-free option set
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LinkerOptions {
    first_variadic: Option<usize>,
    captures: Option<Vec<CapturedState>>,
    critical: Option<bool>,
}

impl LinkerOptions {
    /// No options
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse options for a downcall to `descriptor`
    pub fn for_downcall(
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<Self, LinkError> {
        let mut parsed = Self::default();
        for (i, option) in options.iter().enumerate() {
            if options[..i].iter().any(|o| o.kind() == option.kind()) {
                return Err(LinkError::InvalidOption {
                    reason: format!("duplicate option: {}", option),
                });
            }
            match option {
                LinkOption::FirstVariadicArg(index) => {
                    let count = descriptor.argument_layouts().len();
                    if *index > count {
                        return Err(LinkError::InvalidOption {
                            reason: format!(
                                "index '{}' not in bounds for descriptor with {} arguments",
                                index, count
                            ),
                        });
                    }
                    parsed.first_variadic = Some(*index);
                }
                LinkOption::CaptureCallState(states) => parsed.captures = Some(states.clone()),
                LinkOption::Critical { allow_heap_access } => parsed.critical = Some(*allow_heap_access),
            }
        }
        Ok(parsed)
    }

    /// Upcalls accept no options
    pub fn for_upcall(
        _descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<Self, LinkError> {
        match options.first() {
            Some(option) => Err(LinkError::InvalidOption {
                reason: format!("not supported for upcall: {}", option),
            }),
            None => Ok(Self::default()),
        }
    }

    #[inline]
    pub fn first_variadic_index(&self) -> Option<usize> {
        self.first_variadic
    }

    /// Requested states; empty when nothing is captured
    pub fn captured_states(&self) -> &[CapturedState] {
        self.captures.as_deref().unwrap_or(&[])
    }

    /// Check if any state is captured (an empty capture request captures nothing)
    #[inline]
    pub fn has_captured_call_state(&self) -> bool {
        !self.captured_states().is_empty()
    }

    #[inline]
    pub fn is_critical(&self) -> bool {
        self.critical.is_some()
    }
}
