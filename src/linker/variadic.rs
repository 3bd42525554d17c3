//! Variadic argument policy
//!
//! C promotes variadic arguments narrower than `int` to `int` and `float` to
//! `double`. Signedness of the narrow layouts cannot be expressed, so they
//! are refused instead of being silently sign-extended.

use super::options::LinkerOptions;
use crate::descriptor::FunctionDescriptor;
use crate::error::LinkError;
use crate::layout::{MemoryLayout, ValueLayout};

const PROMOTED: [ValueLayout; 5] = [
    ValueLayout::BOOL,
    ValueLayout::BYTE,
    ValueLayout::CHAR,
    ValueLayout::SHORT,
    ValueLayout::FLOAT,
];

/// Reject promoted layouts in the variadic tail of a normalized descriptor
pub fn check_variadic_layouts(
    descriptor: &FunctionDescriptor,
    options: &LinkerOptions,
) -> Result<(), LinkError> {
    let Some(first) = options.first_variadic_index() else {
        return Ok(());
    };
    let args = descriptor.argument_layouts();
    for (index, layout) in args.iter().enumerate().skip(first) {
        if let MemoryLayout::Value(v) = layout {
            if PROMOTED.contains(v) {
                return Err(LinkError::UnsupportedVariadicArgument {
                    index,
                    layout: layout.to_string(),
                });
            }
        }
    }
    Ok(())
}
