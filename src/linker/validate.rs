//! Layout validation - structural soundness of layouts crossing the boundary
//!
//! Depth-first, parent before children: a struct's member offsets are checked
//! before its members are descended into, so the outermost defect is the one
//! reported.

use crate::descriptor::FunctionDescriptor;
use crate::error::LayoutViolation;
use crate::interop::AbiDispatch;
use crate::layout::{align_up, GroupLayout, MemoryLayout, SequenceLayout, ValueLayout};

/// Recursive layout checker bound to one platform's rules
pub struct LayoutValidator<'a> {
    abi: &'a dyn AbiDispatch,
}

impl<'a> LayoutValidator<'a> {
    pub fn new(abi: &'a dyn AbiDispatch) -> Self {
        Self { abi }
    }

    /// Check the return layout, then every argument layout
    pub fn check_descriptor(&self, descriptor: &FunctionDescriptor) -> Result<(), LayoutViolation> {
        if let Some(ret) = descriptor.return_layout() {
            self.check_layout(ret)?;
        }
        descriptor
            .argument_layouts()
            .iter()
            .try_for_each(|layout| self.check_layout(layout))
    }

    /// Check a single argument or return layout
    ///
    /// Padding never reaches here; descriptors refuse it at construction.
    pub fn check_layout(&self, layout: &MemoryLayout) -> Result<(), LayoutViolation> {
        if let MemoryLayout::Sequence(_) = layout {
            return Err(LayoutViolation::TopLevelSequence {
                layout: layout.to_string(),
            });
        }
        self.check_recursive(layout)
    }

    /// Check a layout at any depth
    pub fn check_recursive(&self, layout: &MemoryLayout) -> Result<(), LayoutViolation> {
        match layout {
            MemoryLayout::Value(v) => self.check_supported(v),
            MemoryLayout::Padding(_) => Ok(()),
            MemoryLayout::Struct(group) => self.check_struct(layout, group),
            MemoryLayout::Union(group) => self.check_union(layout, group),
            MemoryLayout::Sequence(seq) => self.check_sequence(layout, seq),
        }
    }

    fn check_supported(&self, value: &ValueLayout) -> Result<(), LayoutViolation> {
        let bare = value.clone().without_name().without_target_layout();
        if self.abi.canonical_layouts().contains(&bare) {
            Ok(())
        } else {
            Err(LayoutViolation::Unsupported {
                layout: bare.to_string(),
            })
        }
    }

    fn check_struct(&self, layout: &MemoryLayout, group: &GroupLayout) -> Result<(), LayoutViolation> {
        check_natural_alignment(layout)?;

        let mut offset = 0u64;
        let mut last_unpadded = 0u64;
        let mut preceding_padding: Option<&MemoryLayout> = None;

        for (index, member) in group.members().iter().enumerate() {
            let expected = align_up(last_unpadded, member.byte_alignment());
            if expected != offset {
                return Err(LayoutViolation::UnexpectedOffset {
                    parent: layout.to_string(),
                    member: member.to_string(),
                    index,
                    found: offset,
                    expected,
                });
            }
            self.abi.check_struct_member(self, member, offset)?;

            offset += member.byte_size();
            if member.is_padding() {
                if let Some(preceding) = preceding_padding {
                    return Err(LayoutViolation::ConsecutivePadding {
                        parent: layout.to_string(),
                        padding: member.to_string(),
                        preceding: preceding.to_string(),
                    });
                }
                preceding_padding = Some(member);
            } else {
                last_unpadded = offset;
                preceding_padding = None;
            }
        }

        let members = group.members();
        if !members.is_empty() && members.iter().all(MemoryLayout::is_padding) {
            return Err(LayoutViolation::OnlyPadding {
                layout: layout.to_string(),
            });
        }
        check_group_size(layout, group, last_unpadded)
    }

    fn check_union(&self, layout: &MemoryLayout, group: &GroupLayout) -> Result<(), LayoutViolation> {
        check_natural_alignment(layout)?;

        let max_unpadded = group
            .members()
            .iter()
            .filter(|m| !m.is_padding())
            .map(MemoryLayout::byte_size)
            .max()
            .unwrap_or(0);

        let mut has_padding = false;
        for member in group.members() {
            self.check_recursive(member)?;
            if member.is_padding() {
                if has_padding {
                    return Err(LayoutViolation::MultiplePadding {
                        parent: layout.to_string(),
                    });
                }
                has_padding = true;
                if member.byte_size() <= max_unpadded {
                    return Err(LayoutViolation::SuperfluousPadding {
                        parent: layout.to_string(),
                        padding: member.to_string(),
                    });
                }
            }
        }
        check_group_size(layout, group, max_unpadded)
    }

    fn check_sequence(&self, layout: &MemoryLayout, seq: &SequenceLayout) -> Result<(), LayoutViolation> {
        check_natural_alignment(layout)?;
        let element = seq.element_layout();
        if element.is_padding() {
            return Err(LayoutViolation::PaddingSequence {
                parent: layout.to_string(),
                element: element.to_string(),
            });
        }
        self.check_recursive(element)
    }
}

fn check_natural_alignment(layout: &MemoryLayout) -> Result<(), LayoutViolation> {
    if layout.has_natural_alignment() {
        Ok(())
    } else {
        Err(LayoutViolation::UnnaturalAlignment {
            layout: layout.to_string(),
        })
    }
}

/// Trailing padding must be exactly the rounding gap
fn check_group_size(
    layout: &MemoryLayout,
    group: &GroupLayout,
    unpadded_extent: u64,
) -> Result<(), LayoutViolation> {
    let expected = align_up(unpadded_extent, group.byte_alignment());
    if group.byte_size() == expected {
        Ok(())
    } else {
        Err(LayoutViolation::UnexpectedSize {
            layout: layout.to_string(),
            found: group.byte_size(),
            expected,
        })
    }
}
