//! Descriptor normalization - drop names so equal shapes share one linkage

use crate::descriptor::FunctionDescriptor;
use crate::layout::MemoryLayout;

/// Strip every layout name in a descriptor
#[inline]
pub fn normalize(descriptor: &FunctionDescriptor) -> FunctionDescriptor {
    descriptor.map_layouts(strip_names)
}

/// Strip names recursively, address targets included
///
/// Sizes, alignments and byte orders carry over unchanged.
pub fn strip_names(layout: &MemoryLayout) -> MemoryLayout {
    match layout {
        MemoryLayout::Value(v) => v.clone().without_name().map_target(strip_names).into(),
        MemoryLayout::Padding(_) => layout.clone().without_name(),
        MemoryLayout::Struct(g) => MemoryLayout::Struct(g.map_members(strip_names)).without_name(),
        MemoryLayout::Union(g) => MemoryLayout::Union(g.map_members(strip_names)).without_name(),
        MemoryLayout::Sequence(s) => MemoryLayout::Sequence(s.map_element(strip_names)).without_name(),
    }
}
