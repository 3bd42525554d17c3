//! ABI (Application Binary Interface) classification
//!
//! Computes, per calling convention, where each argument of a signature
//! lands: integer register, floating-point register, stack slot, or a
//! reference to a caller-made copy. The machine-level moves themselves are
//! performed by libffi; the sequence is kept on every artifact for
//! diagnostics and tracing.

use crate::descriptor::FunctionDescriptor;
use crate::layout::{MemoryLayout, ScalarKind, ADDRESS_SIZE};
use core::fmt;

/// Calling convention of a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallingConvention {
    /// System V AMD64 ABI (Unix x86-64)
    SysV,
    /// Microsoft x64 calling convention (Windows)
    Win64,
    /// AAPCS64 (Linux AArch64)
    Aapcs64,
    /// Apple's AAPCS64 variant (variadic arguments always on the stack)
    AppleArm64,
    /// Windows on ARM64 (variadic floats in integer registers)
    WinArm64,
    /// RISC-V LP64D
    RiscV64,
    /// PowerPC64 (ELFv1/ELFv2 and AIX)
    PowerPc64,
    /// s390x ELF ABI
    S390x,
    /// No classification; libffi decides everything
    Fallback,
}

impl CallingConvention {
    /// Get platform default
    #[inline]
    pub const fn default() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
        return Self::Win64;

        #[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
        return Self::SysV;

        #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
        return Self::AppleArm64;

        #[cfg(all(target_arch = "aarch64", target_os = "windows"))]
        return Self::WinArm64;

        #[cfg(all(
            target_arch = "aarch64",
            not(target_vendor = "apple"),
            not(target_os = "windows")
        ))]
        return Self::Aapcs64;

        #[cfg(target_arch = "riscv64")]
        return Self::RiscV64;

        #[cfg(target_arch = "powerpc64")]
        return Self::PowerPc64;

        #[cfg(target_arch = "s390x")]
        return Self::S390x;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "riscv64",
            target_arch = "powerpc64",
            target_arch = "s390x"
        )))]
        return Self::Fallback;
    }

    /// Integer argument registers
    #[inline]
    pub const fn max_int_registers(self) -> u8 {
        match self {
            Self::SysV => 6,  // RDI, RSI, RDX, RCX, R8, R9
            Self::Win64 => 4, // RCX, RDX, R8, R9
            Self::Aapcs64 | Self::AppleArm64 | Self::WinArm64 => 8, // X0-X7
            Self::RiscV64 => 8,   // a0-a7
            Self::PowerPc64 => 8, // r3-r10
            Self::S390x => 5,     // r2-r6
            Self::Fallback => 0,
        }
    }

    /// Floating-point argument registers
    #[inline]
    pub const fn max_float_registers(self) -> u8 {
        match self {
            Self::SysV => 8, // XMM0-XMM7
            Self::Win64 => 4,
            Self::Aapcs64 | Self::AppleArm64 | Self::WinArm64 => 8, // V0-V7
            Self::RiscV64 => 8,    // fa0-fa7
            Self::PowerPc64 => 13, // f1-f13
            Self::S390x => 4,      // f0, f2, f4, f6
            Self::Fallback => 0,
        }
    }

    /// Win64 assigns one positional slot per argument, shared by both classes
    #[inline]
    const fn positional(self) -> bool {
        matches!(self, Self::Win64)
    }

    /// PowerPC floats also consume the matching integer slot
    #[inline]
    const fn floats_shadow_ints(self) -> bool {
        matches!(self, Self::PowerPc64)
    }

    /// Largest aggregate passed in registers by value
    #[inline]
    const fn max_register_aggregate(self) -> u64 {
        match self {
            Self::SysV | Self::Aapcs64 | Self::AppleArm64 | Self::WinArm64 | Self::RiscV64 => 16,
            Self::Win64 | Self::S390x => 8,
            Self::PowerPc64 => 64,
            Self::Fallback => 0,
        }
    }

    /// Homogeneous float aggregate member limit (0 = no HFA rule)
    #[inline]
    const fn hfa_limit(self) -> usize {
        match self {
            Self::Aapcs64 | Self::AppleArm64 | Self::WinArm64 => 4,
            Self::PowerPc64 => 8,
            Self::RiscV64 => 2,
            _ => 0,
        }
    }

    /// AArch64 passes the indirect result address in x8, outside the argument registers
    #[inline]
    const fn has_indirect_result_register(self) -> bool {
        matches!(self, Self::Aapcs64 | Self::AppleArm64 | Self::WinArm64)
    }
}

impl Default for CallingConvention {
    #[inline]
    fn default() -> Self {
        Self::default()
    }
}

/// Where one argument (or a piece of it) is passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentLocation {
    /// Integer register, numbered from the first argument register
    Int(u8),
    /// Floating-point register
    Float(u8),
    /// Byte offset into the outgoing stack area
    Stack(u64),
    /// Aggregate spread over several locations
    Split(Vec<ArgumentLocation>),
    /// Pointer to a caller-made copy, passed at the inner location
    Reference(Box<ArgumentLocation>),
    /// Classification left to the native backend
    Delegated,
}

impl fmt::Display for ArgumentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "r{}", n),
            Self::Float(n) => write!(f, "f{}", n),
            Self::Stack(off) => write!(f, "stack+{}", off),
            Self::Split(parts) => {
                f.write_str("{")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str("}")
            }
            Self::Reference(inner) => write!(f, "&{}", inner),
            Self::Delegated => f.write_str("?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentBinding {
    pub index: usize,
    pub location: ArgumentLocation,
}

/// Register/stack assignment for a whole signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingSequence {
    convention: CallingConvention,
    arguments: Vec<ArgumentBinding>,
    return_in_memory: bool,
    stack_bytes: u64,
}

impl CallingSequence {
    /// Classify `descriptor` under `convention`
    ///
    /// Arguments from `first_variadic` on follow the convention's variadic rules.
    pub fn compute(
        convention: CallingConvention,
        descriptor: &FunctionDescriptor,
        first_variadic: Option<usize>,
    ) -> Self {
        let mut allocator = RegisterAllocator::new(convention);

        let return_in_memory = descriptor
            .return_layout()
            .map_or(false, |ret| returns_in_memory(convention, ret));
        if return_in_memory && !convention.has_indirect_result_register() {
            // Hidden result pointer takes the first integer register
            allocator.next_int();
        }

        let arguments = descriptor
            .argument_layouts()
            .iter()
            .enumerate()
            .map(|(index, layout)| {
                let variadic = first_variadic.map_or(false, |first| index >= first);
                ArgumentBinding {
                    index,
                    location: allocator.classify(layout, variadic),
                }
            })
            .collect();

        Self {
            convention,
            arguments,
            return_in_memory,
            stack_bytes: allocator.stack_offset,
        }
    }

    #[inline]
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn arguments(&self) -> &[ArgumentBinding] {
        &self.arguments
    }

    pub fn location(&self, index: usize) -> Option<&ArgumentLocation> {
        self.arguments.get(index).map(|b| &b.location)
    }

    /// Check if the return value goes through a hidden result pointer
    #[inline]
    pub fn return_in_memory(&self) -> bool {
        self.return_in_memory
    }

    /// Bytes of outgoing stack arguments
    #[inline]
    pub fn stack_bytes(&self) -> u64 {
        self.stack_bytes
    }
}

impl fmt::Display for CallingSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(", self.convention)?;
        for (i, b) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", b.index, b.location)?;
        }
        f.write_str(")")?;
        if self.return_in_memory {
            f.write_str(" ret=mem")?;
        }
        Ok(())
    }
}

/// Register allocation strategy for function calls
pub struct RegisterAllocator {
    convention: CallingConvention,
    int_regs_used: u8,
    fp_regs_used: u8,
    stack_offset: u64,
}

impl RegisterAllocator {
    /// Create allocator for calling convention
    #[inline]
    pub const fn new(convention: CallingConvention) -> Self {
        Self {
            convention,
            int_regs_used: 0,
            fp_regs_used: 0,
            stack_offset: 0,
        }
    }

    /// Check if `count` more registers of a class are available
    #[inline]
    pub fn can_use_registers(&self, is_float: bool, count: u8) -> bool {
        if self.convention.positional() {
            // One shared slot counter
            return self.int_regs_used + count <= self.convention.max_int_registers();
        }
        if is_float {
            self.fp_regs_used + count <= self.convention.max_float_registers()
        } else {
            self.int_regs_used + count <= self.convention.max_int_registers()
        }
    }

    /// Reset for new call
    #[inline]
    pub fn reset(&mut self) {
        self.int_regs_used = 0;
        self.fp_regs_used = 0;
        self.stack_offset = 0;
    }

    fn next_int(&mut self) -> ArgumentLocation {
        if self.can_use_registers(false, 1) {
            let reg = self.int_regs_used;
            self.int_regs_used += 1;
            if self.convention.positional() {
                self.fp_regs_used = self.int_regs_used;
            }
            ArgumentLocation::Int(reg)
        } else {
            self.next_stack(ADDRESS_SIZE, ADDRESS_SIZE)
        }
    }

    fn next_float(&mut self) -> ArgumentLocation {
        if self.convention.positional() {
            if self.can_use_registers(true, 1) {
                let reg = self.int_regs_used;
                self.int_regs_used += 1;
                self.fp_regs_used = self.int_regs_used;
                return ArgumentLocation::Float(reg);
            }
            return self.next_stack(ADDRESS_SIZE, ADDRESS_SIZE);
        }
        if self.can_use_registers(true, 1) {
            let reg = self.fp_regs_used;
            self.fp_regs_used += 1;
            if self.convention.floats_shadow_ints() && self.can_use_registers(false, 1) {
                self.int_regs_used += 1;
            }
            ArgumentLocation::Float(reg)
        } else {
            self.next_stack(ADDRESS_SIZE, ADDRESS_SIZE)
        }
    }

    fn next_stack(&mut self, size: u64, alignment: u64) -> ArgumentLocation {
        let slot = ADDRESS_SIZE.max(alignment.min(16));
        let offset = crate::layout::align_up(self.stack_offset, slot);
        self.stack_offset = offset + crate::layout::align_up(size.max(1), ADDRESS_SIZE);
        ArgumentLocation::Stack(offset)
    }

    fn classify(&mut self, layout: &MemoryLayout, variadic: bool) -> ArgumentLocation {
        use CallingConvention::*;

        if self.convention == Fallback {
            return ArgumentLocation::Delegated;
        }
        if variadic && self.convention == AppleArm64 {
            return self.next_stack(layout.byte_size(), layout.byte_alignment());
        }
        // Variadic floats travel in integer registers on these conventions
        let floats_as_ints = variadic && matches!(self.convention, Win64 | WinArm64 | RiscV64);

        match layout {
            MemoryLayout::Value(v) => {
                if v.kind().is_float() && !floats_as_ints {
                    self.next_float()
                } else {
                    self.next_int()
                }
            }
            _ => self.classify_aggregate(layout, variadic),
        }
    }

    fn classify_aggregate(&mut self, layout: &MemoryLayout, variadic: bool) -> ArgumentLocation {
        use CallingConvention::*;

        let size = layout.byte_size();
        let mut scalars = Vec::new();
        flatten(layout, 0, &mut scalars);

        if let Some(count) = homogeneous_float_count(self.convention, layout, &scalars) {
            if !variadic && self.can_use_registers(true, count) {
                return ArgumentLocation::Split((0..count).map(|_| self.next_float()).collect());
            }
        }

        match self.convention {
            Win64 => {
                if matches!(size, 1 | 2 | 4 | 8) {
                    self.next_int()
                } else {
                    ArgumentLocation::Reference(Box::new(self.next_int()))
                }
            }
            S390x => {
                if matches!(size, 1 | 2 | 4 | 8) {
                    match scalars.as_slice() {
                        [(_, kind)] if kind.is_float() => self.next_float(),
                        _ => self.next_int(),
                    }
                } else {
                    ArgumentLocation::Reference(Box::new(self.next_int()))
                }
            }
            SysV => {
                if size > self.convention.max_register_aggregate() {
                    return self.next_stack(size, layout.byte_alignment());
                }
                let classes = eightbyte_classes(size, &scalars);
                let floats = classes.iter().filter(|&&f| f).count() as u8;
                let ints = classes.len() as u8 - floats;
                if self.can_use_registers(true, floats) && self.can_use_registers(false, ints) {
                    let parts = classes
                        .iter()
                        .map(|&is_float| {
                            if is_float {
                                self.next_float()
                            } else {
                                self.next_int()
                            }
                        })
                        .collect();
                    ArgumentLocation::Split(parts)
                } else {
                    self.next_stack(size, layout.byte_alignment())
                }
            }
            _ => {
                if size > self.convention.max_register_aggregate() {
                    return ArgumentLocation::Reference(Box::new(self.next_int()));
                }
                let words = ((size + ADDRESS_SIZE - 1) / ADDRESS_SIZE) as u8;
                if self.can_use_registers(false, words) {
                    ArgumentLocation::Split((0..words).map(|_| self.next_int()).collect())
                } else {
                    // NGRN is exhausted once an aggregate spills
                    self.int_regs_used = self.convention.max_int_registers();
                    self.next_stack(size, layout.byte_alignment())
                }
            }
        }
    }
}

fn returns_in_memory(convention: CallingConvention, ret: &MemoryLayout) -> bool {
    use CallingConvention::*;

    if !ret.is_group() {
        return false;
    }
    let size = ret.byte_size();
    let mut scalars = Vec::new();
    flatten(ret, 0, &mut scalars);
    if homogeneous_float_count(convention, ret, &scalars).is_some() {
        return false;
    }
    match convention {
        Win64 | S390x => !matches!(size, 1 | 2 | 4 | 8),
        PowerPc64 => size > 16,
        Fallback => false,
        _ => size > convention.max_register_aggregate(),
    }
}

/// Scalars of an aggregate with their byte offsets
fn flatten(layout: &MemoryLayout, base: u64, out: &mut Vec<(u64, ScalarKind)>) {
    match layout {
        MemoryLayout::Value(v) => out.push((base, v.kind())),
        MemoryLayout::Padding(_) => {}
        MemoryLayout::Struct(g) => {
            let mut offset = base;
            for member in g.members() {
                flatten(member, offset, out);
                offset += member.byte_size();
            }
        }
        MemoryLayout::Union(g) => {
            for member in g.members() {
                flatten(member, base, out);
            }
        }
        MemoryLayout::Sequence(s) => {
            let size = s.element_layout().byte_size();
            for i in 0..s.element_count() {
                flatten(s.element_layout(), base + i * size, out);
            }
        }
    }
}

/// Member count of a homogeneous float aggregate, if `layout` is one
fn homogeneous_float_count(
    convention: CallingConvention,
    layout: &MemoryLayout,
    scalars: &[(u64, ScalarKind)],
) -> Option<u8> {
    let limit = convention.hfa_limit();
    let (_, first) = scalars.first()?;
    if limit == 0 || !first.is_float() || scalars.len() > limit {
        return None;
    }
    let homogeneous = scalars.iter().all(|(_, kind)| kind == first);
    let dense = scalars.len() as u64 * first.size() == layout.byte_size();
    (homogeneous && dense && !matches!(layout, MemoryLayout::Union(_))).then(|| scalars.len() as u8)
}

/// SysV eightbyte classes: `true` for SSE, `false` for INTEGER
fn eightbyte_classes(size: u64, scalars: &[(u64, ScalarKind)]) -> Vec<bool> {
    let count = ((size + 7) / 8) as usize;
    (0..count)
        .map(|i| {
            let mut in_chunk = scalars.iter().filter(|(off, _)| (*off / 8) as usize == i).peekable();
            in_chunk.peek().is_some() && in_chunk.all(|(_, kind)| kind.is_float())
        })
        .collect()
}
