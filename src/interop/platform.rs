//! Platform dispatch - one ABI strategy per supported hardware/OS pair
//!
//! The set of strategies is closed: `PlatformLinker` enumerates them and
//! `PlatformLinker::current()` picks one from the compilation target.

use super::abi::{CallingConvention, CallingSequence};
use super::call::{CallInterface, NativeInvoker};
use super::upcall::UpcallStubFactory;
use crate::descriptor::{FunctionDescriptor, MethodType};
use crate::error::{LayoutViolation, LinkError};
use crate::layout::{ByteOrder, MemoryLayout, ScalarKind, ValueLayout, ADDRESS_SIZE};
use crate::linker::{LayoutValidator, LinkerOptions};
use once_cell::sync::Lazy;
use std::collections::HashSet;

static LP64: Lazy<CanonicalLayouts> =
    Lazy::new(|| CanonicalLayouts::new(ValueLayout::LONG, ValueLayout::LONG, ValueLayout::INT));

static LLP64: Lazy<CanonicalLayouts> =
    Lazy::new(|| CanonicalLayouts::new(ValueLayout::INT, ValueLayout::LONG, ValueLayout::CHAR));

static ILP32: Lazy<CanonicalLayouts> =
    Lazy::new(|| CanonicalLayouts::new(ValueLayout::INT, ValueLayout::INT, ValueLayout::INT));

static CURRENT: Lazy<PlatformLinker> = Lazy::new(PlatformLinker::detect);

/// Scalar layouts a platform accepts, keyed by C type name
#[derive(Debug)]
pub struct CanonicalLayouts {
    by_name: Vec<(&'static str, ValueLayout)>,
    members: HashSet<ValueLayout>,
}

impl CanonicalLayouts {
    fn new(long: ValueLayout, size_t: ValueLayout, wchar_t: ValueLayout) -> Self {
        let by_name = vec![
            ("bool", ValueLayout::BOOL),
            ("char", ValueLayout::BYTE),
            ("short", ValueLayout::SHORT),
            ("int", ValueLayout::INT),
            ("float", ValueLayout::FLOAT),
            ("long", long),
            ("long long", ValueLayout::LONG),
            ("double", ValueLayout::DOUBLE),
            ("void*", ValueLayout::ADDRESS),
            ("size_t", size_t),
            ("wchar_t", wchar_t),
            ("int8_t", ValueLayout::BYTE),
            ("int16_t", ValueLayout::SHORT),
            ("int32_t", ValueLayout::INT),
            ("int64_t", ValueLayout::LONG),
            ("char16_t", ValueLayout::CHAR),
        ];
        let members = by_name.iter().map(|(_, l)| l.clone()).collect();
        Self { by_name, members }
    }

    /// Layout of a C type by name
    pub fn get(&self, name: &str) -> Option<&ValueLayout> {
        self.by_name.iter().find(|(n, _)| *n == name).map(|(_, l)| l)
    }

    /// Check membership of an unnamed, untargeted value layout
    #[inline]
    pub fn contains(&self, layout: &ValueLayout) -> bool {
        self.members.contains(layout)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ValueLayout)> {
        self.by_name.iter().map(|(n, l)| (*n, l))
    }
}

/// Contract every platform strategy implements
pub trait AbiDispatch: Send + Sync {
    fn name(&self) -> &'static str;

    fn canonical_layouts(&self) -> &CanonicalLayouts;

    /// Extra per-member struct rules; the default validates the member normally
    fn check_struct_member(
        &self,
        validator: &LayoutValidator<'_>,
        member: &MemoryLayout,
        offset: u64,
    ) -> Result<(), LayoutViolation> {
        let _ = offset;
        validator.check_recursive(member)
    }

    /// Build an invocable bridge for a validated, normalized signature
    fn arrange_downcall(
        &self,
        method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> Result<NativeInvoker, LinkError>;

    /// Build a reusable stub factory for a validated, normalized signature
    fn arrange_upcall(
        &self,
        method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> Result<UpcallStubFactory, LinkError>;
}

/// Supported ABI strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformLinker {
    SysVx64,
    Windowsx64,
    LinuxAArch64,
    MacOsAArch64,
    WindowsAArch64,
    LinuxRiscv64,
    LinuxPpc64,
    LinuxPpc64le,
    AixPpc64,
    LinuxS390,
    /// Any other target; libffi does all classification
    Fallback,
}

impl PlatformLinker {
    /// Strategy of the running platform, chosen once per process
    #[inline]
    pub fn current() -> Self {
        *CURRENT
    }

    fn detect() -> Self {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Self::Windowsx64
        } else if cfg!(target_arch = "x86_64") {
            Self::SysVx64
        } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            Self::MacOsAArch64
        } else if cfg!(all(target_arch = "aarch64", windows)) {
            Self::WindowsAArch64
        } else if cfg!(all(target_arch = "aarch64", target_os = "linux")) {
            Self::LinuxAArch64
        } else if cfg!(all(target_arch = "riscv64", target_os = "linux")) {
            Self::LinuxRiscv64
        } else if cfg!(all(target_arch = "powerpc64", target_os = "aix")) {
            Self::AixPpc64
        } else if cfg!(all(target_arch = "powerpc64", target_os = "linux", target_endian = "little")) {
            Self::LinuxPpc64le
        } else if cfg!(all(target_arch = "powerpc64", target_os = "linux")) {
            Self::LinuxPpc64
        } else if cfg!(all(target_arch = "s390x", target_os = "linux")) {
            Self::LinuxS390
        } else {
            Self::Fallback
        }
    }

    pub const fn convention(self) -> CallingConvention {
        match self {
            Self::SysVx64 => CallingConvention::SysV,
            Self::Windowsx64 => CallingConvention::Win64,
            Self::LinuxAArch64 => CallingConvention::Aapcs64,
            Self::MacOsAArch64 => CallingConvention::AppleArm64,
            Self::WindowsAArch64 => CallingConvention::WinArm64,
            Self::LinuxRiscv64 => CallingConvention::RiscV64,
            Self::LinuxPpc64 | Self::LinuxPpc64le | Self::AixPpc64 => CallingConvention::PowerPc64,
            Self::LinuxS390 => CallingConvention::S390x,
            Self::Fallback => CallingConvention::Fallback,
        }
    }
}

impl AbiDispatch for PlatformLinker {
    fn name(&self) -> &'static str {
        match self {
            Self::SysVx64 => "sysv-x64",
            Self::Windowsx64 => "windows-x64",
            Self::LinuxAArch64 => "linux-aarch64",
            Self::MacOsAArch64 => "macos-aarch64",
            Self::WindowsAArch64 => "windows-aarch64",
            Self::LinuxRiscv64 => "linux-riscv64",
            Self::LinuxPpc64 => "linux-ppc64",
            Self::LinuxPpc64le => "linux-ppc64le",
            Self::AixPpc64 => "aix-ppc64",
            Self::LinuxS390 => "linux-s390x",
            Self::Fallback => "fallback",
        }
    }

    fn canonical_layouts(&self) -> &CanonicalLayouts {
        match self {
            Self::Windowsx64 | Self::WindowsAArch64 => &*LLP64,
            Self::Fallback if ADDRESS_SIZE == 4 => &*ILP32,
            Self::Fallback if cfg!(windows) => &*LLP64,
            _ => &*LP64,
        }
    }

    fn check_struct_member(
        &self,
        validator: &LayoutValidator<'_>,
        member: &MemoryLayout,
        offset: u64,
    ) -> Result<(), LayoutViolation> {
        // AIX packs doubles after the first member to 4 bytes (power alignment)
        if let (Self::AixPpc64, MemoryLayout::Value(v)) = (self, member) {
            if offset % 8 != 0 && v.kind() == ScalarKind::Double {
                if v.byte_alignment() != 4 {
                    return Err(LayoutViolation::StructMember {
                        member: member.to_string(),
                        offset,
                        reason: "should be 4-byte aligned",
                    });
                }
                if v.order() != ByteOrder::native() {
                    return Err(LayoutViolation::StructMember {
                        member: member.to_string(),
                        offset,
                        reason: "has an unexpected byte order",
                    });
                }
                return Ok(());
            }
        }
        validator.check_recursive(member)
    }

    fn arrange_downcall(
        &self,
        method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> Result<NativeInvoker, LinkError> {
        let fixed = options.first_variadic_index();
        let sequence = CallingSequence::compute(self.convention(), descriptor, fixed);
        let interface = CallInterface::prepare(descriptor, fixed)?;
        Ok(NativeInvoker::new(
            interface,
            descriptor.clone(),
            method_type.clone(),
            sequence,
            options.captured_states().to_vec(),
            options.is_critical(),
        ))
    }

    fn arrange_upcall(
        &self,
        _method_type: &MethodType,
        descriptor: &FunctionDescriptor,
        _options: &LinkerOptions,
    ) -> Result<UpcallStubFactory, LinkError> {
        let sequence = CallingSequence::compute(self.convention(), descriptor, None);
        let interface = CallInterface::prepare(descriptor, None)?;
        Ok(UpcallStubFactory::new(interface, descriptor.clone(), sequence))
    }
}
