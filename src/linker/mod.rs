//! Linkage engine - validated, normalized, cached native linkage
//!
//! Design: every request runs the same pipeline:
//! 1. Native access check (before anything else)
//! 2. Layout validation against the platform's rules
//! 3. Name stripping, so equal shapes share one cache entry
//! 4. Option parsing and the variadic policy
//! 5. Cache lookup, dispatching to the platform strategy on a miss
//!
//! Architecture:
//! - `validate.rs` - Recursive layout validator
//! - `normalize.rs` - Name stripping
//! - `variadic.rs` - Variadic argument policy
//! - `options.rs` - Link options
//! - `cache.rs` - Single-flight reclaimable cache
//! - `handle.rs` - Downcall artifacts and handles

mod cache;
mod handle;
mod normalize;
mod options;
mod validate;
mod variadic;

#[cfg(test)]
mod tests;

pub use cache::{CacheStats, LinkCache};
pub use handle::{CallContext, DowncallArtifact, DowncallHandle};
pub use normalize::{normalize, strip_names};
pub use options::{LinkOption, LinkerOptions};
pub use validate::LayoutValidator;
pub use variadic::check_variadic_layouts;

use crate::access::NativeAccess;
use crate::config::LinkerConfig;
use crate::descriptor::FunctionDescriptor;
use crate::error::LinkError;
use crate::interop::{AbiDispatch, CanonicalLayouts, PlatformLinker, UpcallStubFactory, UpcallTarget};
use crate::logging;
use crate::memory::{Arena, MemorySegment};
use once_cell::sync::Lazy;
use std::panic::Location;
use std::sync::Arc;

static NATIVE_LINKER: Lazy<Linker> = Lazy::new(|| {
    let config = LinkerConfig::discover().with_env_overrides();
    Linker::with_config(PlatformLinker::current(), &config)
});

/// Process-wide linker for the running platform
///
/// Configured from `.typthon-link.toml` and the environment on first use.
pub fn native_linker() -> &'static Linker {
    &NATIVE_LINKER
}

/// Cache key: a normalized descriptor with its parsed options
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkRequest {
    descriptor: FunctionDescriptor,
    options: LinkerOptions,
}

impl LinkRequest {
    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &LinkerOptions {
        &self.options
    }
}

/// Linkage engine over one ABI strategy
pub struct Linker<A: AbiDispatch = PlatformLinker> {
    abi: A,
    access: NativeAccess,
    downcalls: LinkCache<LinkRequest, DowncallArtifact>,
    upcalls: LinkCache<LinkRequest, UpcallStubFactory>,
}

impl<A: AbiDispatch> Linker<A> {
    /// Linker with default configuration
    pub fn new(abi: A) -> Self {
        Self::with_config(abi, &LinkerConfig::default())
    }

    pub fn with_config(abi: A, config: &LinkerConfig) -> Self {
        let cache = &config.cache;
        Self {
            abi,
            access: NativeAccess::new(config.access.mode, config.access.allowed_callers.clone()),
            downcalls: LinkCache::new("downcall", cache.soft_limit, cache.log_reclaims),
            upcalls: LinkCache::new("upcall", cache.soft_limit, cache.log_reclaims),
        }
    }

    pub fn abi(&self) -> &A {
        &self.abi
    }

    pub fn platform_name(&self) -> &'static str {
        self.abi.name()
    }

    /// Scalar layouts this linker accepts, keyed by C type name
    pub fn canonical_layouts(&self) -> &CanonicalLayouts {
        self.abi.canonical_layouts()
    }

    pub fn validator(&self) -> LayoutValidator<'_> {
        LayoutValidator::new(&self.abi)
    }

    pub(crate) fn check_access(
        &self,
        caller: &Location<'_>,
        operation: &'static str,
    ) -> Result<(), LinkError> {
        self.access.ensure(caller, operation)
    }

    /// Link `descriptor` and bind it to `symbol`
    #[track_caller]
    pub fn downcall_handle(
        &self,
        symbol: *const (),
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<DowncallHandle, LinkError> {
        let caller = Location::caller();
        self.access.ensure(caller, "downcallHandle")?;
        if symbol.is_null() {
            return Err(rejected("downcallHandle", LinkError::NullInput { what: "symbol" }));
        }
        let handle = self.downcall_inner(descriptor, options)?;
        handle.bind(symbol).map_err(|e| rejected("downcallHandle", e.into()))
    }

    /// Link `descriptor` without a target; calls pass the target first
    #[track_caller]
    pub fn downcall_handle_unbound(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<DowncallHandle, LinkError> {
        self.access.ensure(Location::caller(), "downcallHandle")?;
        self.downcall_inner(descriptor, options)
    }

    /// Access-checked pipeline body shared with the C API
    pub(crate) fn downcall_inner(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<DowncallHandle, LinkError> {
        let _perf = logging::perf::track("downcall_handle");
        self.link_downcall(descriptor, options)
            .map(DowncallHandle::unbound)
            .map_err(|e| rejected("downcallHandle", e))
    }

    fn link_downcall(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<Arc<DowncallArtifact>, LinkError> {
        self.validator().check_descriptor(descriptor)?;
        let descriptor = normalize(descriptor);
        let options = LinkerOptions::for_downcall(&descriptor, options)?;
        check_variadic_layouts(&descriptor, &options)?;

        logging::log_link_request("downcall", &descriptor);
        self.downcalls
            .get_or_compute(LinkRequest { descriptor, options }, |request| {
                logging::log_cache_miss("downcall", &request.descriptor);
                let method_type = request.descriptor.to_method_type();
                let invoker = self
                    .abi
                    .arrange_downcall(&method_type, &request.descriptor, &request.options)?;
                DowncallArtifact::new(invoker)
            })
    }

    /// Mint a native entry point that calls `target`, valid until `arena` closes
    #[track_caller]
    pub fn upcall_stub(
        &self,
        target: UpcallTarget,
        descriptor: &FunctionDescriptor,
        arena: &Arena,
        options: &[LinkOption],
    ) -> Result<MemorySegment, LinkError> {
        self.access.ensure(Location::caller(), "upcallStub")?;
        let factory = self.upcall_inner(descriptor, options, Some(&target))?;
        factory
            .make_stub(target, arena)
            .map_err(|e| rejected("upcallStub", e))
    }

    /// Shared stub factory for `descriptor`
    #[track_caller]
    pub fn upcall_stub_factory(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
    ) -> Result<Arc<UpcallStubFactory>, LinkError> {
        self.access.ensure(Location::caller(), "upcallStub")?;
        self.upcall_inner(descriptor, options, None)
    }

    pub(crate) fn upcall_inner(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
        target: Option<&UpcallTarget>,
    ) -> Result<Arc<UpcallStubFactory>, LinkError> {
        let _perf = logging::perf::track("upcall_stub");
        self.link_upcall(descriptor, options, target)
            .map_err(|e| rejected("upcallStub", e))
    }

    fn link_upcall(
        &self,
        descriptor: &FunctionDescriptor,
        options: &[LinkOption],
        target: Option<&UpcallTarget>,
    ) -> Result<Arc<UpcallStubFactory>, LinkError> {
        self.validator().check_descriptor(descriptor)?;
        if let Some(target) = target.filter(|t| t.may_fail()) {
            return Err(LinkError::TargetMayFail {
                method_type: target.method_type().to_string(),
            });
        }
        let descriptor = normalize(descriptor);
        let options = LinkerOptions::for_upcall(&descriptor, options)?;

        let method_type = descriptor.to_method_type();
        if let Some(target) = target {
            if *target.method_type() != method_type {
                return Err(LinkError::SignatureMismatch {
                    expected: method_type.to_string(),
                    found: target.method_type().to_string(),
                });
            }
        }

        logging::log_link_request("upcall", &descriptor);
        self.upcalls
            .get_or_compute(LinkRequest { descriptor, options }, |request| {
                logging::log_cache_miss("upcall", &request.descriptor);
                self.abi
                    .arrange_upcall(&method_type, &request.descriptor, &request.options)
            })
    }

    pub fn downcall_cache_stats(&self) -> CacheStats {
        self.downcalls.stats()
    }

    pub fn upcall_cache_stats(&self) -> CacheStats {
        self.upcalls.stats()
    }

    /// Release cached artifacts nobody holds (memory pressure hook)
    ///
    /// Returns the number of demoted entries across both caches.
    pub fn reclaim(&self) -> usize {
        self.downcalls.reclaim() + self.upcalls.reclaim()
    }
}

impl<A: AbiDispatch> std::fmt::Debug for Linker<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linker")
            .field("platform", &self.abi.name())
            .field("access", &self.access.mode())
            .field("downcalls", &self.downcalls.stats())
            .field("upcalls", &self.upcalls.stats())
            .finish()
    }
}

fn rejected(operation: &'static str, err: LinkError) -> LinkError {
    logging::log_link_rejected(operation, &err);
    err
}
