//! Canonical method identity.
//!
//! The handle the compiler receives is not always the handle the sweep armed. Methods of
//! value types are reached through wrapper descriptors (instantiating stubs on 4.x,
//! unboxing stubs on 2.x), so the armed handle has to be mapped onto the handle that
//! actually reaches the compiler before the two can be compared.
//!
//! The runtime-specific lookups sit behind [`MethodIntrospection`]; the mapping rules for each
//! runtime generation are [`CanonicalResolver`] implementations selected by
//! [`resolver_for`].

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use crate::{runtime::environment::RuntimeFlavor, Result};

/// A method inside one loaded module, compared by raw handle values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodIdentity {
    /// Module handle (`CORINFO_MODULE_HANDLE`)
    pub module: usize,
    /// Method handle (`CORINFO_METHOD_HANDLE` / `MethodDesc*`)
    pub method: usize,
}

impl MethodIdentity {
    /// Creates an identity from its two handles.
    #[must_use]
    pub fn new(module: usize, method: usize) -> Self {
        MethodIdentity { module, method }
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}!0x{:X}", self.module, self.method)
    }
}

/// Runtime queries needed to follow wrapper indirections.
pub trait MethodIntrospection {
    /// `true` if the method's declaring type is a value type.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot answer for this handle.
    fn is_value_type_member(&self, method: usize) -> Result<bool>;

    /// The instantiating stub the 4.x runtime compiles in place of `method`, or `method`
    /// itself if none is needed (`RuntimeMethodHandle.GetStubIfNeeded`).
    ///
    /// # Errors
    /// Returns an error if the runtime cannot answer for this handle.
    fn instantiating_stub(&self, method: usize) -> Result<usize>;

    /// The unboxing stub the 2.x runtime compiles for `method`
    /// (`RuntimeMethodHandle.GetUnboxingStub`).
    ///
    /// # Errors
    /// Returns an error if the runtime cannot answer for this handle.
    fn unboxing_stub(&self, method: usize) -> Result<usize>;
}

/// Maps a method handle to the handle that owns its instruction stream at compile time.
pub trait CanonicalResolver {
    /// Resolves `method`. A null handle resolves to itself.
    ///
    /// # Errors
    /// Returns an error if the underlying runtime query fails.
    fn resolve(&self, method: usize) -> Result<usize>;
}

/// Leaves every handle unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

impl CanonicalResolver for PassthroughResolver {
    fn resolve(&self, method: usize) -> Result<usize> {
        Ok(method)
    }
}

/// 4.x rule: value-type members resolve to their instantiating stub.
pub struct StubIfNeededResolver {
    introspection: Rc<dyn MethodIntrospection>,
}

impl StubIfNeededResolver {
    /// Creates the resolver over `introspection`.
    #[must_use]
    pub fn new(introspection: Rc<dyn MethodIntrospection>) -> Self {
        StubIfNeededResolver { introspection }
    }
}

impl CanonicalResolver for StubIfNeededResolver {
    fn resolve(&self, method: usize) -> Result<usize> {
        if method == 0 || !self.introspection.is_value_type_member(method)? {
            return Ok(method);
        }

        self.introspection.instantiating_stub(method)
    }
}

/// 2.x rule: value-type members resolve to their unboxing stub.
pub struct UnboxingStubResolver {
    introspection: Rc<dyn MethodIntrospection>,
}

impl UnboxingStubResolver {
    /// Creates the resolver over `introspection`.
    #[must_use]
    pub fn new(introspection: Rc<dyn MethodIntrospection>) -> Self {
        UnboxingStubResolver { introspection }
    }
}

impl CanonicalResolver for UnboxingStubResolver {
    fn resolve(&self, method: usize) -> Result<usize> {
        if method == 0 || !self.introspection.is_value_type_member(method)? {
            return Ok(method);
        }

        self.introspection.unboxing_stub(method)
    }
}

/// Memoizes another resolver. Handles stay valid for the lifetime of the process, so
/// successful answers never go stale; failures are not cached.
pub struct CachingResolver<R> {
    inner: R,
    cache: RefCell<HashMap<usize, usize>>,
}

impl<R: CanonicalResolver> CachingResolver<R> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: R) -> Self {
        CachingResolver {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl<R: CanonicalResolver> CanonicalResolver for CachingResolver<R> {
    fn resolve(&self, method: usize) -> Result<usize> {
        if let Some(resolved) = self.cache.borrow().get(&method) {
            return Ok(*resolved);
        }

        let resolved = self.inner.resolve(method)?;
        self.cache.borrow_mut().insert(method, resolved);
        Ok(resolved)
    }
}

impl CanonicalResolver for Box<dyn CanonicalResolver> {
    fn resolve(&self, method: usize) -> Result<usize> {
        self.as_ref().resolve(method)
    }
}

/// Selects the resolution rule for a runtime generation.
#[must_use]
pub fn resolver_for(
    flavor: RuntimeFlavor,
    introspection: Rc<dyn MethodIntrospection>,
) -> Box<dyn CanonicalResolver> {
    match flavor {
        RuntimeFlavor::Clr2x => Box::new(CachingResolver::new(UnboxingStubResolver::new(
            introspection,
        ))),
        RuntimeFlavor::Clr40x | RuntimeFlavor::Clr45x => Box::new(CachingResolver::new(
            StubIfNeededResolver::new(introspection),
        )),
    }
}
