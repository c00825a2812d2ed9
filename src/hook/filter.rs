//! Decides which compilations reach the capture callback.

use std::cell::{Cell, RefCell};

use crate::{
    hook::{CompilationEvent, CompileCallback, Interception},
    runtime::identity::{CanonicalResolver, MethodIdentity},
    Error,
};

/// Nesting depth above which the armed target is forwarded instead of handled.
pub const MAX_DEPTH: u32 = 20;

/// Outcome of filtering one compile call.
#[derive(Debug)]
pub enum FilterOutcome {
    /// Call the real compiler with this event.
    Forward(CompilationEvent),
    /// The callback handled the method; report success without compiling.
    Claimed,
    /// The callback failed; the error is stashed for [`CompileFilter::take_error`].
    Failed,
}

/// Scope guard for the nesting counter: increments on entry, decrements on every exit path.
struct DepthGuard<'a> {
    depth: &'a Cell<u32>,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        DepthGuard { depth }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

/// Target matching shared by both hook strategies.
///
/// A compilation is handed to the callback only when its module handle equals the target
/// module, its canonical method handle equals the armed target method and the nesting depth
/// is within [`MAX_DEPTH`]. Everything else passes through untouched.
pub struct CompileFilter {
    resolver: Box<dyn CanonicalResolver>,
    target_module: Cell<usize>,
    target_method: Cell<usize>,
    callback: RefCell<Option<CompileCallback>>,
    depth: Cell<u32>,
    error: RefCell<Option<Error>>,
}

impl CompileFilter {
    /// Creates a disarmed filter using `resolver` for incoming handles.
    #[must_use]
    pub fn new(resolver: Box<dyn CanonicalResolver>) -> Self {
        CompileFilter {
            resolver,
            target_module: Cell::new(0),
            target_method: Cell::new(0),
            callback: RefCell::new(None),
            depth: Cell::new(0),
            error: RefCell::new(None),
        }
    }

    /// Module handle compilations must belong to.
    pub fn target_module(&self) -> usize {
        self.target_module.get()
    }

    /// Sets the module handle compilations must belong to.
    pub fn set_target_module(&self, module: usize) {
        self.target_module.set(module);
    }

    /// Armed method handle, zero if disarmed.
    pub fn target_method(&self) -> usize {
        self.target_method.get()
    }

    /// Arms `method`; zero disarms.
    pub fn set_target_method(&self, method: usize) {
        self.target_method.set(method);
    }

    /// Replaces the callback.
    pub fn set_callback(&self, callback: Option<CompileCallback>) {
        *self.callback.borrow_mut() = callback;
    }

    /// Current nesting depth of handled compilations.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Takes the stashed callback error, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.error.borrow_mut().take()
    }

    /// Stashes `error` for the session to pick up after the compile call returns.
    pub fn stash_error(&self, error: Error) {
        *self.error.borrow_mut() = Some(error);
    }

    fn is_target(&self, identity: MethodIdentity) -> bool {
        let (module, method) = (self.target_module.get(), self.target_method.get());
        if method == 0 || identity.module != module {
            return false;
        }

        match self.resolver.resolve(identity.method) {
            Ok(resolved) => resolved == method,
            Err(error) => {
                log::debug!("Cannot resolve {identity}, passing through - {error}");
                false
            }
        }
    }

    /// Filters one compile call.
    pub fn filter(&self, mut event: CompilationEvent) -> FilterOutcome {
        let Some(request) = event.request() else {
            return FilterOutcome::Forward(event);
        };
        let identity = MethodIdentity::new(request.module_handle(), request.method_handle());

        if self.depth.get() > MAX_DEPTH || !self.is_target(identity) {
            return FilterOutcome::Forward(event);
        }

        // Clone out of the cell so a nested compile can reach the callback again.
        let Some(callback) = self.callback.borrow().clone() else {
            return FilterOutcome::Forward(event);
        };

        let _guard = DepthGuard::enter(&self.depth);
        log::trace!("Intercepted {identity} at depth {}", self.depth.get());

        match callback(&mut event) {
            Ok(Interception::Claimed) => FilterOutcome::Claimed,
            Ok(Interception::Forward) => FilterOutcome::Forward(event),
            Err(error) => {
                self.stash_error(error);
                FilterOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runtime::{
            corinfo::{CorInfoMethodInfo40, MethodInfoLayout},
            identity::PassthroughResolver,
        },
        Result,
    };
    use std::rc::Rc;

    const MODULE: usize = 0xA000;
    const METHOD: usize = 0xB000;

    fn info(module: usize, method: usize) -> CorInfoMethodInfo40 {
        CorInfoMethodInfo40 {
            ftn: method,
            scope: module,
            ..Default::default()
        }
    }

    fn event(info: &CorInfoMethodInfo40) -> CompilationEvent {
        unsafe { CompilationEvent::new(MethodInfoLayout::V40, 1, info as *const _ as usize, 2, 3) }
    }

    fn armed(callback: CompileCallback) -> Rc<CompileFilter> {
        let filter = Rc::new(CompileFilter::new(Box::new(PassthroughResolver)));
        filter.set_target_module(MODULE);
        filter.set_target_method(METHOD);
        filter.set_callback(Some(callback));
        filter
    }

    fn claim() -> CompileCallback {
        Rc::new(|_: &mut CompilationEvent| Ok(Interception::Claimed))
    }

    #[test]
    fn forwards_foreign_module() {
        let filter = armed(claim());
        let info = info(MODULE + 1, METHOD);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Forward(_)));
    }

    #[test]
    fn forwards_other_method() {
        let filter = armed(claim());
        let info = info(MODULE, METHOD + 8);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Forward(_)));
    }

    #[test]
    fn forwards_when_disarmed() {
        let filter = armed(claim());
        filter.set_target_method(0);
        let info = info(MODULE, 0);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Forward(_)));
    }

    #[test]
    fn claims_target() {
        let filter = armed(claim());
        let info = info(MODULE, METHOD);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Claimed));
        assert_eq!(filter.depth(), 0);
    }

    #[test]
    fn forward_keeps_edits() {
        let filter = armed(Rc::new(|event: &mut CompilationEvent| {
            event.set_native_size(0x99);
            Ok(Interception::Forward)
        }));
        let info = info(MODULE, METHOD);
        match filter.filter(event(&info)) {
            FilterOutcome::Forward(event) => assert_eq!(event.native_size(), 0x99),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failure_is_stashed() {
        let filter = armed(Rc::new(|_: &mut CompilationEvent| -> Result<Interception> {
            Err(Error::Error("boom".to_string()))
        }));
        let info = info(MODULE, METHOD);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Failed));
        assert!(matches!(filter.take_error(), Some(Error::Error(message)) if message == "boom"));
        assert!(filter.take_error().is_none());
        assert_eq!(filter.depth(), 0);
    }

    #[test]
    fn canonical_resolution() {
        struct Offset;
        impl CanonicalResolver for Offset {
            fn resolve(&self, method: usize) -> Result<usize> {
                if method == 1 {
                    return Err(Error::Error("unknown".to_string()));
                }
                Ok(method + 0x10)
            }
        }

        let filter = CompileFilter::new(Box::new(Offset));
        filter.set_target_module(MODULE);
        filter.set_target_method(METHOD);
        filter.set_callback(Some(claim()));

        let wrapped = info(MODULE, METHOD - 0x10);
        assert!(matches!(filter.filter(event(&wrapped)), FilterOutcome::Claimed));

        let direct = info(MODULE, METHOD);
        assert!(matches!(filter.filter(event(&direct)), FilterOutcome::Forward(_)));

        let unknown = info(MODULE, 1);
        assert!(matches!(filter.filter(event(&unknown)), FilterOutcome::Forward(_)));
    }

    #[test]
    fn nesting_is_bounded() {
        use std::cell::Cell;

        let calls = Rc::new(Cell::new(0u32));
        let forwarded = Rc::new(Cell::new(0u32));
        let slot: Rc<RefCell<Option<Rc<CompileFilter>>>> = Rc::new(RefCell::new(None));

        let callback: CompileCallback = {
            let (calls, forwarded, slot) = (calls.clone(), forwarded.clone(), slot.clone());
            Rc::new(move |event: &mut CompilationEvent| {
                calls.set(calls.get() + 1);
                let filter = slot.borrow().clone().unwrap();
                if let FilterOutcome::Forward(_) = filter.filter(*event) {
                    forwarded.set(forwarded.get() + 1);
                }
                Ok(Interception::Claimed)
            })
        };

        let filter = armed(callback);
        *slot.borrow_mut() = Some(filter.clone());

        let info = info(MODULE, METHOD);
        assert!(matches!(filter.filter(event(&info)), FilterOutcome::Claimed));
        assert_eq!(calls.get(), MAX_DEPTH + 1);
        assert_eq!(forwarded.get(), 1);
        assert_eq!(filter.depth(), 0);

        slot.borrow_mut().take();
    }
}
