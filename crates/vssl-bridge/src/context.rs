//! Rust-side wrapper around a native configuration bundle.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionRef;
use crate::engine::{self, NativeEngine};
use crate::error::BridgeError;
use crate::fault::{self, Fault};
use crate::ffi::{ContextPtr, RawContext, ServernameHook};
use crate::flags::ServernameStatus;
use crate::registry::{HandleRegistry, Token};
use crate::trampoline;

/// Picks per-host configuration once the client's requested name is known,
/// usually by calling [`ConnectionRef::rebind_context`].
pub type ServernameCallback = Arc<dyn Fn(&ConnectionRef) -> ServernameStatus + Send + Sync>;

pub(crate) static CONTEXTS: HandleRegistry<ContextRef> = HandleRegistry::new("contexts");

/// Context state reachable from the name-selection trampoline.
pub struct ContextRef {
    servername_cb: Mutex<Option<ServernameCallback>>,
}

impl ContextRef {
    pub(crate) fn servername_callback(&self) -> Option<ServernameCallback> {
        self.servername_cb.lock().clone()
    }

    pub fn has_servername_callback(&self) -> bool {
        self.servername_cb.lock().is_some()
    }
}

/// Owning wrapper around a native context.
///
/// The context token stays registered until the engine destroys the native
/// context, which may be after this wrapper is dropped: sessions created from
/// it keep the context alive and can still fire its servername hook. The
/// engine's context release hook unregisters the token.
pub struct Context {
    ctx: ContextPtr,
    engine: &'static dyn NativeEngine,
    inner: Arc<ContextRef>,
    token: Token,
}

impl Context {
    pub fn new() -> Result<Self, BridgeError> {
        let engine = engine::installed_engine()?;
        let ctx = engine
            .context_new()
            .ok_or(BridgeError::AllocationRefused("context"))?;
        let inner = Arc::new(ContextRef {
            servername_cb: Mutex::new(None),
        });
        let token = match CONTEXTS.register(Arc::clone(&inner)) {
            Ok(token) => token,
            Err(err) => fault::terminate(Fault::Registry(err)),
        };
        // SAFETY: the context was just created and is owned by `Self`.
        unsafe {
            engine.set_context_user_data(
                ctx,
                token.into_raw(),
                Some(trampoline::context_release_trampoline),
            );
        }
        tracing::debug!(target: "vssl::context", ?token, "context created");
        Ok(Self {
            ctx,
            engine,
            inner,
            token,
        })
    }

    pub fn as_ptr(&self) -> *mut RawContext {
        self.ctx.as_ptr()
    }

    pub(crate) fn native(&self) -> ContextPtr {
        self.ctx
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Register the name-selection callback for sessions created from (or
    /// still bound to) this context.
    pub fn set_servername_callback<F>(&self, callback: F)
    where
        F: Fn(&ConnectionRef) -> ServernameStatus + Send + Sync + 'static,
    {
        self.install_servername(Some(Arc::new(callback)));
    }

    pub fn clear_servername_callback(&self) {
        self.install_servername(None);
    }

    pub fn has_servername_callback(&self) -> bool {
        self.inner.has_servername_callback()
    }

    fn install_servername(&self, callback: Option<ServernameCallback>) {
        let _previous = {
            let mut slot = self.inner.servername_cb.lock();
            let hook = callback
                .as_ref()
                .map(|_| trampoline::servername_trampoline as ServernameHook);
            // SAFETY: the wrapper holds its reference to the context.
            unsafe {
                self.engine
                    .set_servername_hook(self.ctx, hook, self.token.into_raw())
            };
            std::mem::replace(&mut *slot, callback)
        };
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // The hook and token stay in place for sessions still bound to the
        // context; the release hook retires them.
        // SAFETY: this is the wrapper's last use of its reference.
        unsafe { self.engine.context_free(self.ctx) };
        tracing::debug!(target: "vssl::context", token = ?self.token, "context reference dropped");
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("ctx", &self.ctx)
            .field("token", &self.token)
            .field("servername_callback", &self.has_servername_callback())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::loopback::{self, HandshakeScript};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn selector_outlives_the_wrapper_while_a_session_uses_the_context() {
        let engine = loopback::install().expect("loopback engine");
        let context = Context::new().expect("context");
        let token = context.token();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        context.set_servername_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ServernameStatus::Ok
        });
        let conn = Connection::new(&context).expect("connection");

        drop(context);
        assert!(CONTEXTS.resolve(token).is_ok());
        let outcome = engine.accept(&conn, &HandshakeScript::new().server_name("late.example"));
        assert!(outcome.is_established());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(conn);
        assert!(CONTEXTS.resolve(token).is_err());
        assert_eq!(Arc::strong_count(&calls), 1);
    }

    #[test]
    fn unused_context_is_released_with_its_wrapper() {
        loopback::install().expect("loopback engine");
        let context = Context::new().expect("context");
        let token = context.token();
        context.set_servername_callback(|_| ServernameStatus::Ok);
        drop(context);
        assert!(CONTEXTS.resolve(token).is_err());
    }
}
