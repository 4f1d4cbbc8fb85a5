//! The native TLS engine the bridge sits in front of.
//!
//! The engine is consumed as a process-wide library, the same way a linked
//! `libssl` would be: one implementation is installed at startup and every
//! wrapper and trampoline talks to it.

use std::ffi::{c_char, c_int, c_void};

use once_cell::sync::OnceCell;

use crate::error::BridgeError;
use crate::ffi::{
    CertPtr, ContextPtr, MessageHook, ReleaseHook, ServernameHook, SessionPtr, StoreCtxPtr,
    VerifyHook,
};

/// Per-session and per-context accessors plus hook installation points
/// exposed by the native engine.
///
/// # Safety
///
/// Implementors guarantee that every handle they return stays valid until the
/// matching `*_free` call, that C strings returned by [`servername`],
/// [`version`] and [`cert_subject`] stay valid until the next mutation of the
/// owning object, and that hooks are only invoked synchronously on the thread
/// driving the session, never concurrently for one session. Store contexts and
/// message buffers handed to hooks may be invalidated as soon as the hook
/// returns. A native context stays alive while any session still uses it; its
/// release hook runs once the last such reference is gone.
///
/// # Calling handle-taking methods
///
/// Every method that takes a handle is `unsafe`: the caller guarantees the
/// handle came from this engine and has not been freed, and that store and
/// certificate handles are only used while the hook that supplied them runs.
/// The bridge's wrappers uphold this by owning the handles they hand in.
///
/// [`servername`]: NativeEngine::servername
/// [`version`]: NativeEngine::version
/// [`cert_subject`]: NativeEngine::cert_subject
pub unsafe trait NativeEngine: Send + Sync + 'static {
    fn context_new(&self) -> Option<ContextPtr>;
    /// Drop the caller's reference. The context itself lives on while
    /// sessions use it.
    unsafe fn context_free(&self, ctx: ContextPtr);
    /// Store `data` in the context's user-data slot. When `release` is set
    /// the engine calls it with `data` once the context is finally destroyed.
    unsafe fn set_context_user_data(
        &self,
        ctx: ContextPtr,
        data: *mut c_void,
        release: Option<ReleaseHook>,
    );
    unsafe fn set_servername_hook(
        &self,
        ctx: ContextPtr,
        hook: Option<ServernameHook>,
        arg: *mut c_void,
    );

    unsafe fn session_new(&self, ctx: ContextPtr) -> Option<SessionPtr>;
    unsafe fn session_free(&self, session: SessionPtr);
    /// Swap the configuration bundle. Only later certificate and config
    /// lookups observe the new context; negotiated material is untouched.
    unsafe fn set_session_context(&self, session: SessionPtr, ctx: ContextPtr);

    unsafe fn user_data(&self, session: SessionPtr) -> *mut c_void;
    /// Store `data` in the session's user-data slot. When `release` is set the
    /// engine calls it with `data` as it frees the session.
    unsafe fn set_user_data(
        &self,
        session: SessionPtr,
        data: *mut c_void,
        release: Option<ReleaseHook>,
    );

    unsafe fn options(&self, session: SessionPtr) -> u64;
    unsafe fn set_options(&self, session: SessionPtr, options: u64) -> u64;
    unsafe fn clear_options(&self, session: SessionPtr, options: u64) -> u64;

    unsafe fn verify_mode(&self, session: SessionPtr) -> c_int;
    unsafe fn set_verify(&self, session: SessionPtr, mode: c_int, hook: Option<VerifyHook>);
    unsafe fn verify_depth(&self, session: SessionPtr) -> c_int;
    unsafe fn set_verify_depth(&self, session: SessionPtr, depth: c_int);

    unsafe fn set_message_hook(&self, session: SessionPtr, hook: Option<MessageHook>);

    unsafe fn servername(&self, session: SessionPtr) -> *const c_char;
    unsafe fn version(&self, session: SessionPtr) -> *const c_char;

    unsafe fn store_session(&self, ctx: StoreCtxPtr) -> Option<SessionPtr>;
    unsafe fn store_current_cert(&self, ctx: StoreCtxPtr) -> Option<CertPtr>;
    unsafe fn store_error(&self, ctx: StoreCtxPtr) -> c_int;
    unsafe fn store_error_depth(&self, ctx: StoreCtxPtr) -> c_int;

    unsafe fn cert_der(&self, cert: CertPtr) -> Vec<u8>;
    unsafe fn cert_subject(&self, cert: CertPtr) -> *const c_char;
}

static ENGINE: OnceCell<&'static dyn NativeEngine> = OnceCell::new();

/// Install the process-wide engine. Fails if one is already installed.
pub fn install_engine(engine: &'static dyn NativeEngine) -> Result<(), BridgeError> {
    ENGINE
        .set(engine)
        .map_err(|_| BridgeError::EngineAlreadyInstalled)
}

pub fn installed_engine() -> Result<&'static dyn NativeEngine, BridgeError> {
    ENGINE.get().copied().ok_or(BridgeError::EngineNotInstalled)
}

/// Whether `engine` is the instance currently installed.
pub fn is_installed(engine: &'static dyn NativeEngine) -> bool {
    ENGINE
        .get()
        .is_some_and(|installed| std::ptr::addr_eq(*installed, engine))
}
