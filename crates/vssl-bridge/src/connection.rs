//! Rust-side wrapper around one native session.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::context::Context;
use crate::engine::{self, NativeEngine};
use crate::error::BridgeError;
use crate::fault::{self, Fault};
use crate::ffi::{self, MessageHook, RawSession, SessionPtr, VerifyHook};
use crate::flags::{ContentType, ProtocolVersion, SslOptions, VerifyMode};
use crate::registry::{HandleRegistry, Token};
use crate::store::X509StoreContextRef;
use crate::trampoline;

/// Decides whether to accept the certificate under inspection. The first
/// argument is the engine's own verdict; the returned value replaces it.
pub type VerifyCallback = Arc<dyn Fn(bool, &X509StoreContextRef<'_>) -> bool + Send + Sync>;

/// Observes every protocol message the engine sends or receives.
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &TraceRecord) + Send + Sync>;

pub(crate) static SESSIONS: HandleRegistry<ConnectionRef> = HandleRegistry::new("sessions");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    pub(crate) fn from_write_p(write_p: i32) -> Self {
        if write_p != 0 {
            Direction::Sent
        } else {
            Direction::Received
        }
    }

    pub fn is_sending(self) -> bool {
        self == Direction::Sent
    }
}

/// One traced protocol message. `content` is an owned copy of the engine's
/// buffer, which the engine reuses as soon as the hook returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub direction: Direction,
    pub version: ProtocolVersion,
    pub content_type: ContentType,
    pub content: Bytes,
}

/// Session state shared between the owning [`Connection`] and the
/// trampolines. Callbacks receive it by reference.
///
/// A `ConnectionRef` is only reachable while its session is live: an owning
/// [`Connection`] frees the session in its destructor, and an adopted wrapper
/// is unregistered by the engine's release hook before the session goes away.
/// The native handle itself is never handed out as a safe value.
pub struct ConnectionRef {
    session: SessionPtr,
    engine: &'static dyn NativeEngine,
    verify_cb: Mutex<Option<VerifyCallback>>,
    msg_cb: Mutex<Option<MessageCallback>>,
}

impl ConnectionRef {
    fn bind(engine: &'static dyn NativeEngine, session: SessionPtr) -> Self {
        Self {
            session,
            engine,
            verify_cb: Mutex::new(None),
            msg_cb: Mutex::new(None),
        }
    }

    pub fn as_ptr(&self) -> *mut RawSession {
        self.session.as_ptr()
    }

    pub(crate) fn session(&self) -> SessionPtr {
        self.session
    }

    /// Set the verify mode and drop any verification callback; the native
    /// hook is uninstalled even if `mode` requests peer verification.
    pub fn set_verify(&self, mode: VerifyMode) {
        self.install_verify(mode, None);
    }

    /// Set the verify mode together with a verification callback.
    pub fn set_verify_callback<F>(&self, mode: VerifyMode, callback: F)
    where
        F: Fn(bool, &X509StoreContextRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.install_verify(mode, Some(Arc::new(callback)));
    }

    /// Change the verify mode, keeping the registered callback.
    pub fn set_verify_mode(&self, mode: VerifyMode) {
        let callback = self.verify_callback();
        self.install_verify(mode, callback);
    }

    /// Replace the verification callback, keeping the verify mode.
    pub fn replace_verify_callback<F>(&self, callback: F)
    where
        F: Fn(bool, &X509StoreContextRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.install_verify(self.verify_mode(), Some(Arc::new(callback)));
    }

    /// Drop the verification callback, keeping the verify mode.
    pub fn clear_verify_callback(&self) {
        self.install_verify(self.verify_mode(), None);
    }

    pub fn has_verify_callback(&self) -> bool {
        self.verify_cb.lock().is_some()
    }

    fn install_verify(&self, mode: VerifyMode, callback: Option<VerifyCallback>) {
        let _previous = {
            let mut slot = self.verify_cb.lock();
            let hook = callback
                .as_ref()
                .map(|_| trampoline::verify_trampoline as VerifyHook);
            // SAFETY: the session is live while `self` is reachable.
            unsafe { self.engine.set_verify(self.session, mode.bits(), hook) };
            std::mem::replace(&mut *slot, callback)
        };
    }

    /// The registered verification callback, if any.
    pub fn verify_callback(&self) -> Option<VerifyCallback> {
        self.verify_cb.lock().clone()
    }

    pub fn verify_mode(&self) -> VerifyMode {
        // SAFETY: the session is live while `self` is reachable.
        VerifyMode::from_bits_retain(unsafe { self.engine.verify_mode(self.session) })
    }

    /// Maximum chain depth the engine will follow during verification.
    pub fn set_verify_depth(&self, depth: i32) {
        // SAFETY: the session is live while `self` is reachable.
        unsafe { self.engine.set_verify_depth(self.session, depth) };
    }

    pub fn verify_depth(&self) -> i32 {
        // SAFETY: the session is live while `self` is reachable.
        unsafe { self.engine.verify_depth(self.session) }
    }

    /// Register a callback for every message sent or received. Note that
    /// version and content type may hold values outside the named constants.
    pub fn set_msg_callback<F>(&self, callback: F)
    where
        F: Fn(&ConnectionRef, &TraceRecord) + Send + Sync + 'static,
    {
        self.install_msg(Some(Arc::new(callback)));
    }

    pub fn clear_msg_callback(&self) {
        self.install_msg(None);
    }

    pub fn has_msg_callback(&self) -> bool {
        self.msg_cb.lock().is_some()
    }

    fn install_msg(&self, callback: Option<MessageCallback>) {
        let _previous = {
            let mut slot = self.msg_cb.lock();
            let hook = callback
                .as_ref()
                .map(|_| trampoline::message_trampoline as MessageHook);
            // SAFETY: the session is live while `self` is reachable.
            unsafe { self.engine.set_message_hook(self.session, hook) };
            std::mem::replace(&mut *slot, callback)
        };
    }

    pub(crate) fn msg_callback(&self) -> Option<MessageCallback> {
        self.msg_cb.lock().clone()
    }

    /// Host name requested by the client through SNI, or an empty string.
    pub fn servername(&self) -> String {
        // SAFETY: the session is live and keeps the string alive.
        unsafe { ffi::lossy_string(self.engine.servername(self.session)) }
    }

    /// Negotiated protocol label such as `TLSv1.3`. Only meaningful once the
    /// handshake has completed.
    pub fn version(&self) -> String {
        // SAFETY: the session is live and keeps the string alive.
        unsafe { ffi::lossy_string(self.engine.version(self.session)) }
    }

    pub fn options(&self) -> SslOptions {
        // SAFETY: the session is live while `self` is reachable.
        SslOptions::from_bits_retain(unsafe { self.engine.options(self.session) })
    }

    /// Add `options`; returns the resulting set.
    pub fn set_options(&self, options: SslOptions) -> SslOptions {
        // SAFETY: the session is live while `self` is reachable.
        let bits = unsafe { self.engine.set_options(self.session, options.bits()) };
        SslOptions::from_bits_retain(bits)
    }

    /// Remove `options`; returns the resulting set.
    pub fn clear_options(&self, options: SslOptions) -> SslOptions {
        // SAFETY: the session is live while `self` is reachable.
        let bits = unsafe { self.engine.clear_options(self.session, options.bits()) };
        SslOptions::from_bits_retain(bits)
    }

    /// Point the session at another configuration bundle, typically from a
    /// name-selection callback.
    ///
    /// Only lookups made after the swap see the new context (certificates and
    /// keys served from here on). Anything the handshake already negotiated or
    /// accepted stays as it was; exactly which attributes follow the new
    /// context is up to the engine.
    pub fn rebind_context(&self, context: &Context) {
        // SAFETY: both objects are live for the duration of the call; the
        // engine takes its own reference to the context.
        unsafe { self.engine.set_session_context(self.session, context.native()) };
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("session", &self.session)
            .field("verify_callback", &self.has_verify_callback())
            .field("msg_callback", &self.has_msg_callback())
            .finish()
    }
}

/// Owning wrapper: registers the session on creation, and on drop
/// unregisters it before releasing the native session.
///
/// The native session is only reachable through the wrapper, so it cannot be
/// freed behind the wrapper's back:
///
/// ```compile_fail
/// use vssl_bridge::{loopback, Connection, Context, NativeEngine};
///
/// let engine = loopback::install().unwrap();
/// let context = Context::new().unwrap();
/// let conn = Connection::new(&context).unwrap();
/// let stale = conn.session();
/// engine.session_free(stale);
/// drop(conn);
/// ```
pub struct Connection {
    inner: Arc<ConnectionRef>,
    token: Token,
}

impl Connection {
    pub fn new(context: &Context) -> Result<Self, BridgeError> {
        let engine = engine::installed_engine()?;
        // SAFETY: `context` owns a live native context.
        let session = unsafe { engine.session_new(context.native()) }
            .ok_or(BridgeError::AllocationRefused("session"))?;
        let inner = Arc::new(ConnectionRef::bind(engine, session));
        let token = register(&inner);
        // SAFETY: the session was just created and is owned by `inner`.
        unsafe { engine.set_user_data(session, token.into_raw(), None) };
        tracing::debug!(target: "vssl::connection", ?token, "session created");
        Ok(Self { inner, token })
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

impl Deref for Connection {
    type Target = ConnectionRef;

    fn deref(&self) -> &ConnectionRef {
        &self.inner
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        SESSIONS.unregister(self.token);
        let engine = self.inner.engine;
        // SAFETY: the wrapper owns the session and this is its last use.
        unsafe {
            engine.set_user_data(self.inner.session, std::ptr::null_mut(), None);
            engine.session_free(self.inner.session);
        }
        tracing::debug!(target: "vssl::connection", token = ?self.token, "session released");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("inner", &self.inner)
            .finish()
    }
}

fn register(inner: &Arc<ConnectionRef>) -> Token {
    match SESSIONS.register(Arc::clone(inner)) {
        Ok(token) => token,
        Err(err) => fault::terminate(Fault::Registry(err)),
    }
}

/// Wrap a session the engine created on its own. The wrapper does not own
/// the session; the engine's release hook unregisters it when the session is
/// freed.
///
/// # Safety
///
/// `session` must be a live session of `engine`.
pub(crate) unsafe fn adopt(
    engine: &'static dyn NativeEngine,
    session: SessionPtr,
) -> Arc<ConnectionRef> {
    let inner = Arc::new(ConnectionRef::bind(engine, session));
    let token = register(&inner);
    engine.set_user_data(
        session,
        token.into_raw(),
        Some(trampoline::release_trampoline),
    );
    tracing::debug!(target: "vssl::connection", ?token, "adopted engine-created session");
    inner
}
