//! In-process engine that plays the server side of a scripted handshake.
//!
//! It stands in for a linked TLS library in tests, benches and the trace
//! tool: it owns sessions and contexts, fires the installed hooks from the
//! handshake driver exactly where a real engine would, and reuses (then
//! scribbles over) message buffers once a hook returns. No cryptography is
//! performed; certificates are labels with validity flags.

use std::collections::HashSet;
use std::ffi::{c_char, c_int, c_void, CString};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::connection::ConnectionRef;
use crate::context::Context;
use crate::engine::{self, NativeEngine};
use crate::error::BridgeError;
use crate::ffi::{
    CertPtr, ContextPtr, MessageHook, RawCert, RawContext, RawSession, RawStoreCtx, ReleaseHook,
    ServernameHook, SessionPtr, StoreCtxPtr, VerifyHook, AD_UNRECOGNIZED_NAME,
    TLSEXT_ERR_ALERT_WARNING, TLSEXT_ERR_NOACK, TLSEXT_ERR_OK,
};
use crate::flags::{ContentType, ProtocolVersion, VerifyMode, VerifyResult};

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;
const HANDSHAKE_FINISHED: u8 = 20;

const ALERT_LEVEL_FATAL: u8 = 2;
const ALERT_BAD_CERTIFICATE: u8 = 42;
const ALERT_CERTIFICATE_EXPIRED: u8 = 45;
const ALERT_CERTIFICATE_REQUIRED: u8 = 116;

const SCRIBBLE: u8 = 0xAA;

static LOOPBACK: Lazy<LoopbackEngine> = Lazy::new(LoopbackEngine::new);

/// Install the process-wide loopback engine, or return it if it is already
/// the installed engine.
pub fn install() -> Result<&'static LoopbackEngine, BridgeError> {
    let loopback: &'static LoopbackEngine = &LOOPBACK;
    match engine::install_engine(loopback) {
        Ok(()) => {
            tracing::debug!(target: "vssl::loopback", "loopback engine installed");
            Ok(loopback)
        }
        Err(_) if engine::is_installed(loopback) => Ok(loopback),
        Err(err) => Err(err),
    }
}

/// A certificate presented by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    subject: String,
    expired: bool,
    self_signed: bool,
}

impl PeerCertificate {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            expired: false,
            self_signed: false,
        }
    }

    pub fn expired(mut self) -> Self {
        self.expired = true;
        self
    }

    pub fn self_signed(mut self) -> Self {
        self.self_signed = true;
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Placeholder DER: a SEQUENCE wrapping the subject bytes.
    pub fn der(&self) -> Vec<u8> {
        let body = self.subject.as_bytes();
        let mut der = vec![0x30];
        match body.len() {
            len @ 0..=0x7f => der.push(len as u8),
            len @ 0x80..=0xff => der.extend_from_slice(&[0x81, len as u8]),
            len => {
                let len = len.min(0xffff) as u16;
                der.push(0x82);
                der.extend_from_slice(&len.to_be_bytes());
            }
        }
        der.extend_from_slice(&body[..body.len().min(0xffff)]);
        der
    }
}

/// Client behaviour for one scripted handshake.
#[derive(Debug, Clone)]
pub struct HandshakeScript {
    pub server_name: Option<String>,
    /// Leaf first.
    pub peer_chain: Vec<PeerCertificate>,
    pub version: ProtocolVersion,
}

impl Default for HandshakeScript {
    fn default() -> Self {
        Self {
            server_name: None,
            peer_chain: Vec::new(),
            version: ProtocolVersion::TLS1_3,
        }
    }
}

impl HandshakeScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn peer(mut self, cert: PeerCertificate) -> Self {
        self.peer_chain.push(cert);
        self
    }

    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The servername hook asked for a fatal alert.
    ServernameRejected { alert: c_int },
    /// The peer chain was rejected at `depth`.
    PeerVerification { depth: i32, error: VerifyResult },
    /// Peer verification was required but no certificate was sent.
    MissingPeerCertificate,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFailure::ServernameRejected { alert } => {
                write!(f, "server name rejected (alert {alert})")
            }
            HandshakeFailure::PeerVerification { depth, error } => {
                write!(f, "peer certificate rejected at depth {depth}: {error}")
            }
            HandshakeFailure::MissingPeerCertificate => f.write_str("peer sent no certificate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established {
        version: ProtocolVersion,
        /// Id of the context the session was bound to when the server hello
        /// went out.
        context_id: u64,
    },
    Rejected(HandshakeFailure),
}

impl HandshakeOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, HandshakeOutcome::Established { .. })
    }
}

struct SimContext {
    id: u64,
    servername: Mutex<Option<(ServernameHook, usize)>>,
    release: Mutex<Option<(ReleaseHook, usize)>>,
}

impl Drop for SimContext {
    fn drop(&mut self) {
        if let Some((release, data)) = self.release.get_mut().take() {
            // SAFETY: the release hook was installed together with `data`;
            // the last reference is gone and no engine lock is held.
            unsafe { release(data as *mut c_void) };
        }
    }
}

struct SessionState {
    context: Arc<SimContext>,
    options: u64,
    verify_mode: c_int,
    verify_hook: Option<VerifyHook>,
    verify_depth: c_int,
    msg_hook: Option<MessageHook>,
    user_data: usize,
    release: Option<ReleaseHook>,
    servername: Option<CString>,
    version: Option<CString>,
}

struct SimSession {
    id: u64,
    state: Mutex<SessionState>,
}

struct SimCert {
    subject: CString,
    der: Vec<u8>,
}

impl SimCert {
    fn from_peer(cert: &PeerCertificate) -> Self {
        let subject = cert.subject.replace('\0', "");
        Self {
            subject: CString::new(subject).unwrap_or_default(),
            der: cert.der(),
        }
    }
}

struct SimStoreCtx {
    session: SessionPtr,
    cert: *const SimCert,
    error: c_int,
    depth: c_int,
}

/// The loopback engine. Obtain the process-wide instance with [`install`];
/// any `&LoopbackEngine` is therefore the installed engine, and the
/// wrapper-taking methods below rely on that.
pub struct LoopbackEngine {
    next_id: AtomicU64,
    live_sessions: Mutex<HashSet<u64>>,
    live_contexts: Mutex<HashSet<u64>>,
}

impl LoopbackEngine {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live_sessions: Mutex::new(HashSet::new()),
            live_contexts: Mutex::new(HashSet::new()),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// `ctx` came from `context_new` and the caller's reference is still held.
    unsafe fn context<'a>(&self, ctx: ContextPtr) -> &'a SimContext {
        &*ctx.as_ptr().cast::<SimContext>()
    }

    /// # Safety
    ///
    /// As for [`Self::context`].
    unsafe fn context_arc(&self, ctx: ContextPtr) -> Arc<SimContext> {
        let raw = ctx.as_ptr().cast::<SimContext>().cast_const();
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    }

    /// # Safety
    ///
    /// `session` came from `session_new` and has not been freed.
    unsafe fn session<'a>(&self, session: SessionPtr) -> &'a SimSession {
        &*session.as_ptr().cast::<SimSession>()
    }

    /// # Safety
    ///
    /// `ctx` is the store context of a verify hook that is still running.
    unsafe fn store<'a>(&self, ctx: StoreCtxPtr) -> &'a SimStoreCtx {
        &*ctx.as_ptr().cast::<SimStoreCtx>()
    }

    /// Engine-assigned id of a context.
    pub fn context_id(&self, context: &Context) -> u64 {
        // SAFETY: the wrapper holds its reference to the context.
        unsafe { self.context(context.native()) }.id
    }

    /// Engine-assigned id of a session.
    pub fn session_id(&self, conn: &ConnectionRef) -> u64 {
        // SAFETY: the session is live while `conn` is reachable.
        unsafe { self.raw_session_id(conn.session()) }
    }

    /// Engine-assigned id of a session created directly through the engine.
    ///
    /// # Safety
    ///
    /// `session` came from this engine and has not been freed.
    pub unsafe fn raw_session_id(&self, session: SessionPtr) -> u64 {
        self.session(session).id
    }

    pub fn is_session_live(&self, id: u64) -> bool {
        self.live_sessions.lock().contains(&id)
    }

    pub fn is_context_live(&self, id: u64) -> bool {
        self.live_contexts.lock().contains(&id)
    }

    pub fn has_verify_hook(&self, conn: &ConnectionRef) -> bool {
        // SAFETY: the session is live while `conn` is reachable.
        let sim = unsafe { self.session(conn.session()) };
        sim.state.lock().verify_hook.is_some()
    }

    pub fn has_msg_hook(&self, conn: &ConnectionRef) -> bool {
        // SAFETY: the session is live while `conn` is reachable.
        let sim = unsafe { self.session(conn.session()) };
        sim.state.lock().msg_hook.is_some()
    }

    pub fn has_servername_hook(&self, context: &Context) -> bool {
        // SAFETY: the wrapper holds its reference to the context.
        let sim = unsafe { self.context(context.native()) };
        sim.servername.lock().is_some()
    }

    /// Drive the server side of one handshake for `conn`. See
    /// [`Self::accept_session`].
    pub fn accept(&self, conn: &ConnectionRef, script: &HandshakeScript) -> HandshakeOutcome {
        // SAFETY: the session is live while `conn` is reachable, and it was
        // created by the installed engine, which is `self`.
        unsafe { self.accept_session(conn.session(), script) }
    }

    /// Drive the server side of one handshake for `session`.
    ///
    /// Sequence: client hello received, servername hook, server hello sent,
    /// client certificate received and verified (when peer verification is
    /// on and a chain was sent), finished received. A rejection sends a fatal
    /// alert and ends the handshake.
    ///
    /// # Safety
    ///
    /// `session` came from this engine and is not freed before this returns.
    pub unsafe fn accept_session(
        &self,
        session: SessionPtr,
        script: &HandshakeScript,
    ) -> HandshakeOutcome {
        let sim = self.session(session);
        let version = script.version;
        {
            let mut state = sim.state.lock();
            state.servername = script
                .server_name
                .as_deref()
                .and_then(|name| CString::new(name).ok());
            state.version = None;
        }
        tracing::debug!(
            target: "vssl::loopback",
            session = sim.id,
            server_name = script.server_name.as_deref().unwrap_or(""),
            "handshake started"
        );

        let hello_body = script.server_name.as_deref().unwrap_or("").as_bytes();
        self.emit_handshake(session, false, version, HANDSHAKE_CLIENT_HELLO, hello_body);

        if script.server_name.is_some() {
            if let Err(failure) = self.select_server_name(session) {
                return self.reject(session, version, failure);
            }
        }

        let context_id = sim.state.lock().context.id;
        let label = format!("ctx-{context_id}");
        self.emit_handshake(session, true, version, HANDSHAKE_SERVER_HELLO, label.as_bytes());

        let mode = VerifyMode::from_bits_retain(sim.state.lock().verify_mode);
        if mode.contains(VerifyMode::PEER) {
            if script.peer_chain.is_empty() {
                if mode.contains(VerifyMode::FAIL_IF_NO_PEER_CERT) {
                    return self.reject(session, version, HandshakeFailure::MissingPeerCertificate);
                }
            } else {
                let chain: Vec<SimCert> = script.peer_chain.iter().map(SimCert::from_peer).collect();
                let body: Vec<u8> = chain.iter().flat_map(|cert| cert.der.iter().copied()).collect();
                self.emit_handshake(session, false, version, HANDSHAKE_CERTIFICATE, &body);
                if let Err(failure) = self.verify_chain(session, &script.peer_chain, &chain) {
                    return self.reject(session, version, failure);
                }
            }
        }

        self.emit_handshake(session, false, version, HANDSHAKE_FINISHED, &[0u8; 12]);
        let label = version
            .label()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("0x{:04x}", version.as_raw()));
        sim.state.lock().version = CString::new(label).ok();
        tracing::debug!(target: "vssl::loopback", session = sim.id, %version, context_id, "handshake established");
        HandshakeOutcome::Established {
            version,
            context_id,
        }
    }

    unsafe fn select_server_name(&self, session: SessionPtr) -> Result<(), HandshakeFailure> {
        let context = Arc::clone(&self.session(session).state.lock().context);
        let installed = *context.servername.lock();
        let Some((hook, arg)) = installed else {
            return Ok(());
        };
        let mut alert = AD_UNRECOGNIZED_NAME;
        // SAFETY: hooks are engine-installed C-ABI functions; no engine lock
        // is held across the call.
        let status = hook(session.as_ptr(), &mut alert, arg as *mut c_void);
        match status {
            TLSEXT_ERR_OK | TLSEXT_ERR_NOACK | TLSEXT_ERR_ALERT_WARNING => Ok(()),
            _ => Err(HandshakeFailure::ServernameRejected { alert }),
        }
    }

    unsafe fn verify_chain(
        &self,
        session: SessionPtr,
        peers: &[PeerCertificate],
        chain: &[SimCert],
    ) -> Result<(), HandshakeFailure> {
        let (hook, max_depth) = {
            let state = self.session(session).state.lock();
            (state.verify_hook, state.verify_depth)
        };
        for depth in (0..chain.len()).rev() {
            let peer = &peers[depth];
            let error = if max_depth >= 0 && depth as c_int > max_depth {
                VerifyResult::CERT_CHAIN_TOO_LONG
            } else if peer.expired {
                VerifyResult::CERT_HAS_EXPIRED
            } else if peer.self_signed && chain.len() == 1 {
                VerifyResult::DEPTH_ZERO_SELF_SIGNED_CERT
            } else if peer.self_signed {
                VerifyResult::SELF_SIGNED_CERT_IN_CHAIN
            } else {
                VerifyResult::OK
            };
            let mut store = SimStoreCtx {
                session,
                cert: &chain[depth],
                error: error.as_raw(),
                depth: depth as c_int,
            };
            let preverified = c_int::from(error.is_ok());
            let verdict = match hook {
                // SAFETY: `store` lives on this frame for the whole call.
                Some(hook) => hook(preverified, ptr::addr_of_mut!(store).cast::<RawStoreCtx>()),
                None => preverified,
            };
            if verdict == 0 {
                return Err(HandshakeFailure::PeerVerification {
                    depth: depth as i32,
                    error,
                });
            }
        }
        Ok(())
    }

    unsafe fn reject(
        &self,
        session: SessionPtr,
        version: ProtocolVersion,
        failure: HandshakeFailure,
    ) -> HandshakeOutcome {
        let description = match failure {
            HandshakeFailure::ServernameRejected { alert } => u8::try_from(alert).unwrap_or(0),
            HandshakeFailure::PeerVerification { error, .. }
                if error == VerifyResult::CERT_HAS_EXPIRED =>
            {
                ALERT_CERTIFICATE_EXPIRED
            }
            HandshakeFailure::PeerVerification { .. } => ALERT_BAD_CERTIFICATE,
            HandshakeFailure::MissingPeerCertificate => ALERT_CERTIFICATE_REQUIRED,
        };
        self.emit(
            session,
            true,
            version,
            ContentType::ALERT,
            vec![ALERT_LEVEL_FATAL, description],
        );
        tracing::debug!(target: "vssl::loopback", session = self.raw_session_id(session), %failure, "handshake rejected");
        HandshakeOutcome::Rejected(failure)
    }

    unsafe fn emit_handshake(
        &self,
        session: SessionPtr,
        sent: bool,
        version: ProtocolVersion,
        msg_type: u8,
        body: &[u8],
    ) {
        let len = body.len().min(0x00ff_ffff);
        let mut message = Vec::with_capacity(4 + len);
        message.push(msg_type);
        message.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body[..len]);
        self.emit(session, sent, version, ContentType::HANDSHAKE, message);
    }

    unsafe fn emit(
        &self,
        session: SessionPtr,
        sent: bool,
        version: ProtocolVersion,
        content_type: ContentType,
        mut buffer: Vec<u8>,
    ) {
        let hook = self.session(session).state.lock().msg_hook;
        if let Some(hook) = hook {
            // SAFETY: `buffer` stays alive and unmodified for the call.
            hook(
                c_int::from(sent),
                version.as_raw(),
                content_type.as_raw(),
                buffer.as_ptr().cast::<c_void>(),
                buffer.len(),
                session.as_ptr(),
                ptr::null_mut(),
            );
        }
        buffer.fill(SCRIBBLE);
    }
}

// SAFETY: handles stay valid until freed, strings live in session state until
// replaced, hooks run synchronously on the caller's thread with no lock held.
unsafe impl NativeEngine for LoopbackEngine {
    fn context_new(&self) -> Option<ContextPtr> {
        let id = self.allocate_id();
        let ctx = Arc::new(SimContext {
            id,
            servername: Mutex::new(None),
            release: Mutex::new(None),
        });
        self.live_contexts.lock().insert(id);
        // SAFETY: `Arc::into_raw` never yields null.
        unsafe { ContextPtr::from_ptr(Arc::into_raw(ctx).cast_mut().cast::<RawContext>()) }
    }

    unsafe fn context_free(&self, ctx: ContextPtr) {
        let id = self.context(ctx).id;
        self.live_contexts.lock().remove(&id);
        // Releases the strong count taken in `context_new`; the last one runs
        // the release hook.
        drop(Arc::from_raw(ctx.as_ptr().cast::<SimContext>().cast_const()));
    }

    unsafe fn set_context_user_data(
        &self,
        ctx: ContextPtr,
        data: *mut c_void,
        release: Option<ReleaseHook>,
    ) {
        *self.context(ctx).release.lock() = release.map(|release| (release, data as usize));
    }

    unsafe fn set_servername_hook(
        &self,
        ctx: ContextPtr,
        hook: Option<ServernameHook>,
        arg: *mut c_void,
    ) {
        *self.context(ctx).servername.lock() = hook.map(|hook| (hook, arg as usize));
    }

    unsafe fn session_new(&self, ctx: ContextPtr) -> Option<SessionPtr> {
        let id = self.allocate_id();
        let session = Box::new(SimSession {
            id,
            state: Mutex::new(SessionState {
                context: self.context_arc(ctx),
                options: 0,
                verify_mode: VerifyMode::NONE.bits(),
                verify_hook: None,
                verify_depth: -1,
                msg_hook: None,
                user_data: 0,
                release: None,
                servername: None,
                version: None,
            }),
        });
        self.live_sessions.lock().insert(id);
        // `Box::into_raw` never yields null.
        SessionPtr::from_ptr(Box::into_raw(session).cast::<RawSession>())
    }

    unsafe fn session_free(&self, session: SessionPtr) {
        // Reclaims the box leaked in `session_new`.
        let sim = Box::from_raw(session.as_ptr().cast::<SimSession>());
        let (data, release) = {
            let state = sim.state.lock();
            (state.user_data, state.release)
        };
        if let Some(release) = release {
            // The release hook was installed together with `data`.
            release(data as *mut c_void);
        }
        self.live_sessions.lock().remove(&sim.id);
        // Dropping the session may drop the last context reference.
        drop(sim);
    }

    unsafe fn set_session_context(&self, session: SessionPtr, ctx: ContextPtr) {
        let context = self.context_arc(ctx);
        let previous = std::mem::replace(&mut self.session(session).state.lock().context, context);
        drop(previous);
    }

    unsafe fn user_data(&self, session: SessionPtr) -> *mut c_void {
        self.session(session).state.lock().user_data as *mut c_void
    }

    unsafe fn set_user_data(&self, session: SessionPtr, data: *mut c_void, release: Option<ReleaseHook>) {
        let mut state = self.session(session).state.lock();
        state.user_data = data as usize;
        state.release = release;
    }

    unsafe fn options(&self, session: SessionPtr) -> u64 {
        self.session(session).state.lock().options
    }

    unsafe fn set_options(&self, session: SessionPtr, options: u64) -> u64 {
        let mut state = self.session(session).state.lock();
        state.options |= options;
        state.options
    }

    unsafe fn clear_options(&self, session: SessionPtr, options: u64) -> u64 {
        let mut state = self.session(session).state.lock();
        state.options &= !options;
        state.options
    }

    unsafe fn verify_mode(&self, session: SessionPtr) -> c_int {
        self.session(session).state.lock().verify_mode
    }

    unsafe fn set_verify(&self, session: SessionPtr, mode: c_int, hook: Option<VerifyHook>) {
        let mut state = self.session(session).state.lock();
        state.verify_mode = mode;
        state.verify_hook = hook;
    }

    unsafe fn verify_depth(&self, session: SessionPtr) -> c_int {
        self.session(session).state.lock().verify_depth
    }

    unsafe fn set_verify_depth(&self, session: SessionPtr, depth: c_int) {
        self.session(session).state.lock().verify_depth = depth;
    }

    unsafe fn set_message_hook(&self, session: SessionPtr, hook: Option<MessageHook>) {
        self.session(session).state.lock().msg_hook = hook;
    }

    unsafe fn servername(&self, session: SessionPtr) -> *const c_char {
        self.session(session)
            .state
            .lock()
            .servername
            .as_ref()
            .map_or(ptr::null(), |name| name.as_ptr())
    }

    unsafe fn version(&self, session: SessionPtr) -> *const c_char {
        self.session(session)
            .state
            .lock()
            .version
            .as_ref()
            .map_or(ptr::null(), |version| version.as_ptr())
    }

    unsafe fn store_session(&self, ctx: StoreCtxPtr) -> Option<SessionPtr> {
        Some(self.store(ctx).session)
    }

    unsafe fn store_current_cert(&self, ctx: StoreCtxPtr) -> Option<CertPtr> {
        let cert = self.store(ctx).cert;
        // The certificate outlives the store context.
        CertPtr::from_ptr(cert.cast_mut().cast::<RawCert>())
    }

    unsafe fn store_error(&self, ctx: StoreCtxPtr) -> c_int {
        self.store(ctx).error
    }

    unsafe fn store_error_depth(&self, ctx: StoreCtxPtr) -> c_int {
        self.store(ctx).depth
    }

    unsafe fn cert_der(&self, cert: CertPtr) -> Vec<u8> {
        // `cert` points at a `SimCert` held by the running handshake.
        (*cert.as_ptr().cast::<SimCert>()).der.clone()
    }

    unsafe fn cert_subject(&self, cert: CertPtr) -> *const c_char {
        (*cert.as_ptr().cast::<SimCert>()).subject.as_ptr()
    }
}

impl fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("live_sessions", &self.live_sessions.lock().len())
            .field("live_contexts", &self.live_contexts.lock().len())
            .finish()
    }
}

/// Run `f` with a store context for `conn`'s session whose current
/// certificate has `subject`, as the verify hook would see it at depth 0.
#[cfg(test)]
pub(crate) fn with_store_ctx<R>(
    conn: &ConnectionRef,
    subject: &str,
    f: impl FnOnce(*mut RawStoreCtx) -> R,
) -> R {
    let cert = SimCert::from_peer(&PeerCertificate::new(subject));
    let mut store = SimStoreCtx {
        session: conn.session(),
        cert: &cert,
        error: VerifyResult::OK.as_raw(),
        depth: 0,
    };
    f(ptr::addr_of_mut!(store).cast::<RawStoreCtx>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A bare engine session on a fresh context, outside any wrapper.
    fn raw_session(engine: &LoopbackEngine) -> (ContextPtr, SessionPtr) {
        let ctx = engine.context_new().expect("ctx");
        let session = unsafe { engine.session_new(ctx) }.expect("session");
        (ctx, session)
    }

    fn release(engine: &LoopbackEngine, ctx: ContextPtr, session: SessionPtr) {
        unsafe {
            engine.session_free(session);
            engine.context_free(ctx);
        }
    }

    #[test]
    fn placeholder_der_uses_definite_lengths() {
        assert_eq!(PeerCertificate::new("CN=a").der(), b"\x30\x04CN=a".to_vec());
        let long = PeerCertificate::new("x".repeat(200)).der();
        assert_eq!(&long[..3], &[0x30, 0x81, 200]);
        assert_eq!(long.len(), 203);
    }

    #[test]
    fn handshake_without_hooks_uses_engine_verdicts() {
        let engine = install().expect("loopback");
        let (ctx, session) = raw_session(engine);
        unsafe { engine.set_verify(session, VerifyMode::PEER.bits(), None) };

        let rejected = unsafe {
            engine.accept_session(
                session,
                &HandshakeScript::new().peer(PeerCertificate::new("CN=leaf").expired()),
            )
        };
        assert_eq!(
            rejected,
            HandshakeOutcome::Rejected(HandshakeFailure::PeerVerification {
                depth: 0,
                error: VerifyResult::CERT_HAS_EXPIRED,
            })
        );

        let accepted = unsafe {
            engine.accept_session(
                session,
                &HandshakeScript::new().peer(PeerCertificate::new("CN=leaf")),
            )
        };
        assert!(accepted.is_established());
        release(engine, ctx, session);
    }

    #[test]
    fn required_peer_certificate_must_be_sent() {
        let engine = install().expect("loopback");
        let (ctx, session) = raw_session(engine);
        let mode = VerifyMode::PEER | VerifyMode::FAIL_IF_NO_PEER_CERT;
        unsafe { engine.set_verify(session, mode.bits(), None) };
        assert_eq!(
            unsafe { engine.accept_session(session, &HandshakeScript::new()) },
            HandshakeOutcome::Rejected(HandshakeFailure::MissingPeerCertificate)
        );
        release(engine, ctx, session);
    }

    #[test]
    fn verify_depth_limits_the_chain() {
        let engine = install().expect("loopback");
        let (ctx, session) = raw_session(engine);
        unsafe {
            engine.set_verify(session, VerifyMode::PEER.bits(), None);
            engine.set_verify_depth(session, 0);
        }
        let script = HandshakeScript::new()
            .peer(PeerCertificate::new("CN=leaf"))
            .peer(PeerCertificate::new("CN=intermediate"));
        assert_eq!(
            unsafe { engine.accept_session(session, &script) },
            HandshakeOutcome::Rejected(HandshakeFailure::PeerVerification {
                depth: 1,
                error: VerifyResult::CERT_CHAIN_TOO_LONG,
            })
        );
        release(engine, ctx, session);
    }

    static RELEASED: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

    unsafe extern "C" fn record_release(data: *mut c_void) {
        RELEASED.lock().push(data as usize);
    }

    #[test]
    fn context_outlives_free_while_sessions_hold_it() {
        let engine = install().expect("loopback");
        let (ctx, session) = raw_session(engine);
        let (ctx_id, session_id) = unsafe {
            engine.set_context_user_data(ctx, 0x5151 as *mut c_void, Some(record_release));
            (engine.context(ctx).id, engine.raw_session_id(session))
        };

        unsafe { engine.context_free(ctx) };
        assert!(!engine.is_context_live(ctx_id));
        assert!(!RELEASED.lock().contains(&0x5151));
        assert!(unsafe { engine.accept_session(session, &HandshakeScript::new()) }.is_established());

        unsafe { engine.session_free(session) };
        assert!(!engine.is_session_live(session_id));
        assert!(RELEASED.lock().contains(&0x5151));
    }

    #[test]
    fn options_accumulate_and_clear() {
        let engine = install().expect("loopback");
        let (ctx, session) = raw_session(engine);
        unsafe {
            assert_eq!(engine.set_options(session, 0b1010), 0b1010);
            assert_eq!(engine.set_options(session, 0b0100), 0b1110);
            assert_eq!(engine.clear_options(session, 0b0010), 0b1100);
        }
        release(engine, ctx, session);
    }
}
