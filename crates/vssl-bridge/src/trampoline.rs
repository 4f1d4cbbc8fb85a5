//! C-ABI entry points installed into the native engine.
//!
//! Each trampoline recovers the Rust object from the token the engine hands
//! back, runs the application callback under fault containment, and
//! translates the result into the engine's return convention. Anything it
//! cannot make sense of (no engine, a missing or unknown token) is a fault.

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::{self, ConnectionRef, Direction, TraceRecord, SESSIONS};
use crate::context::CONTEXTS;
use crate::engine::{self, NativeEngine};
use crate::fault::{self, Fault, Hook};
use crate::ffi::{RawSession, RawStoreCtx, SessionPtr, StoreCtxPtr, TLSEXT_ERR_NOACK};
use crate::flags::{ContentType, ProtocolVersion};
use crate::registry::Token;
use crate::store::X509StoreContextRef;

/// Installed as the per-session verify hook.
///
/// # Safety
///
/// Must only be called by the installed engine, with a store context that is
/// live for the duration of the call.
pub unsafe extern "C" fn verify_trampoline(ok: c_int, ctx: *mut RawStoreCtx) -> c_int {
    dispatch_verify(ok, ctx)
}

/// Installed as the per-session message hook.
///
/// # Safety
///
/// Must only be called by the installed engine; `buf` must be null or valid
/// for `len` bytes for the duration of the call.
pub unsafe extern "C" fn message_trampoline(
    write_p: c_int,
    version: c_int,
    content_type: c_int,
    buf: *const c_void,
    len: usize,
    session: *mut RawSession,
    _arg: *mut c_void,
) {
    dispatch_message(write_p, version, content_type, buf, len, session)
}

/// Installed as the per-context servername hook; `arg` carries the context's
/// token.
///
/// # Safety
///
/// Must only be called by the installed engine with a live session.
pub unsafe extern "C" fn servername_trampoline(
    session: *mut RawSession,
    alert: *mut c_int,
    arg: *mut c_void,
) -> c_int {
    dispatch_servername(session, alert, arg)
}

/// Installed as the user-data release hook of adopted sessions.
///
/// # Safety
///
/// Must only be called by the installed engine, once per adopted session.
pub unsafe extern "C" fn release_trampoline(data: *mut c_void) {
    dispatch_release(data)
}

/// Installed as the user-data release hook of every context.
///
/// # Safety
///
/// Must only be called by the installed engine, once per context, after the
/// last session using the context is gone.
pub unsafe extern "C" fn context_release_trampoline(data: *mut c_void) {
    dispatch_context_release(data)
}

fn engine_for(hook: Hook) -> &'static dyn NativeEngine {
    engine::installed_engine().unwrap_or_else(|_| fault::terminate(Fault::EngineMissing { hook }))
}

/// # Safety
///
/// `session` must be a live session of `engine`.
unsafe fn resolve_session(
    engine: &'static dyn NativeEngine,
    session: SessionPtr,
    hook: Hook,
) -> Arc<ConnectionRef> {
    let Some(token) = Token::from_raw(engine.user_data(session)) else {
        fault::terminate(Fault::MissingToken { hook })
    };
    SESSIONS
        .resolve(token)
        .unwrap_or_else(|_| fault::terminate(Fault::UnknownToken { hook, token }))
}

pub(crate) unsafe fn dispatch_verify(ok: c_int, ctx: *mut RawStoreCtx) -> c_int {
    let hook = Hook::Verify;
    let engine = engine_for(hook);
    let Some(ctx) = StoreCtxPtr::from_ptr(ctx) else {
        fault::terminate(Fault::MissingSession { hook })
    };
    let Some(session) = engine.store_session(ctx) else {
        fault::terminate(Fault::MissingSession { hook })
    };
    let conn = resolve_session(engine, session, hook);

    // No callback: the engine's verdict stands.
    let Some(callback) = conn.verify_callback() else {
        return ok;
    };
    let view = X509StoreContextRef::from_ptr(engine, ctx);
    let accepted = fault::contain(hook, || callback(ok != 0, &view));
    tracing::debug!(
        target: "vssl::trampoline",
        preverified = ok != 0,
        accepted,
        depth = view.error_depth(),
        "verify callback returned"
    );
    c_int::from(accepted)
}

pub(crate) unsafe fn dispatch_message(
    write_p: c_int,
    version: c_int,
    content_type: c_int,
    buf: *const c_void,
    len: usize,
    session: *mut RawSession,
) {
    let hook = Hook::MessageTrace;
    let engine = engine_for(hook);
    let Some(session) = SessionPtr::from_ptr(session) else {
        fault::terminate(Fault::MissingSession { hook })
    };
    let conn = resolve_session(engine, session, hook);
    let Some(callback) = conn.msg_callback() else {
        return;
    };

    let content = if buf.is_null() || len == 0 {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(std::slice::from_raw_parts(buf.cast::<u8>(), len))
    };
    let record = TraceRecord {
        direction: Direction::from_write_p(write_p),
        version: ProtocolVersion::from_raw(version),
        content_type: ContentType::from_raw(content_type),
        content,
    };
    fault::contain(hook, || callback(&conn, &record));
}

pub(crate) unsafe fn dispatch_servername(
    session: *mut RawSession,
    _alert: *mut c_int,
    arg: *mut c_void,
) -> c_int {
    let hook = Hook::Servername;
    let engine = engine_for(hook);
    let Some(token) = Token::from_raw(arg) else {
        fault::terminate(Fault::MissingToken { hook })
    };
    let context = CONTEXTS
        .resolve(token)
        .unwrap_or_else(|_| fault::terminate(Fault::UnknownToken { hook, token }));
    let Some(selector) = context.servername_callback() else {
        tracing::warn!(
            target: "vssl::config",
            context = ?token,
            "servername hook fired without a selector; not acknowledging the name"
        );
        return TLSEXT_ERR_NOACK;
    };

    let Some(session) = SessionPtr::from_ptr(session) else {
        fault::terminate(Fault::MissingSession { hook })
    };
    let conn = match Token::from_raw(engine.user_data(session)) {
        Some(token) => SESSIONS
            .resolve(token)
            .unwrap_or_else(|_| fault::terminate(Fault::UnknownToken { hook, token })),
        None => connection::adopt(engine, session),
    };
    let status = fault::contain(hook, || selector(&conn));
    tracing::debug!(target: "vssl::trampoline", ?status, "servername selector returned");
    status.as_raw()
}

pub(crate) unsafe fn dispatch_release(data: *mut c_void) {
    let Some(token) = Token::from_raw(data) else {
        return;
    };
    let released = SESSIONS.unregister(token);
    tracing::debug!(
        target: "vssl::trampoline",
        ?token,
        found = released.is_some(),
        "adopted session released"
    );
    fault::contain(Hook::Release, move || drop(released));
}

pub(crate) unsafe fn dispatch_context_release(data: *mut c_void) {
    let Some(token) = Token::from_raw(data) else {
        return;
    };
    let released = CONTEXTS.unregister(token);
    tracing::debug!(
        target: "vssl::trampoline",
        ?token,
        found = released.is_some(),
        "context released"
    );
    fault::contain(Hook::Release, move || drop(released));
}
