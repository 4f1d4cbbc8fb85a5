//! Raw C-ABI surface shared with the native engine.
//!
//! The engine only ever sees the opaque handles declared here plus the hook
//! signatures it calls back through. Nothing in this module owns memory.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::marker::{PhantomData, PhantomPinned};
use std::ptr::NonNull;

macro_rules! opaque_native_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(C)]
        pub struct $name {
            _data: [u8; 0],
            _marker: PhantomData<(*mut u8, PhantomPinned)>,
        }
    };
}

opaque_native_type!(
    /// Engine-side state for one TLS connection.
    RawSession
);
opaque_native_type!(
    /// Engine-side configuration bundle shared by many sessions.
    RawContext
);
opaque_native_type!(
    /// Engine-side verification context, valid for one verify hook call.
    RawStoreCtx
);
opaque_native_type!(
    /// Engine-side certificate object.
    RawCert
);

/// `(preverify_ok, store_ctx) -> ok`
pub type VerifyHook = unsafe extern "C" fn(ok: c_int, ctx: *mut RawStoreCtx) -> c_int;

/// `(write_p, version, content_type, buf, len, session, arg)`
pub type MessageHook = unsafe extern "C" fn(
    write_p: c_int,
    version: c_int,
    content_type: c_int,
    buf: *const c_void,
    len: usize,
    session: *mut RawSession,
    arg: *mut c_void,
);

/// `(session, alert_out, arg) -> status`
pub type ServernameHook =
    unsafe extern "C" fn(session: *mut RawSession, alert: *mut c_int, arg: *mut c_void) -> c_int;

/// Invoked by the engine with the session's user data when it frees the session.
pub type ReleaseHook = unsafe extern "C" fn(data: *mut c_void);

pub const TLSEXT_ERR_OK: c_int = 0;
pub const TLSEXT_ERR_ALERT_WARNING: c_int = 1;
pub const TLSEXT_ERR_ALERT_FATAL: c_int = 2;
pub const TLSEXT_ERR_NOACK: c_int = 3;

/// Alert the engine pre-loads into `alert_out` before calling the servername hook.
pub const AD_UNRECOGNIZED_NAME: c_int = 112;

macro_rules! native_ptr {
    ($(#[$meta:meta])* $name:ident => $raw:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonNull<$raw>);

        impl $name {
            /// # Safety
            ///
            /// `ptr` must be null or point to a live engine object of the
            /// matching kind for as long as the returned handle is used.
            pub unsafe fn from_ptr(ptr: *mut $raw) -> Option<Self> {
                NonNull::new(ptr).map(Self)
            }

            pub fn as_ptr(self) -> *mut $raw {
                self.0.as_ptr()
            }
        }

        // An engine handle is an address; the engine serialises access per session.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

native_ptr!(
    /// Non-null handle to a [`RawSession`].
    SessionPtr => RawSession
);
native_ptr!(
    /// Non-null handle to a [`RawContext`].
    ContextPtr => RawContext
);
native_ptr!(
    /// Non-null handle to a [`RawStoreCtx`].
    StoreCtxPtr => RawStoreCtx
);
native_ptr!(
    /// Non-null handle to a [`RawCert`].
    CertPtr => RawCert
);

/// Marshal an engine-owned C string; null becomes the empty string and
/// invalid UTF-8 is replaced rather than rejected.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of this call.
pub(crate) unsafe fn lossy_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn lossy_string_tolerates_null_and_bad_utf8() {
        assert_eq!(unsafe { lossy_string(std::ptr::null()) }, "");

        let raw = CString::new(vec![b'h', 0xff, b'i']).unwrap();
        let marshaled = unsafe { lossy_string(raw.as_ptr()) };
        assert_eq!(marshaled, "h\u{fffd}i");
    }

    #[test]
    fn null_pointers_do_not_produce_handles() {
        assert!(unsafe { SessionPtr::from_ptr(std::ptr::null_mut()) }.is_none());
        assert!(unsafe { StoreCtxPtr::from_ptr(std::ptr::null_mut()) }.is_none());
    }
}
