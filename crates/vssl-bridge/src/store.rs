//! Read-only view over the engine's verification context.
//!
//! A view is created by the verify trampoline for exactly one callback
//! invocation. Callbacks receive it as `&X509StoreContextRef<'_>` under a
//! higher-ranked lifetime, and the view is neither `Send` nor `Sync`, so it
//! cannot be stashed or moved off the engine's thread. Owned data must be
//! copied out (`to_der`, `subject`) before the callback returns.

use std::fmt;
use std::marker::PhantomData;

use crate::engine::NativeEngine;
use crate::ffi::{self, CertPtr, RawCert, RawStoreCtx, StoreCtxPtr};
use crate::flags::VerifyResult;

pub struct X509StoreContextRef<'a> {
    ctx: StoreCtxPtr,
    engine: &'static dyn NativeEngine,
    _frame: PhantomData<&'a mut RawStoreCtx>,
}

impl<'a> X509StoreContextRef<'a> {
    /// # Safety
    ///
    /// `ctx` must stay valid for `'a`, which must not outlive the hook
    /// invocation that supplied it.
    pub(crate) unsafe fn from_ptr(engine: &'static dyn NativeEngine, ctx: StoreCtxPtr) -> Self {
        Self {
            ctx,
            engine,
            _frame: PhantomData,
        }
    }

    /// Verification error recorded so far for the current certificate.
    pub fn error(&self) -> VerifyResult {
        // SAFETY: `ctx` is live for `'a`, see `from_ptr`.
        VerifyResult::from_raw(unsafe { self.engine.store_error(self.ctx) })
    }

    /// Position of the current certificate in the chain, 0 being the leaf.
    pub fn error_depth(&self) -> i32 {
        // SAFETY: as in `error`.
        unsafe { self.engine.store_error_depth(self.ctx) }
    }

    /// The certificate currently being checked.
    pub fn current_cert(&self) -> Option<CertificateRef<'a>> {
        // SAFETY: as in `error`; the certificate lives as long as the context.
        let cert = unsafe { self.engine.store_current_cert(self.ctx) }?;
        Some(CertificateRef {
            cert,
            engine: self.engine,
            _frame: PhantomData,
        })
    }
}

impl fmt::Debug for X509StoreContextRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509StoreContextRef")
            .field("error", &self.error())
            .field("error_depth", &self.error_depth())
            .finish()
    }
}

/// Certificate borrowed from a verification context.
pub struct CertificateRef<'a> {
    cert: CertPtr,
    engine: &'static dyn NativeEngine,
    _frame: PhantomData<&'a RawCert>,
}

impl CertificateRef<'_> {
    /// Copy of the DER encoding.
    pub fn to_der(&self) -> Vec<u8> {
        // SAFETY: the certificate is live for `'a`.
        unsafe { self.engine.cert_der(self.cert) }
    }

    /// One-line subject name; empty if the engine has none.
    pub fn subject(&self) -> String {
        // SAFETY: the engine keeps the string alive with the certificate.
        unsafe { ffi::lossy_string(self.engine.cert_subject(self.cert)) }
    }
}

impl fmt::Debug for CertificateRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRef")
            .field("subject", &self.subject())
            .finish()
    }
}
