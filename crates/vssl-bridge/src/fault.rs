//! Fault containment at the native boundary.
//!
//! A trampoline never hands a half-made security decision back to the engine.
//! Panics raised by application callbacks are caught here and, like every
//! other inconsistency detected by a trampoline, end the process.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::error::RegistryError;
use crate::registry::Token;

/// The native hook a fault was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Verify,
    MessageTrace,
    Servername,
    Release,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hook::Verify => "verify",
            Hook::MessageTrace => "message-trace",
            Hook::Servername => "servername",
            Hook::Release => "release",
        })
    }
}

/// Unrecoverable conditions detected at the native boundary.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    #[error("{hook} hook fired before a native engine was installed")]
    EngineMissing { hook: Hook },
    #[error("{hook} hook received no session")]
    MissingSession { hook: Hook },
    #[error("{hook} hook received an object carrying no bridge token")]
    MissingToken { hook: Hook },
    #[error("{hook} hook received unknown token {token:?}")]
    UnknownToken { hook: Hook, token: Token },
    #[error("{hook} callback panicked: {message}")]
    CallbackPanic { hook: Hook, message: String },
    #[error("cannot register native object: {0}")]
    Registry(#[from] RegistryError),
}

impl Fault {
    pub fn hook(&self) -> Option<Hook> {
        match self {
            Fault::EngineMissing { hook }
            | Fault::MissingSession { hook }
            | Fault::MissingToken { hook }
            | Fault::UnknownToken { hook, .. }
            | Fault::CallbackPanic { hook, .. } => Some(*hook),
            Fault::Registry(_) => None,
        }
    }
}

/// How the process ends once a fault is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FatalPolicy {
    /// `std::process::abort`, skipping atexit handlers and destructors.
    #[default]
    Abort,
    /// `std::process::exit` with the given status code.
    Exit { code: i32 },
}

/// Runs after the fault is logged and before the [`FatalPolicy`] applies.
///
/// It must not return, and it must not unwind when the fault was raised from
/// a hook the engine called: the trampolines are `extern "C"` and a panic
/// may not cross them. Only a Rust caller driving the
/// `dispatch_*` functions directly, such as a test harness, may unwind out of
/// it. A hook that wants to record the fault and then end the process should
/// call [`std::process::abort`] or [`std::process::exit`] itself.
pub type FatalHook = fn(&Fault) -> !;

static POLICY: RwLock<FatalPolicy> = parking_lot::const_rwlock(FatalPolicy::Abort);
static HOOK: RwLock<Option<FatalHook>> = parking_lot::const_rwlock(None);

pub fn set_fatal_policy(policy: FatalPolicy) {
    *POLICY.write() = policy;
}

pub fn fatal_policy() -> FatalPolicy {
    *POLICY.read()
}

/// Install (or with `None`, remove) the hook that replaces termination.
/// Returns the previous hook.
pub fn set_fatal_hook(hook: Option<FatalHook>) -> Option<FatalHook> {
    std::mem::replace(&mut *HOOK.write(), hook)
}

pub(crate) fn terminate(fault: Fault) -> ! {
    let policy = fatal_policy();
    match fault.hook() {
        Some(hook) => tracing::error!(
            target: "vssl::fault",
            %hook,
            error = %fault,
            ?policy,
            "unrecoverable fault at native boundary; terminating"
        ),
        None => tracing::error!(
            target: "vssl::fault",
            error = %fault,
            ?policy,
            "unrecoverable fault at native boundary; terminating"
        ),
    }

    let hook = *HOOK.read();
    if let Some(hook) = hook {
        hook(&fault);
    }
    match policy {
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Exit { code } => std::process::exit(code),
    }
}

/// Run application code, converting a panic into a fatal fault.
pub(crate) fn contain<R>(hook: Hook, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => terminate(Fault::CallbackPanic {
            hook,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contain_passes_through_normal_results() {
        assert_eq!(contain(Hook::Verify, || 7), 7);
    }

    #[test]
    fn contained_panic_becomes_fatal_fault() {
        let outcome = testing::expect_fault(|| {
            contain(Hook::Verify, || -> bool { panic!("verifier exploded") })
        });
        let message = outcome.expect_err("panic must not return a decision");
        assert!(message.contains("verify callback panicked"));
        assert!(message.contains("verifier exploded"));
    }

    #[test]
    fn fatal_policy_deserializes_from_tagged_form() {
        let policy: FatalPolicy =
            serde_json::from_str(r#"{"action":"exit","code":70}"#).expect("policy");
        assert_eq!(policy, FatalPolicy::Exit { code: 70 });
        let policy: FatalPolicy = serde_json::from_str(r#"{"action":"abort"}"#).expect("policy");
        assert_eq!(policy, FatalPolicy::Abort);
    }
}
