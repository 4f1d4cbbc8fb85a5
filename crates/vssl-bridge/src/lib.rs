//! Safe Rust callbacks for a native TLS engine.
//!
//! The engine calls back through C-ABI hooks for peer verification, protocol
//! message tracing and server-name selection. This crate installs those hooks
//! as trampolines that map the engine's objects back to their Rust wrappers
//! through a token registry, so no Rust pointer is ever stored in native
//! memory. Any inconsistency or panic at the boundary terminates the process
//! (see [`fault`]).

pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod fault;
pub mod ffi;
pub mod flags;
pub mod loopback;
pub mod registry;
pub mod store;
pub mod trampoline;

use std::sync::Once;

pub use config::{BridgeConfig, LogConfig, LogFormat};
pub use connection::{
    Connection, ConnectionRef, Direction, MessageCallback, TraceRecord, VerifyCallback,
};
pub use context::{Context, ServernameCallback};
pub use engine::{install_engine, installed_engine, NativeEngine};
pub use error::{BridgeError, RegistryError};
pub use fault::{set_fatal_hook, set_fatal_policy, FatalHook, FatalPolicy, Fault, Hook};
pub use flags::{ContentType, ProtocolVersion, ServernameStatus, SslOptions, VerifyMode, VerifyResult};
pub use registry::{HandleRegistry, Token};
pub use store::{CertificateRef, X509StoreContextRef};

static INIT: Once = Once::new();

/// Apply process-level settings: the fatal policy and, once per process, the
/// tracing subscriber.
pub fn init(config: &BridgeConfig) {
    fault::set_fatal_policy(config.fatal);
    if config.log.install_subscriber {
        INIT.call_once(|| config::install_subscriber(&config.log));
    }
    tracing::debug!(target: "vssl::config", policy = ?config.fatal, "bridge initialised");
}
