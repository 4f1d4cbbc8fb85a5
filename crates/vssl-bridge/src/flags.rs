//! Integer-backed values exchanged with the native engine.
//!
//! Everything here converts from native integers without failing. Values the
//! engine reports outside the named constants are kept as-is, since the
//! protocol reserves ranges for future versions and content types.

use std::ffi::c_int;
use std::fmt;

use bitflags::bitflags;

use crate::ffi;

bitflags! {
    /// Peer verification mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VerifyMode: c_int {
        const NONE = 0x00;
        const PEER = 0x01;
        const FAIL_IF_NO_PEER_CERT = 0x02;
        const CLIENT_ONCE = 0x04;
        const POST_HANDSHAKE = 0x08;
    }
}

bitflags! {
    /// Per-session option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SslOptions: u64 {
        const NO_TICKET = 1 << 14;
        const NO_COMPRESSION = 1 << 17;
        const NO_SESSION_RESUMPTION_ON_RENEGOTIATION = 1 << 16;
        const CIPHER_SERVER_PREFERENCE = 1 << 22;
        const NO_SSLV3 = 1 << 25;
        const NO_TLSV1 = 1 << 26;
        const NO_TLSV1_2 = 1 << 27;
        const NO_TLSV1_1 = 1 << 28;
        const NO_TLSV1_3 = 1 << 29;
        const NO_RENEGOTIATION = 1 << 30;
    }
}

/// Result of a name-selection callback, in the engine's status encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServernameStatus {
    /// Accept the requested name.
    Ok,
    /// Send a warning alert and continue.
    AlertWarning,
    /// Abort the handshake with the alert in the engine's alert slot.
    AlertFatal,
    /// Continue without acknowledging the extension.
    NoAck,
}

impl ServernameStatus {
    pub fn as_raw(self) -> c_int {
        match self {
            ServernameStatus::Ok => ffi::TLSEXT_ERR_OK,
            ServernameStatus::AlertWarning => ffi::TLSEXT_ERR_ALERT_WARNING,
            ServernameStatus::AlertFatal => ffi::TLSEXT_ERR_ALERT_FATAL,
            ServernameStatus::NoAck => ffi::TLSEXT_ERR_NOACK,
        }
    }

    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            ffi::TLSEXT_ERR_OK => Some(ServernameStatus::Ok),
            ffi::TLSEXT_ERR_ALERT_WARNING => Some(ServernameStatus::AlertWarning),
            ffi::TLSEXT_ERR_ALERT_FATAL => Some(ServernameStatus::AlertFatal),
            ffi::TLSEXT_ERR_NOACK => Some(ServernameStatus::NoAck),
            _ => None,
        }
    }
}

/// Record-layer protocol version as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion(c_int);

impl ProtocolVersion {
    pub const SSL3: Self = Self(0x0300);
    pub const TLS1: Self = Self(0x0301);
    pub const TLS1_1: Self = Self(0x0302);
    pub const TLS1_2: Self = Self(0x0303);
    pub const TLS1_3: Self = Self(0x0304);
    pub const DTLS1: Self = Self(0xfeff);
    pub const DTLS1_2: Self = Self(0xfefd);

    pub const fn from_raw(raw: c_int) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> c_int {
        self.0
    }

    /// Engine-style label (`TLSv1.3`), or `None` for unnamed values.
    pub fn label(self) -> Option<&'static str> {
        Some(match self {
            Self::SSL3 => "SSLv3",
            Self::TLS1 => "TLSv1",
            Self::TLS1_1 => "TLSv1.1",
            Self::TLS1_2 => "TLSv1.2",
            Self::TLS1_3 => "TLSv1.3",
            Self::DTLS1 => "DTLSv1",
            Self::DTLS1_2 => "DTLSv1.2",
            _ => return None,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => f.write_str(label),
            None => write!(f, "0x{:04x}", self.0),
        }
    }
}

/// Record content type as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentType(c_int);

impl ContentType {
    pub const CHANGE_CIPHER_SPEC: Self = Self(20);
    pub const ALERT: Self = Self(21);
    pub const HANDSHAKE: Self = Self(22);
    pub const APPLICATION_DATA: Self = Self(23);
    /// Pseudo content type used when the engine traces a raw record header.
    pub const HEADER: Self = Self(0x100);
    /// Pseudo content type carrying the TLS 1.3 inner content type byte.
    pub const INNER_CONTENT_TYPE: Self = Self(0x101);

    pub const fn from_raw(raw: c_int) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> c_int {
        self.0
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::CHANGE_CIPHER_SPEC => "change_cipher_spec",
            Self::ALERT => "alert",
            Self::HANDSHAKE => "handshake",
            Self::APPLICATION_DATA => "application_data",
            Self::HEADER => "header",
            Self::INNER_CONTENT_TYPE => "inner_content_type",
            other => return write!(f, "content_type({})", other.0),
        };
        f.write_str(name)
    }
}

/// Certificate verification error code from the store context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerifyResult(c_int);

impl VerifyResult {
    pub const OK: Self = Self(0);
    pub const UNABLE_TO_GET_ISSUER_CERT: Self = Self(2);
    pub const CERT_NOT_YET_VALID: Self = Self(9);
    pub const CERT_HAS_EXPIRED: Self = Self(10);
    pub const DEPTH_ZERO_SELF_SIGNED_CERT: Self = Self(18);
    pub const SELF_SIGNED_CERT_IN_CHAIN: Self = Self(19);
    pub const UNABLE_TO_GET_ISSUER_CERT_LOCALLY: Self = Self(20);
    pub const CERT_CHAIN_TOO_LONG: Self = Self(22);
    pub const HOSTNAME_MISMATCH: Self = Self(62);

    pub const fn from_raw(raw: c_int) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> c_int {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::OK => "ok",
            Self::UNABLE_TO_GET_ISSUER_CERT => "unable to get issuer certificate",
            Self::CERT_NOT_YET_VALID => "certificate is not yet valid",
            Self::CERT_HAS_EXPIRED => "certificate has expired",
            Self::DEPTH_ZERO_SELF_SIGNED_CERT => "self-signed certificate",
            Self::SELF_SIGNED_CERT_IN_CHAIN => "self-signed certificate in certificate chain",
            Self::UNABLE_TO_GET_ISSUER_CERT_LOCALLY => "unable to get local issuer certificate",
            Self::CERT_CHAIN_TOO_LONG => "certificate chain too long",
            Self::HOSTNAME_MISMATCH => "hostname mismatch",
            _ => "unknown verification error",
        }
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ServernameStatus::Ok, 0)]
    #[case(ServernameStatus::AlertWarning, 1)]
    #[case(ServernameStatus::AlertFatal, 2)]
    #[case(ServernameStatus::NoAck, 3)]
    fn servername_status_uses_engine_codes(#[case] status: ServernameStatus, #[case] raw: c_int) {
        assert_eq!(status.as_raw(), raw);
        assert_eq!(ServernameStatus::from_raw(raw), Some(status));
    }

    #[test]
    fn unknown_versions_and_content_types_pass_through() {
        let version = ProtocolVersion::from_raw(0x7f1c);
        assert_eq!(version.as_raw(), 0x7f1c);
        assert_eq!(version.label(), None);
        assert_eq!(version.to_string(), "0x7f1c");

        let content = ContentType::from_raw(99);
        assert_eq!(content.as_raw(), 99);
        assert_eq!(content.to_string(), "content_type(99)");
        assert_eq!(ContentType::HANDSHAKE.to_string(), "handshake");
    }

    #[test]
    fn unknown_option_bits_are_retained() {
        let raw = SslOptions::NO_TICKET.bits() | (1 << 3);
        let options = SslOptions::from_bits_retain(raw);
        assert!(options.contains(SslOptions::NO_TICKET));
        assert_eq!(options.bits(), raw);
    }
}
