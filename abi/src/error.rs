//! Error taxonomy for the networking core.
//!
//! One enum covers every failure the core can report. Each variant maps to
//! exactly one POSIX errno for embedders that surface a syscall boundary.
//! Softirq-context failures are never reported through this type; they are
//! counted in drop statistics instead.

use core::fmt;

/// Errors reported by the networking core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// Transient resource exhaustion; the caller may retry (ENOMEM/ENOBUFS).
    NoMemory,
    /// A blocking operation was attempted in non-blocking mode (EAGAIN).
    Again,
    /// A blocking wait was woken by a signal (ERESTARTSYS).
    Interrupted,
    /// The name is already hashed in the socket table (EADDRINUSE).
    AddrInUse,
    /// No address could be produced, e.g. auto-bind space exhausted (EADDRNOTAVAIL).
    AddrNotAvail,
    /// The target socket vanished or refuses connections (ECONNREFUSED).
    ConnRefused,
    /// The peer closed with data still queued (ECONNRESET).
    ConnReset,
    /// No destination and no connected peer (ENOTCONN).
    NotConn,
    /// connect() on an already-connected stream socket (EISCONN).
    IsConn,
    /// Write after the peer shut down its receive side (EPIPE).
    Pipe,
    /// Malformed address, bad flags, or out-of-range parameters (EINVAL).
    Inval,
    /// Unknown device name or index (ENODEV).
    NoDev,
    /// The device is not up (ENETDOWN).
    NetDown,
    /// Queue full on a non-blocking path or congestion from enqueue (EBUSY).
    Busy,
    /// Unsupported operation, e.g. OOB data on AF_UNIX (EOPNOTSUPP).
    NotSupp,
    /// Peer pairing or capability check failed (EPERM).
    Perm,
    /// Control-plane lookup found no such object (ENOENT).
    NoEnt,
    /// Socket type mismatch between endpoints (EPROTOTYPE).
    Proto,
}

impl NetError {
    /// Convert to a POSIX errno value (negative) for the syscall boundary.
    pub const fn to_errno(&self) -> i32 {
        match self {
            Self::NoMemory => -12,     // ENOMEM
            Self::Again => -11,        // EAGAIN
            Self::Interrupted => -512, // ERESTARTSYS
            Self::AddrInUse => -98,    // EADDRINUSE
            Self::AddrNotAvail => -99, // EADDRNOTAVAIL
            Self::ConnRefused => -111, // ECONNREFUSED
            Self::ConnReset => -104,   // ECONNRESET
            Self::NotConn => -107,     // ENOTCONN
            Self::IsConn => -106,      // EISCONN
            Self::Pipe => -32,         // EPIPE
            Self::Inval => -22,        // EINVAL
            Self::NoDev => -19,        // ENODEV
            Self::NetDown => -100,     // ENETDOWN
            Self::Busy => -16,         // EBUSY
            Self::NotSupp => -95,      // EOPNOTSUPP
            Self::Perm => -1,          // EPERM
            Self::NoEnt => -2,         // ENOENT
            Self::Proto => -91,        // EPROTOTYPE
        }
    }

    /// Reverse of [`to_errno`](Self::to_errno); `None` for unknown values.
    pub const fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            -12 => Some(Self::NoMemory),
            -11 => Some(Self::Again),
            -512 => Some(Self::Interrupted),
            -98 => Some(Self::AddrInUse),
            -99 => Some(Self::AddrNotAvail),
            -111 => Some(Self::ConnRefused),
            -104 => Some(Self::ConnReset),
            -107 => Some(Self::NotConn),
            -106 => Some(Self::IsConn),
            -32 => Some(Self::Pipe),
            -22 => Some(Self::Inval),
            -19 => Some(Self::NoDev),
            -100 => Some(Self::NetDown),
            -16 => Some(Self::Busy),
            -95 => Some(Self::NotSupp),
            -1 => Some(Self::Perm),
            -2 => Some(Self::NoEnt),
            -91 => Some(Self::Proto),
            _ => None,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
