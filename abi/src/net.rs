//! Socket-facing constants and flag types.

use bitflags::bitflags;

/// Longest AF_UNIX name, filesystem or abstract, in bytes.
pub const UNIX_PATH_MAX: usize = 108;

/// Socket type of an AF_UNIX endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SockType {
    /// Connection-oriented byte stream.
    Stream,
    /// Connectionless datagrams with preserved boundaries.
    Dgram,
}

impl SockType {
    /// Numeric discriminant folded into the abstract-name hash.
    #[inline]
    pub const fn as_hash_salt(self) -> usize {
        match self {
            SockType::Stream => 1,
            SockType::Dgram => 2,
        }
    }
}

bitflags! {
    /// Per-call message flags accepted by send/recv operations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Convert any would-sleep into `Again`.
        const DONTWAIT = 1 << 0;
        /// Suppress SIGPIPE on a broken stream.
        const NOSIGNAL = 1 << 1;
        /// Read without consuming.
        const PEEK     = 1 << 2;
        /// Datagram was larger than the supplied buffer (output flag).
        const TRUNC    = 1 << 3;
        /// Block until the full requested length has been received.
        const WAITALL  = 1 << 4;
        /// Out-of-band data; never supported on AF_UNIX.
        const OOB      = 1 << 5;
    }
}

bitflags! {
    /// Shutdown direction bits stored per socket.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Shutdown: u8 {
        /// No more receives.
        const RCV = 1 << 0;
        /// No more sends.
        const SND = 1 << 1;
    }
}

impl Shutdown {
    /// Both directions, applied on close.
    pub const MASK: Self = Self::from_bits_truncate(Self::RCV.bits() | Self::SND.bits());

    /// Decode the classic `SHUT_RD`/`SHUT_WR`/`SHUT_RDWR` argument.
    ///
    /// The conventional encoding maps `mode + 1` onto the direction bits.
    #[inline]
    pub const fn from_how(how: u8) -> Self {
        Self::from_bits_truncate((how + 1) & Self::MASK.bits())
    }
}

bitflags! {
    /// Poll-style readiness bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PollMask: u16 {
        const IN   = 1 << 0;
        const OUT  = 1 << 1;
        const ERR  = 1 << 2;
        const HUP  = 1 << 3;
    }
}

/// Credentials stamped on every queued AF_UNIX message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ucred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}
