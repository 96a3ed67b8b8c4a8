//! Rill: a class-based-queueing network core.
//!
//! Three tightly coupled subsystems define how packets move:
//!
//! - the device and protocol dispatch layer ([`dev`], [`ptype`],
//!   [`softnet`]): interface registration, the receive softirq, and the
//!   transmit entry point;
//! - the queueing-discipline framework ([`qdisc`]) with the CBQ
//!   implementation ([`cbq`]), its classifiers ([`cls`]), rate tables
//!   ([`ratetab`]) and timers ([`timer`]);
//! - the AF_UNIX socket family ([`unix`]), which moves packets directly
//!   between peer queues and never touches a device.
//!
//! The control plane ([`ctrl`]) is the typed replacement for an
//! ioctl/netlink surface.

#![no_std]

pub mod cbq;
pub mod cls;
pub mod ctrl;
pub mod dev;
pub mod pkt;
pub mod ptype;
pub mod qdisc;
pub mod ratetab;
pub mod softnet;
pub mod timer;
pub mod types;
pub mod unix;

#[cfg(feature = "itests")]
pub mod cbq_tests;
#[cfg(feature = "itests")]
pub mod testutil;
#[cfg(feature = "itests")]
pub mod qdisc_tests;
#[cfg(feature = "itests")]
pub mod unix_tests;

pub use pkt::{Pkt, PktCb};
pub use types::{Ifindex, PktType};
