//! Named protocol constants.
//!
//! The original implementation hard-codes these as C `#define`s scattered
//! through `tcp_input.c`/`tcp_output.c`/`tcb.h`; gathering them here keeps
//! the state machine itself free of magic numbers.

use std::time::Duration;

/// Default maximum segment size assumed for a peer that sends no MSS option.
pub const TCP_DEF_MSS: u16 = 536;

/// Maximum segment lifetime. `2 * MSL` is the TIME_WAIT duration.
pub const MSL: Duration = Duration::from_secs(60);

/// Lower bound on the retransmission timeout (RFC 6298).
pub const RTO_MIN: Duration = Duration::from_secs(1);

/// Base RTO used for the initial SYN before any RTT sample exists.
pub const TCP_SYN_RTO: Duration = Duration::from_secs(1);

/// Number of SYN retransmissions before giving up, matching `R2_SYN` under
/// 1 s-base exponential backoff.
pub const TCP_SYN_COUNT: u32 = 6;

/// Elapsed-time threshold past which a data segment's path is suspected of
/// failing (RFC 793 S3.8.3 R1). Logged only; retransmission continues.
pub const TCP_R1: Duration = Duration::from_secs(50);

/// Elapsed-time threshold past which a connection is abandoned outright
/// (RFC 793 S3.8.3 R2).
pub const TCP_R2: Duration = Duration::from_secs(100);

/// R1 equivalent during the SYN handshake.
pub const TCP_R1_SYN: Duration = Duration::from_secs(60);

/// R2 equivalent during the SYN handshake; must allow retransmission of the
/// SYN for at least 3 minutes (RFC 9293 S3.8.3).
pub const TCP_R2_SYN: Duration = Duration::from_secs(180);

/// Initial receive window advertised by a fresh TCB.
pub const INITIAL_RCV_WND: u16 = u16::MAX;

/// Lowest ephemeral port handed out by `NetStack::connect`.
pub const EPHEMERAL_PORT_LO: u16 = 32768;

/// Highest ephemeral port handed out by `NetStack::connect`.
pub const EPHEMERAL_PORT_HI: u16 = 65535;

/// Bound on a listener's accept backlog (SPEC_FULL.md's `max_backlog`):
/// child sockets that finish the handshake once this many are already
/// waiting to be accepted are dropped.
pub const PENDING_QUEUE_DEPTH: usize = 4;
