use std::cmp;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering::{self, Acquire};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, TcpOptionElement};
use log::{debug, trace, warn};
use tidy_tuntap::Tun;

use crate::config;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

/*
                    RFC 9293 - S3.3.2 - Fig 5

                            +---------+ ---------\      active OPEN
                            |  CLOSED |            \    -----------
                            +---------+<---------\   \   create TCB
                              |     ^              \   \  snd SYN
                 passive OPEN |     |   CLOSE        \   \
                 ------------ |     | ----------       \   \
                  create TCB  |     | delete TCB         \   \
                              V     |                      \   \
          rcv RST (note 1)  +---------+            CLOSE    |    \
       -------------------->|  LISTEN |          ---------- |     |
      /                     +---------+          delete TCB |     |
     /           rcv SYN      |     |     SEND              |     |
    /           -----------   |     |    -------            |     V
+--------+      snd SYN,ACK  /       \   snd SYN          +--------+
|        |<-----------------           ------------------>|        |
|  SYN   |                    rcv SYN                     |  SYN   |
|  RCVD  |<-----------------------------------------------|  SENT  |
|        |                  snd SYN,ACK                   |        |
|        |------------------           -------------------|        |
+--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
   |         --------------   |     |   -----------
   |                x         |     |     snd ACK
   |                          V     V
   |  CLOSE                 +---------+
   | -------                |  ESTAB  |
   | snd FIN                +---------+
   |                 CLOSE    |     |    rcv FIN
   V                -------   |     |    -------
+---------+         snd FIN  /       \   snd ACK         +---------+
|  FIN    |<----------------          ------------------>|  CLOSE  |
| WAIT-1  |------------------                            |   WAIT  |
+---------+          rcv FIN  \                          +---------+
  | rcv ACK of FIN   -------   |                          CLOSE  |
  | --------------   snd ACK   |                         ------- |
  V        x                   V                         snd FIN V
+---------+               +---------+                    +---------+
|FINWAIT-2|               | CLOSING |                    | LAST-ACK|
+---------+               +---------+                    +---------+
  |              rcv ACK of FIN |                 rcv ACK of FIN |
  |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
  |  -------            x       V    ------------        x       V
   \ snd ACK              +---------+delete TCB          +---------+
     -------------------->|TIME-WAIT|------------------->| CLOSED  |
                          +---------+                    +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynRcvd,
    SynSent,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND

1 - old sequence numbers that have been acknowledged
2 - sequence numbers of unacknowledged data
3 - sequence numbers allowed for new data transmission
4 - future sequence numbers that are not yet allowed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSpace {
    una: u32, // send unacknowledged
    nxt: u32, // send next
    wnd: u16, // send window
    urp: u16, // send urgent pointer
    wl1: u32, // segment sequence number used for last window update
    wl2: u32, // segment acknowledgment number used for last window update
    iss: u32, // initial send sequence number
    mss: u16, // sender maximum segment size

    max_wnd: u16, // maximum window that the receiver has advertised
}

/*
                RFC 9293 - S3.3.1 - Fig 4

                       1          2          3
                   ----------|----------|----------
                          RCV.NXT    RCV.NXT
                                    +RCV.WND

        1 - old sequence numbers that have been acknowledged
        2 - sequence numbers allowed for new reception
        3 - future sequence numbers that are not yet allowed
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvSpace {
    nxt: u32, // receive next
    wnd: u16, // receive window
    urp: u16, // receive urgent pointer
    irs: u32, // initial receive seqeunce number
    mss: u16, // receiver maximum segment size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
pub enum Action {
    Noop,
    AddToPending(TCB),
    RemoveFromPending,
    IsEstablished,
    Reset,
    DeleteTCB,
    Wakeup {
        wake_up_reader: bool,
        wake_up_writer: bool,
        wake_up_closer: bool,
    },
    ConnectionRefused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    sno: u32,
    una: u32,
    len: u32,
    fin: bool,
    syn: bool,
    ack: bool,

    retry: bool,
    total_ret_time: u128,
    sent: Option<Instant>,
    mss: Option<u16>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.sno.wrapping_add(self.len).wrapping_sub(1)
    }

    fn unacked_data_len(&self) -> usize {
        (self.end().wrapping_sub(self.una) + 1) as usize - if self.fin { 1 } else { 0 }
    }
}

/// Connection state required by RFC 793, plus the timers and buffers that
/// drive a single TCP connection's input/output/retransmission processing.
#[derive(Debug, Clone)]
pub struct TCB {
    pub(crate) quad: Quad,
    pub(crate) kind: Kind,
    pub(crate) state: State,
    pub(crate) reset: Arc<AtomicBool>,
    pub(crate) write_closed: Arc<AtomicBool>,
    pub(crate) read_closed: Arc<AtomicBool>,
    pub(crate) time_wait: Option<Instant>,

    pub(crate) snd: SendSpace,
    pub(crate) rcv: RecvSpace,

    pub(crate) srtt: u128,
    pub(crate) rttvar: u128,
    pub(crate) rto: u128,
    pub(crate) rtt_measured: bool,
    pub(crate) timeout: Option<Instant>,
    pub(crate) r1: u128,
    pub(crate) r2: Arc<AtomicU64>,
    pub(crate) r1_syn: u128,
    pub(crate) r2_syn: Arc<AtomicU64>,

    /// Set once a FIN carrying segment has been handed to [`TCB::on_tick`] for
    /// transmission. Paired with `fin_acked` to track the FIN's phantom
    /// sequence byte explicitly instead of inferring it from buffer indices.
    pub(crate) fin_sent: bool,
    /// Set once the FIN's phantom sequence byte has been fully acknowledged.
    pub(crate) fin_acked: bool,

    pub(crate) probe_timeout: Option<Instant>,

    pub(crate) incoming: VecDeque<u8>,
    pub(crate) outgoing: VecDeque<u8>,
    pub(crate) segments: VecDeque<Segment>,
}

impl TCB {
    fn blank(quad: Quad, kind: Kind, state: State, iss: u32) -> Self {
        TCB {
            quad,
            kind,
            state,
            reset: Arc::new(AtomicBool::new(false)),
            write_closed: Arc::new(AtomicBool::new(false)),
            read_closed: Arc::new(AtomicBool::new(false)),
            time_wait: None,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                urp: 0,
                wl1: 0,
                wl2: 0,
                iss,
                mss: config::TCP_DEF_MSS,
                max_wnd: 0,
            },
            rcv: RecvSpace {
                nxt: 0,
                wnd: config::INITIAL_RCV_WND,
                urp: 0,
                irs: 0,
                mss: config::TCP_DEF_MSS,
            },
            srtt: 0,
            rttvar: 0,
            // Until a round-trip time (RTT) measurement has been made for a
            // segment, the sender SHOULD set RTO <- 1 second (RFC 6298).
            rto: config::TCP_SYN_RTO.as_millis(),
            rtt_measured: false,
            timeout: None,
            r1: config::TCP_R1.as_millis(),
            r2: Arc::new(AtomicU64::new(config::TCP_R2.as_millis() as u64)),
            r1_syn: config::TCP_R1_SYN.as_millis(),
            r2_syn: Arc::new(AtomicU64::new(config::TCP_R2_SYN.as_millis() as u64)),
            fin_sent: false,
            fin_acked: false,
            probe_timeout: None,
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            segments: VecDeque::new(),
        }
    }

    pub fn listen(quad: Quad, iss: u32) -> Self {
        Self::blank(quad, Kind::Passive, State::Listen, iss)
    }

    pub fn syn_sent(quad: Quad, iss: u32) -> Self {
        let mut tcb = Self::blank(quad, Kind::Active, State::SynSent, iss);

        tcb.segments.push_front(Segment {
            sno: tcb.snd.nxt,
            una: tcb.snd.nxt,
            len: 1,
            fin: false,
            syn: true,
            ack: false,
            retry: false,
            total_ret_time: 0,
            sent: None,
            mss: Some(tcb.rcv.mss),
        });

        tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);

        tcb
    }

    pub fn is_outgoing_full(&self) -> bool {
        self.outgoing.capacity() == self.outgoing.len()
    }

    fn is_fin_acked(&self) -> bool {
        let acked = self.fin_acked && self.outgoing.is_empty() && self.segments.is_empty();
        trace!("is_fin_acked: {acked}");
        acked
    }

    fn available_data_len(&self) -> usize {
        let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        self.outgoing.len() - sent_len
    }

    fn sws_allows_send(&self) -> bool {
        /*
                RFC 9293 - S3.8.6.2.1. Sender's Algorithm -- When to Send Data

            The "usable window" is:

            U = SND.UNA + SND.WND - SND.NXT

            i.e., the offered window less the amount of data sent but not
            acknowledged. If D is the amount of data queued in the sending TCP
            endpoint but not yet sent, then the following set of rules is
            recommended.

            Send data:

            (1) if a maximum-sized segment can be sent, i.e., if:
                min(D,U) >= Eff.snd.MSS;

            (2) or if the data is pushed and all queued data can be sent now, i.e., if:
                [SND.NXT = SND.UNA and] PUSHed and D <= U
                (the bracketed condition is imposed by the Nagle algorithm);

            (3)  or if at least a fraction Fs of the maximum window can be sent, i.e., if:
                [SND.NXT = SND.UNA and] min(D,U) >= Fs * Max(SND.WND);

            (4) or if the override timeout occurs.

            Here Fs is a fraction whose recommended value is 1/2. The override
            timeout should be in the range 0.1 - 1.0 seconds. It may be
            convenient to combine this timer with the timer used to probe
            zero windows.
        */

        let d = self.available_data_len();
        let u = self
            .snd
            .una
            .wrapping_add(self.snd.wnd as u32)
            .wrapping_sub(self.snd.nxt) as usize;

        cmp::min(d, u) >= self.snd.mss as usize
            || d <= u
            || cmp::min(d, u) >= (0.5 * self.snd.max_wnd as f64) as usize
    }

    pub fn close(&mut self) {
        if self.state == State::Estab {
            debug!("{:?}: Estab -> FinWait1", self.quad);
            self.state = State::FinWait1;
        } else {
            assert_eq!(self.state, State::CloseWait);

            debug!("{:?}: CloseWait -> LastAck", self.quad);
            self.state = State::LastAck;
        }

        // When we close the write half of the TCP stream, we must send a FIN.
        // If there is any data available to be sent, FIN will be set on the
        // last segment (see on_tick). Otherwise append a bare FIN segment.
        if self.available_data_len() == 0 {
            let fin = Segment {
                sno: self.snd.nxt,
                una: self.snd.nxt,
                len: 1,
                fin: true,
                syn: false,
                ack: true,
                retry: false,
                total_ret_time: 0,
                sent: None,
                mss: None,
            };

            self.segments.push_back(fin);
            self.fin_sent = true;

            self.snd.nxt = self.snd.nxt.wrapping_add(1);
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let len = cmp::min(buf.len(), self.incoming.len());

        let data: Vec<u8> = self.incoming.drain(..len).collect();

        buf[..data.len()].copy_from_slice(&data[..]);

        /*
                RFC9293 S3.8.6.2.2. Receiver's Algorithm -- When to Send a Window Update

        A TCP implementation MUST include a SWS avoidance algorithm in the
        receiver (MUST-39). The solution to receiver SWS is to avoid
        advancing the right window edge RCV.NXT+RCV.WND in small increments.

        The suggested SWS avoidance algorithm for the receiver is to keep
        RCV.NXT+RCV.WND fixed until the reduction satisfies:

            RCV.BUFF - RCV.USER - RCV.WND  >=  min( Fr * RCV.BUFF, Eff.snd.MSS )

        where Fr is a fraction whose recommended value is 1/2.
        */

        if self.incoming.capacity() - self.incoming.len() - self.rcv.wnd as usize
            >= cmp::min(
                (0.5 * self.incoming.capacity() as f64) as usize,
                self.snd.mss as usize,
            )
        {
            self.rcv.wnd = (self.incoming.capacity() - self.incoming.len()) as u16;
        }

        len
    }

    /// Drives retransmission, zero-window probing, outgoing segmentation and
    /// the TIME_WAIT timer. Returns `true` when the caller should delete this
    /// TCB (R2 threshold exceeded or TIME_WAIT elapsed).
    pub fn on_tick(&mut self, tun: &mut Tun) -> bool {
        if let Some(timeout) = self.timeout {
            if Instant::now() >= timeout {
                let seg = self.segments.front_mut().unwrap();

                let data: Vec<u8> = self
                    .outgoing
                    .iter()
                    .cloned()
                    .take(seg.unacked_data_len())
                    .collect();

                trace!(
                    "retransmitting {} bytes (fin={} syn={} ack={})",
                    data.len(),
                    seg.fin,
                    seg.syn,
                    seg.ack
                );
                write_data(
                    self.quad,
                    seg.sno,
                    self.rcv.nxt,
                    self.rcv.wnd,
                    tun,
                    &data[..],
                    seg.fin,
                    seg.syn,
                    seg.ack,
                    seg.mss,
                );

                seg.retry = true;
                seg.total_ret_time += self.rto;
                seg.sent = Some(Instant::now());

                self.rto *= 2;
                self.timeout = Some(seg.sent.unwrap() + Duration::from_millis(self.rto as u64));

                /*
                        RFC 9293 S3.8.3. TCP Connection Failures

                There are two thresholds R1 and R2 measuring the amount of
                retransmission that has occurred for the same segment. When
                the number of transmissions reaches R1, pass negative advice
                (dead-gateway diagnosis, logged only here). When it reaches
                R2, close the connection.

                R2 for a SYN segment MUST be set large enough to provide
                retransmission of the segment for at least 3 minutes.
                */
                if seg.syn {
                    if seg.total_ret_time > self.r1_syn {
                        warn!("{:?}: SYN R1 threshold reached, path may be failing", self.quad);
                    }
                    if seg.total_ret_time as u64 > self.r2_syn.load(Acquire) {
                        warn!("{:?}: SYN R2 threshold reached, abandoning connection", self.quad);
                        return true;
                    }
                } else {
                    if seg.total_ret_time > self.r1 {
                        warn!("{:?}: R1 threshold reached, path may be failing", self.quad);
                    }
                    if seg.total_ret_time as u64 > self.r2.load(Acquire) {
                        warn!("{:?}: R2 threshold reached, abandoning connection", self.quad);
                        return true;
                    }
                }
            }
        }

        if !self.outgoing.is_empty() {
            if self.sws_allows_send() {
                let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
                let available_len = self.outgoing.len() - sent_len;

                let to_be_sent = cmp::min(available_len, self.snd.wnd as usize);

                if to_be_sent > 0 {
                    let data_len = cmp::min(to_be_sent, self.snd.mss as usize);
                    let fin = data_len == to_be_sent && self.write_closed.load(Ordering::Acquire);

                    let data: Vec<u8> = self
                        .outgoing
                        .iter()
                        .copied()
                        .skip(sent_len)
                        .take(data_len)
                        .collect();

                    trace!("sending {} bytes of outgoing data (fin={fin})", data.len());
                    write_data(
                        self.quad,
                        self.snd.nxt,
                        self.rcv.nxt,
                        self.rcv.wnd,
                        tun,
                        data.as_slice(),
                        fin,
                        false,
                        true,
                        None,
                    );

                    let seg = Segment {
                        sno: self.snd.nxt,
                        una: self.snd.nxt,
                        len: data_len as u32,
                        fin,
                        syn: false,
                        ack: true,
                        retry: false,
                        total_ret_time: 0,
                        sent: Some(Instant::now()),
                        mss: None,
                    };

                    self.timeout =
                        Some(seg.sent.unwrap() + Duration::from_millis(self.rto as u64));

                    if fin {
                        self.fin_sent = true;
                    }

                    self.segments.push_back(seg);

                    self.snd.nxt = self
                        .snd
                        .nxt
                        .wrapping_add(data_len as u32)
                        .wrapping_add(if fin { 1 } else { 0 });
                }
            }
        } else if let Some(seg) = self.segments.front_mut() {
            if seg.sent.is_none() {
                trace!(
                    "sending control segment (fin={} syn={} ack={})",
                    seg.fin, seg.syn, seg.ack
                );
                write_data(
                    self.quad,
                    seg.sno,
                    self.rcv.nxt,
                    self.rcv.wnd,
                    tun,
                    &[],
                    seg.fin,
                    seg.syn,
                    seg.ack,
                    seg.mss,
                );

                seg.sent = Some(Instant::now());

                if self.timeout.is_none() {
                    self.timeout =
                        Some(seg.sent.unwrap() + Duration::from_millis(self.rto as u64));
                }
            }
        }

        if let Some(time_wait) = self.time_wait {
            if Instant::now() >= time_wait {
                debug!("{:?}: TIME_WAIT elapsed, deleting TCB", self.quad);
                return true;
            }
        }

        if let Some(probe_timeout) = self.probe_timeout {
            /*
                    RFC 9293 S3.8.6.1. Zero-Window Probing

            The sending TCP peer must regularly transmit at least one octet of
            new data (if available), or retransmit, even if the send window
            is zero, in order to "probe" the window. Probing of zero (offered)
            windows MUST be supported (MUST-36).
            */
            if Instant::now() >= probe_timeout {
                trace!("{:?}: sending zero-window probe", self.quad);
                write_data(
                    self.quad,
                    self.snd.una.wrapping_sub(1),
                    self.rcv.nxt,
                    self.rcv.wnd,
                    tun,
                    &[0u8; 1],
                    false,
                    false,
                    true,
                    None,
                );

                self.probe_timeout = Some(Instant::now() + Duration::from_millis(self.rto as u64));
            }
        }

        false
    }

    /// Applies an incoming ACK to `snd.una`/`unacked segments`. Returns
    /// `(writer_can_proceed, rtt_sample)`; `rtt_sample` is only `Some` for a
    /// segment that was never retransmitted (Karn's algorithm, RFC 6298).
    fn process_ack(&mut self, ackno: u32) -> (bool, Option<u128>) {
        self.snd.una = ackno;

        let mut compute_rto = false;
        let mut r = 0;

        let before_len = self.outgoing.len();

        while !self.segments.is_empty() {
            let seg = self.segments.front_mut().unwrap();
            let end = seg.end();

            compute_rto = !seg.retry;
            r = (Instant::now() - seg.sent.unwrap()).as_millis();

            if is_between_wrapped(seg.una, ackno, end.wrapping_add(1)) {
                // Partial acknowledgment.
                let acked = ackno.wrapping_sub(seg.una);
                self.outgoing.drain(..acked as usize);
                seg.una = ackno;
                break;
            } else if wrapping_lt(end, ackno) {
                // Full acknowledgment.
                let seg = self.segments.pop_front().unwrap();
                self.outgoing.drain(..seg.unacked_data_len());
                if seg.fin {
                    self.fin_acked = true;
                }
            } else {
                break;
            }
        }

        if self.segments.is_empty() {
            self.timeout = None;
        } else {
            let seg = self.segments.front().unwrap();
            self.timeout = Some(seg.sent.unwrap() + Duration::from_millis(self.rto as u64));
        }

        (before_len < self.outgoing.len(), compute_rto.then_some(r))
    }

    fn compute_rto(&mut self, r: u128) {
        /*
        -   When the first RTT measurement R is made:
                SRTT <- R
                RTTVAR <- R/2
        -   On subsequent measurements R':
                RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
                SRTT <- (1 - alpha) * SRTT + alpha * R'
            (alpha=1/8, beta=1/4)
        -   RTO <- SRTT + max(G, K*RTTVAR), K = 4
        */
        if !self.rtt_measured {
            self.srtt = r;
            self.rttvar = r / 2;
            self.rtt_measured = true;
        } else {
            self.rttvar =
                ((1.0 - 0.25) * self.rttvar as f64 + 0.25 * self.srtt.abs_diff(r) as f64) as u128;
            self.srtt = ((1.0 - 0.125) * self.srtt as f64 + 0.125 * r as f64) as u128;
        }

        self.rto = self.srtt + cmp::max(100, 4 * self.rttvar);

        // Whenever RTO is computed, if it is less than RTO_MIN, round up.
        self.rto = cmp::max(self.rto, config::RTO_MIN.as_millis());
    }

    pub fn on_segment(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        tun: &mut Tun,
    ) -> Action {
        trace!("{:?}: on_segment in state {:?}", self.quad, self.state);
        if self.state == State::Listen {
            /*
            If the state is LISTEN:
            First, check for a RST: an incoming RST could not be valid since
            it could not have been sent in response to anything sent by this
            incarnation of the connection. Ignore. Return.

            Second, check for an ACK: any acknowledgment is bad if it arrives
            on a connection still in the LISTEN state. Form a reset:
                <SEQ=SEG.ACK><CTL=RST>
            Return.

            Third, check for a SYN: set RCV.NXT to SEG.SEQ+1, IRS is set to
            SEG.SEQ, ISS is selected and a SYN segment is sent of the form:
                <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
            SND.NXT is set to ISS+1 and SND.UNA to ISS. State -> SYN-RECEIVED.

            Fourth, drop any other data or control.
            */

            if tcph.rst() {
                return Action::Noop;
            }

            if tcph.ack() {
                write_reset(&ip4h, &tcph, data, tun);
                return Action::Noop;
            }

            if tcph.syn() {
                let mss = tcph
                    .options_iterator()
                    .find_map(|op| match op.unwrap() {
                        TcpOptionElement::MaximumSegmentSize(mss) => Some(mss),
                        _ => None,
                    })
                    .unwrap_or(config::TCP_DEF_MSS);

                self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
                self.rcv.irs = tcph.sequence_number();

                self.snd.wnd = tcph.window_size();
                self.snd.max_wnd = tcph.window_size();
                self.snd.mss = mss;

                self.segments.push_front(Segment {
                    sno: self.snd.nxt,
                    una: self.snd.nxt,
                    len: 1,
                    fin: false,
                    syn: true,
                    ack: true,
                    retry: false,
                    total_ret_time: 0,
                    sent: None,
                    mss: None,
                });

                self.snd.nxt = self.snd.iss.wrapping_add(1);

                debug!("{:?}: Listen -> SynRcvd", self.quad);
                self.state = State::SynRcvd;

                return Action::AddToPending(self.clone());
            }

            return Action::Noop;
        } else if self.state == State::SynSent {
            /*
            If the state is SYN-SENT:
            First, check the ACK bit: if SEG.ACK =< ISS or SEG.ACK > SND.NXT,
            send a reset (unless RST set, then drop) and return.

            Second, check the RST bit: if the ACK was acceptable, signal
            "connection reset", drop the segment, enter CLOSED, delete TCB.

            Fourth, check the SYN bit: RCV.NXT <- SEG.SEQ+1, IRS <- SEG.SEQ.
            SND.UNA should be advanced to SEG.ACK (if ACK present) and any
            now-acknowledged retransmission-queue segments removed.

            If SND.UNA > ISS, enter ESTABLISHED and send an ACK. Otherwise
            enter SYN-RECEIVED and send SYN,ACK.
            */
            if tcph.ack() {
                if is_between_wrapped(
                    self.snd.una,
                    tcph.acknowledgment_number(),
                    self.snd.nxt.wrapping_add(1),
                ) {
                    if tcph.rst() {
                        return Action::Reset;
                    }
                } else {
                    write_reset(&ip4h, &tcph, &[], tun);
                    return Action::Noop;
                }
            }

            if tcph.syn() {
                self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
                self.rcv.irs = tcph.sequence_number();
                self.snd.una = tcph.acknowledgment_number();

                // Our syn is acked
                if wrapping_lt(self.snd.iss, self.snd.una) {
                    self.snd.wnd = tcph.window_size();
                    self.snd.wl1 = tcph.sequence_number();
                    self.snd.wl2 = tcph.acknowledgment_number();

                    if self.snd.wnd > self.snd.max_wnd {
                        self.snd.max_wnd = self.snd.wnd;
                    }

                    self.outgoing.reserve_exact(self.snd.wnd as usize);
                    self.incoming.reserve_exact(config::INITIAL_RCV_WND as usize);

                    self.segments.pop_front().unwrap();
                    assert!(self.segments.is_empty());

                    self.timeout.take();

                    debug!("{:?}: SynSent -> Estab", self.quad);
                    self.state = State::Estab;

                    write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);

                    return Action::IsEstablished;
                } else {
                    debug!("{:?}: SynSent -> SynRcvd", self.quad);
                    self.state = State::SynRcvd;

                    write_synack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);

                    return Action::Noop;
                }
            }

            return Action::Noop;
        } else {
            // All synchronized states: SYN-RECEIVED through TIME-WAIT.
            let seg_len =
                data.len() + if tcph.ack() { 1 } else { 0 } + if tcph.fin() { 1 } else { 0 };

            // Step 1: sequence number validity.
            if !self.is_segment_valid(&tcph, seg_len as u32) {
                if tcph.rst() {
                    return Action::Noop;
                }

                trace!("{:?}: segment out of window, acking", self.quad);
                write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);

                return Action::Noop;
            }

            // Step 2: RST bit.
            if tcph.rst() {
                if self.state == State::SynRcvd {
                    // Passive OPEN: return to LISTEN silently. Active OPEN:
                    // connection refused.
                    if self.kind == Kind::Passive {
                        return Action::RemoveFromPending;
                    } else {
                        return Action::ConnectionRefused;
                    }
                } else if self.state == State::Estab
                    || self.state == State::FinWait1
                    || self.state == State::FinWait2
                    || self.state == State::CloseWait
                {
                    self.reset.store(true, Ordering::Release);
                    return Action::Reset;
                }
            }

            // Step 4: SYN-in-window.
            if tcph.syn()
                && (self.state == State::SynRcvd
                    || self.state == State::Estab
                    || self.state == State::FinWait1
                    || self.state == State::FinWait2
                    || self.state == State::CloseWait
                    || self.state == State::Closing
                    || self.state == State::LastAck
                    || self.state == State::TimeWait)
            {
                // RFC 5961's challenge-ACK refinement is not implemented;
                // following plain RFC 793 we reset unconditionally in any
                // synchronised state, SYN-RECEIVED included.
                write_reset(&ip4h, &tcph, data, tun);
                return Action::Reset;
            }

            // Step 5: ACK field.
            if !tcph.ack() {
                return Action::Noop;
            }

            let mut wake_up_reader = false;
            let mut wake_up_writer = false;
            let mut wake_up_closer = false;

            if self.state == State::SynRcvd {
                if is_between_wrapped(
                    self.snd.una,
                    tcph.acknowledgment_number(),
                    self.snd.nxt.wrapping_add(1),
                ) {
                    debug!("{:?}: SynRcvd -> Estab", self.quad);
                    self.state = State::Estab;

                    self.snd.wnd = tcph.window_size();
                    self.snd.wl1 = tcph.sequence_number();
                    self.snd.wl2 = tcph.acknowledgment_number();

                    if self.snd.wnd > self.snd.max_wnd {
                        self.snd.max_wnd = self.snd.wnd;
                    }

                    self.outgoing.reserve_exact(self.snd.wnd as usize);
                    self.incoming.reserve_exact(config::INITIAL_RCV_WND as usize);

                    self.segments.pop_front().unwrap();
                    assert!(self.segments.is_empty());

                    self.timeout.take();

                    return Action::IsEstablished;
                } else {
                    write_reset(&ip4h, &tcph, data, tun);
                    return Action::Noop;
                }
            } else if self.state == State::Estab
                || self.state == State::FinWait1
                || self.state == State::FinWait2
                || self.state == State::CloseWait
                || self.state == State::Closing
            {
                if is_between_wrapped(
                    self.snd.una,
                    tcph.acknowledgment_number(),
                    self.snd.nxt.wrapping_add(1),
                ) {
                    let (can_write, r) = self.process_ack(tcph.acknowledgment_number());

                    if let Some(r) = r {
                        self.compute_rto(r);
                    }

                    wake_up_writer = can_write;
                } else if wrapping_lt(self.snd.nxt, tcph.acknowledgment_number()) {
                    trace!("{:?}: ack of unsent data", self.quad);
                    write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
                    return Action::Noop;
                }

                // RFC 1122 S4.2.2.20 window-update correction: update
                // SND.WND unconditionally on an acceptable ACK even when
                // WL1/WL2 don't license a WL1/WL2 bump.
                if is_between_wrapped(
                    self.snd.una.wrapping_sub(1),
                    tcph.acknowledgment_number(),
                    self.snd.nxt.wrapping_add(1),
                ) {
                    if wrapping_lt(self.snd.wl1, tcph.sequence_number())
                        || (self.snd.wl1 == tcph.sequence_number()
                            && wrapping_lt(self.snd.wl2, tcph.acknowledgment_number().wrapping_add(1)))
                    {
                        self.snd.wl1 = tcph.sequence_number();
                        self.snd.wl2 = tcph.acknowledgment_number();
                    }
                    self.snd.wnd = tcph.window_size();

                    if self.snd.wnd > self.snd.max_wnd {
                        self.snd.max_wnd = self.snd.wnd;
                    }

                    if self.snd.wnd == 0 {
                        self.probe_timeout =
                            Some(Instant::now() + Duration::from_millis(self.rto as u64));
                    } else {
                        self.probe_timeout.take();
                    }
                }
            } else if self.state == State::LastAck {
                // The only thing that can arrive here is an ACK of our FIN.
                self.process_ack(tcph.acknowledgment_number());

                if self.is_fin_acked() {
                    return Action::DeleteTCB;
                }
            } else if self.state == State::TimeWait {
                // The only thing that can arrive here is a retransmitted FIN.
                // Acknowledge it and restart the 2 MSL timer.
                self.time_wait = Some(Instant::now() + config::MSL * 2);

                trace!("{:?}: acking retransmitted FIN in TimeWait", self.quad);
                write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
            }

            if self.state == State::FinWait1 && self.is_fin_acked() {
                debug!("{:?}: FinWait1 -> FinWait2", self.quad);
                self.state = State::FinWait2;
            }

            if self.state == State::FinWait2 {
                wake_up_closer = true;
            }

            let mut process_fin = tcph.fin();

            // Step 7: segment text.
            if self.state == State::Estab
                || self.state == State::FinWait1
                || self.state == State::FinWait2
            {
                let new = (self.rcv.nxt.wrapping_sub(tcph.sequence_number())) as usize;
                let new_len = data.len() - new;
                let acc_len = cmp::min(new_len, self.rcv.wnd as usize);

                let data = &data[new..new + acc_len];

                process_fin &= new_len == acc_len;

                self.incoming.extend(data.iter());

                let pre_nxt = self.rcv.nxt;
                self.rcv.nxt = self
                    .rcv
                    .nxt
                    .wrapping_add(acc_len as u32)
                    .wrapping_add(if process_fin { 1 } else { 0 });

                let pre_wnd = self.rcv.wnd;
                self.rcv.wnd -= acc_len as u16;

                // Only ack if accepted new data, or the window was zero and
                // this is a probe segment.
                if wrapping_lt(pre_nxt, self.rcv.nxt) || pre_wnd == 0 {
                    write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
                }

                wake_up_reader = !data.is_empty();
            }
            // CLOSE-WAIT, CLOSING, LAST-ACK, TIME-WAIT: a FIN has already
            // been received from the remote side; ignore segment text.

            // Step 8: FIN bit.
            if process_fin {
                trace!("{:?}: processing FIN", self.quad);
                if self.state == State::Listen || self.state == State::SynSent {
                    return Action::Noop;
                } else if self.state == State::SynRcvd || self.state == State::Estab {
                    debug!("{:?}: -> CloseWait", self.quad);
                    self.state = State::CloseWait;
                    self.read_closed.store(true, Ordering::Release);
                    wake_up_reader = true;
                } else if self.state == State::FinWait1 {
                    if self.is_fin_acked() {
                        debug!("{:?}: FinWait1 -> TimeWait", self.quad);
                        self.state = State::TimeWait;
                        self.timeout = None;
                        self.time_wait = Some(Instant::now() + config::MSL * 2);
                    } else {
                        debug!("{:?}: FinWait1 -> Closing", self.quad);
                        self.state = State::Closing;
                    }
                } else if self.state == State::FinWait2 {
                    debug!("{:?}: FinWait2 -> TimeWait", self.quad);
                    self.state = State::TimeWait;
                    self.timeout = None;
                    self.time_wait = Some(Instant::now() + config::MSL * 2);
                } else if self.state == State::CloseWait
                    || self.state == State::Closing
                    || self.state == State::LastAck
                {
                    return Action::Noop;
                } else if self.state == State::TimeWait {
                    self.time_wait = Some(Instant::now() + config::MSL * 2);
                }
            }

            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            }
        }
    }

    /*
    There are four cases for the acceptability test for an incoming segment:

    Segment Length  Receive Window  Test
    0               0               SEG.SEQ = RCV.NXT
    0               >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    >0              0               not acceptable
    >0              >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
                                     or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    */
    fn is_segment_valid(&self, tcph: &TcpHeaderSlice, seg_len: u32) -> bool {
        let seg_seq = tcph.sequence_number();
        let rcv_wnd = self.rcv.wnd as u32;
        let rcv_nxt = self.rcv.nxt;

        if seg_len == 0 && rcv_wnd == 0 {
            seg_seq == rcv_nxt
        } else if seg_len == 0 && rcv_wnd > 0 {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        } else if seg_len > 0 && rcv_wnd == 0 {
            false
        } else if seg_len > 0 && rcv_wnd > 0 {
            is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq,
                rcv_nxt.wrapping_add(rcv_wnd),
            ) || is_between_wrapped(
                rcv_nxt.wrapping_sub(1),
                seg_seq.wrapping_add(seg_len).wrapping_sub(1),
                rcv_nxt.wrapping_add(rcv_wnd),
            )
        } else {
            false
        }
    }
}

/// Wrap-safe "is lhs older than rhs" per RFC 1323: sequence numbers are
/// compared by testing whether the difference is within 2**31.
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    lhs.wrapping_sub(rhs) > (1 << 31)
}

fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_lt_basic() {
        assert!(wrapping_lt(0, 1));
        assert!(!wrapping_lt(1, 0));
        assert!(wrapping_lt(u32::MAX, 0));
        assert!(!wrapping_lt(0, u32::MAX));
    }

    #[test]
    fn wrapping_lt_matches_signed_delta() {
        for delta in [1i64, 2, 100, 1_000_000, (1i64 << 30)] {
            let a = 1000u32;
            let b = a.wrapping_add(delta as u32);
            assert!(wrapping_lt(a, b), "delta={delta}");
            assert!(!wrapping_lt(b, a), "delta={delta}");
        }
    }

    #[test]
    fn is_between_wrapped_basic() {
        assert!(is_between_wrapped(10, 15, 20));
        assert!(!is_between_wrapped(10, 25, 20));
        assert!(!is_between_wrapped(10, 10, 20));
    }

    #[test]
    fn segment_end_and_unacked_len() {
        let seg = Segment {
            sno: 1000,
            una: 1000,
            len: 500,
            fin: false,
            syn: false,
            ack: true,
            retry: false,
            total_ret_time: 0,
            sent: None,
            mss: None,
        };
        assert_eq!(seg.end(), 1499);
        assert_eq!(seg.unacked_data_len(), 500);
    }

    #[test]
    fn segment_with_fin_unacked_len_excludes_phantom_byte() {
        let seg = Segment {
            sno: 1000,
            una: 1000,
            len: 501,
            fin: true,
            syn: false,
            ack: true,
            retry: false,
            total_ret_time: 0,
            sent: None,
            mss: None,
        };
        assert_eq!(seg.unacked_data_len(), 500);
    }
}
