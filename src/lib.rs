use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use log::{debug, info, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use rand::Rng;
use tidy_tuntap::Tun;

pub mod config;
mod err;
pub use err::*;

mod icmp;

mod tcp;
use tcp::{write_reset, Action, Dual, Quad, State, TcpListener, TCB};

#[derive(Debug)]
pub struct EstabElement {
    quad: Quad,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    r2_syn: Arc<AtomicU64>,
    r2: Arc<AtomicU64>,
    reset: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct EstabEntry {
    cvar: Arc<Condvar>,
    elts: Vec<EstabElement>,
}

#[derive(Debug)]
pub struct StreamEntry {
    tcb: TCB,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    reset: Arc<AtomicBool>,
}

/// Slot a blocked `NetStack::connect` call waits on; filled in by
/// `segment_loop` once the handshake resolves one way or the other.
#[derive(Debug)]
struct ConnectingEntry {
    cvar: Arc<Condvar>,
    result: Arc<Mutex<Option<Result<(), Error>>>>,
}

#[derive(Debug, Default)]
pub struct Manager {
    iss: Arc<AtomicU32>,
    bounded: HashSet<u16>,
    pending: HashMap<Quad, TCB>,
    connecting: HashMap<Quad, ConnectingEntry>,
    established: HashMap<u16, EstabEntry>,
    streams: HashMap<Quad, StreamEntry>,
}

#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    addr: Ipv4Addr,
    mask: Ipv4Addr,
    stop: Arc<AtomicBool>,
    jh: thread::JoinHandle<()>,
    ih: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        info!("{name}: up, addr={addr} mask={mask}");

        let iss = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let ih = {
            let iss = iss.clone();
            let stop = stop.clone();

            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(4));
                    iss.fetch_add(1, Ordering::Release);
                }
            })
        };

        let manager = Arc::new(Mutex::new(Manager {
            iss,
            bounded: HashSet::new(),
            pending: HashMap::new(),
            connecting: HashMap::new(),
            established: HashMap::new(),
            streams: HashMap::new(),
        }));

        let jh = {
            let manager = manager.clone();
            let stop = stop.clone();

            thread::spawn(move || segment_loop(tun, manager, stop, addr))
        };

        Ok(NetStack {
            manager,
            addr,
            mask,
            stop,
            jh,
            ih,
        })
    }

    pub fn bind(&mut self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();

        match manager.established.entry(port) {
            Entry::Occupied(_) => Err(Error::PortInUse(port)),
            Entry::Vacant(v) => {
                let cvar = Arc::new(Condvar::new());

                v.insert(EstabEntry {
                    cvar: cvar.clone(),
                    elts: Vec::new(),
                });

                manager.bounded.insert(port);

                Ok(TcpListener {
                    port,
                    manager: self.manager.clone(),
                    cvar,
                })
            }
        }
    }

    /// Active OPEN. Blocks until the connection is ESTABLISHED or the
    /// handshake fails.
    pub fn connect(&mut self, ip: Ipv4Addr, port: u16) -> Result<tcp::TcpStream, Error> {
        if !self.reachable(ip) {
            return Err(Error::HostUnreachable);
        }

        let (quad, cvar, result) = {
            let mut manager = self.manager.lock().unwrap();

            let mut rng = rand::thread_rng();
            let src_port = loop {
                let candidate =
                    rng.gen_range(config::EPHEMERAL_PORT_LO..=config::EPHEMERAL_PORT_HI);
                let quad = Quad {
                    src: Dual {
                        ipv4: self.addr,
                        port: candidate,
                    },
                    dst: Dual { ipv4: ip, port },
                };

                if !manager.pending.contains_key(&quad) && !manager.streams.contains_key(&quad) {
                    break candidate;
                }
            };

            let quad = Quad {
                src: Dual {
                    ipv4: self.addr,
                    port: src_port,
                },
                dst: Dual { ipv4: ip, port },
            };

            let iss = manager.iss.load(Ordering::Acquire);
            let tcb = TCB::syn_sent(quad, iss);

            let cvar = Arc::new(Condvar::new());
            let result = Arc::new(Mutex::new(None));

            manager.pending.insert(quad, tcb);
            manager.connecting.insert(
                quad,
                ConnectingEntry {
                    cvar: cvar.clone(),
                    result: result.clone(),
                },
            );

            debug!("{quad:?}: connecting");

            (quad, cvar, result)
        };

        let mut guard = result.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        let outcome = guard.take().unwrap();
        drop(guard);

        outcome?;

        let manager = self.manager.lock().unwrap();
        let entry = manager
            .streams
            .get(&quad)
            .expect("stream vanished right after handshake completed");

        Ok(tcp::TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar: entry.rvar.clone(),
            wvar: entry.wvar.clone(),
            svar: entry.svar.clone(),
            r2_syn: entry.tcb.r2_syn.clone(),
            r2: entry.tcb.r2.clone(),
            closed: false,
            reset: entry.reset.clone(),
        })
    }

    fn reachable(&self, ip: Ipv4Addr) -> bool {
        subnet_reachable(self.addr, self.mask, ip)
    }

    pub fn join(self) {
        self.stop.store(true, Ordering::Release);
        self.jh.join().unwrap();
        self.ih.join().unwrap();
    }
}

/// Whether `ip` is on the same subnet as `addr`/`mask` — the only routing
/// decision this crate's single point-to-point interface needs to make
/// (see `SPEC_FULL.md` S4.7).
fn subnet_reachable(addr: Ipv4Addr, mask: Ipv4Addr, ip: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    u32::from(ip) & mask == u32::from(addr) & mask
}

fn segment_loop(mut tun: Tun, manager: Arc<Mutex<Manager>>, stop: Arc<AtomicBool>, self_addr: Ipv4Addr) {
    while !stop.load(Ordering::Acquire) {
        let mut buf = [0u8; 1500];

        {
            let mut manager = manager.lock().unwrap();

            let mut to_be_deleted = vec![];
            for (quad, entry) in manager.streams.iter_mut() {
                if entry.tcb.on_tick(&mut tun) {
                    to_be_deleted.push(*quad);
                }
            }
            for quad in to_be_deleted {
                if let Some(stream) = manager.streams.remove(&quad) {
                    if stream.tcb.state != State::TimeWait {
                        warn!("{quad:?}: abandoning connection after R2 timeout");
                        stream.reset.store(true, Ordering::Release);
                    }
                    stream.rvar.notify_one();
                    stream.wvar.notify_one();
                    stream.svar.notify_one();
                }
            }

            let mut to_be_deleted = vec![];
            for (quad, tcb) in manager.pending.iter_mut() {
                if tcb.on_tick(&mut tun) {
                    to_be_deleted.push(*quad);
                }
            }
            for quad in to_be_deleted {
                manager.pending.remove(&quad);
                if let Some(connecting) = manager.connecting.remove(&quad) {
                    warn!("{quad:?}: SYN retransmission exhausted");
                    *connecting.result.lock().unwrap() = Some(Err(Error::TimedOut));
                    connecting.cvar.notify_one();
                }
            }
        }

        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], 1).unwrap() == 0 {
            continue;
        }

        let n = tun.read(&mut buf).unwrap();

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else {
            continue;
        };

        if ip4h.protocol() == 1 {
            let payload = &buf[(ip4h.ihl() * 4) as usize..n];
            if let Some(reply) = icmp::echo_reply(&ip4h, payload, self_addr) {
                if let Err(e) = tun.write(&reply) {
                    trace!("failed to write ICMP reply: {e}");
                }
            }
            continue;
        }

        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..n]) else {
            continue;
        };
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..n];

        let src = Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        };
        let dst = Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        };

        let quad = Quad { src, dst };

        let mut manager = manager.lock().unwrap();

        let action = if let Some(StreamEntry { tcb, .. }) = manager.streams.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else if let Some(tcb) = manager.pending.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else if manager.bounded.contains(&dst.port) {
            let iss = manager.iss.load(Ordering::Acquire);
            let mut tcb = TCB::listen(quad, iss);

            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else {
            /*
            If the connection does not exist (CLOSED), then a reset is sent
            in response to any incoming segment except another reset. A SYN
            segment that does not match an existing connection is rejected
            by this means.
            */

            if tcph.rst() {
                continue;
            }

            write_reset(&ip4h, &tcph, data, &mut tun);

            Action::Noop
        };

        match action {
            Action::Noop => continue,
            Action::AddToPending(tcb) => {
                manager.pending.insert(quad, tcb);
            }
            Action::RemoveFromPending => {
                manager.pending.remove(&quad);
            }
            Action::IsEstablished => {
                let tcb = manager.pending.remove(&quad).unwrap();
                let rvar = Arc::new(Condvar::new());
                let wvar = Arc::new(Condvar::new());
                let svar = Arc::new(Condvar::new());
                let r2 = tcb.r2.clone();
                let r2_syn = tcb.r2_syn.clone();
                let reset = tcb.reset.clone();

                debug!("{quad:?}: established");

                manager.streams.insert(
                    quad,
                    StreamEntry {
                        tcb,
                        rvar: rvar.clone(),
                        wvar: wvar.clone(),
                        svar: svar.clone(),
                        reset: reset.clone(),
                    },
                );

                if let Some(connecting) = manager.connecting.remove(&quad) {
                    *connecting.result.lock().unwrap() = Some(Ok(()));
                    connecting.cvar.notify_one();
                } else if let Some(EstabEntry { cvar, elts }) =
                    manager.established.get_mut(&dst.port)
                {
                    if elts.len() >= config::PENDING_QUEUE_DEPTH {
                        warn!("{quad:?}: dropped, listener's accept backlog is full");
                    } else {
                        elts.push(EstabElement {
                            quad,
                            rvar,
                            wvar,
                            svar,
                            r2,
                            r2_syn,
                            reset,
                        });
                        cvar.notify_one();
                    }
                }
            }
            Action::Reset => {
                if let Some(stream) = manager.streams.remove(&quad) {
                    warn!("{quad:?}: connection reset");
                    stream.reset.store(true, Ordering::Release);
                    stream.rvar.notify_one();
                    stream.wvar.notify_one();
                    stream.svar.notify_one();
                } else {
                    manager.pending.remove(&quad);
                    if let Some(connecting) = manager.connecting.remove(&quad) {
                        *connecting.result.lock().unwrap() = Some(Err(Error::ConnectionReset));
                        connecting.cvar.notify_one();
                    }
                }
            }
            Action::ConnectionRefused => {
                manager.pending.remove(&quad);
                if let Some(connecting) = manager.connecting.remove(&quad) {
                    warn!("{quad:?}: connection refused");
                    *connecting.result.lock().unwrap() = Some(Err(Error::ConnectionRefused));
                    connecting.cvar.notify_one();
                }
            }
            Action::DeleteTCB => {
                if let Some(stream) = manager.streams.remove(&quad) {
                    debug!("{quad:?}: closed");
                    stream.svar.notify_one();
                }
            }
            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            } => {
                let StreamEntry {
                    rvar, wvar, svar, ..
                } = &manager.streams[&quad];

                if wake_up_reader {
                    rvar.notify_one();
                }
                if wake_up_writer {
                    wvar.notify_one();
                }
                if wake_up_closer {
                    svar.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_reachable_same_subnet() {
        let addr = "10.10.10.10".parse().unwrap();
        let mask = "255.255.255.0".parse().unwrap();
        assert!(subnet_reachable(addr, mask, "10.10.10.20".parse().unwrap()));
    }

    #[test]
    fn subnet_reachable_rejects_off_subnet() {
        let addr = "10.10.10.10".parse().unwrap();
        let mask = "255.255.255.0".parse().unwrap();
        assert!(!subnet_reachable(addr, mask, "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn subnet_reachable_self() {
        let addr = "10.10.10.10".parse().unwrap();
        let mask = "255.255.255.0".parse().unwrap();
        assert!(subnet_reachable(addr, mask, addr));
    }
}
