use std::cmp;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, Manager};

use super::Quad;

#[derive(Debug)]
pub struct TcpStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) quad: Quad,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    pub(crate) r2_syn: Arc<AtomicU64>,
    pub(crate) r2: Arc<AtomicU64>,
    pub(crate) closed: bool,
    pub(crate) reset: Arc<AtomicBool>,
}

impl TcpStream {
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        let mut manager = self.manager.lock().unwrap();

        self.closed = true;

        if let Some(entry) = manager.streams.get_mut(&self.quad) {
            entry.tcb.close();
            manager = self.svar.wait(manager).unwrap();
        }

        drop(manager)
    }

    /// Sets `R2`, the elapsed-time threshold (in milliseconds) past which an
    /// established connection is abandoned outright rather than merely
    /// logging a path-degradation warning (RFC 793 S3.8.3).
    pub fn set_r2(&self, r2: u64) {
        self.r2.store(r2, Ordering::Release);
    }

    /// Sets `R2_SYN`, the R2 equivalent that applies while the handshake's
    /// SYN is still outstanding.
    pub fn set_r2_syn(&self, r2_syn: u64) {
        self.r2_syn.store(r2_syn, Ordering::Release);
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reset.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset.into());
        }

        let mut manager = self.manager.lock().unwrap();

        // Nothing to wait for once the peer's FIN has been received and the
        // buffered bytes ahead of it have all been drained: `recv` below
        // then returns 0, the stream's EOF.
        let waiting_for_data = |manager: &Manager| {
            manager
                .streams
                .get(&self.quad)
                .map(|entry| entry.tcb.incoming.is_empty() && !entry.tcb.read_closed.load(Ordering::Acquire))
                .unwrap_or(false)
        };

        if waiting_for_data(&manager) {
            manager = self
                .rvar
                .wait_while(manager, |manager| {
                    waiting_for_data(manager) && !self.reset.load(Ordering::Acquire)
                })
                .unwrap();
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset.into());
        }

        let len = manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::StreamClosed(self.quad.src))?
            .tcb
            .recv(buf);

        Ok(len)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Error::Shutdown.into());
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset.into());
        }

        let mut manager = self.manager.lock().unwrap();

        if manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::StreamClosed(self.quad.src))?
            .tcb
            .is_outgoing_full()
        {
            manager = self
                .wvar
                .wait_while(manager, |manager| {
                    manager
                        .streams
                        .get(&self.quad)
                        .map(|entry| entry.tcb.is_outgoing_full())
                        .unwrap_or(false)
                        && !self.reset.load(Ordering::Acquire)
                })
                .unwrap();
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset.into());
        }

        let outgoing = &mut manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::StreamClosed(self.quad.src))?
            .tcb
            .outgoing;

        let len = cmp::min(buf.len(), outgoing.capacity() - outgoing.len());

        outgoing.extend(buf[..len].iter());

        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        if !manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::StreamClosed(self.quad.src))?
            .tcb
            .outgoing
            .is_empty()
        {
            manager = self
                .wvar
                .wait_while(manager, |manager| {
                    manager
                        .streams
                        .get(&self.quad)
                        .map(|entry| !entry.tcb.outgoing.is_empty())
                        .unwrap_or(false)
                        && !self.reset.load(Ordering::Acquire)
                })
                .unwrap();
        }

        drop(manager);

        if self.reset.load(Ordering::Acquire) {
            Err(Error::ConnectionReset.into())
        } else {
            Ok(())
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}
