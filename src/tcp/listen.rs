use std::sync::{Arc, Mutex};

use crate::{Error, EstabElement, Manager};

use super::stream::TcpStream;

#[derive(Debug)]
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) cvar: Arc<std::sync::Condvar>,
}

impl TcpListener {
    pub fn accept(&self) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        if manager
            .established
            .get(&self.port)
            .ok_or(Error::PortClosed(self.port))?
            .elts
            .is_empty()
        {
            manager = self
                .cvar
                .wait_while(manager, |manager| {
                    manager.established[&self.port].elts.is_empty()
                })
                .unwrap();
        }

        let establisheds = manager
            .established
            .get_mut(&self.port)
            .ok_or(Error::PortClosed(self.port))?;

        let EstabElement {
            quad,
            rvar,
            wvar,
            svar,
            r2_syn,
            r2,
            reset,
        } = establisheds.elts.pop().unwrap();

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar,
            wvar,
            svar,
            r2_syn,
            r2,
            closed: false,
            reset,
        })
    }

    pub fn set_nonblocking(&self, _nonblocking: bool) {
        // The blocking wait in `accept` is a `Condvar`, not a file
        // descriptor; non-blocking mode is left unimplemented until a
        // caller actually needs `EWOULDBLOCK` from `accept`.
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();

        manager.bounded.remove(&self.port);
        manager.established.remove(&self.port);
    }
}
