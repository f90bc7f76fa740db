use std::io::Write;

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};
use log::trace;
use tidy_tuntap::Tun;

use super::Quad;

fn send(ip4h: Ipv4Header, tcph: TcpHeader, data: &[u8], tun: &mut Tun) {
    let mut buf = [0u8; 1500];
    let mut cursor = std::io::Cursor::new(&mut buf[..]);

    ip4h.write(&mut cursor).unwrap();
    tcph.write(&mut cursor).unwrap();
    cursor.write_all(data).unwrap();

    let len = cursor.position() as usize;

    if let Err(e) = tun.write(&buf[..len]) {
        trace!("failed to write to tun device: {e}");
    }
}

/// Builds the reset demanded by RFC 9293 S3.10.4 for a segment that arrived
/// on a connection that doesn't exist (or is no longer in the right state).
pub fn write_reset(ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8], tun: &mut Tun) {
    let (sno, ackno) = if tcph.ack() {
        (tcph.acknowledgment_number(), 0)
    } else {
        (
            0,
            tcph.sequence_number()
                .wrapping_add(data.len() as u32)
                .wrapping_add(if tcph.syn() { 1 } else { 0 })
                .wrapping_add(if tcph.fin() { 1 } else { 0 }),
        )
    };

    let mut rst_tcph = TcpHeader::new(tcph.destination_port(), tcph.source_port(), sno, 0);
    rst_tcph.rst = true;
    rst_tcph.ack = !tcph.ack();
    rst_tcph.acknowledgment_number = ackno;

    let rst_ip4h = Ipv4Header::new(
        rst_tcph.header_len(),
        64,
        6,
        ip4h.destination(),
        ip4h.source(),
    );

    rst_tcph.checksum = rst_tcph.calc_checksum_ipv4(&rst_ip4h, &[]).unwrap();

    send(rst_ip4h, rst_tcph, &[], tun);
}

pub fn write_synack(quad: &Quad, sno: u32, ackno: u32, wnd: u16, tun: &mut Tun) {
    write_control(quad, sno, ackno, wnd, true, true, tun);
}

pub fn write_ack(quad: &Quad, sno: u32, ackno: u32, wnd: u16, tun: &mut Tun) {
    write_control(quad, sno, ackno, wnd, false, true, tun);
}

fn write_control(quad: &Quad, sno: u32, ackno: u32, wnd: u16, syn: bool, ack: bool, tun: &mut Tun) {
    let mut tcph = TcpHeader::new(quad.dst.port, quad.src.port, sno, wnd);
    tcph.syn = syn;
    tcph.ack = ack;
    tcph.acknowledgment_number = ackno;

    let ip4h = Ipv4Header::new(
        tcph.header_len(),
        64,
        6,
        quad.dst.ipv4.octets(),
        quad.src.ipv4.octets(),
    );

    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, &[]).unwrap();

    send(ip4h, tcph, &[], tun);
}

/// Builds and sends a single outgoing segment. `mss` is only ever `Some` on
/// a SYN/SYN-ACK (see `tcp_options` grounding in SPEC_FULL.md S4.3).
#[allow(clippy::too_many_arguments)]
pub fn write_data(
    quad: Quad,
    sno: u32,
    ackno: u32,
    wnd: u16,
    tun: &mut Tun,
    data: &[u8],
    fin: bool,
    syn: bool,
    ack: bool,
    mss: Option<u16>,
) {
    let mut tcph = TcpHeader::new(quad.dst.port, quad.src.port, sno, wnd);
    tcph.fin = fin;
    tcph.syn = syn;
    tcph.ack = ack;
    tcph.acknowledgment_number = ackno;

    if let Some(mss) = mss {
        tcph.set_options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .unwrap();
    }

    let ip4h = Ipv4Header::new(
        tcph.header_len() + data.len() as u16,
        64,
        6,
        quad.dst.ipv4.octets(),
        quad.src.ipv4.octets(),
    );

    tcph.checksum = tcph.calc_checksum_ipv4(&ip4h, data).unwrap();

    send(ip4h, tcph, data, tun);
}
