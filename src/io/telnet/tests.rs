use super::*;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
struct Wire {
    incoming: VecDeque<Vec<u8>>,
    outgoing: Vec<u8>,
    closed: bool,
    /// Bytes the peer will still accept; `None` is unlimited.
    window: Option<usize>,
    broken: bool,
}

#[derive(Clone, Default)]
struct FakeConnection(Rc<RefCell<Wire>>);

impl FakeConnection {
    fn send(&self, bytes: &[u8]) {
        self.0.borrow_mut().incoming.push_back(bytes.to_vec());
    }

    fn received(&self) -> Vec<u8> {
        self.0.borrow().outgoing.clone()
    }

    fn clear(&self) {
        self.0.borrow_mut().outgoing.clear();
    }

    /// Only the test still holds the wire.
    fn dropped(&self) -> bool {
        Rc::strong_count(&self.0) == 1
    }
}

impl Read for FakeConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.borrow_mut();
        match wire.incoming.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    wire.incoming.push_front(chunk.split_off(n));
                }
                Ok(n)
            }
            None if wire.closed => Ok(0),
            None => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for FakeConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.0.borrow_mut();
        if wire.broken {
            return Err(ErrorKind::BrokenPipe.into());
        }
        let n = wire.window.map_or(buf.len(), |w| w.min(buf.len()));
        if n == 0 {
            return Err(ErrorKind::WouldBlock.into());
        }
        if let Some(w) = wire.window.as_mut() {
            *w -= n;
        }
        wire.outgoing.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for FakeConnection {
    fn peer(&self) -> Option<String> {
        Some("10.0.0.7:4000".to_string())
    }
}

#[derive(Clone, Default)]
struct FakeListener(Rc<RefCell<VecDeque<FakeConnection>>>);

impl FakeListener {
    fn dial(&self) -> FakeConnection {
        let conn = FakeConnection::default();
        self.0.borrow_mut().push_back(conn.clone());
        conn
    }
}

impl Listener for FakeListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Connection>>> {
        Ok(self.0.borrow_mut().pop_front().map(|c| Box::new(c) as Box<dyn Connection>))
    }
}

fn mux_with(lines: usize) -> (Multiplexor, FakeListener) {
    let listener = FakeListener::default();
    let mut mux = Multiplexor::new(lines, "Altair 8800");
    mux.listen(Box::new(listener.clone()));
    (mux, listener)
}

/// Connect one client to line 0 with receive enabled.
fn connected() -> (Multiplexor, FakeConnection) {
    let (mut mux, listener) = mux_with(1);
    let conn = listener.dial();
    assert_eq!(mux.poll_connections(), Some(0));
    mux.line_mut(0).unwrap().receive_enabled = true;
    conn.clear();
    (mux, conn)
}

fn drain(line: &mut Line) -> Vec<u8> {
    std::iter::from_fn(|| line.getc()).map(|r| r.byte).collect()
}

// ========================================================================
// ACCEPT
// ========================================================================

#[test]
fn accept_negotiates_and_greets() {
    let (mut mux, listener) = mux_with(2);
    assert_eq!(mux.poll_connections(), None);
    let conn = listener.dial();
    assert_eq!(mux.poll_connections(), Some(0));

    let sent = conn.received();
    assert_eq!(&sent[..15], &NEGOTIATION);
    assert_eq!(&sent[15..], b"\n\r\nConnected to the Altair 8800 simulator\r\n\n");

    let line = mux.line(0).unwrap();
    assert!(line.is_connected());
    assert!(!line.receive_enabled);
    assert!(line.transmit_enabled());
    assert_eq!(line.peer(), Some("10.0.0.7:4000"));
}

#[test]
fn second_client_takes_next_free_line() {
    let (mut mux, listener) = mux_with(3);
    listener.dial();
    listener.dial();
    assert_eq!(mux.poll_connections(), Some(0));
    assert_eq!(mux.poll_connections(), Some(1));
    mux.disconnect(0).unwrap();
    listener.dial();
    assert_eq!(mux.poll_connections(), Some(0));
}

#[test]
fn busy_accept_refuses_and_leaves_lines_alone() {
    let (mut mux, listener) = mux_with(1);
    let first = listener.dial();
    assert_eq!(mux.poll_connections(), Some(0));
    first.clear();

    let second = listener.dial();
    assert_eq!(mux.poll_connections(), None);
    assert_eq!(second.received(), BUSY_MESSAGE.as_bytes());
    assert!(second.dropped());

    assert!(!first.dropped());
    assert!(first.received().is_empty());
    assert!(mux.line(0).unwrap().is_connected());
}

#[test]
fn no_listener_no_connections() {
    let mut mux = Multiplexor::new(4, "x");
    assert!(!mux.is_listening());
    assert_eq!(mux.poll_connections(), None);
}

// ========================================================================
// RECEIVE / DESTUFF
// ========================================================================

#[test]
fn doubled_iac_in_binary_mode_is_data() {
    let (mut mux, conn) = connected();
    conn.send(&[0x41, 0xFF, 0xFF, 0x42]);
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert!(line.binary());
    assert_eq!(line.rx_queue_len(), 3);
    assert_eq!(drain(line), vec![0x41, 0xFF, 0x42]);
}

#[test]
fn option_negotiation_is_removed() {
    let (mut mux, conn) = connected();
    conn.send(&[IAC, WILL, OPT_ECHO, 0x43]);
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert_eq!(drain(line), vec![0x43]);
    assert_eq!(line.state(), ParseState::Normal);
    assert!(line.binary());
}

#[test]
fn will_binary_leaves_binary_mode_and_drops_lf_after_cr() {
    let (mut mux, conn) = connected();
    conn.send(&[IAC, WILL, OPT_BINARY, b'a', 0x0D, 0x0A, b'b']);
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert!(!line.binary());
    assert_eq!(drain(line), b"a\rb".to_vec());
}

#[test]
fn wont_binary_enters_binary_mode() {
    let (mut mux, conn) = connected();
    conn.send(&[IAC, WILL, OPT_BINARY]);
    mux.poll_rx();
    assert!(!mux.line(0).unwrap().binary());
    conn.send(&[IAC, WONT, OPT_BINARY, 0x0D, 0x0A]);
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert!(line.binary());
    assert_eq!(drain(line), vec![0x0D, 0x0A]);
}

#[test]
fn doubled_iac_outside_binary_mode_is_skipped() {
    let (mut mux, conn) = connected();
    conn.send(&[IAC, WILL, OPT_BINARY, IAC, IAC, b'x', b'y']);
    mux.poll_rx();
    assert_eq!(drain(mux.line_mut(0).unwrap()), b"y".to_vec());
}

#[test]
fn break_becomes_flagged_null() {
    let (mut mux, conn) = connected();
    conn.send(&[b'q', IAC, BRK, b'r']);
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert_eq!(line.getc(), Some(Received { byte: b'q', brk: false }));
    assert_eq!(line.getc(), Some(Received { byte: 0, brk: true }));
    assert_eq!(line.getc(), Some(Received { byte: b'r', brk: false }));
    assert_eq!(line.getc(), None);
}

#[test]
fn sequence_split_across_reads_is_completed() {
    let (mut mux, conn) = connected();
    conn.send(&[0x41, IAC]);
    mux.poll_rx();
    assert_eq!(mux.line(0).unwrap().state(), ParseState::Iac);
    conn.send(&[DO, OPT_SGA, 0x42]);
    mux.poll_rx();
    assert_eq!(drain(mux.line_mut(0).unwrap()), vec![0x41, 0x42]);
}

#[test]
fn unread_data_holds_off_further_reads() {
    let (mut mux, conn) = connected();
    conn.send(b"one");
    mux.poll_rx();
    conn.send(b"two");
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert_eq!(drain(line), b"one".to_vec());
    mux.poll_rx();
    assert_eq!(drain(mux.line_mut(0).unwrap()), b"two".to_vec());
}

#[test]
fn reads_are_bounded_by_guard() {
    let (mut mux, conn) = connected();
    conn.send(&[b'z'; BUFFER_SIZE]);
    mux.poll_rx();
    assert_eq!(mux.line(0).unwrap().rx_queue_len(), BUFFER_SIZE - GUARD);
}

#[test]
fn receive_disabled_line_is_not_read() {
    let (mut mux, conn) = connected();
    mux.line_mut(0).unwrap().receive_enabled = false;
    conn.send(b"hi");
    mux.poll_rx();
    let line = mux.line_mut(0).unwrap();
    assert_eq!(line.rx_queue_len(), 0);
    assert_eq!(line.getc(), None);
}

#[test]
fn peer_close_resets_line() {
    let (mut mux, conn) = connected();
    conn.0.borrow_mut().closed = true;
    mux.poll_rx();
    assert!(!mux.line(0).unwrap().is_connected());
    assert!(conn.dropped());
}

// ========================================================================
// TRANSMIT
// ========================================================================

#[test]
fn putc_stuffs_iac_and_poll_flushes() {
    let (mut mux, conn) = connected();
    let line = mux.line_mut(0).unwrap();
    line.putc(b'A');
    line.putc(IAC);
    assert_eq!(line.tx_queue_len(), 3);
    mux.poll_tx();
    assert_eq!(conn.received(), vec![b'A', IAC, IAC]);
    assert_eq!(mux.line(0).unwrap().tx_queue_len(), 0);
}

#[test]
fn backpressure_until_fully_drained() {
    let (mut mux, conn) = connected();
    let line = mux.line_mut(0).unwrap();
    for _ in 0..BUFFER_SIZE - GUARD {
        line.putc(b'.');
    }
    assert!(line.transmit_enabled());
    line.putc(b'.');
    assert!(!line.transmit_enabled());

    conn.0.borrow_mut().window = Some(10);
    mux.poll_tx();
    let line = mux.line(0).unwrap();
    assert!(!line.transmit_enabled());
    assert_eq!(line.tx_queue_len(), BUFFER_SIZE - GUARD + 1 - 10);

    conn.0.borrow_mut().window = None;
    mux.poll_tx();
    let line = mux.line(0).unwrap();
    assert!(line.transmit_enabled());
    assert_eq!(line.tx_queue_len(), 0);
    assert_eq!(line.counts().1, (BUFFER_SIZE - GUARD + 1) as u64);
}

#[test]
fn full_buffer_drops_characters() {
    let (mut mux, _conn) = connected();
    let line = mux.line_mut(0).unwrap();
    for _ in 0..BUFFER_SIZE + 5 {
        line.putc(b'#');
    }
    assert_eq!(line.tx_queue_len(), BUFFER_SIZE);
    assert!(!line.transmit_enabled());
}

#[test]
fn write_error_resets_line() {
    let (mut mux, conn) = connected();
    mux.line_mut(0).unwrap().putc(b'x');
    conn.0.borrow_mut().broken = true;
    mux.poll_tx();
    assert!(!mux.line(0).unwrap().is_connected());
}

#[test]
fn putc_without_connection_is_ignored() {
    let mut line = Line::new();
    line.putc(b'x');
    assert_eq!(line.tx_queue_len(), 0);
}

// ========================================================================
// OPERATOR
// ========================================================================

#[test]
fn operator_disconnect_notifies_peer() {
    let (mut mux, conn) = connected();
    mux.disconnect(0).unwrap();
    assert_eq!(conn.received(), b"\r\nOperator disconnected line\r\n\n".to_vec());
    assert!(!mux.line(0).unwrap().is_connected());
    assert!(matches!(mux.disconnect(5), Err(Error::NoSuchUnit { .. })));
}

#[test]
fn close_says_goodbye_and_stops_listening() {
    let (mut mux, conn) = connected();
    mux.close();
    assert_eq!(conn.received(), b"\r\nDisconnected from the Altair 8800 simulator\r\n\n".to_vec());
    assert!(!mux.is_listening());
    assert!(conn.dropped());
}

#[test]
fn statistics_and_summaries() {
    let (mut mux, listener) = mux_with(2);
    let conn = listener.dial();
    mux.poll_connections();
    mux.line_mut(0).unwrap().receive_enabled = true;
    conn.send(b"abc");
    mux.poll_rx();
    mux.line_mut(0).unwrap().putc(b'!');

    let stats = mux.statistics();
    assert_eq!(stats[0], "line 0: input (on) queued/total = 3/3, output (on) queued/total = 1/0");
    assert_eq!(stats[1], "line 1: line disconnected");

    let summaries = mux.connection_summaries();
    assert!(summaries[0].starts_with("line 0: peer 10.0.0.7:4000"));
    assert_eq!(summaries[1], "line 1: line disconnected");
}
