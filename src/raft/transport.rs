//! Peer-to-peer transport for raft messages.
//!
//! Frames are a 4-byte big-endian length followed by the protobuf-encoded
//! message. Each outbound message opens its own connection; raft traffic is
//! heartbeat-paced, so connection reuse buys little here.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use prost::Message as ProstMessage;
use raft::eraftpb::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Binds `addr` and spawns the accept loop. Each connection is drained on
/// its own short-lived thread and every decoded message is forwarded to the
/// worker; a dropped worker ends the forwarding silently.
pub fn spawn_listener(addr: &str, tx: Sender<Message>) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    let addr = addr.to_string();
    thread::Builder::new()
        .name(format!("raft-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(e) = drain_connection(stream, &tx) {
                                tracing::debug!(error = %e, "raft connection closed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "raft accept failed"),
                }
            }
        })?;
    Ok(())
}

fn drain_connection(mut stream: TcpStream, tx: &Sender<Message>) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut len_buf) {
            // Peers close after sending; an EOF between frames is normal.
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(e)
            };
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;

        let msg = Message::decode(buf.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if tx.send(msg).is_err() {
            return Ok(());
        }
    }
}

/// Fire-and-forget send; raft tolerates dropped messages, so failures are
/// only logged.
pub fn send_message(addr: &str, msg: &Message) {
    let bytes = msg.encode_to_vec();
    if let Err(e) = try_send(addr, &bytes) {
        tracing::debug!(peer = addr, error = %e, "raft send failed");
    }
}

fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let parsed = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: {e}")))?;
    let mut stream = TcpStream::connect_timeout(&parsed, CONNECT_TIMEOUT)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn roundtrips_a_message() {
        let (tx, rx) = unbounded();
        // Port 0 picks a free port; rebind through a probe listener first.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);
        spawn_listener(&addr, tx).unwrap();

        let mut msg = Message::default();
        msg.from = 7;
        msg.to = 9;
        msg.term = 3;
        send_message(&addr, &msg);

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.from, 7);
        assert_eq!(received.to, 9);
        assert_eq!(received.term, 3);
    }
}
