//! Accept loop feeding the engine one connection at a time.
//!
//! Every connection carries exactly one message. Requests are numbered in
//! arrival order. While the engine runs a real command the listener is
//! polled without blocking: kill envelopes go straight to the running
//! command and everything else waits in a FIFO queue, keeping the number it
//! arrived with.

use capturemock_core::transport::read_reply;
use capturemock_core::{Engine, KillSource, Request, ResponseSink};
use capturemock_protocol::{CommandKillEnvelope, CommandReply, Envelope, ErrorInfo};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT_SECS: u64 = 2;

/// One message read off a connection, waiting to be served.
struct Message {
    number: u64,
    peer: SocketAddr,
    stream: TcpStream,
    envelope: Result<Envelope, ErrorInfo>,
}

enum Flow {
    Continue,
    Terminate,
}

pub struct Dispatcher {
    listener: TcpListener,
    engine: Engine,
    queue: VecDeque<Message>,
    next_number: u64,
    served: u64,
}

impl Dispatcher {
    pub fn new(listener: TcpListener, engine: Engine) -> Self {
        Self {
            listener,
            engine,
            queue: VecDeque::new(),
            next_number: 1,
            served: 0,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serves connections until a terminate message arrives. Only a broken
    /// listener ends the loop with an error.
    pub fn run(&mut self) -> std::io::Result<()> {
        loop {
            let message = match self.queue.pop_front() {
                Some(message) => message,
                None => match self.accept()? {
                    Some(message) => message,
                    None => continue,
                },
            };
            if let Flow::Terminate = self.serve(message) {
                return Ok(());
            }
        }
    }

    fn accept(&mut self) -> std::io::Result<Option<Message>> {
        match self.listener.accept() {
            Ok((stream, peer)) => Ok(receive(stream, peer, &mut self.next_number)),
            Err(err) if is_transient_accept_error(&err) => {
                warn!(error = %err, "Failed to accept connection");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn serve(&mut self, message: Message) -> Flow {
        let Message {
            number,
            peer,
            mut stream,
            envelope,
        } = message;
        self.served += 1;

        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(number, code = %err.code, message = %err.message, "Malformed envelope");
                let reply = CommandReply::failure(format!("ERROR: {}", err)).encode();
                if let Err(err) = ResponseSink::new(&mut stream).write(&reply) {
                    warn!(error = %err, "Failed to send error reply");
                }
                close(&stream);
                return Flow::Continue;
            }
        };

        debug!(number, kind = envelope.kind(), peer = %peer, "Request received");
        let Some(request) = Request::from_envelope(envelope, self.engine.config()) else {
            info!(number, "Terminate message received");
            close(&stream);
            return Flow::Terminate;
        };

        let mut incoming = Incoming {
            listener: &self.listener,
            queue: &mut self.queue,
            next_number: &mut self.next_number,
        };
        let responses = self.engine.process(&request, number, &mut incoming);

        let mut sink = ResponseSink::new(&mut stream);
        for response in &responses {
            if let Err(err) = response.forward(&mut sink) {
                warn!(error = %err, number, "Failed to send response");
                break;
            }
        }
        if sink.peer_gone() {
            debug!(number, "Client disconnected before the reply was complete");
        }
        close(&stream);
        Flow::Continue
    }
}

/// Polls the listener while a real command runs.
struct Incoming<'a> {
    listener: &'a TcpListener,
    queue: &'a mut VecDeque<Message>,
    next_number: &'a mut u64,
}

impl KillSource for Incoming<'_> {
    fn poll_kills(&mut self) -> Vec<CommandKillEnvelope> {
        let mut kills = Vec::new();
        if let Err(err) = self.listener.set_nonblocking(true) {
            warn!(error = %err, "Failed to poll listener");
            return kills;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let Some(message) = receive(stream, peer, self.next_number) else {
                        continue;
                    };
                    match message.envelope {
                        Ok(Envelope::CommandKill(kill)) => {
                            debug!(signal = kill.signal, pid = kill.pid, "Kill received");
                            close(&message.stream);
                            kills.push(kill);
                        }
                        _ => {
                            debug!(number = message.number, "Queued request behind running command");
                            self.queue.push_back(message);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "Failed to accept connection while command runs");
                    break;
                }
            }
        }

        if let Err(err) = self.listener.set_nonblocking(false) {
            warn!(error = %err, "Failed to restore blocking listener");
        }
        kills
    }
}

/// Reads one message from a freshly accepted connection. Empty connections
/// (port probes) are dropped without using up a request number.
fn receive(mut stream: TcpStream, peer: SocketAddr, next_number: &mut u64) -> Option<Message> {
    let envelope = match read_message(&mut stream) {
        Ok(text) if text.is_empty() => {
            debug!(peer = %peer, "Empty connection; ignoring");
            return None;
        }
        Ok(text) => Envelope::parse(&text),
        Err(err) => Err(err),
    };

    let number = *next_number;
    *next_number += 1;
    Some(Message {
        number,
        peer,
        stream,
        envelope,
    })
}

fn read_message(stream: &mut TcpStream) -> Result<String, ErrorInfo> {
    // Accepted sockets may inherit the listener's non-blocking flag.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    read_reply(stream).map_err(|err| match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            ErrorInfo::new("read_timeout", "request timed out")
        }
        ErrorKind::InvalidData => ErrorInfo::new("invalid_request", err.to_string()),
        _ => ErrorInfo::new("read_error", format!("failed to read request: {}", err)),
    })
}

fn close(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use capturemock_core::{Mode, RcConfig, RecordLog};
    use std::io::{Read, Write};
    use std::thread;

    fn dispatcher() -> (Dispatcher, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let engine =
            Engine::new(RcConfig::empty(), Mode::RecordOnly, Vec::new(), RecordLog::disabled())
                .unwrap();
        (Dispatcher::new(listener, engine), address)
    }

    fn send(address: SocketAddr, payload: &str) -> TcpStream {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(payload.as_bytes()).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        stream
    }

    #[test]
    fn numbers_follow_arrival_and_skip_probes() {
        let (mut dispatcher, address) = dispatcher();
        drop(TcpStream::connect(address).unwrap());
        let _first = send(address, "SUT_SERVER:one\n");

        let mut message = None;
        while message.is_none() {
            message = dispatcher.accept().unwrap();
        }
        let message = message.unwrap();
        assert_eq!(message.number, 1);
        assert_eq!(
            message.envelope.unwrap(),
            Envelope::ServerState("one".to_string())
        );
    }

    #[test]
    fn malformed_envelope_gets_error_triple() {
        let (mut dispatcher, address) = dispatcher();
        let client = thread::spawn(move || {
            let mut stream = send(address, "SUT_COMMAND_LINE:['echo']:SUT_SEP:{}");
            let mut reply = String::new();
            stream.read_to_string(&mut reply).unwrap();
            send(address, "TERMINATE_SERVER\n");
            reply
        });

        dispatcher.run().unwrap();
        let reply = CommandReply::parse(&client.join().unwrap()).unwrap();
        assert_eq!(reply.exit_code, 1);
        assert!(reply.stderr.contains("invalid_envelope"));
        assert_eq!(dispatcher.engine().recorded(), 0);
    }

    #[test]
    fn kills_are_separated_from_queued_requests() {
        let (mut dispatcher, address) = dispatcher();
        let _state = send(address, "SUT_SERVER:ready\n");
        let _kill = send(address, "SUT_COMMAND_KILL:15:SUT_SEP:77");

        let mut incoming = Incoming {
            listener: &dispatcher.listener,
            queue: &mut dispatcher.queue,
            next_number: &mut dispatcher.next_number,
        };
        let mut kills = Vec::new();
        for _ in 0..200 {
            kills.extend(incoming.poll_kills());
            if !kills.is_empty() && !incoming.queue.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(kills, vec![CommandKillEnvelope { signal: 15, pid: 77 }]);
        assert_eq!(dispatcher.queue.len(), 1);
        assert_eq!(dispatcher.queue[0].number, 1);
        assert_eq!(dispatcher.next_number, 3);
    }
}
