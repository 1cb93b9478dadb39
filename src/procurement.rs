//! Procurement role: a UDP client that places an order with a factory server
//! and follows its progress until every factory has completed.

use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use tracing::{debug, info, warn};

use crate::error::{SimError, SimResult};
use crate::ledger::{Observation, ProductionLedger};
use crate::message::{FRAME_LEN, Message, Purpose, WireError};

/// Largest datagram accepted; anything longer than a frame is rejected by decode.
const DATAGRAM_BUF: usize = 2 * FRAME_LEN;

/// Most factories a server may confirm.
const MAX_FACTORIES: u32 = 20;

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Client {
    fn connect(server: SocketAddr) -> SimResult<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        Ok(Self { socket, server })
    }

    fn send(&self, message: &Message) -> SimResult<()> {
        self.socket.send_to(&message.encode(), self.server)?;
        Ok(())
    }

    /// Next decodable frame. Frames with unknown purposes are skipped.
    fn recv(&self) -> SimResult<Message> {
        let mut buf = [0u8; DATAGRAM_BUF];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf)?;
            match Message::decode(&buf[..len]) {
                Ok(message) => return Ok(message),
                Err(WireError::UnknownPurpose(code)) => {
                    debug!(code, %from, "ignoring datagram with unrecognised purpose");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Place an order of `order_size` parts with `server` and print its progress
/// and final summary to `out`.
pub fn run(
    order_size: u32,
    server: SocketAddr,
    out: &mut impl Write,
) -> SimResult<ProductionLedger> {
    if order_size == 0 {
        return Err(SimError::InvalidArgument("order size must be > 0".into()));
    }
    let client = Client::connect(server)?;
    writeln!(out, "PROCUREMENT: Started")?;

    client.send(&Message::Request { order_size })?;
    writeln!(out, "PROCUREMENT: Sent an order for {order_size} parts to {server}")?;
    writeln!(out, "PROCUREMENT is now waiting for order confirmation ...")?;
    out.flush()?;

    let num_workers = match client.recv()? {
        Message::Confirmation { num_workers } => num_workers,
        other => {
            return Err(SimError::UnexpectedReply {
                expected: Purpose::Confirmation,
                received: other.purpose(),
            });
        }
    };
    if num_workers == 0 || num_workers > MAX_FACTORIES {
        return Err(SimError::InvalidConfirmation {
            num_workers,
            max: MAX_FACTORIES,
        });
    }
    writeln!(out, "PROCUREMENT: Order confirmed by {num_workers} factories")?;
    out.flush()?;
    info!(num_workers, "order confirmed");

    let mut ledger = ProductionLedger::new(num_workers);
    while !ledger.is_settled() {
        let message = client.recv()?;
        match ledger.observe(&message) {
            Observation::Produced {
                worker_id,
                parts_made,
            } => {
                if let Message::Production { worker, .. } = message {
                    writeln!(
                        out,
                        "PROCUREMENT: Factory #{worker_id:3} produced {parts_made:5} parts in {:5} milliSecs",
                        worker.duration_ms
                    )?;
                }
            }
            Observation::Completed {
                worker_id,
                shortfall,
            } => {
                debug!(factory = worker_id, "factory completed");
                if shortfall > 0 {
                    warn!(
                        factory = worker_id,
                        missing_parts = shortfall,
                        "production reports were lost"
                    );
                }
            }
            Observation::DuplicateCompletion { worker_id } => {
                warn!(factory = worker_id, "ignoring repeated completion");
            }
            Observation::UnknownWorker { worker_id } => {
                warn!(factory = worker_id, "ignoring report from unknown factory");
            }
            Observation::Ignored => debug!(?message, "ignoring message"),
        }
        out.flush()?;
    }

    ledger.write_report(out, "PROCUREMENT Summary Report", order_size)?;
    writeln!(out)?;
    writeln!(out, ">>> PROCUREMENT Terminated")?;
    out.flush()?;
    Ok(ledger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkerTag;
    use std::thread;

    fn tag(worker_id: u32) -> WorkerTag {
        WorkerTag {
            worker_id,
            capacity: 20,
            duration_ms: 600,
        }
    }

    fn confirmed(num_workers: u32) -> Vec<u8> {
        Message::Confirmation { num_workers }.encode().to_vec()
    }

    fn produced(worker_id: u32, parts_made: u32) -> Vec<u8> {
        Message::Production {
            worker: tag(worker_id),
            parts_made,
        }
        .encode()
        .to_vec()
    }

    fn completed(worker_id: u32, total_parts_made: u32, iterations: u32) -> Vec<u8> {
        Message::Completion {
            worker: tag(worker_id),
            total_parts_made,
            iterations,
        }
        .encode()
        .to_vec()
    }

    /// Single-shot server: answer one request with `replies`.
    fn serve(replies: Vec<Vec<u8>>) -> (SocketAddr, thread::JoinHandle<u32>) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let addr = socket.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let mut buf = [0u8; FRAME_LEN];
            let (len, client) = socket.recv_from(&mut buf).expect("request");
            let Ok(Message::Request { order_size }) = Message::decode(&buf[..len]) else {
                panic!("expected a request");
            };
            for reply in replies {
                socket.send_to(&reply, client).expect("reply");
            }
            order_size
        });
        (addr, handle)
    }

    #[test]
    fn follows_an_order_to_completion() {
        let mut unknown = confirmed(0);
        unknown[0..4].copy_from_slice(&9u32.to_le_bytes());
        let replies = vec![
            confirmed(2),
            produced(1, 20),
            unknown,
            produced(2, 15),
            completed(2, 15, 1),
            produced(1, 5),
            completed(1, 25, 2),
        ];
        let (server, handle) = serve(replies);

        let mut out = Vec::new();
        let ledger = run(40, server, &mut out).expect("procurement run");
        assert_eq!(handle.join().expect("server panicked"), 40);

        assert_eq!(ledger.grand_total(), 40);
        assert_eq!(ledger.tally(1).map(|t| t.iterations), Some(2));
        let log = String::from_utf8(out).expect("utf8");
        assert!(log.contains("PROCUREMENT: Factory #  1 produced    20 parts in   600 milliSecs"));
        assert!(log.contains("Grand total parts made =    40   vs   order size of    40"));
        assert!(log.trim_end().ends_with(">>> PROCUREMENT Terminated"));
    }

    #[test]
    fn rejects_a_reply_that_is_not_a_confirmation() {
        let (server, handle) = serve(vec![produced(1, 1)]);
        let err = run(5, server, &mut Vec::new()).expect_err("protocol violation");
        handle.join().expect("server panicked");
        assert!(matches!(
            err,
            SimError::UnexpectedReply {
                expected: Purpose::Confirmation,
                received: Purpose::Production
            }
        ));
    }

    #[test]
    fn rejects_a_confirmation_without_factories() {
        let (server, handle) = serve(vec![confirmed(0)]);
        let err = run(5, server, &mut Vec::new()).expect_err("nothing would ever complete");
        handle.join().expect("server panicked");
        assert!(matches!(err, SimError::InvalidConfirmation { num_workers: 0, .. }));
    }

    #[test]
    fn rejects_an_implausible_factory_count() {
        let (server, handle) = serve(vec![confirmed(u32::MAX)]);
        let mut out = Vec::new();
        let err = run(5, server, &mut out).expect_err("count out of range");
        handle.join().expect("server panicked");
        assert!(matches!(
            err,
            SimError::InvalidConfirmation {
                num_workers: u32::MAX,
                max: MAX_FACTORIES
            }
        ));
        let log = String::from_utf8(out).expect("utf8");
        assert!(!log.contains("Order confirmed"));
    }

    #[test]
    fn zero_order_is_rejected_before_sending() {
        let server: SocketAddr = (Ipv4Addr::LOCALHOST, 9).into();
        assert!(matches!(
            run(0, server, &mut Vec::new()),
            Err(SimError::InvalidArgument(_))
        ));
    }
}
