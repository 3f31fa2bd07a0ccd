//! Broker-side handlers. Every connection gets one of each, in the order
//! connection, client, worker. They never remove themselves.

use bytes::Bytes;

use crate::dispatch::{Claim, Handler};
use crate::error::ProtocolError;
use crate::protocol::{handle_arg, number_arg, text_arg, Frame, Magic, PacketType};
use crate::server::broker::BrokerState;
use crate::ConnectionId;

fn flag(value: bool) -> Bytes {
    Bytes::from_static(if value { b"1" } else { b"0" })
}

/// Connection-scoped requests: echo, options, client id.
pub struct ConnectionResponder {
    conn: ConnectionId,
}

impl ConnectionResponder {
    pub fn new(conn: ConnectionId) -> Self {
        Self { conn }
    }
}

impl Handler<BrokerState> for ConnectionResponder {
    fn try_handle(&mut self, frame: &Frame, state: &mut BrokerState) -> Result<Claim, ProtocolError> {
        if frame.magic() != Magic::Request {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();
        match packet {
            PacketType::EchoReq => {
                let args = frame.expect_args()?;
                state.send(self.conn, Frame::response(PacketType::EchoRes, args));
            }
            PacketType::OptionReq => {
                let args = frame.expect_args()?;
                let option = text_arg(packet, &args[0])?;
                if option == "exceptions" {
                    if let Some(peer) = state.peer_mut(self.conn) {
                        peer.exceptions = true;
                    }
                    state.send(self.conn, Frame::response(PacketType::OptionRes, args));
                } else {
                    state.send(
                        self.conn,
                        Frame::error("ERR_UNKNOWN_OPTION", &format!("Unknown option {}", option)),
                    );
                }
            }
            PacketType::SetClientId => {
                let args = frame.expect_args()?;
                let id = text_arg(packet, &args[0])?;
                if let Some(peer) = state.peer_mut(self.conn) {
                    peer.client_id = Some(id);
                }
            }
            _ => return Ok(Claim::Unclaimed),
        }
        Ok(Claim::Claimed)
    }

    fn name(&self) -> &'static str {
        "connection"
    }
}

/// Job submission and status queries.
pub struct ClientResponder {
    conn: ConnectionId,
}

impl ClientResponder {
    pub fn new(conn: ConnectionId) -> Self {
        Self { conn }
    }
}

impl Handler<BrokerState> for ClientResponder {
    fn try_handle(&mut self, frame: &Frame, state: &mut BrokerState) -> Result<Claim, ProtocolError> {
        if frame.magic() != Magic::Request {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();

        if let Some((priority, background)) = packet.submit_mode() {
            let args = frame.expect_args()?;
            let function = text_arg(packet, &args[0])?;
            if function.trim().is_empty() {
                return Err(ProtocolError::InvalidArgument {
                    packet,
                    detail: "empty function name".to_string(),
                });
            }
            let unique_id = text_arg(packet, &args[1])?;
            state.submit(
                self.conn,
                priority,
                background,
                function,
                unique_id,
                args[2].clone(),
            );
            return Ok(Claim::Claimed);
        }

        if packet == PacketType::GetStatus {
            let args = frame.expect_args()?;
            let handle = handle_arg(packet, &args[0])?;
            let status = state.status(&handle);
            state.send(
                self.conn,
                Frame::response(
                    PacketType::StatusRes,
                    [
                        Bytes::from(handle),
                        flag(status.known),
                        flag(status.running),
                        Bytes::from(status.numerator.to_string()),
                        Bytes::from(status.denominator.to_string()),
                    ],
                ),
            );
            return Ok(Claim::Claimed);
        }

        Ok(Claim::Unclaimed)
    }

    fn name(&self) -> &'static str {
        "client"
    }
}

/// Capability registration, the grab/sleep exchange and work reports.
pub struct WorkerResponder {
    conn: ConnectionId,
}

impl WorkerResponder {
    pub fn new(conn: ConnectionId) -> Self {
        Self { conn }
    }
}

impl Handler<BrokerState> for WorkerResponder {
    fn try_handle(&mut self, frame: &Frame, state: &mut BrokerState) -> Result<Claim, ProtocolError> {
        if frame.magic() != Magic::Request {
            return Ok(Claim::Unclaimed);
        }
        let packet = frame.packet();
        match packet {
            PacketType::CanDo => {
                let args = frame.expect_args()?;
                let function = text_arg(packet, &args[0])?;
                state.registry.get_or_create_worker(self.conn).can_do(&function, None);
                tracing::debug!(conn_id = self.conn, function = %function, "CAN_DO");
            }
            PacketType::CanDoTimeout => {
                let args = frame.expect_args()?;
                let function = text_arg(packet, &args[0])?;
                let timeout = u32::try_from(number_arg(packet, &args[1])?).map_err(|_| {
                    ProtocolError::InvalidArgument {
                        packet,
                        detail: "timeout out of range".to_string(),
                    }
                })?;
                state
                    .registry
                    .get_or_create_worker(self.conn)
                    .can_do(&function, Some(timeout));
                tracing::debug!(conn_id = self.conn, function = %function, timeout, "CAN_DO_TIMEOUT");
            }
            PacketType::CantDo => {
                let args = frame.expect_args()?;
                let function = text_arg(packet, &args[0])?;
                if let Some(worker) = state.registry.worker_mut(self.conn) {
                    worker.cant_do(&function);
                }
            }
            PacketType::ResetAbilities => {
                if let Some(worker) = state.registry.worker_mut(self.conn) {
                    worker.reset_abilities();
                }
            }
            PacketType::PreSleep => state.pre_sleep(self.conn),
            PacketType::GrabJob => state.grab(self.conn, false),
            PacketType::GrabJobUniq => state.grab(self.conn, true),
            p if p.is_work_report() => state.work_report(self.conn, frame)?,
            _ => return Ok(Claim::Unclaimed),
        }
        Ok(Claim::Claimed)
    }

    fn name(&self) -> &'static str {
        "worker"
    }
}
