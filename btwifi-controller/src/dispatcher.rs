//! Outbound command framing and inbound response demultiplexing
//!
//! The wire protocol has no request id: a response is attributed to the
//! command in flight on the channel it arrived on. Only one command per
//! channel may therefore be outstanding; a second send is refused with
//! [`SetupError::BusyChannel`] instead of risking a misattributed response.

use std::time::{Duration, Instant};

use btwifi_proto::{
    AccessPoint, Channel, ChannelMap, CommandEnvelope, MAX_CHUNK_LEN, ResponseEnvelope, WifiCommand,
    WifiResult, chunk_frame, encode_frame,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SetupError;
use crate::models::ListModel;
use crate::transport::GattTransport;

/// Commander characteristic a channel writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commander {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    command: i32,
    deadline: Option<Instant>,
}

/// Typed result of one response
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Access-point model was replaced
    AccessPoints { count: usize, skipped: usize },
    CurrentConnection(Option<AccessPoint>),
    Completed {
        channel: Channel,
        command: i32,
        payload: Option<Value>,
    },
    Failed {
        channel: Channel,
        command: i32,
        result: i32,
    },
}

#[derive(Debug)]
pub struct Dispatcher {
    in_flight: ChannelMap<Option<InFlight>>,
    command_timeout: Option<Duration>,
    max_chunk_len: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(None, MAX_CHUNK_LEN)
    }
}

impl Dispatcher {
    pub fn new(command_timeout: Option<Duration>, max_chunk_len: usize) -> Self {
        Self {
            in_flight: ChannelMap::default(),
            command_timeout,
            max_chunk_len,
        }
    }

    /// Frame `envelope` and queue its chunks on the channel's commander.
    ///
    /// `commander` is `None` while the owning service is not ready.
    pub fn send<T: GattTransport>(
        &mut self,
        channel: Channel,
        envelope: &CommandEnvelope,
        commander: Option<Commander>,
        transport: &mut T,
        now: Instant,
    ) -> Result<(), SetupError> {
        let Some(commander) = commander else {
            warn!(
                %channel,
                command = envelope.command,
                "commander characteristic not available, dropping command"
            );
            return Err(SetupError::NotReady(channel));
        };
        if let Some(pending) = self.in_flight[channel] {
            warn!(%channel, pending = pending.command, command = envelope.command, "channel busy");
            return Err(SetupError::BusyChannel { channel, pending: pending.command });
        }

        let frame = encode_frame(envelope)?;
        debug!(%channel, command = envelope.command, bytes = frame.len(), "streaming command");
        for chunk in chunk_frame(&frame, self.max_chunk_len) {
            transport.write_characteristic(commander.service, commander.characteristic, chunk)?;
        }

        self.in_flight[channel] = Some(InFlight {
            command: envelope.command,
            // a timeout too large to represent never expires
            deadline: self.command_timeout.and_then(|timeout| now.checked_add(timeout)),
        });
        Ok(())
    }

    /// Route a decoded response. Access points go straight into `access_points`.
    pub fn handle_response(
        &mut self,
        channel: Channel,
        response: ResponseEnvelope,
        access_points: &mut dyn ListModel<AccessPoint>,
    ) -> Outcome {
        match self.in_flight[channel] {
            Some(pending) if pending.command == response.command => {
                self.in_flight[channel] = None;
            }
            Some(pending) => {
                // the pending command is still owed its own reply
                warn!(
                    %channel,
                    pending = pending.command,
                    command = response.command,
                    "response does not match pending command"
                );
            }
            None => {
                debug!(%channel, command = response.command, "unsolicited response");
            }
        }

        if !response.is_success() {
            warn!(
                %channel,
                command = response.command,
                result = response.result,
                reason = %WifiResult::from_code(response.result),
                "command failed"
            );
            return Outcome::Failed {
                channel,
                command: response.command,
                result: response.result,
            };
        }

        debug!(%channel, command = response.command, "command reply");
        match (channel, WifiCommand::from_code(response.command)) {
            (Channel::Wifi, Some(WifiCommand::GetNetworks)) => {
                let (list, skipped) = AccessPoint::list_from_payload(response.payload());
                if skipped > 0 {
                    warn!(skipped, "ignoring malformed access point entries");
                }
                access_points.clear();
                let count = list.len();
                for access_point in list {
                    access_points.add(access_point);
                }
                info!(count, "access points updated");
                Outcome::AccessPoints { count, skipped }
            }
            (Channel::Wifi, Some(WifiCommand::GetConnection)) => {
                Outcome::CurrentConnection(AccessPoint::connection_from_payload(response.payload()))
            }
            _ => Outcome::Completed {
                channel,
                command: response.command,
                payload: response.payload,
            },
        }
    }

    pub fn pending(&self, channel: Channel) -> Option<i32> {
        self.in_flight[channel].map(|pending| pending.command)
    }

    /// Clear and return every command whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(Channel, i32)> {
        let mut expired = Vec::new();
        for (channel, slot) in self.in_flight.iter_mut() {
            if let Some(pending) = *slot {
                if pending.deadline.is_some_and(|deadline| now >= deadline) {
                    *slot = None;
                    expired.push((channel, pending.command));
                }
            }
        }
        expired
    }

    pub fn reset(&mut self) {
        for (_, slot) in self.in_flight.iter_mut() {
            *slot = None;
        }
    }
}
