//! Remote invocation facade: executes serialized tasks on the peer over a
//! dedicated channel.

use crate::error::Result;
use crate::net::connection::{ChannelHandle, ConnectionHandle};
use crate::net::message::downcast;
use crate::remote::protocol::{
    Envelope, InvocationRequest, Response, INVOCATION_SERVICE_PROTOCOL, INVOCATION_SERVICE_RECEIVER,
};
use crate::value::Value;
use photon::logging;

pub struct RemoteInvocationService {
    channel: ChannelHandle,
    log: logging::Logger,
}

impl RemoteInvocationService {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        connection: &ConnectionHandle,
        log: L,
    ) -> Result<RemoteInvocationService> {
        let channel =
            connection.open_channel(INVOCATION_SERVICE_PROTOCOL, INVOCATION_SERVICE_RECEIVER, None, None)?;

        Ok(RemoteInvocationService {
            channel,
            log: logging::child(log, logging::o!("facade" => "invocation-service")),
        })
    }

    /// Runs `task` on the peer and returns its result verbatim. Deadlines and
    /// cancellation ride the request slot; no retries happen here.
    pub fn execute(&self, task: &Value) -> Result<Value> {
        logging::debug!(self.log, "executing remote task");

        let response = self.channel.request(
            Envelope::boxed(InvocationRequest { task: task.clone() }),
            0,
        )?;
        downcast::<Envelope<Response>>(response)?.body.into_result()
    }
}
