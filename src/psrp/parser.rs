//! Message parsing stage: completed fragment payloads to [`Message`]s.

use std::sync::Arc;

use crate::logging::{component, LogScope};
use crate::pipeline::Consumer;
use crate::psrp::defrag::CompletedMessage;
use crate::psrp::message::Message;

pub struct MessageParser {
    log: LogScope,
    next: Arc<dyn Consumer<Message>>,
}

impl MessageParser {
    pub fn new(log: LogScope, next: Arc<dyn Consumer<Message>>) -> Self {
        Self { log, next }
    }

    pub fn with_default_log(next: Arc<dyn Consumer<Message>>) -> Self {
        Self::new(LogScope::component(component::PARSER), next)
    }
}

impl Consumer<CompletedMessage> for MessageParser {
    fn accept(&self, completed: CompletedMessage) {
        let ctx = completed.context.log_context().with_object(completed.object_id);
        let message = match Message::decode(&completed.data, completed.context, completed.object_id) {
            Ok(message) => message,
            Err(e) => {
                crate::log_error!(self.log, ctx, "MESSAGE_DECODE_FAILED", error = e.to_string());
                return;
            }
        };

        let ctx = ctx.with_runspace(message.rpid, message.pid);
        crate::log_debug!(
            self.log,
            ctx,
            "MESSAGE",
            destination = message.destination.to_string(),
            message_type = message.message_type.to_string(),
            payload_len = message.data.len()
        );
        if self.log.enabled(log::Level::Trace) {
            log::trace!(
                target: self.log.target(),
                "{} MESSAGE_DATA {}",
                ctx,
                String::from_utf8_lossy(&message.data)
            );
        }
        self.next.accept(message);
    }
}
