use std::sync::Arc;

use crate::logging::{LogLevel, Logger};
use crate::platform::{Notice, Notifier};
use crate::wire::codec::WireCodec;
use crate::wire::session::build_notice_frame;

use super::ConnectionPool;

/// Delivers notices as NOTIFY pushes on the connection an identity is bound
/// to. Identities without a live connection miss the notice.
pub struct ConnectionNotifier {
    pool: Arc<ConnectionPool>,
    codec: WireCodec,
    logger: Arc<Logger>,
}

impl ConnectionNotifier {
    pub fn new(pool: Arc<ConnectionPool>, codec: WireCodec, logger: Arc<Logger>) -> Self {
        Self {
            pool,
            codec,
            logger,
        }
    }
}

impl Notifier for ConnectionNotifier {
    fn notify(&self, identity: &str, notice: &Notice) {
        let Some(connection) = self.pool.connection_for(identity) else {
            self.logger.debug(
                Some("pools::notifier"),
                &format!("no connection for '{identity}', dropping {} notice", notice.code()),
            );
            return;
        };

        let frame = match build_notice_frame(&self.codec, notice) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger.warn(
                    Some("pools::notifier"),
                    &format!("failed to build {} notice: {error}", notice.code()),
                );
                return;
            }
        };

        if let Err(error) = connection.write_frame(&frame) {
            self.logger.log(
                LogLevel::Warn,
                Some("pools::notifier"),
                "Notice delivery failed",
                Some(serde_json::json!({
                    "identity": identity,
                    "connection_id": connection.id(),
                    "notice": notice.code(),
                    "error": error.to_string()
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    use rmpv::Value;

    use crate::logging::LogLevel;
    use crate::logging::testing::memory_logger;
    use crate::platform::{Notice, Notifier};
    use crate::pools::ConnectionPool;
    use crate::pools::testing::connected_pair;
    use crate::wire::codec::{FrameBuffer, WireCodec};
    use crate::wire::envelope::{NOTIFY_MESSAGE_TYPE, WireEnvelope};

    use super::ConnectionNotifier;

    #[test]
    fn pushes_notice_to_bound_connection() {
        let codec = WireCodec::new(64 * 1024).expect("codec");
        let pool = Arc::new(ConnectionPool::new());
        let (conn, mut client, _server) = connected_pair();
        let connection_id = pool.register(conn);
        pool.bind_identity(connection_id, "ada").expect("bind");

        let (logger, _sink) = memory_logger(LogLevel::Debug);
        let notifier = ConnectionNotifier::new(Arc::clone(&pool), codec, logger);
        notifier.notify("ada", &Notice::UpNext);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buffer = FrameBuffer::new();
        let envelope = loop {
            let mut chunk = [0_u8; 512];
            let size = client.read(&mut chunk).expect("client should receive push");
            buffer.extend(&chunk[..size]);
            if let Some(raw) = buffer.next_envelope(&codec).expect("push should decode") {
                break WireEnvelope::from_raw(&raw).expect("envelope");
            }
        };

        assert_eq!(envelope.message_type, NOTIFY_MESSAGE_TYPE);
        assert_eq!(envelope.payload.get("code"), Some(&Value::String("up_next".into())));
    }

    #[test]
    fn unbound_identity_is_logged_and_skipped() {
        let codec = WireCodec::new(64 * 1024).expect("codec");
        let (logger, sink) = memory_logger(LogLevel::Debug);
        let notifier = ConnectionNotifier::new(Arc::new(ConnectionPool::new()), codec, logger);

        notifier.notify("ghost", &Notice::NothingToDo);
        assert!(sink.contains("no connection for 'ghost'"));
    }
}
