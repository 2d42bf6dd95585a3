mod config;
mod events;
mod intake;
mod logging;
mod orchestrator;
mod platform;
mod pools;
mod server;
mod shutdown;
mod storage;
mod utils;
mod wire;

use std::collections::HashMap;
use std::io;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use config::AppConfig;
use events::{APP_STARTED, EventEmitter};
use intake::{Intake, Signal};
use logging::{LogLevel, Logger, LoggerConfig};
use orchestrator::Lane;
use orchestrator::desk::{Collaborators, DeskSettings, HelpDesk};
use orchestrator::waitlist::Waitlist;
use orchestrator::waitlist::persistent::PersistentWaitlist;
use platform::{EmitterLiveView, LiveRoster, PresenceRegistry};
use pools::{ConnectionNotifier, ConnectionPool};
use serde_json::json;
use server::{PersistentConnection, TcpServer};
use shutdown::ShutdownHooks;
use storage::StorageFacade;
use utils::runtime::ensure_posix_or_exit;
use utils::startup_banner::print_startup_banner;
use utils::timing::measure_execution;
use wire::codec::{FrameBuffer, WireCodec};
use wire::session::{
    ClientRequest, PROTOCOL_VIOLATION_CODE, SessionError, build_intake_error_frame,
    build_presence_ack_frame, build_protocol_error_frame, build_reply_frame,
    build_unknown_type_frame, evaluate_client_envelope,
};

const READ_CHUNK_BYTES: usize = 16 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn main() {
    ensure_posix_or_exit();

    let app_config = load_config_or_exit();
    print_startup_banner(&app_config.session.name);
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));
    let storage = measure_execution("storage.initialize", Some("main::storage"), &logger, || {
        StorageFacade::initialize(&app_config, &logger)
    })
    .map(Arc::new)
    .unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let wire_codec = WireCodec::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("wire codec configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Wire codec initialized",
        Some(json!({
            "max_envelope_size_bytes": wire_codec.max_envelope_size_bytes()
        })),
    );

    let emitter = Arc::new(EventEmitter::new());
    let roster = LiveRoster::attach(&emitter, Arc::clone(&logger));
    let presence = Arc::new(PresenceRegistry::new());
    let pool = Arc::new(ConnectionPool::new());
    let collaborators = Collaborators {
        directory: presence.clone(),
        connector: presence.clone(),
        notifier: Arc::new(ConnectionNotifier::new(
            Arc::clone(&pool),
            wire_codec,
            Arc::clone(&logger),
        )),
        live_view: Arc::new(EmitterLiveView::new(
            Arc::clone(&emitter),
            Arc::clone(&logger),
        )),
    };

    let session = Arc::new(HelpDesk::new(
        Waitlist::new(),
        desk_settings_or_exit(Lane::Session, &app_config),
        collaborators.clone(),
        Arc::clone(&logger),
    ));
    let booth = app_config.booth.enabled.then(|| {
        let waitlist = measure_execution("waitlist.bootstrap", Some("main::booth"), &logger, || {
            PersistentWaitlist::bootstrap(Arc::clone(&storage), &logger)
        })
        .unwrap_or_else(|error| {
            eprintln!("booth waitlist bootstrap error: {error}");
            process::exit(2);
        });
        let desk = HelpDesk::new(
            waitlist,
            desk_settings_or_exit(Lane::Booth, &app_config),
            collaborators,
            Arc::clone(&logger),
        );
        match desk.snapshot() {
            Ok(entries) => roster.seed(Lane::Booth, &entries),
            Err(error) => logger.warn(
                Some("main::booth"),
                &format!("could not seed booth roster: {error}"),
            ),
        }
        Arc::new(desk)
    });
    if booth.is_none() {
        logger.info(Some("main::booth"), "Booth lane disabled by configuration");
    }
    let intake = Arc::new(Intake::new(session, booth, Arc::clone(&logger)));

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} started non-blocking TCP intake server",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "session": app_config.session.name,
            "booth_enabled": app_config.booth.enabled
        })),
    );

    emitter.emit_or_exit(
        APP_STARTED,
        Some(json!({
            "component": "main",
            "session": app_config.session.name
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let runtime = Runtime {
        pool: Arc::clone(&pool),
        presence,
        intake,
        codec: wire_codec,
        logger: Arc::clone(&logger),
    };
    let mut buffers: HashMap<u64, FrameBuffer> = HashMap::new();
    let mut signal_workers: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown_hooks.is_triggered() {
        loop {
            match server.try_accept_persistent() {
                Ok(Some(connection)) => {
                    let connection_id = pool.register(Arc::clone(&connection));
                    buffers.insert(connection_id, FrameBuffer::new());
                    logger.log(
                        LogLevel::Info,
                        Some("main::server"),
                        "Accepted persistent full-duplex TCP connection",
                        Some(json!({
                            "connection_id": connection_id,
                            "peer_addr": connection.peer_addr().to_string(),
                            "open_connections": server.connection_count()
                        })),
                    );
                }
                Ok(None) => break,
                Err(error) => {
                    logger.warn(Some("main::server"), &format!("accept failed: {error}"));
                    break;
                }
            }
        }

        for connection_id in runtime.poll_connections(&mut buffers, &mut signal_workers) {
            let unread = buffers
                .remove(&connection_id)
                .map_or(0, |buffer| buffer.pending_len());
            if unread > 0 {
                logger.debug(
                    Some("main::server"),
                    &format!(
                        "connection {connection_id} closed with {unread} bytes of an unfinished frame"
                    ),
                );
            }
            server.drop_connection(connection_id);
        }
        signal_workers.retain(|worker| !worker.is_finished());
        thread::sleep(POLL_INTERVAL);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    emitter.begin_shutdown();
    for worker in signal_workers {
        if worker.join().is_err() {
            logger.warn(Some("main::shutdown"), "a signal worker panicked");
        }
    }
    pool.terminate_all();
    server.shutdown_all_connections();
    if let Err(error) = storage.flush() {
        logger.error(
            Some("main::shutdown"),
            &format!("storage flush failed during shutdown: {error}"),
        );
    }

    let drained = emitter.wait_for_idle(Duration::from_secs(3));
    if drained {
        logger.info(
            Some("main::shutdown"),
            "All running listeners completed before timeout",
        );
    } else {
        logger.warn(
            Some("main::shutdown"),
            "Listener drain timeout reached; continuing shutdown",
        );
    }

    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "TCP server stopped and shutdown completed",
        Some(json!({
            "session_waiting_dropped": roster.lines(Lane::Session).len(),
            "session_degraded": roster.is_degraded(Lane::Session),
            "booth_waiting_persisted": roster.lines(Lane::Booth).len(),
            "known_locations": runtime.presence.count()
        })),
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn desk_settings_or_exit(lane: Lane, app_config: &AppConfig) -> DeskSettings {
    DeskSettings::from_app_config(lane, app_config).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    })
}

struct Runtime {
    pool: Arc<ConnectionPool>,
    presence: Arc<PresenceRegistry>,
    intake: Arc<Intake>,
    codec: WireCodec,
    logger: Arc<Logger>,
}

impl Runtime {
    /// Reads whatever each connection has ready and handles complete frames.
    /// Returns the connections that were closed.
    fn poll_connections(
        &self,
        buffers: &mut HashMap<u64, FrameBuffer>,
        signal_workers: &mut Vec<JoinHandle<()>>,
    ) -> Vec<u64> {
        let mut closed = Vec::new();

        for (connection_id, connection) in self.pool.active_connections() {
            let buffer = buffers.entry(connection_id).or_default();
            let mut chunk = [0_u8; READ_CHUNK_BYTES];
            match connection.try_read(&mut chunk) {
                Ok(0) => {
                    self.close(connection_id, "peer closed the connection");
                    closed.push(connection_id);
                    continue;
                }
                Ok(size) => buffer.extend(&chunk[..size]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => {
                    self.close(connection_id, &format!("socket read error: {error}"));
                    closed.push(connection_id);
                    continue;
                }
            }

            let _ = self.pool.touch_now(connection_id);
            if !self.drain_frames(connection_id, &connection, buffer, signal_workers) {
                closed.push(connection_id);
            }
        }

        closed
    }

    /// Handles every complete frame in the buffer. Returns false once the
    /// connection had to be closed.
    fn drain_frames(
        &self,
        connection_id: u64,
        connection: &Arc<PersistentConnection>,
        buffer: &mut FrameBuffer,
        signal_workers: &mut Vec<JoinHandle<()>>,
    ) -> bool {
        loop {
            let raw = match buffer.next_envelope(&self.codec) {
                Ok(Some(raw)) => raw,
                Ok(None) => return true,
                Err(error) => {
                    self.reject_and_close(connection_id, connection, "0", &error.to_string());
                    return false;
                }
            };

            let bound = self.pool.bound_identity(connection_id);
            match evaluate_client_envelope(&raw, bound.as_deref()) {
                Ok(request) => {
                    if let Err(error) = self.pool.bind_identity(connection_id, request.identity()) {
                        self.write(
                            connection,
                            build_protocol_error_frame(
                                &self.codec,
                                request.request_id(),
                                PROTOCOL_VIOLATION_CODE,
                                &error.to_string(),
                            ),
                            "ERR response",
                        );
                        continue;
                    }
                    self.handle_request(connection, request, signal_workers);
                }
                Err(SessionError::UnknownMessageType {
                    request_id,
                    message_type,
                }) => {
                    self.write(
                        connection,
                        build_unknown_type_frame(&self.codec, &request_id, message_type),
                        "ERR response",
                    );
                }
                Err(SessionError::ProtocolViolation {
                    request_id,
                    code,
                    message,
                }) => {
                    let rid = request_id.as_deref().unwrap_or("0");
                    self.logger.warn(
                        Some("main::wire"),
                        &format!("rejected request on connection {connection_id}: {message}"),
                    );
                    self.write(
                        connection,
                        build_protocol_error_frame(&self.codec, rid, &code, &message),
                        "ERR response",
                    );
                }
                Err(error) => {
                    self.reject_and_close(connection_id, connection, "0", &error.to_string());
                    return false;
                }
            }
        }
    }

    fn handle_request(
        &self,
        connection: &Arc<PersistentConnection>,
        request: ClientRequest,
        signal_workers: &mut Vec<JoinHandle<()>>,
    ) {
        match request {
            ClientRequest::Presence {
                request_id,
                identity,
                location,
            } => {
                self.logger.log(
                    LogLevel::Debug,
                    Some("main::presence"),
                    "Presence updated",
                    Some(json!({
                        "identity": identity,
                        "location": location.as_ref().map(|location| location.as_str())
                    })),
                );
                self.presence.record(&identity, location);
                self.write(
                    connection,
                    build_presence_ack_frame(&self.codec, &request_id),
                    "OK response",
                );
            }
            ClientRequest::Signal { request_id, signal } => {
                signal_workers.push(self.spawn_signal(Arc::clone(connection), request_id, signal));
            }
        }
    }

    /// Dispatch may wait on the connector, so each signal runs off the poll
    /// loop and writes its own reply.
    fn spawn_signal(
        &self,
        connection: Arc<PersistentConnection>,
        request_id: String,
        signal: Signal,
    ) -> JoinHandle<()> {
        let intake = Arc::clone(&self.intake);
        let codec = self.codec;
        let logger = Arc::clone(&self.logger);

        thread::spawn(move || {
            let frame = match intake.handle(signal) {
                Ok(reply) => build_reply_frame(&codec, &request_id, &reply),
                Err(error) => build_intake_error_frame(&codec, &request_id, &error),
            };
            write_response_frame(&connection, frame, &logger, "intake reply");
        })
    }

    fn reject_and_close(
        &self,
        connection_id: u64,
        connection: &Arc<PersistentConnection>,
        request_id: &str,
        message: &str,
    ) {
        self.write(
            connection,
            build_protocol_error_frame(&self.codec, request_id, PROTOCOL_VIOLATION_CODE, message),
            "ERR response",
        );
        self.close(
            connection_id,
            &format!("wire protocol violation ({PROTOCOL_VIOLATION_CODE}): {message}"),
        );
    }

    fn write(
        &self,
        connection: &Arc<PersistentConnection>,
        frame: Result<Vec<u8>, SessionError>,
        label: &str,
    ) {
        write_response_frame(connection, frame, &self.logger, label);
    }

    fn close(&self, connection_id: u64, reason: &str) {
        match self.pool.terminate(connection_id) {
            Ok(identity) => self.logger.log(
                LogLevel::Info,
                Some("main::server"),
                "Connection closed",
                Some(json!({
                    "connection_id": connection_id,
                    "identity": identity,
                    "reason": reason
                })),
            ),
            Err(error) => self.logger.warn(Some("main::server"), &error.to_string()),
        }
    }
}

fn write_response_frame(
    connection: &Arc<PersistentConnection>,
    frame: Result<Vec<u8>, SessionError>,
    logger: &Logger,
    label: &str,
) {
    let frame = match frame {
        Ok(frame) => frame,
        Err(error) => {
            logger.warn(
                Some("main::wire"),
                &format!(
                    "failed to build {label} for connection {}: {error}",
                    connection.id()
                ),
            );
            return;
        }
    };

    if let Err(error) = connection.write_frame(&frame) {
        logger.warn(
            Some("main::wire"),
            &format!(
                "failed to write {label} to connection {}: {error}",
                connection.id()
            ),
        );
    }
}
