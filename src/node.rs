use crate::error::{Error, Result};
use crate::redis::{
    formatter, Command, CommandKind, CommandMonitor, Connection, EncodedResponse, RedisRequest,
};
use crate::shard::{Shard, ShardConfig};

use log::{info, warn};
use std::sync::Arc;

/// The top of the dispatching hierarchy: one process runs one QuarkDB node,
/// which owns its shard and the process-wide connection facilities
/// (monitoring, connection-local commands), and routes everything else down
/// to the shard's active group.
pub struct QuarkDBNode {
    shard: Arc<Shard>,
    monitor: CommandMonitor,
    boot_time: std::time::Instant,
}

impl QuarkDBNode {
    pub fn new(config: ShardConfig) -> Result<Arc<Self>> {
        info!("Starting QuarkDB node, version {}", env!("CARGO_PKG_VERSION"));
        Ok(Arc::new(Self {
            shard: Shard::start(config)?,
            monitor: CommandMonitor::new(),
            boot_time: std::time::Instant::now(),
        }))
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Services one client request. Responses flow through the connection's
    /// pending queue, which keeps them in submission order even when writes
    /// must first be committed by consensus.
    pub fn dispatch(&self, conn: &Connection, request: RedisRequest) {
        if request.is_empty() {
            return;
        }
        if self.monitor.active() {
            self.monitor.broadcast(&request, &format!("id={}", conn.id()));
        }

        let Some((command, kind)) = Command::parse(&request) else {
            conn.queue.append_response(formatter::err(&format!(
                "unknown command '{}'",
                String::from_utf8_lossy(&request[0])
            )));
            return;
        };

        match kind {
            CommandKind::Control => {
                let response = self.control(conn, command, &request);
                conn.queue.append_response(response);
            }
            CommandKind::Pubsub => {
                let response = self.pubsub(conn, command, &request);
                conn.queue.append_response(response);
            }
            CommandKind::Quarkdb => {
                let response = self.quarkdb(command, &request);
                conn.queue.append_response(response);
            }
            CommandKind::Read | CommandKind::Write | CommandKind::Raft => {
                self.shard.dispatch(conn, command, kind, request);
            }
        }
    }

    // ----- Connection-local control ------------------------------------------

    fn control(&self, conn: &Connection, command: Command, request: &RedisRequest) -> EncodedResponse {
        let args = &request[1..];
        match command {
            Command::Ping => match args {
                [] => formatter::pong(),
                [message] => formatter::string(message),
                _ => formatter::err_args("PING"),
            },
            Command::Echo => match args {
                [message] => formatter::string(message),
                _ => formatter::err_args("ECHO"),
            },
            Command::Client => self.client(conn, args),
            Command::Monitor => {
                if !args.is_empty() {
                    return formatter::err_args("MONITOR");
                }
                conn.set_monitor();
                self.monitor.register(Arc::downgrade(&conn.queue));
                formatter::ok()
            }
            Command::ActivatePushTypes => {
                // There's no way to deactivate push types. This is
                // intentional.
                conn.activate_push_types();
                formatter::ok()
            }
            Command::ActivateStaleReads => {
                conn.activate_stale_reads();
                formatter::ok()
            }
            Command::Debug => self.debug(args),
            _ => formatter::err("internal dispatching error"),
        }
    }

    fn client(&self, conn: &Connection, args: &[Vec<u8>]) -> EncodedResponse {
        match args {
            [sub, name] if sub.eq_ignore_ascii_case(b"setname") => {
                conn.set_name(String::from_utf8_lossy(name).to_string());
                formatter::ok()
            }
            [sub] if sub.eq_ignore_ascii_case(b"getname") => {
                formatter::string(conn.name().as_bytes())
            }
            [sub] if sub.eq_ignore_ascii_case(b"id") => formatter::integer(conn.id() as i64),
            _ => formatter::err("Syntax error, try CLIENT (SETNAME name|GETNAME|ID)"),
        }
    }

    fn debug(&self, args: &[Vec<u8>]) -> EncodedResponse {
        match args.first().map(|a| a.to_ascii_lowercase()) {
            Some(kind) if kind == b"segfault" || kind == b"terminate" => {
                warn!("Received DEBUG {}; aborting", String::from_utf8_lossy(&kind));
                std::process::abort();
            }
            Some(kind) if kind == b"kill" => {
                warn!("Received DEBUG kill; exiting");
                std::process::exit(1);
            }
            _ => formatter::err("DEBUG subcommand not supported"),
        }
    }

    // ----- Pub/sub surface ---------------------------------------------------

    fn pubsub(&self, conn: &Connection, command: Command, request: &RedisRequest) -> EncodedResponse {
        let channels = &request[1..];
        if channels.is_empty() {
            return formatter::err_args(&crate::redis::request::command_name(request));
        }
        let action = match command {
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            _ => return formatter::err("internal dispatching error"),
        };
        let mut out = Vec::new();
        for channel in channels {
            let delta = if command == Command::Subscribe { 1 } else { -1 };
            let count = conn.adjust_subscriptions(delta);
            out.push(formatter::subscription(action, channel, count as i64, conn.has_push_types()));
        }
        EncodedResponse::concat(out)
    }

    // ----- QUARKDB_* commands ------------------------------------------------

    fn quarkdb(&self, command: Command, request: &RedisRequest) -> EncodedResponse {
        let args = &request[1..];
        match command {
            Command::QuarkdbInfo => self.info(),
            Command::QuarkdbVersion => formatter::string(env!("CARGO_PKG_VERSION").as_bytes()),
            Command::QuarkdbHealth => self.health(),
            Command::QuarkdbCheckpoint => match args {
                [path] => {
                    let path = std::path::PathBuf::from(String::from_utf8_lossy(path).to_string());
                    into_response(self.shard.checkpoint(&path))
                }
                _ => formatter::err_args("QUARKDB_CHECKPOINT"),
            },
            Command::QuarkdbManualCompaction => into_response(self.shard.manual_compaction()),
            Command::QuarkdbVerifyChecksum => {
                match self.shard.with_state_machine(|sm| sm.verify_checksum()) {
                    Ok(checked) => formatter::status(&format!("OK, checked {checked} keys")),
                    Err(err) => formatter::err(&err.to_string()),
                }
            }
            Command::QuarkdbBulkloadFinalize => {
                into_response(self.shard.with_state_machine(|sm| sm.finalize_bulkload()))
            }
            Command::QuarkdbStartResilvering => match args {
                [id] => into_response(
                    self.shard.resilvering_start(&String::from_utf8_lossy(id)),
                ),
                _ => formatter::err_args("QUARKDB_START_RESILVERING"),
            },
            Command::QuarkdbResilveringCopyFile => match args {
                [id, name, contents] => into_response(self.shard.resilvering_copy_file(
                    &String::from_utf8_lossy(id),
                    &String::from_utf8_lossy(name),
                    contents,
                )),
                _ => formatter::err_args("QUARKDB_RESILVERING_COPY_FILE"),
            },
            Command::QuarkdbFinishResilvering => match args {
                [id] => into_response(
                    self.shard.resilvering_finish(&String::from_utf8_lossy(id)),
                ),
                _ => formatter::err_args("QUARKDB_FINISH_RESILVERING"),
            },
            Command::QuarkdbCancelResilvering => match args {
                [id] => into_response(
                    self.shard.resilvering_cancel(&String::from_utf8_lossy(id)),
                ),
                _ => formatter::err_args("QUARKDB_CANCEL_RESILVERING"),
            },
            _ => formatter::err("internal dispatching error"),
        }
    }

    fn info(&self) -> EncodedResponse {
        let mut lines = vec![
            format!("VERSION {}", env!("CARGO_PKG_VERSION")),
            format!("MODE {}", self.shard.mode_name()),
            format!("UPTIME-SECONDS {}", self.boot_time.elapsed().as_secs()),
        ];
        if let Ok(status) = self.shard.with_state_machine(|sm| sm.status()) {
            lines.push(format!("STATE-MACHINE-ENGINE {}", status.name));
            lines.push(format!("STATE-MACHINE-KEYS {}", status.keys));
            lines.push(format!("STATE-MACHINE-SIZE {}", status.size));
        }
        if let Ok(applied) = self.shard.with_state_machine(|sm| Ok(sm.last_applied())) {
            lines.push(format!("LAST-APPLIED {applied}"));
        }
        formatter::status_vector(&lines)
    }

    fn health(&self) -> EncodedResponse {
        // A full-scan consistency check would be too expensive here; being
        // able to read the engine at all is the baseline signal.
        match self.shard.with_state_machine(|sm| sm.status()) {
            Ok(_) => formatter::status_vector(&["GREEN", "state-machine reachable"]),
            Err(err) => formatter::status_vector(&[
                "RED".to_string(),
                format!("state-machine unreachable: {err}"),
            ]),
        }
    }
}

fn into_response(result: Result<()>) -> EncodedResponse {
    match result {
        Ok(()) => formatter::ok(),
        Err(Error::Unavailable) => formatter::unavailable(),
        Err(err) => formatter::err(&err.to_string()),
    }
}
