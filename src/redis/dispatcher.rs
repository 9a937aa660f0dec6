use super::formatter_impl::{formatter, EncodedResponse};
use super::request::{command_name, Command, RedisRequest, Transaction};
use crate::error::{Error, Result};
use crate::raft::LogIndex;
use crate::statemachine::{
    ClockValue, Direction, LeaseAcquisition, StagingRead, StateMachine, WriteStaging,
};

use std::sync::Arc;

/// The default page size for cursored scans without an explicit COUNT.
const DEFAULT_SCAN_COUNT: usize = 100;

/// Executes data commands against the state machine: reads from engine
/// snapshots, writes through staging areas committed at their journal index.
pub struct RedisDispatcher {
    sm: Arc<StateMachine>,
}

impl RedisDispatcher {
    pub fn new(sm: Arc<StateMachine>) -> Self {
        Self { sm }
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.sm
    }

    /// Serves a read command from a state machine snapshot.
    pub fn dispatch_read(&self, request: &RedisRequest) -> EncodedResponse {
        let mut staging = self.sm.begin_read();
        match self.execute_read(&mut staging, request) {
            Ok(response) => response,
            Err(error) => formatter::from_error(&error),
        }
    }

    /// Applies a write transaction at the given journal index, returning one
    /// response per request. A commit failure aborts the process: partially
    /// applying a committed entry would break at-most-once application.
    pub fn apply(&self, tx: &Transaction, index: LogIndex) -> Vec<EncodedResponse> {
        let mut staging = self.sm.begin_write();
        let mut responses = Vec::with_capacity(tx.expected_responses());
        for request in tx.requests() {
            responses.push(match self.execute_write(&mut staging, request) {
                Ok(response) => response,
                Err(error) => formatter::from_error(&error),
            });
        }
        self.sm.commit(staging, index).expect("failed to commit applied journal entry");

        // Lease commands carry the leader's clock; mirror committed values
        // into the in-memory timekeeper.
        for request in tx.requests() {
            if let Some(timestamp) = lease_timestamp(request) {
                self.sm.synchronize_clock(timestamp);
            }
        }
        responses
    }

    fn execute_read(
        &self,
        staging: &mut dyn StagingRead,
        request: &RedisRequest,
    ) -> Result<EncodedResponse> {
        use Command::*;
        let sm = &self.sm;
        let Some((command, _)) = Command::parse(request) else {
            return Ok(unknown_command(request));
        };
        let args = &request[1..];

        Ok(match command {
            Get => {
                let [key] = args else { return Ok(formatter::err_args("GET")) };
                formatter::opt_string(sm.get(staging, key)?.as_deref())
            }
            Exists => {
                if args.is_empty() {
                    return Ok(formatter::err_args("EXISTS"));
                }
                formatter::integer(sm.exists(staging, args)?)
            }
            Keys => {
                let [pattern] = args else { return Ok(formatter::err_args("KEYS")) };
                formatter::vector(&sm.keys(staging, pattern)?)
            }
            Scan => {
                let (cursor, pattern, count) = match parse_scan_args(args, true)? {
                    Some(parsed) => parsed,
                    None => return Ok(formatter::err_args("SCAN")),
                };
                let (next, keys) = sm.scan(staging, &cursor, &pattern, count)?;
                formatter::scan(&encode_cursor(next), &keys)
            }
            Type => {
                let [key] = args else { return Ok(formatter::err_args("TYPE")) };
                match sm.key_type(staging, key)? {
                    Some(key_type) => formatter::status(&key_type.to_string()),
                    None => formatter::status("none"),
                }
            }
            Hget => {
                let [key, field] = args else { return Ok(formatter::err_args("HGET")) };
                formatter::opt_string(sm.hget(staging, key, field)?.as_deref())
            }
            Hexists => {
                let [key, field] = args else { return Ok(formatter::err_args("HEXISTS")) };
                formatter::integer(sm.hexists(staging, key, field)? as i64)
            }
            Hkeys => {
                let [key] = args else { return Ok(formatter::err_args("HKEYS")) };
                formatter::vector(&sm.hkeys(staging, key)?)
            }
            Hgetall => {
                let [key] = args else { return Ok(formatter::err_args("HGETALL")) };
                formatter::vector(&flatten_pairs(sm.hgetall(staging, key)?))
            }
            Hlen => {
                let [key] = args else { return Ok(formatter::err_args("HLEN")) };
                formatter::integer(sm.hlen(staging, key)?)
            }
            Hvals => {
                let [key] = args else { return Ok(formatter::err_args("HVALS")) };
                formatter::vector(&sm.hvals(staging, key)?)
            }
            Hscan => {
                let Some((key, rest)) = args.split_first() else {
                    return Ok(formatter::err_args("HSCAN"));
                };
                let (cursor, _, count) = match parse_scan_args(rest, false)? {
                    Some(parsed) => parsed,
                    None => return Ok(formatter::err_args("HSCAN")),
                };
                let (next, pairs) = sm.hscan(staging, key, &cursor, count)?;
                formatter::scan(&encode_cursor(next), &flatten_pairs(pairs))
            }
            Sismember => {
                let [key, element] = args else { return Ok(formatter::err_args("SISMEMBER")) };
                formatter::integer(sm.sismember(staging, key, element)? as i64)
            }
            Smembers => {
                let [key] = args else { return Ok(formatter::err_args("SMEMBERS")) };
                formatter::vector(&sm.smembers(staging, key)?)
            }
            Scard => {
                let [key] = args else { return Ok(formatter::err_args("SCARD")) };
                formatter::integer(sm.scard(staging, key)?)
            }
            Sscan => {
                let Some((key, rest)) = args.split_first() else {
                    return Ok(formatter::err_args("SSCAN"));
                };
                let (cursor, _, count) = match parse_scan_args(rest, false)? {
                    Some(parsed) => parsed,
                    None => return Ok(formatter::err_args("SSCAN")),
                };
                let (next, members) = sm.sscan(staging, key, &cursor, count)?;
                formatter::scan(&encode_cursor(next), &members)
            }
            Llen => {
                let [key] = args else { return Ok(formatter::err_args("LLEN")) };
                formatter::integer(sm.deque_len(staging, key)?)
            }
            Lhget => {
                let (key, field, hint) = match args {
                    [key, field] => (key, field, None),
                    [key, field, hint] => (key, field, Some(hint.as_slice())),
                    _ => return Ok(formatter::err_args("LHGET")),
                };
                formatter::opt_string(sm.lhget(staging, key, field, hint)?.as_deref())
            }
            Lhlen => {
                let [key] = args else { return Ok(formatter::err_args("LHLEN")) };
                formatter::integer(sm.lhlen(staging, key)?)
            }
            ConfigGet => {
                let [name] = args else { return Ok(formatter::err_args("CONFIG_GET")) };
                formatter::opt_string(sm.config_get(staging, name)?.as_deref())
            }
            ConfigGetall => {
                if !args.is_empty() {
                    return Ok(formatter::err_args("CONFIG_GETALL"));
                }
                formatter::vector(&flatten_pairs(sm.config_getall(staging)?))
            }
            _ => formatter::err(&format!(
                "internal dispatching error for '{}'",
                command_name(request)
            )),
        })
    }

    fn execute_write(
        &self,
        staging: &mut WriteStaging,
        request: &RedisRequest,
    ) -> Result<EncodedResponse> {
        use Command::*;
        let sm = &self.sm;
        let Some((command, _)) = Command::parse(request) else {
            return Ok(unknown_command(request));
        };
        let args = &request[1..];

        Ok(match command {
            Set => {
                let [key, value] = args else { return Ok(formatter::err_args("SET")) };
                sm.set(staging, key, value)?;
                formatter::ok()
            }
            Del => {
                if args.is_empty() {
                    return Ok(formatter::err_args("DEL"));
                }
                formatter::integer(sm.del(staging, args)?)
            }
            Flushall => {
                if !args.is_empty() {
                    return Ok(formatter::err_args("FLUSHALL"));
                }
                sm.flushall(staging)?;
                formatter::ok()
            }
            Hset => {
                let [key, field, value] = args else { return Ok(formatter::err_args("HSET")) };
                formatter::integer(sm.hset(staging, key, field, value)? as i64)
            }
            Hmset => {
                let Some((key, pairs)) = args.split_first() else {
                    return Ok(formatter::err_args("HMSET"));
                };
                let Some(pairs) = chunk_pairs(pairs) else {
                    return Ok(formatter::err_args("HMSET"));
                };
                sm.hmset(staging, key, &pairs)?;
                formatter::ok()
            }
            Hsetnx => {
                let [key, field, value] = args else { return Ok(formatter::err_args("HSETNX")) };
                formatter::integer(sm.hsetnx(staging, key, field, value)? as i64)
            }
            Hdel => {
                let Some((key, fields)) = args.split_first() else {
                    return Ok(formatter::err_args("HDEL"));
                };
                if fields.is_empty() {
                    return Ok(formatter::err_args("HDEL"));
                }
                formatter::integer(sm.hdel(staging, key, fields)?)
            }
            Hincrby => {
                let [key, field, increment] = args else {
                    return Ok(formatter::err_args("HINCRBY"));
                };
                let increment = parse_i64(increment)?;
                formatter::integer(sm.hincrby(staging, key, field, increment)?)
            }
            Hincrbyfloat => {
                let [key, field, increment] = args else {
                    return Ok(formatter::err_args("HINCRBYFLOAT"));
                };
                let increment = parse_f64(increment)?;
                let result = sm.hincrbyfloat(staging, key, field, increment)?;
                formatter::string(format!("{result}").as_bytes())
            }
            Hincrbymulti => {
                // Triplets of (key, field, increment), applied atomically;
                // returns the sum of all results. Arguments parse up front,
                // so a malformed triplet can't leave earlier increments
                // half-applied.
                if args.is_empty() || args.len() % 3 != 0 {
                    return Ok(formatter::err_args("HINCRBYMULTI"));
                }
                let mut triplets = Vec::with_capacity(args.len() / 3);
                for triplet in args.chunks(3) {
                    triplets.push((&triplet[0], &triplet[1], parse_i64(&triplet[2])?));
                }
                let mut total = 0_i64;
                for (key, field, increment) in triplets {
                    total += sm.hincrby(staging, key, field, increment)?;
                }
                formatter::integer(total)
            }
            Hclone => {
                let [source, target] = args else { return Ok(formatter::err_args("HCLONE")) };
                sm.hclone(staging, source, target)?;
                formatter::ok()
            }
            Sadd => {
                let Some((key, elements)) = args.split_first() else {
                    return Ok(formatter::err_args("SADD"));
                };
                if elements.is_empty() {
                    return Ok(formatter::err_args("SADD"));
                }
                formatter::integer(sm.sadd(staging, key, elements)?)
            }
            Srem => {
                let Some((key, elements)) = args.split_first() else {
                    return Ok(formatter::err_args("SREM"));
                };
                if elements.is_empty() {
                    return Ok(formatter::err_args("SREM"));
                }
                formatter::integer(sm.srem(staging, key, elements)?)
            }
            Smove => {
                let [source, destination, element] = args else {
                    return Ok(formatter::err_args("SMOVE"));
                };
                formatter::integer(sm.smove(staging, source, destination, element)? as i64)
            }
            Lpush | Rpush => {
                let Some((key, elements)) = args.split_first() else {
                    return Ok(formatter::err_args(&command_name(request)));
                };
                if elements.is_empty() {
                    return Ok(formatter::err_args(&command_name(request)));
                }
                let direction =
                    if command == Lpush { Direction::Front } else { Direction::Back };
                formatter::integer(sm.deque_push(staging, direction, key, elements)?)
            }
            Lpop | Rpop => {
                let [key] = args else {
                    return Ok(formatter::err_args(&command_name(request)));
                };
                let direction = if command == Lpop { Direction::Front } else { Direction::Back };
                formatter::opt_string(sm.deque_pop(staging, direction, key)?.as_deref())
            }
            Lhset => {
                let [key, field, hint, value] = args else {
                    return Ok(formatter::err_args("LHSET"));
                };
                formatter::integer(sm.lhset(staging, key, field, hint, value)? as i64)
            }
            Lhmset => {
                let Some((key, triplets)) = args.split_first() else {
                    return Ok(formatter::err_args("LHMSET"));
                };
                if triplets.is_empty() || triplets.len() % 3 != 0 {
                    return Ok(formatter::err_args("LHMSET"));
                }
                let triplets: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = triplets
                    .chunks(3)
                    .map(|t| (t[0].clone(), t[1].clone(), t[2].clone()))
                    .collect();
                sm.lhmset(staging, key, &triplets)?;
                formatter::ok()
            }
            Lhdel => {
                let Some((key, fields)) = args.split_first() else {
                    return Ok(formatter::err_args("LHDEL"));
                };
                if fields.is_empty() {
                    return Ok(formatter::err_args("LHDEL"));
                }
                formatter::integer(sm.lhdel(staging, key, fields)?)
            }
            DequeTrimFront => {
                let [key, max_to_keep] = args else {
                    return Ok(formatter::err_args("DEQUE-TRIM-FRONT"));
                };
                let max_to_keep = parse_i64(max_to_keep)?;
                if max_to_keep < 0 {
                    return Err(Error::InvalidInput(
                        "value is not an integer or out of range".to_string(),
                    ));
                }
                formatter::integer(sm.deque_trim_front(staging, key, max_to_keep)?)
            }
            ConfigSet => {
                let [name, value] = args else { return Ok(formatter::err_args("CONFIG_SET")) };
                sm.config_set(staging, name, value)?;
                formatter::ok()
            }
            LeaseAcquire => {
                // Client shape: key holder duration. The leader appends its
                // clock before journaling, so replicas apply the same time.
                let (args, timestamp) = split_lease_timestamp(args, 3);
                let [key, holder, duration] = args else {
                    return Ok(formatter::err_args("LEASE_ACQUIRE"));
                };
                let duration = parse_u64(duration)?;
                match sm.lease_acquire(staging, key, holder, timestamp, duration)? {
                    LeaseAcquisition::Acquired(_) => formatter::status("ACQUIRED"),
                    LeaseAcquisition::Renewed(_) => formatter::status("RENEWED"),
                    LeaseAcquisition::FailedDueToOtherOwner(info) => formatter::err(&format!(
                        "lease already held by '{}'",
                        String::from_utf8_lossy(&info.holder)
                    )),
                }
            }
            LeaseGet => {
                let (args, timestamp) = split_lease_timestamp(args, 1);
                let [key] = args else { return Ok(formatter::err_args("LEASE_GET")) };
                if timestamp != 0 {
                    sm.maybe_advance_clock(staging, timestamp)?;
                }
                match sm.lease_get(staging, key)? {
                    Some(info) => formatter::vector(&[
                        b"HOLDER".to_vec(),
                        info.holder,
                        b"DEADLINE".to_vec(),
                        info.expires.to_string().into_bytes(),
                    ]),
                    None => formatter::null(),
                }
            }
            LeaseRelease => {
                let (args, timestamp) = split_lease_timestamp(args, 1);
                let [key] = args else { return Ok(formatter::err_args("LEASE_RELEASE")) };
                if sm.lease_release(staging, key, timestamp)? {
                    formatter::ok()
                } else {
                    formatter::err("lease does not exist")
                }
            }
            _ => formatter::err(&format!(
                "internal dispatching error for '{}'",
                command_name(request)
            )),
        })
    }
}

/// Appends the leader's current clock to a lease command before it is
/// journaled, so every replica applies the same timestamp.
pub fn timestamp_lease_request(request: &mut RedisRequest, clock: ClockValue) {
    match Command::parse(request) {
        Some((Command::LeaseAcquire, _)) if request.len() == 4 => {
            request.push(clock.to_string().into_bytes())
        }
        Some((Command::LeaseGet | Command::LeaseRelease, _)) if request.len() == 2 => {
            request.push(clock.to_string().into_bytes())
        }
        _ => {}
    }
}

/// Extracts the timestamp a lease request was journaled with, if any.
fn lease_timestamp(request: &RedisRequest) -> Option<ClockValue> {
    match Command::parse(request) {
        Some((Command::LeaseAcquire, _)) if request.len() == 5 => parse_clock(&request[4]),
        Some((Command::LeaseGet | Command::LeaseRelease, _)) if request.len() == 3 => {
            parse_clock(&request[2])
        }
        _ => None,
    }
}

/// Splits the trailing timestamp off a lease command's arguments: with
/// base_args client arguments, a base_args + 1 shape carries the leader's
/// clock as its last token.
fn split_lease_timestamp(args: &[Vec<u8>], base_args: usize) -> (&[Vec<u8>], ClockValue) {
    if args.len() == base_args + 1 {
        if let Some(clock) = parse_clock(&args[base_args]) {
            return (&args[..base_args], clock);
        }
    }
    (args, 0)
}

fn parse_clock(token: &[u8]) -> Option<ClockValue> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn unknown_command(request: &RedisRequest) -> EncodedResponse {
    formatter::err(&format!("unknown command '{}'", command_name(request)))
}

fn parse_i64(token: &[u8]) -> Result<i64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidInput("value is not an integer or out of range".to_string()))
}

fn parse_u64(token: &[u8]) -> Result<u64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidInput("value is not an integer or out of range".to_string()))
}

fn parse_f64(token: &[u8]) -> Result<f64> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidInput("value is not a valid float".to_string()))
}

/// Parses cursored scan arguments: CURSOR [MATCH pattern] [COUNT n]. The
/// cursor is "0" for a fresh scan, or "next:<position>" as previously
/// returned; any other shape is rejected, preserving the cursor format
/// clients depend on.
fn parse_scan_args(
    args: &[Vec<u8>],
    with_match: bool,
) -> Result<Option<(Vec<u8>, Vec<u8>, usize)>> {
    let Some((cursor_token, mut rest)) = args.split_first() else {
        return Ok(None);
    };
    let cursor = decode_cursor(cursor_token)?;

    let mut pattern = b"*".to_vec();
    let mut count = DEFAULT_SCAN_COUNT;
    while !rest.is_empty() {
        let [option, value, tail @ ..] = rest else { return Ok(None) };
        match option.to_ascii_uppercase().as_slice() {
            b"MATCH" if with_match => pattern = value.clone(),
            b"COUNT" => {
                count = parse_i64(value)?
                    .try_into()
                    .map_err(|_| Error::InvalidInput("syntax error".to_string()))?;
                if count == 0 {
                    return Err(Error::InvalidInput("syntax error".to_string()));
                }
            }
            _ => return Err(Error::InvalidInput("syntax error".to_string())),
        }
        rest = tail;
    }
    Ok(Some((cursor, pattern, count)))
}

/// Decodes a scan cursor: "0" (or empty) starts from the beginning,
/// "next:<position>" resumes.
fn decode_cursor(token: &[u8]) -> Result<Vec<u8>> {
    if token.is_empty() || token == b"0" {
        return Ok(Vec::new());
    }
    token
        .strip_prefix(b"next:")
        .map(|position| position.to_vec())
        .ok_or_else(|| Error::InvalidInput("invalid cursor".to_string()))
}

/// Encodes the next cursor: "next:<position>", or "0" when the scan is
/// done.
fn encode_cursor(next: Option<Vec<u8>>) -> Vec<u8> {
    match next {
        Some(position) => {
            let mut cursor = b"next:".to_vec();
            cursor.extend_from_slice(&position);
            cursor
        }
        None => b"0".to_vec(),
    }
}

/// Groups a flat field/value list into pairs, or None if the length is odd.
fn chunk_pairs(tokens: &[Vec<u8>]) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
    if tokens.is_empty() || tokens.len() % 2 != 0 {
        return None;
    }
    Some(tokens.chunks(2).map(|pair| (pair[0].clone(), pair[1].clone())).collect())
}

/// Flattens pairs into the alternating array shape RESP clients expect.
fn flatten_pairs(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        out.push(field);
        out.push(value);
    }
    out
}
