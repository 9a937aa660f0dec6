use crate::error::{Error, Result};
use crate::raft::{
    ContactDetails, FsyncPolicy, FsyncThread, HeartbeatTracker, RaftCommitTracker, RaftDirector,
    RaftDispatcher, RaftJournal, RaftLease, RaftReplicator, RaftServer, RaftState, RaftTalker,
    RaftTrimmer, ResilveringTrigger, Timeouts, TrimConfig,
};
use crate::redis::dispatcher::timestamp_lease_request;
use crate::redis::resp::Reply;
use crate::redis::{
    formatter, Command, CommandKind, Connection, EncodedResponse, RedisDispatcher, RedisRequest,
    Transaction,
};
use crate::statemachine::StateMachine;
use crate::storage::{BitCask, Engine, Memory};

use log::{error, info, warn};
use rand::Rng as _;
use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Compact a bitcask engine on open when at least 20% (and 1 MB) of it is
/// garbage.
const COMPACT_FRACTION: f64 = 0.2;
const COMPACT_MIN_BYTES: u64 = 1024 * 1024;

/// Which storage engine backs the shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    Bitcask,
    Memory,
}

impl EngineKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "bitcask" | "" => Ok(EngineKind::Bitcask),
            "memory" => Ok(EngineKind::Memory),
            other => Err(Error::InvalidInput(format!("invalid storage engine {other}"))),
        }
    }

    fn open(&self, path: PathBuf) -> Result<Box<dyn Engine>> {
        match self {
            EngineKind::Bitcask => {
                Ok(Box::new(BitCask::new_compact(path, COMPACT_FRACTION, COMPACT_MIN_BYTES)?))
            }
            EngineKind::Memory => Ok(Box::new(Memory::new())),
        }
    }
}

/// The shard's operating mode and identity.
#[derive(Clone, Debug)]
pub enum ShardMode {
    /// Replicated through Raft as part of a cluster.
    Raft {
        myself: RaftServer,
        nodes: Vec<RaftServer>,
        cluster_id: String,
        timeouts: Timeouts,
        trim: TrimConfig,
    },
    /// A single standalone node; writes apply directly.
    Standalone,
}

/// Shard construction parameters.
#[derive(Clone, Debug)]
pub struct ShardConfig {
    pub base_dir: PathBuf,
    pub engine: EngineKind,
    pub mode: ShardMode,
    pub bulkload: bool,
}

/// The on-disk layout of a shard: a `current` symlink selecting the active
/// generation, each generation holding the `state-machine/` and
/// `raft-journal/` engine directories, plus a `resilvering-history` file
/// recording every full state transfer.
pub struct ShardDirectory {
    base: PathBuf,
}

impl ShardDirectory {
    pub fn new(base: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base)?;
        let directory = Self { base };
        if !directory.current_link().exists() {
            let generation = directory.base.join("generation-0");
            fs::create_dir_all(&generation)?;
            directory.point_current_at("generation-0")?;
        }
        Ok(directory)
    }

    fn current_link(&self) -> PathBuf {
        self.base.join("current")
    }

    /// The active generation directory.
    pub fn current(&self) -> Result<PathBuf> {
        Ok(fs::canonicalize(self.current_link())?)
    }

    pub fn state_machine_path(&self) -> Result<PathBuf> {
        Ok(self.current()?.join("state-machine").join("bitcask"))
    }

    pub fn journal_path(&self) -> Result<PathBuf> {
        Ok(self.current()?.join("raft-journal").join("bitcask"))
    }

    /// Atomically repoints `current` at another generation.
    fn point_current_at(&self, generation: &str) -> Result<()> {
        let tmp = self.base.join("current.tmp");
        let _ = fs::remove_file(&tmp);
        std::os::unix::fs::symlink(self.base.join(generation), &tmp)?;
        fs::rename(&tmp, self.current_link())?;
        Ok(())
    }

    fn staging_dir(&self, id: &str) -> PathBuf {
        self.base.join(format!("resilvering-{id}"))
    }

    /// Begins receiving a full state transfer into a fresh staging
    /// generation.
    pub fn resilvering_start(&self, id: &str) -> Result<()> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        self.append_history(id, "START")?;
        Ok(())
    }

    /// Stores one file of an incoming state transfer. The name is a path
    /// relative to the generation root; anything trying to escape it is
    /// rejected.
    pub fn resilvering_copy_file(&self, id: &str, name: &str, contents: &[u8]) -> Result<()> {
        let staging = self.staging_dir(id);
        if !staging.exists() {
            return Err(Error::InvalidInput(format!("no resilvering in progress with id {id}")));
        }
        if name.starts_with('/') || name.split('/').any(|part| part == "..") {
            return Err(Error::InvalidInput(format!("invalid resilvering file name {name}")));
        }
        let path = staging.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Promotes the staged generation to current. The caller must have
    /// closed the engines first.
    pub fn resilvering_promote(&self, id: &str) -> Result<()> {
        if !self.staging_dir(id).exists() {
            return Err(Error::InvalidInput(format!("no resilvering in progress with id {id}")));
        }
        self.point_current_at(&format!("resilvering-{id}"))?;
        self.append_history(id, "FINISH")?;
        Ok(())
    }

    pub fn resilvering_cancel(&self, id: &str) -> Result<()> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        self.append_history(id, "CANCEL")?;
        Ok(())
    }

    fn append_history(&self, id: &str, event: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base.join("resilvering-history"))?;
        writeln!(file, "{id} {event}")?;
        Ok(())
    }
}

/// Counts requests currently being serviced. During a resilvering swap the
/// shard stops accepting and spins until the count drains to zero.
#[derive(Default)]
pub struct InFlightTracker {
    accepting: AtomicBool,
    in_flight: AtomicI64,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self { accepting: AtomicBool::new(true), in_flight: AtomicI64::new(0) }
    }

    /// Registers a request, or refuses it if the shard is detached.
    pub fn up(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(InFlightGuard { tracker: self })
    }

    /// Stops accepting requests and waits for in-flight ones to drain.
    pub fn detach(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    pub fn reattach(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }
}

pub struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The active consensus group of a raft-mode shard.
pub struct RaftGroup {
    pub journal: Arc<RaftJournal>,
    pub state: Arc<RaftState>,
    pub sm: Arc<StateMachine>,
    pub dispatcher: Arc<RaftDispatcher>,
    write_tracker: Arc<crate::raft::RaftWriteTracker>,
    director: RaftDirector,
    _fsync: FsyncThread,
}

impl RaftGroup {
    #[allow(clippy::too_many_arguments)]
    fn start(
        directory: &ShardDirectory,
        engine: EngineKind,
        myself: RaftServer,
        nodes: Vec<RaftServer>,
        cluster_id: String,
        timeouts: Timeouts,
        trim: TrimConfig,
        bulkload: bool,
        resilvering: Arc<dyn ResilveringTrigger>,
    ) -> Result<Self> {
        let journal_engine = engine.open(directory.journal_path()?)?;
        let journal = {
            let mut probe = journal_engine;
            if probe.get(b"__cluster-id")?.is_none() {
                info!("Initializing fresh raft journal for cluster {cluster_id}");
                Arc::new(RaftJournal::initialize(
                    probe,
                    cluster_id.clone(),
                    nodes,
                    0,
                    FsyncPolicy::SyncImportantUpdates,
                )?)
            } else {
                Arc::new(RaftJournal::open(probe)?)
            }
        };
        let sm = Arc::new(StateMachine::open(
            engine.open(directory.state_machine_path()?)?,
            bulkload,
        )?);

        let contact = ContactDetails::new(cluster_id, timeouts.clone());
        let state = Arc::new(RaftState::new(journal.clone(), myself));
        let lease = Arc::new(RaftLease::new(timeouts.low));
        let commit_tracker = Arc::new(RaftCommitTracker::new(journal.clone()));
        let trimmer = Arc::new(RaftTrimmer::new(journal.clone()));
        let heartbeat_tracker = Arc::new(HeartbeatTracker::new(timeouts));
        let redis = Arc::new(RedisDispatcher::new(sm.clone()));

        let write_tracker =
            crate::raft::RaftWriteTracker::new(journal.clone(), redis.clone(), commit_tracker.clone());
        let replicator = Arc::new(RaftReplicator::new(
            journal.clone(),
            state.clone(),
            lease.clone(),
            commit_tracker.clone(),
            trimmer.clone(),
            contact.clone(),
            resilvering,
        ));
        let dispatcher = Arc::new(RaftDispatcher::new(
            journal.clone(),
            state.clone(),
            sm.clone(),
            redis,
            write_tracker.clone(),
            replicator.clone(),
            heartbeat_tracker.clone(),
            contact.clone(),
        ));
        let director = RaftDirector::spawn(
            journal.clone(),
            state.clone(),
            replicator,
            write_tracker.clone(),
            heartbeat_tracker,
            lease,
            trimmer,
            trim,
            contact,
        );
        let fsync = FsyncThread::spawn(journal.clone(), Duration::from_secs(1));

        Ok(Self {
            journal,
            state,
            sm,
            dispatcher,
            write_tracker,
            director,
            _fsync: fsync,
        })
    }

    fn stop(self) {
        self.director.shutdown();
        self.write_tracker.shutdown();
    }
}

/// The active group of a standalone shard: just the state machine and the
/// redis dispatcher, with writes applied out-of-band.
pub struct StandaloneGroup {
    pub sm: Arc<StateMachine>,
    pub redis: Arc<RedisDispatcher>,
}

impl StandaloneGroup {
    fn start(directory: &ShardDirectory, engine: EngineKind, bulkload: bool) -> Result<Self> {
        let sm = Arc::new(StateMachine::open(
            engine.open(directory.state_machine_path()?)?,
            bulkload,
        )?);
        let redis = Arc::new(RedisDispatcher::new(sm.clone()));
        Ok(Self { sm, redis })
    }
}

pub enum ShardGroup {
    Raft(RaftGroup),
    Standalone(StandaloneGroup),
}

/// A shard: the shard directory plus its active consensus group, with the
/// detach machinery used by resilvering.
pub struct Shard {
    config: ShardConfig,
    directory: ShardDirectory,
    group: RwLock<Option<ShardGroup>>,
    in_flight: InFlightTracker,
    incoming_resilvering: Mutex<Option<String>>,
}

impl Shard {
    pub fn start(config: ShardConfig) -> Result<Arc<Self>> {
        let directory = ShardDirectory::new(config.base_dir.clone())?;
        let shard = Arc::new(Self {
            config,
            directory,
            group: RwLock::new(None),
            in_flight: InFlightTracker::new(),
            incoming_resilvering: Mutex::new(None),
        });
        shard.attach()?;
        Ok(shard)
    }

    /// Builds and attaches the active group from the current generation.
    fn attach(self: &Arc<Self>) -> Result<()> {
        let group = match &self.config.mode {
            ShardMode::Raft { myself, nodes, cluster_id, timeouts, trim } => {
                let trigger = Arc::new(LeaderResilvering::new(
                    self.directory.base.clone(),
                    ContactDetails::new(cluster_id.clone(), timeouts.clone()),
                ));
                let group = RaftGroup::start(
                    &self.directory,
                    self.config.engine,
                    myself.clone(),
                    nodes.clone(),
                    cluster_id.clone(),
                    timeouts.clone(),
                    *trim,
                    self.config.bulkload,
                    trigger.clone(),
                )?;
                trigger.bind(group.journal.clone(), group.sm.clone());
                ShardGroup::Raft(group)
            }
            ShardMode::Standalone => ShardGroup::Standalone(StandaloneGroup::start(
                &self.directory,
                self.config.engine,
                self.config.bulkload,
            )?),
        };
        *self.group.write().expect("lock poisoned") = Some(group);
        self.in_flight.reattach();
        Ok(())
    }

    /// Services a data or raft command.
    pub fn dispatch(&self, conn: &Connection, command: Command, kind: CommandKind, request: RedisRequest) {
        let Some(_guard) = self.in_flight.up() else {
            conn.queue.append_response(formatter::unavailable());
            return;
        };
        let group = self.group.read().expect("lock poisoned");
        match &*group {
            Some(ShardGroup::Raft(group)) => match kind {
                CommandKind::Read => group.dispatcher.service_read(conn, request),
                CommandKind::Write => group.dispatcher.service_write(conn, request),
                CommandKind::Raft => {
                    let response = group.dispatcher.service_raft(conn, command, &request);
                    conn.queue.append_response(response);
                }
                _ => conn.queue.append_response(formatter::err("internal dispatching error")),
            },
            Some(ShardGroup::Standalone(group)) => match kind {
                CommandKind::Read => {
                    conn.queue.append_response(group.redis.dispatch_read(&request))
                }
                CommandKind::Write => {
                    let mut request = request;
                    timestamp_lease_request(&mut request, group.sm.dynamic_clock());
                    let tx = Transaction::single(request);
                    let responses = group.redis.apply(&tx, 0);
                    conn.queue.append_response(EncodedResponse::concat(responses));
                }
                CommandKind::Raft => conn
                    .queue
                    .append_response(formatter::err("raft not enabled, running in standalone mode")),
                _ => conn.queue.append_response(formatter::err("internal dispatching error")),
            },
            None => conn.queue.append_response(formatter::unavailable()),
        }
    }

    /// Runs a closure against the active state machine.
    pub fn with_state_machine<T>(
        &self,
        f: impl FnOnce(&Arc<StateMachine>) -> Result<T>,
    ) -> Result<T> {
        let group = self.group.read().expect("lock poisoned");
        match &*group {
            Some(ShardGroup::Raft(group)) => f(&group.sm),
            Some(ShardGroup::Standalone(group)) => f(&group.sm),
            None => Err(Error::Unavailable),
        }
    }

    /// Creates a checkpoint of all engines under the given path.
    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        let group = self.group.read().expect("lock poisoned");
        match &*group {
            Some(ShardGroup::Raft(group)) => {
                group.sm.checkpoint(&path.join("state-machine"))?;
                group.journal.checkpoint(&path.join("raft-journal"))?;
                Ok(())
            }
            Some(ShardGroup::Standalone(group)) => {
                group.sm.checkpoint(&path.join("state-machine"))
            }
            None => Err(Error::Unavailable),
        }
    }

    /// Triggers manual compaction of all engines.
    pub fn manual_compaction(&self) -> Result<()> {
        let group = self.group.read().expect("lock poisoned");
        match &*group {
            Some(ShardGroup::Raft(group)) => {
                group.sm.manual_compaction()?;
                group.journal.manual_compaction()
            }
            Some(ShardGroup::Standalone(group)) => group.sm.manual_compaction(),
            None => Err(Error::Unavailable),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.config.mode {
            ShardMode::Raft { .. } => "raft",
            ShardMode::Standalone => "standalone",
        }
    }

    // ----- Incoming resilvering ----------------------------------------------

    pub fn resilvering_start(&self, id: &str) -> Result<()> {
        info!("Starting resilvering {id}: incoming full state transfer");
        let mut incoming = self.incoming_resilvering.lock()?;
        self.directory.resilvering_start(id)?;
        *incoming = Some(id.to_string());
        Ok(())
    }

    pub fn resilvering_copy_file(&self, id: &str, name: &str, contents: &[u8]) -> Result<()> {
        self.check_incoming(id)?;
        self.directory.resilvering_copy_file(id, name, contents)
    }

    /// Completes an incoming state transfer: detaches the shard, closes the
    /// engines, swaps generations, and reopens.
    pub fn resilvering_finish(self: &Arc<Self>, id: &str) -> Result<()> {
        self.check_incoming(id)?;
        info!("Finishing resilvering {id}: swapping in the new shard state");

        self.in_flight.detach();
        let old = self.group.write().expect("lock poisoned").take();
        match old {
            Some(ShardGroup::Raft(group)) => group.stop(),
            Some(ShardGroup::Standalone(_)) | None => {}
        }

        let result = self.directory.resilvering_promote(id).and_then(|()| self.attach());
        if let Err(err) = &result {
            error!("Failed to swap in resilvered state: {err}");
        }
        *self.incoming_resilvering.lock()? = None;
        result
    }

    pub fn resilvering_cancel(&self, id: &str) -> Result<()> {
        warn!("Cancelling resilvering {id}");
        self.check_incoming(id)?;
        *self.incoming_resilvering.lock()? = None;
        self.directory.resilvering_cancel(id)
    }

    fn check_incoming(&self, id: &str) -> Result<()> {
        match self.incoming_resilvering.lock()?.as_deref() {
            Some(active) if active == id => Ok(()),
            _ => Err(Error::InvalidInput(format!("no resilvering in progress with id {id}"))),
        }
    }
}

/// The leader side of resilvering: checkpoints the engines and pushes the
/// files to the fallen-behind target over its Redis port.
pub struct LeaderResilvering {
    base: PathBuf,
    contact: ContactDetails,
    journal: Mutex<Option<Arc<RaftJournal>>>,
    sm: Mutex<Option<Arc<StateMachine>>>,
    active: Arc<Mutex<HashSet<RaftServer>>>,
}

impl LeaderResilvering {
    fn new(base: PathBuf, contact: ContactDetails) -> Self {
        Self {
            base,
            contact,
            journal: Mutex::new(None),
            sm: Mutex::new(None),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn bind(&self, journal: Arc<RaftJournal>, sm: Arc<StateMachine>) {
        *self.journal.lock().expect("lock poisoned") = Some(journal);
        *self.sm.lock().expect("lock poisoned") = Some(sm);
    }

    fn run(
        journal: Arc<RaftJournal>,
        sm: Arc<StateMachine>,
        contact: ContactDetails,
        target: RaftServer,
        scratch: PathBuf,
    ) -> Result<()> {
        let id = hex::encode(rand::thread_rng().gen::<[u8; 8]>());
        info!("Resilvering {target}: transfer id {id}");

        let checkpoint = scratch.join(format!("resilvering-checkpoint-{id}"));
        sm.checkpoint(&checkpoint.join("state-machine"))?;
        journal.checkpoint(&checkpoint.join("raft-journal"))?;

        let result = Self::push_checkpoint(&checkpoint, &contact, &target, &id);
        let _ = fs::remove_dir_all(&checkpoint);
        result
    }

    fn push_checkpoint(
        checkpoint: &Path,
        contact: &ContactDetails,
        target: &RaftServer,
        id: &str,
    ) -> Result<()> {
        // File pushes can be large; allow them a generous deadline.
        let timeout = Duration::from_secs(60);
        let talker = RaftTalker::new(target.clone(), contact.clone());

        let start: RedisRequest =
            vec![b"QUARKDB_START_RESILVERING".to_vec(), id.as_bytes().to_vec()];
        expect_ok(&talker.custom(&start, timeout)?)?;

        for entry in walk_files(checkpoint)? {
            let relative = entry
                .strip_prefix(checkpoint)
                .map_err(|_| Error::IO("checkpoint path confusion".to_string()))?
                .to_string_lossy()
                .to_string();
            let contents = fs::read(&entry)?;
            let copy: RedisRequest = vec![
                b"QUARKDB_RESILVERING_COPY_FILE".to_vec(),
                id.as_bytes().to_vec(),
                relative.into_bytes(),
                contents,
            ];
            expect_ok(&talker.custom(&copy, timeout)?)?;
        }

        let finish: RedisRequest =
            vec![b"QUARKDB_FINISH_RESILVERING".to_vec(), id.as_bytes().to_vec()];
        expect_ok(&talker.custom(&finish, timeout)?)?;
        info!("Resilvering of {target} complete");
        Ok(())
    }
}

impl ResilveringTrigger for LeaderResilvering {
    fn trigger_resilvering(&self, target: &RaftServer) {
        let (journal, sm) = {
            let journal = self.journal.lock().expect("lock poisoned").clone();
            let sm = self.sm.lock().expect("lock poisoned").clone();
            match (journal, sm) {
                (Some(journal), Some(sm)) => (journal, sm),
                _ => return,
            }
        };
        {
            let mut active = self.active.lock().expect("lock poisoned");
            if !active.insert(target.clone()) {
                return; // already resilvering this target
            }
        }

        let contact = self.contact.clone();
        let target = target.clone();
        let scratch = self.base.clone();
        let active = self.active.clone();
        // The tracker must not block; run the transfer on its own thread.
        std::thread::Builder::new()
            .name(format!("resilverer-{target}"))
            .spawn(move || {
                if let Err(err) = Self::run(journal, sm, contact, target.clone(), scratch) {
                    error!("Resilvering of {target} failed: {err}");
                }
                active.lock().expect("lock poisoned").remove(&target);
            })
            .ok();
    }
}

/// Recursively lists all files under a directory.
fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn expect_ok(reply: &Reply) -> Result<()> {
    match reply {
        Reply::Status(_) => Ok(()),
        other => Err(Error::IO(format!("resilvering command failed: {other:?}"))),
    }
}
