// Store-and-forward relay for telemetry bound to the MQTT broker
// Entries are buffered as `topic|payload` lines in a durable log while the uplink is down
// and replayed in write order once the broker session comes back

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::links::MqttLink;
use crate::system_state::{ConnectivityCell, PendingQueue};

const ENTRY_SEPARATOR: char = '|';
const TMP_SUFFIX: &str = ".tmp";
const READ_BUFFER_SIZE: usize = 512;

/// Depth past which a backed-up relay queue is reported
pub const RELAY_QUEUE_WARN_DEPTH: usize = 64;

/// Byte budget of the volatile fallback log
pub const MEMORY_LOG_CAPACITY: usize = 16 * 1024;

/// Append-only sequence of text lines.
pub trait LineLog {
    fn append_line(&mut self, line: &str) -> io::Result<()>;
    /// Buffered reader over the stored bytes, oldest line first
    fn reader(&mut self) -> io::Result<Box<dyn BufRead + '_>>;
    fn truncate(&mut self) -> io::Result<()>;
    /// Drop the first `offset` bytes, keeping the rest in order
    fn discard_prefix(&mut self, offset: u64) -> io::Result<()>;
    /// Size in bytes of the stored lines, newlines included
    fn size(&mut self) -> io::Result<u64>;
}

impl<T: LineLog + ?Sized> LineLog for Box<T> {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        (**self).append_line(line)
    }

    fn reader(&mut self) -> io::Result<Box<dyn BufRead + '_>> {
        (**self).reader()
    }

    fn truncate(&mut self) -> io::Result<()> {
        (**self).truncate()
    }

    fn discard_prefix(&mut self, offset: u64) -> io::Result<()> {
        (**self).discard_prefix(offset)
    }

    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }
}

// Log file on the removable volume
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileLog {
    /// Open (or create) the log at `path`, finishing any rewrite a reset interrupted.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_path);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        // A leftover rewrite is complete only once the original is gone
        if tmp_path.exists() {
            if path.exists() {
                warn!("⚠️ Discarding stale relay rewrite {}", tmp_path.display());
                fs::remove_file(&tmp_path)?;
            } else {
                info!("🔧 Recovering relay log from {}", tmp_path.display());
                fs::rename(&tmp_path, &path)?;
            }
        }

        OpenOptions::new().create(true).append(true).open(&path)?;
        info!("📁 Relay log ready at {}", path.display());

        Ok(Self { path, tmp_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineLog for FileLog {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(format!("{}\n", line).as_bytes())?;
        file.flush()
    }

    fn reader(&mut self) -> io::Result<Box<dyn BufRead + '_>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(e) => Err(e),
        }
    }

    fn truncate(&mut self) -> io::Result<()> {
        File::create(&self.path)?;
        Ok(())
    }

    fn discard_prefix(&mut self, offset: u64) -> io::Result<()> {
        if offset == 0 {
            return Ok(());
        }

        {
            let mut source = File::open(&self.path)?;
            source.seek(SeekFrom::Start(offset))?;
            let mut source = BufReader::with_capacity(READ_BUFFER_SIZE, source);
            let mut tmp = File::create(&self.tmp_path)?;

            // Copy the tail one buffer at a time
            loop {
                let chunk = source.fill_buf()?;
                if chunk.is_empty() {
                    break;
                }
                tmp.write_all(chunk)?;
                let len = chunk.len();
                source.consume(len);
            }
            tmp.flush()?;
        }

        // FAT cannot rename over an existing file
        fs::remove_file(&self.path)?;
        fs::rename(&self.tmp_path, &self.path)
    }

    fn size(&mut self) -> io::Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Volatile log, used when no removable volume is mounted.
///
/// Holds at most `capacity` bytes; the oldest entries are evicted to make room.
#[derive(Debug)]
pub struct MemoryLog {
    buffer: Vec<u8>,
    capacity: usize,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LineLog for MemoryLog {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let needed = line.len() + 1;
        if needed > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry larger than the volatile log",
            ));
        }

        let mut evicted = 0;
        while self.buffer.len() + needed > self.capacity {
            let end = self
                .buffer
                .iter()
                .position(|&b| b == b'\n')
                .map_or(self.buffer.len(), |i| i + 1);
            self.buffer.drain(..end);
            evicted += 1;
        }
        if evicted > 0 {
            warn!("⚠️ Volatile relay log full, dropped {} oldest entries", evicted);
        }

        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.push(b'\n');
        Ok(())
    }

    fn reader(&mut self) -> io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(self.buffer.as_slice()))
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn discard_prefix(&mut self, offset: u64) -> io::Result<()> {
        let end = usize::try_from(offset).map_or(self.buffer.len(), |o| o.min(self.buffer.len()));
        self.buffer.drain(..end);
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.buffer.len() as u64)
    }
}

/// How a published entry left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every entry was handed to the uplink and the log is empty
    Completed { forwarded: usize },
    /// Uplink dropped or rejected an entry; `remaining_bytes` of the log stay queued
    Interrupted {
        forwarded: usize,
        remaining_bytes: u64,
    },
}

/// Durable FIFO in front of the MQTT uplink.
pub struct RelayQueue<G: LineLog, M: MqttLink> {
    log: G,
    uplink: Arc<M>,
    connectivity: ConnectivityCell,
}

impl<G: LineLog, M: MqttLink> RelayQueue<G, M> {
    pub fn new(log: G, uplink: Arc<M>, connectivity: ConnectivityCell) -> Self {
        Self {
            log,
            uplink,
            connectivity,
        }
    }

    /// Forward now if the broker session is live and nothing is queued ahead,
    /// otherwise append to the log.
    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<Delivery, RelayError> {
        validate_entry(topic, payload)?;

        if self.connectivity.is_uplink_ready() && self.is_empty()? {
            match self.uplink.publish(topic, payload) {
                Ok(()) => {
                    debug!("📤 Published {} = {}", topic, payload);
                    return Ok(Delivery::Sent);
                }
                Err(e) => warn!("⚠️ Direct publish to {} failed, buffering: {}", topic, e),
            }
        }

        self.log
            .append_line(&format!("{}{}{}", topic, ENTRY_SEPARATOR, payload))?;
        debug!("💾 Buffered {} = {}", topic, payload);
        Ok(Delivery::Buffered)
    }

    /// Replay the log in write order, one line at a time.
    ///
    /// Connectivity is checked before every entry. On interruption the forwarded
    /// prefix is dropped and the rest stays queued for the next drain. Lines that
    /// are not valid `topic|payload` text are skipped.
    pub async fn drain(&mut self) -> Result<DrainOutcome, RelayError> {
        let backlog = self.backlog_bytes()?;
        if backlog == 0 {
            return Ok(DrainOutcome::Completed { forwarded: 0 });
        }

        info!("📦 Draining {} bytes of buffered relay entries", backlog);
        let mut forwarded = 0;
        let mut consumed: u64 = 0;
        let mut line = Vec::new();

        let interrupted = {
            let mut reader = self.log.reader()?;
            loop {
                line.clear();
                let read = reader.read_until(b'\n', &mut line)?;
                if read == 0 {
                    break false;
                }

                if !self.connectivity.is_uplink_ready() {
                    warn!("⚠️ Uplink lost during drain");
                    break true;
                }

                match parse_entry(&line) {
                    Some((topic, payload)) => {
                        if let Err(e) = self.uplink.publish(topic, payload) {
                            warn!("⚠️ Publish of buffered entry failed: {}", e);
                            break true;
                        }
                        forwarded += 1;
                    }
                    None => warn!(
                        "⚠️ Skipping malformed relay entry: {:?}",
                        String::from_utf8_lossy(&line)
                    ),
                }

                consumed += read as u64;
                embassy_futures::yield_now().await;
            }
        };

        if interrupted {
            self.log.discard_prefix(consumed)?;
            let remaining_bytes = self.backlog_bytes()?;
            info!(
                "⏸️ Drain interrupted after {} entries, {} bytes still queued",
                forwarded, remaining_bytes
            );
            return Ok(DrainOutcome::Interrupted {
                forwarded,
                remaining_bytes,
            });
        }

        self.log.truncate()?;
        info!("✅ Relay drained, {} entries forwarded", forwarded);
        Ok(DrainOutcome::Completed { forwarded })
    }

    pub fn backlog_bytes(&mut self) -> Result<u64, RelayError> {
        Ok(self.log.size()?)
    }

    pub fn is_empty(&mut self) -> Result<bool, RelayError> {
        Ok(self.backlog_bytes()? == 0)
    }
}

// Split a stored line into topic and payload
fn parse_entry(line: &[u8]) -> Option<(&str, &str)> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    std::str::from_utf8(line).ok()?.split_once(ENTRY_SEPARATOR)
}

fn validate_entry(topic: &str, payload: &str) -> Result<(), RelayError> {
    if topic.is_empty() || topic.contains(ENTRY_SEPARATOR) || topic.contains('\n') {
        return Err(RelayError::InvalidEntry(format!("bad topic {:?}", topic)));
    }
    if payload.contains('\n') {
        return Err(RelayError::InvalidEntry(format!(
            "payload for {} contains a newline",
            topic
        )));
    }
    Ok(())
}

// Requests handled by the relay task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    Publish { topic: String, payload: String },
    Drain,
}

// Queue into the relay task, safe to use from callback context
// Commands are never dropped; the relay task moves them to the durable log
#[derive(Clone, Default)]
pub struct RelayBus {
    queue: Arc<PendingQueue<RelayCommand>>,
}

impl RelayBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<String>) {
        let depth = self.queue.push(RelayCommand::Publish {
            topic: topic.into(),
            payload: payload.into(),
        });
        if depth == RELAY_QUEUE_WARN_DEPTH {
            warn!("⚠️ Relay queue backed up ({} pending)", depth);
        }
    }

    /// One pending drain covers every request made before it runs
    pub fn request_drain(&self) {
        self.queue
            .push_unless(RelayCommand::Drain, |pending| *pending == RelayCommand::Drain);
    }

    pub async fn receive(&self) -> RelayCommand {
        self.queue.pop().await
    }

    pub fn try_receive(&self) -> Option<RelayCommand> {
        self.queue.try_pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Last observed log size, readable outside the relay task
#[derive(Clone, Debug, Default)]
pub struct BacklogGauge(Arc<AtomicU64>);

impl BacklogGauge {
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn update(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

// Single owner of the relay queue; appends and drains never overlap
pub struct RelayService<G: LineLog, M: MqttLink> {
    queue: RelayQueue<G, M>,
    bus: RelayBus,
    gauge: BacklogGauge,
}

impl<G: LineLog, M: MqttLink> RelayService<G, M> {
    pub fn new(queue: RelayQueue<G, M>, bus: RelayBus) -> Self {
        let mut service = Self {
            queue,
            bus,
            gauge: BacklogGauge::default(),
        };
        service.refresh_gauge();
        service
    }

    pub fn bus(&self) -> RelayBus {
        self.bus.clone()
    }

    pub fn gauge(&self) -> BacklogGauge {
        self.gauge.clone()
    }

    pub fn queue_mut(&mut self) -> &mut RelayQueue<G, M> {
        &mut self.queue
    }

    pub async fn process(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Publish { topic, payload } => {
                match self.queue.publish(&topic, &payload) {
                    // Uplink came up with a backlog ahead of this entry
                    Ok(Delivery::Buffered) if self.queue.connectivity.is_uplink_ready() => {
                        self.drain().await
                    }
                    Ok(_) => {}
                    Err(e) => error!("❌ Failed to relay {}: {}", topic, e),
                }
            }
            RelayCommand::Drain => self.drain().await,
        }
        self.refresh_gauge();
    }

    /// Handle every queued command without waiting. Returns how many were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(command) = self.bus.try_receive() {
            self.process(command).await;
            handled += 1;
        }
        handled
    }

    /// Never returns
    pub async fn run(&mut self) {
        info!("🚀 Relay service started");
        loop {
            let command = self.bus.receive().await;
            self.process(command).await;
        }
    }

    async fn drain(&mut self) {
        if let Err(e) = self.queue.drain().await {
            error!("❌ Relay drain failed: {}", e);
        }
    }

    fn refresh_gauge(&mut self) {
        match self.queue.backlog_bytes() {
            Ok(bytes) => self.gauge.update(bytes),
            Err(e) => warn!("⚠️ Could not read relay log size: {}", e),
        }
    }
}

#[derive(Debug)]
pub enum RelayError {
    Log(io::Error),
    InvalidEntry(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Log(e) => write!(f, "relay log error: {}", e),
            RelayError::InvalidEntry(msg) => write!(f, "invalid relay entry: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Log(e) => Some(e),
            RelayError::InvalidEntry(_) => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Log(e)
    }
}
