//! The write engine.
//!
//! Executes a [`WritePlan`] against a device on a dedicated background
//! thread: streams regions in bounded chunks, applies boot patches, drives
//! verification, and reports progress over a channel. The engine owns the
//! session state machine and the cancellation and error-reporting contract:
//!
//! - progress events carry monotonically non-decreasing `bytes_written`
//!   (strictly increasing while writing);
//! - exactly one [`Event::Finished`] is delivered per session, always last;
//! - cancellation is cooperative and takes effect at chunk boundaries, never
//!   mid-chunk;
//! - after `Cancelled` or a failure the device content is undefined/partial;
//!   no rollback is attempted and the device must be treated as unbootable
//!   until a new full write succeeds.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::catalog::DeviceCatalog;
use crate::device::BlockTarget;
use crate::error::EngineError;
use crate::plan::{Region, SourceKind, WritePlan};
use crate::verify;

/// Default streaming chunk size. Internal tuning, not part of the contract.
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// States of one write session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Writing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// All regions written and verified.
    Completed,
    /// Cancelled by the caller; device content is undefined/partial.
    Cancelled,
    /// Terminated by an error; device content is undefined/partial.
    Failed(EngineError),
}

/// Notifications delivered over a session's event channel.
#[derive(Clone, Debug)]
pub enum Event {
    Progress {
        /// `floor(100 * bytes_written / total_planned_bytes)`.
        percentage: u8,
        bytes_written: u64,
        /// Human-readable stage message.
        message: String,
    },
    /// Terminal notification; delivered exactly once, always last.
    Finished(Outcome),
}

/// Handle to a running session.
pub struct SessionHandle {
    events: Receiver<Event>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<Outcome>>,
}

impl SessionHandle {
    /// The session's notification stream.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Requests cooperative cancellation. The session finishes its in-flight
    /// chunk, then ends with [`Outcome::Cancelled`]. Safe to call more than
    /// once and at any time.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Blocks until the session reaches a terminal state and returns it.
    pub fn wait(mut self) -> Outcome {
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Outcome::Failed(EngineError::Io {
                    offset: 0,
                    message: "session thread panicked".into(),
                })
            }),
            None => Outcome::Failed(EngineError::Cancelled),
        }
    }
}

/// Process-wide exclusivity registry, keyed by device id. A session holds
/// its entry from `execute()` until its terminal transition; the RAII guard
/// guarantees release on every exit path.
static LOCK_TABLE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

struct DeviceLock {
    key: String,
}

impl DeviceLock {
    fn acquire(key: &str) -> Option<DeviceLock> {
        let table = LOCK_TABLE.get_or_init(|| Mutex::new(HashSet::new()));
        let mut held = table.lock().expect("lock table poisoned");
        if !held.insert(key.to_string()) {
            return None;
        }
        log::debug!("acquired device lock for {key}");
        Some(DeviceLock {
            key: key.to_string(),
        })
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Some(table) = LOCK_TABLE.get() {
            if let Ok(mut held) = table.lock() {
                held.remove(&self.key);
            }
        }
        log::debug!("released device lock for {}", self.key);
    }
}

/// Executes [`WritePlan`]s. Cheap to construct; one engine can run any
/// number of sessions, at most one per device at a time.
pub struct WriteEngine {
    catalog: Arc<dyn DeviceCatalog>,
    chunk_size: usize,
}

impl WriteEngine {
    pub fn new(catalog: Arc<dyn DeviceCatalog>) -> Self {
        WriteEngine {
            catalog,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Overrides the streaming chunk size. Tuning only; observable behavior
    /// is unchanged apart from progress granularity.
    pub fn with_chunk_size(catalog: Arc<dyn DeviceCatalog>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        WriteEngine {
            catalog,
            chunk_size,
        }
    }

    /// Starts a session for `plan` on a background thread.
    ///
    /// The exclusivity lock for the target device is taken here, on the
    /// caller's thread, so a busy device is observed synchronously as
    /// `Err(DeviceBusy)` and no session is created for it.
    pub fn execute(&self, plan: WritePlan) -> Result<SessionHandle, EngineError> {
        let lock = DeviceLock::acquire(plan.target_device_id().as_str())
            .ok_or(EngineError::DeviceBusy)?;

        let (tx, rx) = channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let catalog = Arc::clone(&self.catalog);
        let chunk_size = self.chunk_size;
        let cancel_flag = Arc::clone(&cancel);

        let thread = std::thread::Builder::new()
            .name("ignis-write".into())
            .spawn(move || {
                // The lock lives exactly as long as the session; dropping it
                // here covers every terminal path, including panics.
                let _lock = lock;
                let mut session = Session::new(&plan, tx, cancel_flag);
                let outcome = run_session(&*catalog, &plan, chunk_size, &mut session);
                session.finish(outcome.clone());
                outcome
            })
            .map_err(|e| EngineError::Io {
                offset: 0,
                message: format!("cannot spawn session thread: {e}"),
            })?;

        Ok(SessionHandle {
            events: rx,
            cancel,
            thread: Some(thread),
        })
    }
}

/// Mutable state for one execution of a plan. Owned by the session thread
/// and discarded after the terminal event is delivered.
struct Session {
    state: SessionState,
    bytes_written: u64,
    current_region: usize,
    total_planned_bytes: u64,
    last_error: Option<EngineError>,
    cancel: Arc<AtomicBool>,
    tx: Sender<Event>,
}

impl Session {
    fn new(plan: &WritePlan, tx: Sender<Event>, cancel: Arc<AtomicBool>) -> Session {
        Session {
            state: SessionState::Preparing,
            bytes_written: 0,
            current_region: 0,
            total_planned_bytes: plan.total_planned_bytes(),
            last_error: None,
            cancel,
            tx,
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn progress(&self, message: &str) {
        let percentage = if self.total_planned_bytes == 0 {
            100
        } else {
            (self.bytes_written * 100 / self.total_planned_bytes) as u8
        };
        // A send can only fail if the caller dropped the handle; the session
        // still runs to completion, it just has no audience.
        let _ = self.tx.send(Event::Progress {
            percentage,
            bytes_written: self.bytes_written,
            message: message.to_string(),
        });
    }

    fn fail(&mut self, error: EngineError) -> Outcome {
        self.last_error = Some(error.clone());
        self.transition(SessionState::Failed);
        Outcome::Failed(error)
    }

    fn cancelled(&mut self) -> Outcome {
        self.transition(SessionState::Cancelled);
        Outcome::Cancelled
    }

    fn finish(&mut self, outcome: Outcome) {
        let _ = self.tx.send(Event::Finished(outcome));
    }
}

fn stage_message(kind: &SourceKind) -> &'static str {
    match kind {
        SourceKind::RawImageCopy { .. } => "Writing image data...",
        SourceKind::PersistencePartition => "Preparing persistence storage...",
        SourceKind::ZeroFill => "Clearing partition gap...",
        SourceKind::BootPatch { .. } => "Applying boot patches...",
    }
}

fn run_session(
    catalog: &dyn DeviceCatalog,
    plan: &WritePlan,
    chunk_size: usize,
    session: &mut Session,
) -> Outcome {
    // Preparing: re-validate the device against the descriptor the plan was
    // built from. Enumeration happened an arbitrary time ago; the stick may
    // have been swapped since.
    session.progress("Preparing drive and validating target...");

    let current = match catalog.probe(plan.target_device_id()) {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            return session.fail(EngineError::DeviceChanged(format!(
                "{} is no longer present",
                plan.target_device_id()
            )));
        }
        Err(e) => return session.fail(e),
    };
    if !current.removable {
        return session.fail(EngineError::DeviceChanged(format!(
            "{} is not a removable device",
            current.id
        )));
    }
    if current.capacity_bytes != plan.target_capacity_bytes() {
        return session.fail(EngineError::DeviceChanged(format!(
            "capacity changed from {} to {} bytes",
            plan.target_capacity_bytes(),
            current.capacity_bytes
        )));
    }
    if let Some(last) = plan.regions().last() {
        if last.end_bytes() > current.capacity_bytes {
            return session.fail(EngineError::DeviceChanged(
                "plan no longer fits the device".into(),
            ));
        }
    }

    let mut target = match catalog.open_target(plan.target_device_id()) {
        Ok(target) => target,
        Err(e) => return session.fail(e),
    };

    let mut source = match File::open(plan.source_image_path()) {
        Ok(file) => file,
        Err(e) => {
            return session.fail(EngineError::Io {
                offset: 0,
                message: format!("cannot open source image: {e}"),
            });
        }
    };

    session.transition(SessionState::Writing);
    log::info!(
        "writing {} bytes in {} region(s) to {}",
        plan.total_planned_bytes(),
        plan.regions().len(),
        plan.target_device_id()
    );

    for (index, region) in plan.regions().iter().enumerate() {
        session.current_region = index;
        match write_region(&mut *target, &mut source, region, chunk_size, session) {
            Ok(RegionWrite::Done) => {}
            Ok(RegionWrite::Cancelled) => return session.cancelled(),
            Err(e) => return session.fail(e),
        }
    }

    if let Err(e) = target.flush() {
        return session.fail(EngineError::io(session.bytes_written, &e));
    }
    if session.cancel_requested() {
        return session.cancelled();
    }

    session.transition(SessionState::Verifying);
    session.progress("Verifying image integrity (SHA-256)...");

    for (index, region) in plan.regions().iter().enumerate() {
        session.current_region = index;
        match verify::verify_region(&mut *target, index, region, chunk_size, &session.cancel) {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return session.cancelled(),
            Err(e) => return session.fail(e),
        }
    }

    session.transition(SessionState::Completed);
    session.progress("Verification and finalization complete. Bootable USB ready.");
    Outcome::Completed
}

enum RegionWrite {
    Done,
    Cancelled,
}

/// Streams one region to the device in bounded chunks, checking for
/// cancellation between chunks. An in-flight chunk is always completed
/// before cancellation takes effect.
fn write_region(
    target: &mut dyn BlockTarget,
    source: &mut File,
    region: &Region,
    chunk_size: usize,
    session: &mut Session,
) -> Result<RegionWrite, EngineError> {
    let message = stage_message(&region.kind);

    if let SourceKind::RawImageCopy { source_offset } = region.kind {
        source
            .seek(SeekFrom::Start(source_offset))
            .map_err(|e| EngineError::io(region.offset_bytes, &e))?;
    }

    let mut buffer = vec![0u8; chunk_size];
    let mut pos = region.offset_bytes;
    let end = region.end_bytes();

    while pos < end {
        if session.cancel_requested() {
            return Ok(RegionWrite::Cancelled);
        }

        let chunk = (end - pos).min(chunk_size as u64) as usize;
        match &region.kind {
            SourceKind::RawImageCopy { .. } => {
                source.read_exact(&mut buffer[..chunk]).map_err(|e| {
                    EngineError::Io {
                        offset: pos,
                        message: format!("source read failed: {e}"),
                    }
                })?;
            }
            SourceKind::PersistencePartition | SourceKind::ZeroFill => {
                buffer[..chunk].fill(0);
            }
            SourceKind::BootPatch { payload } => {
                let start = (pos - region.offset_bytes) as usize;
                buffer[..chunk].copy_from_slice(&payload[start..start + chunk]);
            }
        }

        let written = target
            .write_at(pos, &buffer[..chunk])
            .map_err(|e| EngineError::io(pos, &e))?;
        if written < chunk {
            // A short write leaves the device in an unknown state at this
            // offset; surface it rather than retrying.
            return Err(EngineError::Io {
                offset: pos + written as u64,
                message: format!("short write: {written} of {chunk} bytes"),
            });
        }

        pos += chunk as u64;
        session.bytes_written += chunk as u64;
        session.progress(message);
    }

    Ok(RegionWrite::Done)
}
