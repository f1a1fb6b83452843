use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::mmap::MmapFile;
use crate::ring::{BroadcastRing, MpscRing, RING_TRAILER_SIZE};
use crate::wait::{futex_wait, futex_wake};
use crate::{Error, Result};

pub const CNC_MAGIC: u32 = 0x434F_4E44; // 'COND'
pub const CNC_VERSION: u32 = 1;
pub const CNC_META_SIZE: usize = 4096;

pub const DEFAULT_COMMAND_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 128 * 1024;

/// Metadata page of the command-and-control file.
#[repr(C, align(128))]
pub struct CncMeta {
    // Constant after creation.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub driver_pid: AtomicU32,
    pub command_capacity: AtomicU64,
    pub broadcast_capacity: AtomicU64,
    pub driver_start_ns: AtomicU64,
    pub _pad0: [u8; 88],

    // Driver liveness, written every duty cycle.
    pub driver_heartbeat_ns: AtomicU64,
    pub _pad1: [u8; 120],

    // Client-side allocators.
    pub client_id_counter: AtomicU64,
    pub correlation_counter: AtomicU64,
    pub _pad2: [u8; 112],

    // Response wakeup (driver-notify / client-wait).
    pub notify_seq: AtomicU32,
    pub waiters_pending: AtomicU32,
    pub _pad3: [u8; 120],
}

/// The mapped command-and-control file: metadata page, client-to-driver
/// command ring, driver-to-client broadcast ring.
pub struct CncFile {
    mmap: MmapFile,
    meta: *mut CncMeta,
    command: MpscRing,
    broadcast: BroadcastRing,
}

// SAFETY: shared state is confined to the metadata atomics and the rings,
// which carry their own synchronization.
unsafe impl Send for CncFile {}
unsafe impl Sync for CncFile {}

fn region_length(capacity: usize) -> usize {
    capacity + RING_TRAILER_SIZE
}

fn file_length(command_capacity: usize, broadcast_capacity: usize) -> usize {
    CNC_META_SIZE + region_length(command_capacity) + region_length(broadcast_capacity)
}

impl CncFile {
    pub fn create(
        path: &Path,
        command_capacity: usize,
        broadcast_capacity: usize,
        driver_start_ns: u64,
    ) -> Result<Arc<Self>> {
        if !command_capacity.is_power_of_two() || !broadcast_capacity.is_power_of_two() {
            return Err(Error::Unsupported("ring capacity must be a power of two"));
        }
        let tmp_path = path.with_extension("tmp");
        let mut mmap = MmapFile::create(&tmp_path, file_length(command_capacity, broadcast_capacity))?;
        mmap.as_mut_slice().fill(0);
        let ptr = mmap.as_ptr() as *mut CncMeta;
        let meta = unsafe { &*ptr };
        meta.init_state.store(1, Ordering::Relaxed);
        meta.version.store(CNC_VERSION, Ordering::Relaxed);
        meta.driver_pid.store(std::process::id(), Ordering::Relaxed);
        meta.command_capacity
            .store(command_capacity as u64, Ordering::Relaxed);
        meta.broadcast_capacity
            .store(broadcast_capacity as u64, Ordering::Relaxed);
        meta.driver_start_ns.store(driver_start_ns, Ordering::Relaxed);
        meta.driver_heartbeat_ns
            .store(driver_start_ns, Ordering::Relaxed);
        meta.client_id_counter.store(1, Ordering::Relaxed);
        meta.correlation_counter.store(1, Ordering::Relaxed);
        meta.magic.store(CNC_MAGIC, Ordering::Relaxed);
        meta.init_state.store(2, Ordering::Release);
        std::fs::rename(&tmp_path, path)?;
        Self::attach(mmap, ptr, command_capacity, broadcast_capacity)
    }

    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < CNC_META_SIZE {
            return Err(Error::CorruptMetadata("cnc file too small"));
        }
        let ptr = mmap.as_ptr() as *mut CncMeta;
        let meta = unsafe { &*ptr };
        if meta.init_state.load(Ordering::Acquire) != 2 {
            return Err(Error::CorruptMetadata("cnc file not initialized"));
        }
        if meta.magic.load(Ordering::Acquire) != CNC_MAGIC {
            return Err(Error::CorruptMetadata("cnc magic mismatch"));
        }
        let version = meta.version.load(Ordering::Acquire);
        if version != CNC_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let command_capacity = meta.command_capacity.load(Ordering::Acquire) as usize;
        let broadcast_capacity = meta.broadcast_capacity.load(Ordering::Acquire) as usize;
        if mmap.len() != file_length(command_capacity, broadcast_capacity) {
            return Err(Error::CorruptMetadata("cnc file length mismatch"));
        }
        Self::attach(mmap, ptr, command_capacity, broadcast_capacity)
    }

    fn attach(
        mmap: MmapFile,
        meta: *mut CncMeta,
        command_capacity: usize,
        broadcast_capacity: usize,
    ) -> Result<Arc<Self>> {
        let base = mmap.as_ptr();
        // SAFETY: regions are non-overlapping slices of the mapping, which
        // lives as long as the returned CncFile.
        let command = unsafe {
            MpscRing::attach(base.add(CNC_META_SIZE), region_length(command_capacity))?
        };
        let broadcast = unsafe {
            BroadcastRing::attach(
                base.add(CNC_META_SIZE + region_length(command_capacity)),
                region_length(broadcast_capacity),
            )?
        };
        Ok(Arc::new(Self {
            mmap,
            meta,
            command,
            broadcast,
        }))
    }

    pub fn meta(&self) -> &CncMeta {
        unsafe { &*self.meta }
    }

    pub fn command(&self) -> &MpscRing {
        &self.command
    }

    pub fn broadcast(&self) -> &BroadcastRing {
        &self.broadcast
    }

    pub fn allocate_client_id(&self) -> u64 {
        self.meta().client_id_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_correlation_id(&self) -> u64 {
        self.meta().correlation_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn driver_heartbeat_ns(&self) -> u64 {
        self.meta().driver_heartbeat_ns.load(Ordering::Acquire)
    }

    pub fn beat(&self, now_ns: u64) {
        self.meta().driver_heartbeat_ns.store(now_ns, Ordering::Release);
    }

    /// Whether the driver heartbeat is fresher than `ttl`.
    pub fn driver_active(&self, now_ns: u64, ttl: Duration) -> bool {
        let heartbeat = self.driver_heartbeat_ns();
        now_ns.saturating_sub(heartbeat) <= ttl.as_nanos() as u64
    }

    /// Wake clients blocked in `await_notify`. Called by the driver after it
    /// transmits responses.
    pub fn notify_clients(&self) {
        let meta = self.meta();
        if meta.waiters_pending.swap(0, Ordering::AcqRel) != 0 {
            meta.notify_seq.fetch_add(1, Ordering::AcqRel);
            let _ = futex_wake(&meta.notify_seq);
        }
    }

    /// Block until the driver signals new responses or the timeout elapses.
    /// Spurious wakeups are allowed; callers re-check their condition.
    pub fn await_notify(&self, timeout: Duration) -> Result<()> {
        let meta = self.meta();
        let seq = meta.notify_seq.load(Ordering::Acquire);
        meta.waiters_pending.store(1, Ordering::Release);
        if meta.notify_seq.load(Ordering::Acquire) != seq {
            return Ok(());
        }
        futex_wait(&meta.notify_seq, seq, Some(timeout))
    }
}

const _: () = assert!(size_of::<CncMeta>() <= CNC_META_SIZE);
