use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::admin::{AdminQueue, ControllerInfo};
use crate::clock::CycleClock;
use crate::error::{Error, Result};
use crate::ioqueue::IoQueue;
use crate::memory::{MemoryPool, PAGE_SIZE};
use crate::ns::{Namespace, NsInfo};
use crate::passthru::{DeviceId, Passthru, PciAddr};
use crate::regs::{CC_ENABLE, CSTS_READY, Capabilities, DoorbellHelper, Mmio, Register};

/// Poll timeout used by the synchronous operations, in seconds.
pub(crate) const DEFAULT_TIMEOUT_S: u64 = 60;

/// Budget for one synchronous admin command, in seconds.
const ADMIN_TIMEOUT_S: u64 = 30;

/// Admin queue depth; bring-up traffic is tiny.
const ADMIN_QUEUE_SIZE: usize = 64;

/// Defaults applied when the caller passes zero to `open_with`.
const DEFAULT_IOQ_COUNT: usize = 4;
const DEFAULT_IOQ_SIZE: usize = 256;

/// One attached controller shared by every namespace handle opened on it.
pub(crate) struct Session {
    devname: String,
    key: u32,
    mmio: Mmio,
    pool: MemoryPool,
    admin: Mutex<AdminQueue>,
    ioq: Vec<Mutex<IoQueue>>,
    namespaces: RwLock<BTreeMap<u32, Arc<NsInfo>>>,
    ctrl: ControllerInfo,
    clock: CycleClock,
    qcount: usize,
    qsize: usize,
    maxqcount: usize,
    maxqsize: usize,
    refs: AtomicUsize,
}

impl Session {
    /// Reset and configure the controller, then build the I/O queues.
    ///
    /// Any failure aborts the open: the caller never sees a partially
    /// constructed session, and the controller is left disabled.
    fn bring_up(
        dev: Arc<dyn Passthru>,
        pci: PciAddr,
        qcount: usize,
        qsize: usize,
    ) -> Result<Arc<Self>> {
        let clock = CycleClock::calibrate();
        let mmio = Mmio::new(dev.mmio_map(0)?);

        let session = Self::bring_up_enabled(dev, pci, qcount, qsize, clock, mmio);
        if session.is_err() {
            mmio.write32(Register::CC, mmio.read32(Register::CC) & !CC_ENABLE);
        }
        session
    }

    fn bring_up_enabled(
        dev: Arc<dyn Passthru>,
        pci: PciAddr,
        qcount: usize,
        qsize: usize,
        clock: CycleClock,
        mmio: Mmio,
    ) -> Result<Arc<Self>> {
        let devname = pci.to_string();
        let cap = Capabilities::decode(mmio.read64(Register::CAP));
        if cap.min_pagesize > PAGE_SIZE {
            return Err(Error::Unsupported("host page size below controller minimum"));
        }

        let maxqsize = cap.max_queue_entries;
        let qsize = match qsize {
            0 => DEFAULT_IOQ_SIZE.min(maxqsize),
            n if n > maxqsize => {
                log::error!("{devname}: qsize {n} exceeds controller limit {maxqsize}");
                return Err(Error::BadArg("qsize exceeds controller limit"));
            }
            n => n,
        };

        let bells = DoorbellHelper::new(mmio.base(), cap.doorbell_stride);
        let pool = MemoryPool::new(dev.clone());
        let ready_budget = (cap.timeout_500ms as u64).div_ceil(2).max(1);

        // quiesce, program the admin queues, then enable
        mmio.write32(Register::CC, mmio.read32(Register::CC) & !CC_ENABLE);
        wait_ready(&mmio, &clock, false, ready_budget)?;

        let mut admin = AdminQueue::new(&pool, ADMIN_QUEUE_SIZE.min(maxqsize), bells.clone())?;
        mmio.write64(Register::ASQ, admin.sq_address());
        mmio.write64(Register::ACQ, admin.cq_address());
        let entries = (ADMIN_QUEUE_SIZE.min(maxqsize) - 1) as u32;
        mmio.write32(Register::AQA, (entries << 16) | entries);

        // IOSQES=6 (64 B), IOCQES=4 (16 B), MPS=0, CSS=0
        let cc = (4 << 20) | (6 << 16);
        mmio.write32(Register::CC, cc);
        mmio.write32(Register::CC, cc | CC_ENABLE);
        wait_ready(&mmio, &clock, true, ready_budget)?;
        dev.enable_bus_master()?;

        let ctrl = admin.identify_controller(clock.deadline(ADMIN_TIMEOUT_S))?;
        log::info!(
            "{devname}: {} {} fw {}",
            ctrl.model,
            ctrl.serial,
            ctrl.firmware
        );

        let desired = if qcount == 0 { DEFAULT_IOQ_COUNT } else { qcount };
        let (granted_sq, granted_cq) =
            admin.set_queue_count(desired as u16, clock.deadline(ADMIN_TIMEOUT_S))?;
        let maxqcount = granted_sq.min(granted_cq) as usize;
        let qcount = match qcount {
            0 => DEFAULT_IOQ_COUNT.min(maxqcount),
            n if n > maxqcount => {
                log::error!("{devname}: qcount {n} exceeds controller limit {maxqcount}");
                return Err(Error::BadArg("qcount exceeds controller limit"));
            }
            n => n,
        };

        let mut ioq = Vec::with_capacity(qcount);
        for qid in 1..=qcount as u16 {
            let queue = IoQueue::new(qid, qsize, &pool, bells.clone())?;
            admin.create_io_queue(
                qid,
                queue.cq_address(),
                queue.sq_address(),
                qsize,
                clock.deadline(ADMIN_TIMEOUT_S),
            )?;
            ioq.push(Mutex::new(queue));
        }
        log::debug!("{devname}: {qcount} I/O queues of {qsize} entries");

        Ok(Arc::new(Self {
            devname,
            key: pci.key(),
            mmio,
            pool,
            admin: Mutex::new(admin),
            ioq,
            namespaces: RwLock::new(BTreeMap::new()),
            ctrl,
            clock,
            qcount,
            qsize,
            maxqcount,
            maxqsize,
            refs: AtomicUsize::new(0),
        }))
    }

    /// Look up a namespace, identifying it on first use.
    fn ensure_namespace(&self, nsid: u32) -> Result<Arc<NsInfo>> {
        if let Some(info) = self.namespaces.read().get(&nsid) {
            return Ok(info.clone());
        }

        let (block_size, block_count) = self
            .admin
            .lock()
            .identify_namespace(nsid, self.clock.deadline(ADMIN_TIMEOUT_S))?;
        if block_size as usize > PAGE_SIZE {
            return Err(Error::Unsupported("block size above page size"));
        }

        let block_shift = block_size.trailing_zeros();
        let blocks_per_page = (PAGE_SIZE as u32) >> block_shift;
        let info = Arc::new(NsInfo {
            device: format!("{}/{:x}", self.devname, nsid),
            nsid,
            block_size,
            block_shift,
            block_count,
            page_size: PAGE_SIZE as u32,
            blocks_per_page,
            max_blocks_per_io: self.ctrl.max_transfer_pages as u32 * blocks_per_page,
            max_io_per_queue: (self.qsize - 1) as u32,
            queue_count: self.qcount as u32,
            queue_size: self.qsize as u32,
            max_queue_count: self.maxqcount as u32,
            max_queue_size: self.maxqsize as u32,
            model: self.ctrl.model.clone(),
            serial: self.ctrl.serial.clone(),
            firmware: self.ctrl.firmware.clone(),
        });
        self.namespaces.write().insert(nsid, info.clone());
        Ok(info)
    }

    /// Delete the I/O queues and disable the controller.
    fn shutdown(&self) {
        {
            let mut admin = self.admin.lock();
            for queue in &self.ioq {
                let queue = queue.lock();
                if queue.inflight() != 0 {
                    log::warn!(
                        "{}: closing q{} with {} commands outstanding",
                        self.devname,
                        queue.qid(),
                        queue.inflight()
                    );
                }
                if let Err(e) =
                    admin.delete_io_queue(queue.qid(), self.clock.deadline(ADMIN_TIMEOUT_S))
                {
                    log::warn!("{}: q{} deletion failed: {e}", self.devname, queue.qid());
                }
            }
        }

        self.mmio
            .write32(Register::CC, self.mmio.read32(Register::CC) & !CC_ENABLE);
        if wait_ready(&self.mmio, &self.clock, false, 1).is_err() {
            log::warn!("{}: controller did not acknowledge disable", self.devname);
        }
        log::info!("{}: closed", self.devname);
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    pub fn has_translate(&self) -> bool {
        self.ctrl.has_translate
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// The queue at client index `q` (zero-based; hardware qid is q + 1).
    pub fn io_queue(&self, q: usize) -> Result<&Mutex<IoQueue>> {
        self.ioq.get(q).ok_or_else(|| {
            log::error!("{}: queue index {q} out of range", self.devname);
            Error::BadArg("queue index out of range")
        })
    }
}

/// Open devices, keyed by PCI function. Opens and closes are serialized by
/// this one process-wide lock.
static REGISTRY: Mutex<BTreeMap<u32, Arc<Session>>> = Mutex::new(BTreeMap::new());

/// Open a namespace with default queue geometry.
pub fn open<P: Passthru + 'static>(devname: &str) -> Result<Namespace> {
    open_with::<P>(devname, 0, 0)
}

/// Open a namespace, configuring the device on first attach.
///
/// `qcount`/`qsize` of zero pick driver defaults clamped to the
/// controller's advertised maxima. A later open of an already-attached
/// device joins the existing session; its queue geometry is fixed.
pub fn open_with<P: Passthru + 'static>(devname: &str, qcount: usize, qsize: usize) -> Result<Namespace> {
    let id: DeviceId = devname.parse().inspect_err(|e| log::error!("{e}"))?;
    if qsize == 1 {
        log::error!("{devname}: a queue of one entry cannot hold commands");
        return Err(Error::BadArg("qsize must be 0 or at least 2"));
    }

    let mut registry = REGISTRY.lock();
    let (session, fresh) = match registry.get(&id.pci.key()).cloned() {
        Some(session) => (session, false),
        None => {
            let dev = Arc::new(P::open(id.pci)?);
            let session = Session::bring_up(dev, id.pci, qcount, qsize)?;
            registry.insert(id.pci.key(), session.clone());
            (session, true)
        }
    };

    match session.ensure_namespace(id.nsid) {
        Ok(info) => {
            session.refs.fetch_add(1, Ordering::AcqRel);
            Ok(Namespace::new(session, info))
        }
        Err(e) => {
            if fresh {
                registry.remove(&id.pci.key());
                session.shutdown();
            }
            Err(e)
        }
    }
}

/// Drop one namespace handle; the last one tears the device down.
pub(crate) fn close_session(session: &Arc<Session>) {
    let mut registry = REGISTRY.lock();
    if session.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        registry.remove(&session.key);
        session.shutdown();
    }
}

fn wait_ready(mmio: &Mmio, clock: &CycleClock, want: bool, budget_s: u64) -> Result<()> {
    let deadline = clock.deadline(budget_s);
    while ((mmio.read32(Register::CSTS) & CSTS_READY) == CSTS_READY) != want {
        if CycleClock::expired(deadline) {
            log::error!("controller ready bit stuck at {}", !want as u8);
            return Err(Error::Timeout);
        }
        core::hint::spin_loop();
        std::thread::yield_now();
    }
    Ok(())
}
