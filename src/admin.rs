use crate::clock::CycleClock;
use crate::cmd::{Command, FeatureId, IdentifyType, QueueType};
use crate::error::{Error, Result, StatusCode};
use crate::memory::{DmaRegion, MemoryPool, PAGE_SIZE};
use crate::queues::{CompQueue, Completion, SubQueue};
use crate::regs::{Doorbell, DoorbellHelper};

/// Largest transfer, in pages, the driver will issue when the controller
/// does not advertise an MDTS limit.
const MDTS_UNLIMITED_PAGES: usize = 1024;

/// Controller properties gathered during bring-up.
#[derive(Debug, Clone)]
pub(crate) struct ControllerInfo {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size in pages
    pub max_transfer_pages: usize,
    /// Vendor block advertises the translate command extension
    pub has_translate: bool,
}

/// NVMe identify-namespace layout, reduced to the fields consumed here.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct NamespaceData {
    _ignore1: u64,
    capacity: u64,
    _ignore2: [u8; 10],
    lba_size: u8,
    _ignore3: [u8; 101],
    lba_format_support: [u32; 16],
}

/// The admin queue pair and its scratch buffer.
///
/// Admin commands run synchronously, one at a time: the session serializes
/// access with a mutex for the whole post-and-poll of each command, since
/// the admin queue is the only queue shared between threads.
pub(crate) struct AdminQueue {
    sq: SubQueue,
    cq: CompQueue,
    bells: DoorbellHelper,
    buffer: DmaRegion,
}

impl AdminQueue {
    pub fn new(pool: &MemoryPool, depth: usize, bells: DoorbellHelper) -> Result<Self> {
        let sq_region = pool.alloc(depth * size_of::<Command>())?;
        let cq_region = pool.alloc(depth * 16)?;
        Ok(Self {
            sq: SubQueue::new(sq_region, depth),
            cq: CompQueue::new(cq_region, depth),
            bells,
            buffer: pool.alloc(PAGE_SIZE)?,
        })
    }

    pub fn sq_address(&self) -> u64 {
        self.sq.address()
    }

    pub fn cq_address(&self) -> u64 {
        self.cq.address()
    }

    /// Command id for the next submission. Admin runs one command at a
    /// time, so the ring position is unique among in-flight ids.
    fn next_cid(&self) -> u16 {
        self.sq.tail as u16
    }

    /// Post one command and spin-poll its completion.
    pub fn exec(&mut self, cmd: Command, deadline: u64) -> Result<Completion> {
        let opcode = cmd.opcode();
        let tail = self.sq.try_push(cmd)?;
        self.bells.write(Doorbell::SubTail(0), tail as u32);

        loop {
            if let Some((head, entry)) = self.cq.try_pop() {
                self.sq.head = entry.sq_head as usize;
                self.bells.write(Doorbell::CompHead(0), head as u32);

                let code = StatusCode::from_raw(entry.status);
                if !code.is_ok() {
                    log::error!("admin opcode {:#x} failed: {}", opcode, code.description());
                    return Err(Error::Device(code));
                }
                return Ok(entry);
            }
            if CycleClock::expired(deadline) {
                log::error!("admin opcode {:#x} timed out", opcode);
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    fn buffer_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.buffer.vaddr as *const u8, PAGE_SIZE) }
    }

    /// Identify the controller and decode the fields the driver needs.
    pub fn identify_controller(&mut self, deadline: u64) -> Result<ControllerInfo> {
        let cmd = Command::identify(self.next_cid(), self.buffer.iova, IdentifyType::Controller);
        self.exec(cmd, deadline)?;

        let data = self.buffer_bytes();
        let extract_string = |start: usize, end: usize| -> String {
            data[start..end]
                .iter()
                .flat_map(|&b| char::from_u32(b as u32))
                .collect::<String>()
                .trim()
                .to_string()
        };

        let mdts = data[77];
        let max_transfer_pages = if mdts == 0 {
            MDTS_UNLIMITED_PAGES
        } else {
            1usize << mdts
        };

        Ok(ControllerInfo {
            serial: extract_string(4, 24),
            model: extract_string(24, 64),
            firmware: extract_string(64, 72),
            max_transfer_pages,
            // first bit of the vendor-specific block
            has_translate: data[3072] & 1 == 1,
        })
    }

    /// Identify one namespace: (block size, block count).
    pub fn identify_namespace(&mut self, nsid: u32, deadline: u64) -> Result<(u32, u64)> {
        let cmd = Command::identify(self.next_cid(), self.buffer.iova, IdentifyType::Namespace(nsid));
        self.exec(cmd, deadline)?;

        let data = unsafe { &*(self.buffer.vaddr as *const NamespaceData) };
        let capacity = data.capacity;
        if capacity == 0 {
            return Err(Error::BadArg("namespace does not exist"));
        }
        let flba_index = (data.lba_size & 0xF) as usize;
        let lbads = (data.lba_format_support[flba_index] >> 16) & 0xFF;
        Ok((1 << lbads, capacity))
    }

    /// Negotiate the number of I/O queues; returns (sq, cq) granted.
    pub fn set_queue_count(&mut self, requested: u16, deadline: u64) -> Result<(u16, u16)> {
        let zero_based = requested as u32 - 1;
        let cmd = Command::set_features(
            self.next_cid(),
            FeatureId::NumberOfQueues,
            (zero_based << 16) | zero_based,
            false,
        );
        // the grant comes back in CQE DW0 alone; this feature moves no data
        let entry = self.exec(cmd, deadline)?;
        let granted = entry.command_specific;
        Ok((((granted & 0xFFFF) + 1) as u16, ((granted >> 16) + 1) as u16))
    }

    /// Register one I/O queue pair with the controller, CQ before SQ.
    pub fn create_io_queue(
        &mut self,
        qid: u16,
        cq_addr: u64,
        sq_addr: u64,
        depth: usize,
        deadline: u64,
    ) -> Result<()> {
        let size = (depth - 1) as u16;
        self.exec(
            Command::create_queue(self.next_cid(), qid, cq_addr, size, QueueType::Completion, None),
            deadline,
        )?;
        if let Err(e) = self.exec(
            Command::create_queue(self.next_cid(), qid, sq_addr, size, QueueType::Submission, Some(qid)),
            deadline,
        ) {
            // do not leave a half-created pair behind
            let _ = self.exec(
                Command::delete_queue(self.next_cid(), qid, QueueType::Completion),
                deadline,
            );
            return Err(e);
        }
        Ok(())
    }

    /// Remove one I/O queue pair, SQ before CQ; the submission side must
    /// not outlive its completion queue from the device's view.
    pub fn delete_io_queue(&mut self, qid: u16, deadline: u64) -> Result<()> {
        self.exec(
            Command::delete_queue(self.next_cid(), qid, QueueType::Submission),
            deadline,
        )?;
        self.exec(
            Command::delete_queue(self.next_cid(), qid, QueueType::Completion),
            deadline,
        )?;
        Ok(())
    }
}
