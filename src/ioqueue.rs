use crate::clock::CycleClock;
use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::iod::{DescTable, SlotState};
use crate::memory::{MemoryPool, PAGE_SIZE, PrpPage, PrpPagePool};
use crate::queues::{CompQueue, SubQueue};
use crate::regs::{Doorbell, DoorbellHelper};

/// Outcome of polling one descriptor.
pub(crate) enum Reaped {
    /// Terminal: raw CQE status field plus captured DW0. The slot is free.
    Done { status: u16, cs: u32 },
    /// Budget expired; the command is still outstanding.
    TimedOut,
}

/// One I/O queue pair with its descriptor table and PRP-list slab.
///
/// A queue is a thread-owned resource: exactly one thread submits to and
/// polls a given queue id at a time. Nothing here takes a lock; the
/// exclusivity lives in the session wrapper.
pub(crate) struct IoQueue {
    qid: u16,
    sq: SubQueue,
    cq: CompQueue,
    table: DescTable,
    prp_pages: PrpPagePool,
    bells: DoorbellHelper,
}

impl IoQueue {
    /// Allocate rings and the PRP slab for a queue of `depth` entries.
    ///
    /// The rings are registered with the controller by the caller; this
    /// only prepares host-side state.
    pub fn new(qid: u16, depth: usize, pool: &MemoryPool, bells: DoorbellHelper) -> Result<Self> {
        let sq_region = pool.alloc(depth * size_of::<Command>())?;
        let cq_region = pool.alloc(depth * 16)?;
        Ok(Self {
            qid,
            sq: SubQueue::new(sq_region, depth),
            cq: CompQueue::new(cq_region, depth),
            table: DescTable::new(depth),
            prp_pages: PrpPagePool::new(pool, depth)?,
            bells,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn sq_address(&self) -> u64 {
        self.sq.address()
    }

    pub fn cq_address(&self) -> u64 {
        self.cq.address()
    }

    pub fn inflight(&self) -> usize {
        self.table.inflight()
    }

    /// Submit a read or write and return its command id.
    ///
    /// Nothing reaches the device on failure: the tail is only advanced
    /// and the doorbell only rung once the slot is reserved and the PRP
    /// chain is built.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_rw(
        &mut self,
        pool: &MemoryPool,
        nsid: u32,
        write: bool,
        config: bool,
        vaddr: usize,
        nbytes: usize,
        slba: u64,
        nlb: u32,
    ) -> Result<u16> {
        let cid = self.table.reserve().ok_or(Error::QueueFull)?;
        if self.sq.is_full() {
            self.table.release(cid);
            return Err(Error::QueueFull);
        }

        let (prp1, prp2, page) = match self.build_prp(pool, vaddr, nbytes) {
            Ok(prp) => prp,
            Err(e) => {
                self.table.release(cid);
                return Err(e);
            }
        };

        {
            let slot = self.table.get_mut(cid);
            slot.opcode = if write { 1 } else { 2 };
            slot.slba = slba;
            slot.nlb = nlb;
            slot.buf = vaddr;
            slot.prp_page = page;
        }

        let nlb0 = (nlb - 1) as u16;
        let cmd = if config {
            Command::read_write_config(cid, nsid, slba, nlb0, [prp1, prp2], write)
        } else {
            Command::read_write(cid, nsid, slba, nlb0, [prp1, prp2], write)
        };

        let tail = match self.sq.try_push(cmd) {
            Ok(tail) => tail,
            Err(e) => {
                if let Some(page) = self.table.release(cid) {
                    self.prp_pages.put(page);
                }
                return Err(e);
            }
        };
        log::trace!(
            "q{} cid {} {} slba {:#x} nlb {}",
            self.qid,
            cid,
            if write { "write" } else { "read" },
            slba,
            nlb
        );
        self.bells.write(Doorbell::SubTail(self.qid), tail as u32);
        Ok(cid)
    }

    /// Submit a flush and return its command id.
    pub fn submit_flush(&mut self, nsid: u32) -> Result<u16> {
        let cid = self.table.reserve().ok_or(Error::QueueFull)?;
        if self.sq.is_full() {
            self.table.release(cid);
            return Err(Error::QueueFull);
        }
        self.table.get_mut(cid).opcode = 0;

        let tail = match self.sq.try_push(Command::flush(cid, nsid)) {
            Ok(tail) => tail,
            Err(e) => {
                self.table.release(cid);
                return Err(e);
            }
        };
        self.bells.write(Doorbell::SubTail(self.qid), tail as u32);
        Ok(cid)
    }

    /// Build the PRP pair for a page-aligned transfer.
    ///
    /// One page needs PRP1 alone; two pages put the second page in PRP2;
    /// anything longer borrows a list page from the slab and PRP2 points
    /// at the list, which holds the IOVAs of every page after the first.
    fn build_prp(
        &self,
        pool: &MemoryPool,
        vaddr: usize,
        nbytes: usize,
    ) -> Result<(u64, u64, Option<PrpPage>)> {
        if vaddr % PAGE_SIZE != 0 {
            return Err(Error::BadArg("buffer is not page aligned"));
        }
        let prp1 = pool.iova_of(vaddr)?;
        let npages = nbytes.div_ceil(PAGE_SIZE);

        match npages {
            0 | 1 => Ok((prp1, 0, None)),
            2 => Ok((prp1, pool.iova_of(vaddr + PAGE_SIZE)?, None)),
            _ => {
                let page = self.prp_pages.take().ok_or(Error::OutOfMemory)?;
                let fill = || -> Result<()> {
                    for i in 1..npages {
                        page.set_entry(i - 1, pool.iova_of(vaddr + i * PAGE_SIZE)?);
                    }
                    Ok(())
                };
                if let Err(e) = fill() {
                    self.prp_pages.put(page);
                    return Err(e);
                }
                Ok((prp1, page.iova, Some(page)))
            }
        }
    }

    /// Consume every fresh completion entry.
    ///
    /// Descriptor state is settled before the head doorbell moves, so a
    /// poller re-entering after the ring sees a consistent table.
    pub fn sweep(&mut self) {
        while let Some((head, entry)) = self.cq.try_pop() {
            let cid = entry.cmd_id;
            self.sq.head = entry.sq_head as usize;

            if { entry.sq_id } != self.qid {
                panic!("q{}: completion for queue {}", self.qid, { entry.sq_id });
            }
            if cid as usize >= self.table.depth() {
                panic!("q{}: completion names impossible cid {}", self.qid, cid);
            }
            let slot = self.table.get_mut(cid);
            if slot.state != SlotState::Pending {
                panic!("q{}: completion for idle cid {}", self.qid, cid);
            }
            slot.cs = entry.command_specific;
            slot.state = SlotState::Done(entry.status);
            if let Some(page) = slot.prp_page.take() {
                self.prp_pages.put(page);
            }

            self.bells.write(Doorbell::CompHead(self.qid), head as u32);
        }
    }

    /// Poll one command to a terminal state within the cycle budget.
    ///
    /// A zero budget still performs one sweep, so an already-completed
    /// command is reaped without waiting.
    pub fn poll(&mut self, cid: u16, deadline: u64) -> Reaped {
        loop {
            self.sweep();
            match self.table.get(cid).state {
                SlotState::Done(status) => {
                    let slot = self.table.get(cid);
                    let cs = slot.cs;
                    if (status >> 1) & 0x7FF != 0 {
                        log::warn!(
                            "q{} cid {} opcode {:#x} slba {:#x} nlb {} buf {:#x}: status {:#x}",
                            self.qid,
                            cid,
                            slot.opcode,
                            slot.slba,
                            slot.nlb,
                            slot.buf,
                            status >> 1
                        );
                    }
                    self.table.release(cid);
                    return Reaped::Done { status, cs };
                }
                SlotState::Pending => {}
                SlotState::Free => panic!("q{}: poll of idle cid {}", self.qid, cid),
            }
            if CycleClock::expired(deadline) {
                return Reaped::TimedOut;
            }
            std::thread::yield_now();
        }
    }
}
