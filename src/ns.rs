use std::sync::Arc;

use crate::device::{DEFAULT_TIMEOUT_S, Session, close_session};
use crate::error::{Error, Result, StatusCode};
use crate::iod::Iod;
use crate::ioqueue::Reaped;
use crate::memory::DmaBuf;

/// Namespace geometry and session configuration, fixed at open.
#[derive(Debug, Clone)]
pub struct NsInfo {
    /// Canonical device name, `bb:dd.f/nsid`
    pub device: String,
    /// Namespace id
    pub nsid: u32,
    /// Logical block size in bytes
    pub block_size: u32,
    /// log2 of the block size
    pub block_shift: u32,
    /// Addressable blocks in the namespace
    pub block_count: u64,
    /// Host and PRP page size in bytes
    pub page_size: u32,
    /// Blocks per page
    pub blocks_per_page: u32,
    /// Largest single transfer in blocks (controller MDTS)
    pub max_blocks_per_io: u32,
    /// Largest number of concurrent commands per queue
    pub max_io_per_queue: u32,
    /// Configured I/O queue count
    pub queue_count: u32,
    /// Configured I/O queue depth
    pub queue_size: u32,
    /// Controller limit on queue count
    pub max_queue_count: u32,
    /// Controller limit on queue depth
    pub max_queue_size: u32,
    /// Controller model string
    pub model: String,
    /// Controller serial number
    pub serial: String,
    /// Controller firmware revision
    pub firmware: String,
}

/// Outcome of polling an I/O descriptor.
#[derive(Debug)]
pub enum Polled {
    /// The command finished cleanly; carries CQE DW0. The descriptor is
    /// freed.
    Complete(u32),
    /// The device reported an error status. The descriptor is freed.
    Failed(StatusCode),
    /// The poll budget expired. The command is still outstanding and the
    /// handle comes back for a later re-poll.
    TimedOut(Iod),
}

impl Polled {
    /// Collapse into a `Result`, dropping a timed-out handle.
    pub fn into_result(self) -> Result<u32> {
        match self {
            Polled::Complete(cs) => Ok(cs),
            Polled::Failed(code) => Err(Error::Device(code)),
            Polled::TimedOut(_) => Err(Error::Timeout),
        }
    }
}

/// An open namespace: the handle every I/O operation goes through.
///
/// Handles share the underlying device session; the last `close` tears the
/// controller down. I/O queues are a thread-owned resource: a queue index
/// belongs to one thread at a time for both submission and polling.
pub struct Namespace {
    session: Arc<Session>,
    info: Arc<NsInfo>,
}

impl Namespace {
    pub(crate) fn new(session: Arc<Session>, info: Arc<NsInfo>) -> Self {
        Self { session, info }
    }

    /// Geometry and limits of this namespace.
    pub fn info(&self) -> &NsInfo {
        &self.info
    }

    /// Canonical device name.
    pub fn device(&self) -> &str {
        &self.info.device
    }

    /// Number of namespace handles currently open on this device.
    pub fn session_refs(&self) -> usize {
        self.session.refs()
    }

    /// Allocate a DMA-capable I/O buffer from the session pool.
    pub fn alloc(&self, size: usize) -> Result<DmaBuf> {
        self.session.pool().alloc(size).map(DmaBuf::new)
    }

    /// Return a buffer to the session pool.
    pub fn free(&self, buf: DmaBuf) -> Result<()> {
        self.session.pool().free(buf.vaddr())
    }

    /// Release this handle; the last handle on the device closes it.
    pub fn close(self) {
        close_session(&self.session);
    }

    fn check_io(&self, vaddr: usize, slba: u64, nlb: u32) -> Result<usize> {
        let info = &self.info;
        if nlb == 0 || nlb > info.max_blocks_per_io {
            log::error!(
                "{}: nlb {} outside [1, {}]",
                info.device,
                nlb,
                info.max_blocks_per_io
            );
            return Err(Error::BadArg("block count outside device limits"));
        }
        if slba.checked_add(nlb as u64).is_none_or(|end| end > info.block_count) {
            log::error!("{}: range {slba}+{nlb} past end of namespace", info.device);
            return Err(Error::BadArg("range past end of namespace"));
        }

        let nbytes = (nlb as usize) << info.block_shift;
        if !self.session.pool().owns(vaddr, nbytes) {
            log::error!("{}: I/O buffer not from this session's pool", info.device);
            return Err(Error::BadArg("buffer not from this session's pool"));
        }
        Ok(nbytes)
    }

    fn submit_rw(
        &self,
        q: usize,
        write: bool,
        config: bool,
        vaddr: usize,
        slba: u64,
        nlb: u32,
    ) -> Result<Iod> {
        let nbytes = self.check_io(vaddr, slba, nlb)?;
        let mut queue = self.session.io_queue(q)?.lock();
        let cid = queue.submit_rw(
            self.session.pool(),
            self.info.nsid,
            write,
            config,
            vaddr,
            nbytes,
            slba,
            nlb,
        )?;
        Ok(Iod { qid: queue.qid(), cid })
    }

    /// Submit a read of `nlb` blocks into `buf`.
    pub fn aread(&self, q: usize, buf: &DmaBuf, slba: u64, nlb: u32) -> Result<Iod> {
        self.submit_rw(q, false, false, buf.vaddr(), slba, nlb)
    }

    /// Submit a write of `nlb` blocks from `buf`.
    pub fn awrite(&self, q: usize, buf: &DmaBuf, slba: u64, nlb: u32) -> Result<Iod> {
        self.submit_rw(q, true, false, buf.vaddr(), slba, nlb)
    }

    /// Submit a flush; completes after prior writes on this queue are
    /// persistent.
    pub fn aflush(&self, q: usize) -> Result<Iod> {
        let mut queue = self.session.io_queue(q)?.lock();
        let cid = queue.submit_flush(self.info.nsid)?;
        Ok(Iod { qid: queue.qid(), cid })
    }

    /// Submit a one-block translate configuration write.
    ///
    /// The configuration data sits in the first page of `buf`.
    pub fn atranslate_write(&self, q: usize, buf: &DmaBuf, slba: u64) -> Result<Iod> {
        self.require_translate()?;
        self.submit_rw(q, true, true, buf.vaddr(), slba, 1)
    }

    /// Submit a translate read of `nlb` blocks.
    pub fn atranslate_read(&self, q: usize, buf: &DmaBuf, slba: u64, nlb: u32) -> Result<Iod> {
        self.require_translate()?;
        self.submit_rw(q, false, true, buf.vaddr(), slba, nlb)
    }

    fn require_translate(&self) -> Result<()> {
        if !self.session.has_translate() {
            return Err(Error::Unsupported("translate commands"));
        }
        Ok(())
    }

    /// Poll a previously submitted command for up to `timeout_s` seconds.
    ///
    /// A zero timeout checks once without waiting. Reaching a terminal
    /// state consumes the handle; a timeout hands it back and the command
    /// stays outstanding (it cannot be cancelled).
    pub fn apoll(&self, iod: Iod, timeout_s: u64) -> Polled {
        let queue = match self.session.io_queue(iod.qid as usize - 1) {
            Ok(queue) => queue,
            Err(_) => panic!("descriptor names queue {} which does not exist", iod.qid),
        };
        let deadline = self.session.clock().deadline(timeout_s);
        match queue.lock().poll(iod.cid, deadline) {
            Reaped::Done { status, cs } => {
                let code = StatusCode::from_raw(status);
                if code.is_ok() {
                    Polled::Complete(cs)
                } else {
                    Polled::Failed(code)
                }
            }
            Reaped::TimedOut => Polled::TimedOut(iod),
        }
    }

    /// As `apoll`, also writing the CQE command-specific DW0 to `cs`.
    pub fn apoll_cs(&self, iod: Iod, timeout_s: u64, cs: &mut u32) -> Polled {
        let polled = self.apoll(iod, timeout_s);
        if let Polled::Complete(dw0) = &polled {
            *cs = *dw0;
        }
        polled
    }

    /// Synchronous read: submit and poll with the default timeout.
    pub fn read(&self, q: usize, buf: &DmaBuf, slba: u64, nlb: u32) -> Result<()> {
        let iod = self.aread(q, buf, slba, nlb)?;
        std::thread::yield_now();
        self.apoll(iod, DEFAULT_TIMEOUT_S).into_result().map(|_| ())
    }

    /// Synchronous write: submit and poll with the default timeout.
    pub fn write(&self, q: usize, buf: &DmaBuf, slba: u64, nlb: u32) -> Result<()> {
        let iod = self.awrite(q, buf, slba, nlb)?;
        std::thread::yield_now();
        self.apoll(iod, DEFAULT_TIMEOUT_S).into_result().map(|_| ())
    }

    /// Synchronous flush.
    pub fn flush(&self, q: usize) -> Result<()> {
        let iod = self.aflush(q)?;
        std::thread::yield_now();
        self.apoll(iod, DEFAULT_TIMEOUT_S).into_result().map(|_| ())
    }

    /// Translate a region: one configuration write, then overlapping
    /// translate reads until `nlb` blocks are covered.
    ///
    /// At most `max_io_per_queue` descriptors are in flight at any
    /// instant. The configuration write is submitted first so the device
    /// sees the parameters before any read; reads then stream into `buf`
    /// at advancing offsets, each slot refilled as its command completes.
    pub fn translate_region(
        &self,
        q: usize,
        buf: &DmaBuf,
        slba: u64,
        nlb: u32,
        config_nlb: u32,
    ) -> Result<()> {
        self.require_translate()?;
        let info = &self.info;
        if nlb == 0 {
            return Err(Error::BadArg("block count outside device limits"));
        }
        let total_bytes = (nlb as usize) << info.block_shift;
        if buf.len() < total_bytes {
            log::error!("{}: buffer shorter than {nlb} blocks", info.device);
            return Err(Error::BadArg("buffer shorter than the region"));
        }

        let maxbpio = info.max_blocks_per_io;
        let nreads = nlb.div_ceil(maxbpio);
        let window = (info.max_io_per_queue as usize).min(nreads as usize + 1);
        let step = (maxbpio as usize) << info.block_shift;
        let read_nlb = |index: u32| -> u32 {
            if index == nreads - 1 && !nlb.is_multiple_of(maxbpio) {
                nlb % maxbpio
            } else {
                maxbpio
            }
        };

        let mut slots: Vec<Option<Iod>> = Vec::with_capacity(window);
        slots.push(Some(self.atranslate_write_region(q, buf, slba, config_nlb)?));

        let mut issued = 0u32;
        let mut read_off = 0usize;
        while issued < nreads && slots.len() < window {
            let iod = self.submit_rw(q, false, true, buf.vaddr() + read_off, slba, read_nlb(issued))?;
            slots.push(Some(iod));
            read_off += step;
            issued += 1;
        }

        let mut pending = slots.len();
        let mut first_err = None;
        let mut j = 0;
        while pending > 0 {
            if let Some(iod) = slots[j].take() {
                std::thread::yield_now();
                match self.apoll(iod, DEFAULT_TIMEOUT_S) {
                    Polled::Complete(_) => {
                        if issued < nreads && first_err.is_none() {
                            let iod = self.submit_rw(
                                q,
                                false,
                                true,
                                buf.vaddr() + read_off,
                                slba,
                                read_nlb(issued),
                            )?;
                            slots[j] = Some(iod);
                            read_off += step;
                            issued += 1;
                        } else {
                            pending -= 1;
                        }
                    }
                    Polled::Failed(code) => {
                        // stop refilling but drain what is already posted
                        first_err.get_or_insert(Error::Device(code));
                        pending -= 1;
                    }
                    Polled::TimedOut(iod) => {
                        slots[j] = Some(iod);
                    }
                }
            }
            j += 1;
            if j == slots.len() {
                j = 0;
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Configuration write at the head of a translate region; its block
    /// count is the caller's `config_nlb` rather than the fixed single
    /// block of `atranslate_write`.
    fn atranslate_write_region(
        &self,
        q: usize,
        buf: &DmaBuf,
        slba: u64,
        config_nlb: u32,
    ) -> Result<Iod> {
        self.submit_rw(q, true, true, buf.vaddr(), slba, config_nlb)
    }
}
