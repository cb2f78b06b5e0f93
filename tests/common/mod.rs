#![allow(dead_code)]

//! In-memory NVMe controller model.
//!
//! Implements the pass-through contract with identity DMA mappings and a
//! service thread that plays the device side: it watches doorbells in a
//! fake BAR, consumes submission entries, moves data between PRP-addressed
//! host pages and a per-namespace block store, and posts completions with
//! proper phase management. Knobs allow stalling I/O processing and
//! injecting error statuses for timeout and error-path tests.

use std::alloc::{Layout, alloc_zeroed};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use nvme_user::{DeviceId, Passthru, PciAddr, Result as NvmeResult};

const BAR_LEN: usize = 0x1100;
const PAGE: usize = 4096;
pub const BLOCK: usize = 4096;
/// Blocks per namespace; the model carves one store per nsid 1 and 2.
pub const NS_BLOCKS: u64 = 4096;
/// Grantable I/O queues, 1-based.
const MAX_QUEUES: u32 = 8;

const REG_CC: usize = 0x14;
const REG_CSTS: usize = 0x1C;
const REG_AQA: usize = 0x24;
const REG_ASQ: usize = 0x28;
const REG_ACQ: usize = 0x30;
const DB_BASE: usize = 0x1000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Sqe {
    opcode: u8,
    flags: u8,
    cid: u16,
    nsid: u32,
    _rsvd: u64,
    mptr: u64,
    prp1: u64,
    prp2: u64,
    dw10: u32,
    dw11: u32,
    dw12: u32,
    dw13: u32,
    dw14: u32,
    dw15: u32,
}

struct SqState {
    base: u64,
    depth: usize,
    head: usize,
    cqid: u16,
}

struct CqState {
    base: u64,
    depth: usize,
    tail: usize,
    phase: bool,
}

#[derive(Default)]
struct DevState {
    enabled: bool,
    sqs: HashMap<u16, SqState>,
    cqs: HashMap<u16, CqState>,
    storage: HashMap<u32, Vec<u8>>,
}

/// A translate-flagged command observed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOp {
    pub write: bool,
    pub slba: u64,
    pub nlb: u32,
    /// First data page, to observe scatter offsets.
    pub prp1: u64,
}

pub struct MockCtrl {
    bar: usize,
    state: Mutex<DevState>,
    stall_io: AtomicBool,
    translate_cap: AtomicBool,
    opens: AtomicUsize,
    flushes: AtomicUsize,
    io_pages: Mutex<Vec<(u8, Vec<u64>)>>,
    translate_ops: Mutex<Vec<TranslateOp>>,
    fail_next_io: Mutex<Option<u16>>,
}

fn registry() -> &'static Mutex<HashMap<u32, Arc<MockCtrl>>> {
    static CTRLS: OnceLock<Mutex<HashMap<u32, Arc<MockCtrl>>>> = OnceLock::new();
    CTRLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Controller model for a device name, created on first use.
pub fn mock_ctrl(devname: &str) -> Arc<MockCtrl> {
    let id: DeviceId = devname.parse().expect("test device name");
    MockCtrl::get(id.pci)
}

impl MockCtrl {
    fn get(pci: PciAddr) -> Arc<Self> {
        let mut ctrls = registry().lock().unwrap();
        ctrls
            .entry(pci.key())
            .or_insert_with(|| {
                let ctrl = Arc::new(Self::new());
                let service = ctrl.clone();
                thread::spawn(move || service.run());
                ctrl
            })
            .clone()
    }

    fn new() -> Self {
        let layout = Layout::from_size_align(BAR_LEN, PAGE).unwrap();
        let bar = unsafe { alloc_zeroed(layout) } as usize;
        assert!(bar != 0);

        let ctrl = Self {
            bar,
            state: Mutex::new(DevState::default()),
            stall_io: AtomicBool::new(false),
            translate_cap: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            io_pages: Mutex::new(Vec::new()),
            translate_ops: Mutex::new(Vec::new()),
            fail_next_io: Mutex::new(None),
        };
        // CAP: MQES=255, TO=4 (2 s), DSTRD=0, MPSMIN=0
        ctrl.write64(0x0, 255 | (4 << 24));
        // VS 1.4
        ctrl.write32(0x8, 0x0001_0400);
        ctrl
    }

    // register window accessors

    fn read32(&self, off: usize) -> u32 {
        unsafe { ((self.bar + off) as *const u32).read_volatile() }
    }

    fn write32(&self, off: usize, val: u32) {
        unsafe { ((self.bar + off) as *mut u32).write_volatile(val) }
    }

    fn read64(&self, off: usize) -> u64 {
        unsafe { ((self.bar + off) as *const u64).read_volatile() }
    }

    fn write64(&self, off: usize, val: u64) {
        unsafe { ((self.bar + off) as *mut u64).write_volatile(val) }
    }

    // test knobs

    /// Freeze I/O queue processing; admin traffic keeps flowing.
    pub fn stall_io(&self, stall: bool) {
        self.stall_io.store(stall, Ordering::Release);
    }

    /// Complete the next I/O command with the given status.
    pub fn fail_next_io(&self, sct: u16, sc: u16) {
        *self.fail_next_io.lock().unwrap() = Some((sct << 9) | (sc << 1));
    }

    /// Whether identify-controller advertises the translate extension.
    pub fn set_translate_cap(&self, cap: bool) {
        self.translate_cap.store(cap, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.read32(REG_CSTS) & 1 == 1
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    /// Pages touched by each data command, in execution order.
    pub fn io_pages(&self) -> Vec<(u8, Vec<u64>)> {
        self.io_pages.lock().unwrap().clone()
    }

    pub fn translate_ops(&self) -> Vec<TranslateOp> {
        self.translate_ops.lock().unwrap().clone()
    }

    pub fn clear_logs(&self) {
        self.io_pages.lock().unwrap().clear();
        self.translate_ops.lock().unwrap().clear();
    }

    // device model

    fn run(&self) {
        loop {
            self.step();
            thread::sleep(Duration::from_micros(20));
        }
    }

    fn step(&self) {
        let cc = self.read32(REG_CC);
        let mut state = self.state.lock().unwrap();

        if cc & 1 == 1 && !state.enabled {
            let aqa = self.read32(REG_AQA);
            let sq_depth = (aqa & 0xFFF) as usize + 1;
            let cq_depth = ((aqa >> 16) & 0xFFF) as usize + 1;
            state.sqs.insert(0, SqState {
                base: self.read64(REG_ASQ),
                depth: sq_depth,
                head: 0,
                cqid: 0,
            });
            state.cqs.insert(0, CqState {
                base: self.read64(REG_ACQ),
                depth: cq_depth,
                tail: 0,
                phase: true,
            });
            state.enabled = true;
            self.write32(REG_CSTS, 1);
        } else if cc & 1 == 0 && state.enabled {
            state.sqs.clear();
            state.cqs.clear();
            state.enabled = false;
            self.write32(REG_CSTS, 0);
        }

        if !state.enabled {
            return;
        }

        self.service_queue(&mut state, 0);
        if !self.stall_io.load(Ordering::Acquire) {
            let qids: Vec<u16> = state.sqs.keys().copied().filter(|&q| q != 0).collect();
            for qid in qids {
                self.service_queue(&mut state, qid);
            }
        }
    }

    fn service_queue(&self, state: &mut DevState, qid: u16) {
        loop {
            let (sqe, sq_head) = {
                let Some(sq) = state.sqs.get_mut(&qid) else { return };
                let tail = self.read32(DB_BASE + 2 * qid as usize * 4) as usize % sq.depth;
                if sq.head == tail {
                    return;
                }
                fence(Ordering::Acquire);
                let sqe = unsafe {
                    ((sq.base as usize + sq.head * 64) as *const Sqe).read_volatile()
                };
                sq.head = (sq.head + 1) % sq.depth;
                (sqe, sq.head)
            };

            let (cs, status_bits) = if qid == 0 {
                self.exec_admin(state, &sqe)
            } else {
                self.exec_io(state, &sqe)
            };

            let cqid = state.sqs[&qid].cqid;
            let cq = state.cqs.get_mut(&cqid).expect("sq without cq");
            let base = cq.base as usize + cq.tail * 16;
            unsafe {
                (base as *mut u32).write_volatile(cs);
                ((base + 4) as *mut u32).write_volatile(0);
                ((base + 8) as *mut u16).write_volatile(sq_head as u16);
                ((base + 10) as *mut u16).write_volatile(qid);
                ((base + 12) as *mut u16).write_volatile(sqe.cid);
                fence(Ordering::Release);
                ((base + 14) as *mut u16).write_volatile(status_bits | cq.phase as u16);
            }
            cq.tail += 1;
            if cq.tail == cq.depth {
                cq.tail = 0;
                cq.phase = !cq.phase;
            }
        }
    }

    fn exec_admin(&self, state: &mut DevState, sqe: &Sqe) -> (u32, u16) {
        match sqe.opcode {
            // identify
            6 => match sqe.dw10 & 0xFF {
                1 => {
                    self.fill_identify_controller(sqe.prp1);
                    (0, 0)
                }
                0 => {
                    if sqe.nsid == 0 || sqe.nsid > 2 {
                        return (0, 0x0B << 1);
                    }
                    fill_identify_namespace(sqe.prp1);
                    (0, 0)
                }
                _ => (0, 0x02 << 1),
            },
            // create I/O submission queue
            1 => {
                let qid = (sqe.dw10 & 0xFFFF) as u16;
                let depth = (sqe.dw10 >> 16) as usize + 1;
                let cqid = (sqe.dw11 >> 16) as u16;
                if !state.cqs.contains_key(&cqid) {
                    return (0, (1 << 9) | (0x00 << 1));
                }
                state.sqs.insert(qid, SqState { base: sqe.prp1, depth, head: 0, cqid });
                (0, 0)
            }
            // create I/O completion queue
            5 => {
                let qid = (sqe.dw10 & 0xFFFF) as u16;
                let depth = (sqe.dw10 >> 16) as usize + 1;
                state.cqs.insert(qid, CqState { base: sqe.prp1, depth, tail: 0, phase: true });
                (0, 0)
            }
            // delete I/O submission queue
            0 => {
                state.sqs.remove(&((sqe.dw10 & 0xFFFF) as u16));
                (0, 0)
            }
            // delete I/O completion queue
            4 => {
                state.cqs.remove(&((sqe.dw10 & 0xFFFF) as u16));
                (0, 0)
            }
            // set features
            9 => {
                if sqe.dw10 & 0xFF == 0x07 {
                    let sq0 = (sqe.dw11 & 0xFFFF).min(MAX_QUEUES - 1);
                    let cq0 = (sqe.dw11 >> 16).min(MAX_QUEUES - 1);
                    ((cq0 << 16) | sq0, 0)
                } else {
                    (0, 0)
                }
            }
            // get features
            10 => (0, 0),
            _ => (0, 0x01 << 1),
        }
    }

    fn fill_identify_controller(&self, prp1: u64) {
        let data = prp1 as *mut u8;
        unsafe {
            std::ptr::write_bytes(data, 0, PAGE);
            let put = |off: usize, bytes: &[u8]| {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(off), bytes.len());
            };
            // identification strings are space padded to field width
            put(4, b"MOCK0001            ");
            put(24, b"Mock NVMe Controller                    ");
            put(64, b"1.0     ");
            // MDTS: 2^8 pages = 1 MiB
            data.add(77).write(8);
            if self.translate_cap.load(Ordering::Acquire) {
                data.add(3072).write(1);
            }
        }
    }

    fn exec_io(&self, state: &mut DevState, sqe: &Sqe) -> (u32, u16) {
        let injected = self.fail_next_io.lock().unwrap().take();

        if sqe.opcode == 0 {
            self.flushes.fetch_add(1, Ordering::AcqRel);
            return (0, injected.unwrap_or(0));
        }
        if sqe.opcode != 1 && sqe.opcode != 2 {
            return (0, 0x01 << 1);
        }

        let write = sqe.opcode == 1;
        let slba = sqe.dw10 as u64 | ((sqe.dw11 as u64) << 32);
        let nlb = (sqe.dw12 & 0xFFFF) + 1;
        let nbytes = nlb as usize * BLOCK;
        let pages = gather_pages(sqe, nbytes);

        if sqe.dw12 & (1 << 24) != 0 {
            self.translate_ops.lock().unwrap().push(TranslateOp {
                write,
                slba,
                nlb,
                prp1: sqe.prp1,
            });
        }
        self.io_pages.lock().unwrap().push((sqe.opcode, pages.clone()));

        if let Some(bits) = injected {
            return (0, bits);
        }

        let store = state
            .storage
            .entry(sqe.nsid)
            .or_insert_with(|| vec![0; NS_BLOCKS as usize * BLOCK]);
        let mut off = slba as usize * BLOCK;
        let mut left = nbytes;
        for page in pages {
            let chunk = left.min(PAGE);
            unsafe {
                if write {
                    std::ptr::copy_nonoverlapping(page as *const u8, store.as_mut_ptr().add(off), chunk);
                } else {
                    std::ptr::copy_nonoverlapping(store.as_ptr().add(off), page as *mut u8, chunk);
                }
            }
            off += chunk;
            left -= chunk;
        }
        (0, 0)
    }
}

fn fill_identify_namespace(prp1: u64) {
    let data = prp1 as *mut u8;
    unsafe {
        std::ptr::write_bytes(data, 0, PAGE);
        // NSZE and NCAP
        (data as *mut u64).write(NS_BLOCKS);
        (data.add(8) as *mut u64).write(NS_BLOCKS);
        // FLBAS index 0; LBAF0 with LBADS=12 (4 KiB blocks)
        data.add(26).write(0);
        (data.add(128) as *mut u32).write(12 << 16);
    }
}

fn gather_pages(sqe: &Sqe, nbytes: usize) -> Vec<u64> {
    let npages = nbytes.div_ceil(PAGE);
    let mut pages = vec![sqe.prp1];
    match npages {
        0 | 1 => {}
        2 => pages.push(sqe.prp2),
        _ => {
            for i in 0..npages - 1 {
                let entry = unsafe { ((sqe.prp2 as usize + i * 8) as *const u64).read_volatile() };
                pages.push(entry);
            }
        }
    }
    pages
}

/// The pass-through handle the driver opens. DMA mappings are identity:
/// the IOVA of a host address is the address itself.
pub struct MockNvme {
    ctrl: Arc<MockCtrl>,
}

impl Passthru for MockNvme {
    fn open(pci: PciAddr) -> NvmeResult<Self> {
        let ctrl = MockCtrl::get(pci);
        ctrl.opens.fetch_add(1, Ordering::AcqRel);
        Ok(Self { ctrl })
    }

    fn mmio_map(&self, _bar: u32) -> NvmeResult<*mut u8> {
        Ok(self.ctrl.bar as *mut u8)
    }

    fn enable_bus_master(&self) -> NvmeResult<()> {
        Ok(())
    }

    fn map(&self, vaddr: usize, _len: usize) -> NvmeResult<u64> {
        Ok(vaddr as u64)
    }

    fn unmap(&self, _vaddr: usize) -> NvmeResult<()> {
        Ok(())
    }
}
