#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct Command {
    opcode: u8,
    flags: u8,
    cmd_id: u16,
    namespace_id: u32,
    _reserved: u64,
    metadata_ptr: u64,
    data_ptr: [u64; 2],
    cmd_10: u32,
    cmd_11: u32,
    cmd_12: u32,
    cmd_13: u32,
    cmd_14: u32,
    cmd_15: u32,
}

#[derive(Debug)]
pub enum QueueType {
    Submission,
    Completion,
}

#[derive(Debug)]
pub enum IdentifyType {
    Namespace(u32),
    Controller,
    NamespaceList(u32),
}

/// Feature identifiers used by get/set features.
#[derive(Debug, Clone, Copy)]
#[allow(unused)]
pub enum FeatureId {
    Arbitration = 0x01,
    PowerManagement = 0x02,
    TemperatureThreshold = 0x04,
    NumberOfQueues = 0x07,
}

const OPCODE_SUB_QUEUE_DELETE: u8 = 0;
const OPCODE_FLUSH: u8 = 0;
const OPCODE_WRITE: u8 = 1;
const OPCODE_SUB_QUEUE_CREATE: u8 = 1;
const OPCODE_READ: u8 = 2;
const OPCODE_COMP_QUEUE_DELETE: u8 = 4;
const OPCODE_COMP_QUEUE_CREATE: u8 = 5;
const OPCODE_IDENTIFY: u8 = 6;
const OPCODE_SET_FEATURES: u8 = 9;
const OPCODE_GET_FEATURES: u8 = 10;

/// Vendor-extended translate marker, a single flag bit in DW12 that the
/// device interprets on read/write commands. Never sent to controllers
/// that do not advertise the extension.
pub const CONFIG_PAGE_FLAG: u32 = 1 << 24;

impl Command {
    pub fn read_write(
        cmd_id: u16,
        namespace_id: u32,
        lba: u64,
        block_count: u16,
        data_ptr: [u64; 2],
        is_write: bool,
    ) -> Self {
        Self {
            opcode: if is_write { OPCODE_WRITE } else { OPCODE_READ },
            cmd_id,
            namespace_id,
            data_ptr,
            cmd_10: lba as u32,
            cmd_11: (lba >> 32) as u32,
            cmd_12: block_count as u32,
            ..Default::default()
        }
    }

    /// Read/write with the translate config-page flag set in DW12.
    pub fn read_write_config(
        cmd_id: u16,
        namespace_id: u32,
        lba: u64,
        block_count: u16,
        data_ptr: [u64; 2],
        is_write: bool,
    ) -> Self {
        let mut cmd = Self::read_write(cmd_id, namespace_id, lba, block_count, data_ptr, is_write);
        cmd.cmd_12 |= CONFIG_PAGE_FLAG;
        cmd
    }

    pub fn flush(cmd_id: u16, namespace_id: u32) -> Self {
        Self {
            opcode: OPCODE_FLUSH,
            cmd_id,
            namespace_id,
            ..Default::default()
        }
    }

    pub fn create_queue(
        cmd_id: u16,
        queue_id: u16,
        address: u64,
        size: u16,
        target: QueueType,
        cqueue_id: Option<u16>,
    ) -> Command {
        let (opcode, cmd_11) = match target {
            QueueType::Submission => {
                let id = cqueue_id.unwrap_or(0);
                (OPCODE_SUB_QUEUE_CREATE, ((id as u32) << 16) | 1)
            }
            QueueType::Completion => (OPCODE_COMP_QUEUE_CREATE, 1),
        };

        Self {
            opcode,
            cmd_id,
            data_ptr: [address, 0],
            cmd_10: ((size as u32) << 16) | (queue_id as u32),
            cmd_11,
            ..Default::default()
        }
    }

    pub fn delete_queue(cmd_id: u16, queue_id: u16, target: QueueType) -> Self {
        let opcode = match target {
            QueueType::Submission => OPCODE_SUB_QUEUE_DELETE,
            QueueType::Completion => OPCODE_COMP_QUEUE_DELETE,
        };

        Self {
            opcode,
            cmd_id,
            cmd_10: queue_id as u32,
            ..Default::default()
        }
    }

    pub fn identify(cmd_id: u16, address: u64, target: IdentifyType) -> Self {
        let (namespace_id, cmd_10) = match target {
            IdentifyType::Namespace(id) => (id, 0),
            IdentifyType::Controller => (0, 1),
            IdentifyType::NamespaceList(base) => (base, 2),
        };

        Self {
            opcode: OPCODE_IDENTIFY,
            cmd_id,
            namespace_id,
            data_ptr: [address, 0],
            cmd_10,
            ..Default::default()
        }
    }

    /// Set a feature value. The result is returned in CQE DW0 only; no
    /// data page travels with the command for the features used here.
    pub fn set_features(cmd_id: u16, feature: FeatureId, value: u32, save: bool) -> Self {
        Self {
            opcode: OPCODE_SET_FEATURES,
            cmd_id,
            cmd_10: (feature as u32) | if save { 1 << 31 } else { 0 },
            cmd_11: value,
            ..Default::default()
        }
    }

    #[allow(unused)]
    pub fn get_features(cmd_id: u16, feature: FeatureId) -> Self {
        Self {
            opcode: OPCODE_GET_FEATURES,
            cmd_id,
            cmd_10: feature as u32,
            ..Default::default()
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }
}
