//! SCSI command boundary
//!
//! The engine does not marshal specific SCSI commands. Callers hand it a CDB,
//! a direction and an expected transfer length; it carries them in a SCSI
//! Command PDU, gathers Data-In, answers R2Ts with Data-Out and returns the
//! status, sense and data from the SCSI Response.

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext, Reply};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{flags, opcode, pdu_flags, InPdu, Pdu, NO_PDU};
use crate::session::SessionType;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

/// SCSI status codes
pub use crate::pdu::scsi_status;

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Direction of the data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
}

/// A command to carry to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommand {
    pub cdb: Vec<u8>,
    pub direction: DataDirection,
    pub expected_transfer_length: u32,
    /// Data to send for a write
    pub data_out: Vec<u8>,
}

impl ScsiCommand {
    /// Command without a data phase
    pub fn new(cdb: impl Into<Vec<u8>>) -> Self {
        ScsiCommand {
            cdb: cdb.into(),
            direction: DataDirection::None,
            expected_transfer_length: 0,
            data_out: Vec::new(),
        }
    }

    /// Command reading up to `len` bytes from the target
    pub fn read(cdb: impl Into<Vec<u8>>, len: u32) -> Self {
        ScsiCommand {
            cdb: cdb.into(),
            direction: DataDirection::Read,
            expected_transfer_length: len,
            data_out: Vec::new(),
        }
    }

    /// Command sending `data` to the target
    pub fn write(cdb: impl Into<Vec<u8>>, data: Vec<u8>) -> Self {
        ScsiCommand {
            cdb: cdb.into(),
            direction: DataDirection::Write,
            expected_transfer_length: data.len() as u32,
            data_out: data,
        }
    }

    pub fn test_unit_ready() -> Self {
        ScsiCommand::new(vec![0u8; 6])
    }

    /// READ(10) of `blocks` blocks at `lba`
    pub fn read10(lba: u32, blocks: u16, block_size: u32) -> Self {
        let mut cdb = vec![0u8; 10];
        cdb[0] = 0x28;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        ScsiCommand::read(cdb, blocks as u32 * block_size)
    }

    /// WRITE(10) of `data` at `lba`
    pub fn write10(lba: u32, data: Vec<u8>, block_size: u32) -> Self {
        let blocks = (data.len() as u32 / block_size.max(1)) as u16;
        let mut cdb = vec![0u8; 10];
        cdb[0] = 0x2A;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        ScsiCommand::write(cdb, data)
    }
}

/// Handle to a queued command, for abort-task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    pub lun: u32,
    pub itt: u32,
    pub cmdsn: u32,
}

/// Engine-side state of a command in flight
#[derive(Debug, Clone)]
pub(crate) struct ScsiTask {
    pub(crate) lun: u32,
    pub(crate) expected_transfer_length: u32,
    pub(crate) data_out: Vec<u8>,
    pub(crate) data_in: Vec<u8>,
}

impl ScsiTask {
    /// Drop data gathered on a connection that went away
    pub(crate) fn reset(&mut self) {
        self.data_in.clear();
    }
}

/// Residual count reported in a SCSI Response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residual {
    #[default]
    None,
    /// Target transferred fewer bytes than expected
    Underflow(u32),
    /// Target had more bytes than expected
    Overflow(u32),
}

impl Residual {
    fn from_header(hdr_flags: u8, count: u32) -> Self {
        if hdr_flags & flags::RESIDUAL_UNDERFLOW != 0 {
            Residual::Underflow(count)
        } else if hdr_flags & flags::RESIDUAL_OVERFLOW != 0 {
            Residual::Overflow(count)
        } else {
            Residual::None
        }
    }
}

/// What the target returned for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiTaskResult {
    /// SCSI status byte
    pub status: u8,
    pub sense: Option<SenseData>,
    pub data_in: Vec<u8>,
    pub residual: Residual,
}

/// SCSI sense data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    /// 0x70/0x71 fixed format, 0x72/0x73 descriptor format
    pub response_code: u8,
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u64,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            response_code: 0x70,
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    /// Decode fixed or descriptor format sense
    pub fn parse(data: &[u8]) -> Option<Self> {
        let response_code = data.first()? & 0x7f;
        match response_code {
            0x70 | 0x71 => {
                if data.len() < 14 {
                    // short fixed sense still carries the key
                    return Some(SenseData {
                        response_code,
                        sense_key: data.get(2).map_or(0, |b| b & 0x0f),
                        asc: 0,
                        ascq: 0,
                        information: 0,
                    });
                }
                Some(SenseData {
                    response_code,
                    sense_key: data[2] & 0x0f,
                    asc: data[12],
                    ascq: data[13],
                    information: BigEndian::read_u32(&data[3..7]) as u64,
                })
            }
            0x72 | 0x73 => {
                if data.len() < 4 {
                    return None;
                }
                let mut sense = SenseData {
                    response_code,
                    sense_key: data[1] & 0x0f,
                    asc: data[2],
                    ascq: data[3],
                    information: 0,
                };
                // walk descriptors for the Information descriptor (type 0)
                let end = data.len().min(8 + data.get(7).copied().unwrap_or(0) as usize);
                let mut pos = 8;
                while pos + 2 <= end {
                    let kind = data[pos];
                    let len = data[pos + 1] as usize;
                    if kind == 0x00 && len >= 0x0a && pos + 12 <= end {
                        sense.information = BigEndian::read_u64(&data[pos + 4..pos + 12]);
                    }
                    pos += 2 + len;
                }
                Some(sense)
            }
            _ => None,
        }
    }

    pub fn is_unit_attention(&self) -> bool {
        self.sense_key == sense_key::UNIT_ATTENTION
    }

    pub fn sense_key_str(&self) -> &'static str {
        match self.sense_key {
            sense_key::NO_SENSE => "NO SENSE",
            sense_key::RECOVERED_ERROR => "RECOVERED ERROR",
            sense_key::NOT_READY => "NOT READY",
            sense_key::MEDIUM_ERROR => "MEDIUM ERROR",
            sense_key::HARDWARE_ERROR => "HARDWARE ERROR",
            sense_key::ILLEGAL_REQUEST => "ILLEGAL REQUEST",
            sense_key::UNIT_ATTENTION => "UNIT ATTENTION",
            sense_key::DATA_PROTECT => "DATA PROTECT",
            sense_key::BLANK_CHECK => "BLANK CHECK",
            sense_key::ABORTED_COMMAND => "ABORTED COMMAND",
            sense_key::VOLUME_OVERFLOW => "VOLUME OVERFLOW",
            sense_key::MISCOMPARE => "MISCOMPARE",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SenseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (0x{:x}) ASC/ASCQ 0x{:02x}/0x{:02x}",
            self.sense_key_str(),
            self.sense_key,
            self.asc,
            self.ascq
        )
    }
}

/// Map a SCSI status byte to the callback status
pub(crate) fn command_status(status: u8) -> CommandStatus {
    match status {
        scsi_status::GOOD | scsi_status::CONDITION_MET => CommandStatus::Good,
        scsi_status::CHECK_CONDITION => CommandStatus::CheckCondition,
        _ => CommandStatus::Error,
    }
}

impl IscsiContext {
    /// Queue a SCSI command for `lun`.
    ///
    /// Fails synchronously when not logged in, on a discovery session, or
    /// when the CDB is longer than 16 bytes. `cb` receives
    /// [`CommandData::Scsi`] with the status, sense and any Data-In.
    pub fn scsi_command_async(&mut self, lun: u32, command: ScsiCommand, cb: CommandCallback) -> IscsiResult<TaskRef> {
        self.queue_scsi(lun, command, 0, cb)
    }

    pub(crate) fn queue_scsi(
        &mut self,
        lun: u32,
        command: ScsiCommand,
        engine_flags: u32,
        cb: CommandCallback,
    ) -> IscsiResult<TaskRef> {
        if !self.login.logged_in {
            let msg = "Trying to send a SCSI command while not logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }
        if self.session_type == Some(SessionType::Discovery) {
            let msg = "Trying to send a SCSI command on a discovery session".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }
        if command.direction == DataDirection::Write
            && command.data_out.len() != command.expected_transfer_length as usize
        {
            return Err(IscsiError::InvalidPdu(format!(
                "write of {} bytes with expected transfer length {}",
                command.data_out.len(),
                command.expected_transfer_length
            )));
        }

        let itt = self.next_itt();
        let mut pdu = Pdu::new(opcode::SCSI_COMMAND, opcode::SCSI_RESPONSE, itt, engine_flags);
        pdu.set_cdb(&command.cdb)?;
        let mut cmd_flags = flags::FINAL | flags::ATTR_SIMPLE;
        match command.direction {
            DataDirection::Read => cmd_flags |= flags::READ,
            DataDirection::Write => cmd_flags |= flags::WRITE,
            DataDirection::None => {}
        }
        pdu.set_pdu_flags(cmd_flags);
        pdu.set_lun(lun);
        pdu.set_expxferlen(command.expected_transfer_length);

        if command.direction == DataDirection::Write && self.params.immediate_data && !command.data_out.is_empty() {
            let limit = self
                .params
                .first_burst_length
                .min(self.params.target_max_recv_data_segment_length) as usize;
            let len = command.data_out.len().min(limit);
            if len > 0 {
                pdu.add_data(&command.data_out[..len])?;
            }
        }

        pdu.timeout = self.scsi_timeout;
        pdu.task = Some(ScsiTask {
            lun,
            expected_transfer_length: command.expected_transfer_length,
            data_out: command.data_out,
            data_in: Vec::new(),
        });
        pdu.set_callback(cb);
        self.queue(pdu)?;

        let cmdsn = self
            .pending
            .back()
            .filter(|p| p.itt() == itt)
            .map_or(0, |p| p.cmdsn());
        Ok(TaskRef { lun, itt, cmdsn })
    }

    pub(crate) fn process_scsi_reply(&mut self, pdu: &mut Pdu, inpdu: &InPdu) -> Reply {
        let response = inpdu.byte(2);
        let status = inpdu.byte(3);
        if response != 0 {
            let msg = format!("Target failed command itt 0x{:08x}, response 0x{:02x}", pdu.itt(), response);
            warn!("{}", msg);
            self.set_error(msg.clone());
            return Reply::Complete(CommandStatus::Error, CommandData::Message(msg));
        }

        let data = inpdu.data();
        let sense = if data.len() >= 2 {
            let len = (BigEndian::read_u16(&data[0..2]) as usize).min(data.len() - 2);
            SenseData::parse(&data[2..2 + len])
        } else {
            None
        };
        if let Some(sense) = &sense {
            debug!("Sense for itt 0x{:08x}: {}", pdu.itt(), sense);
        }

        let data_in = pdu.task.as_mut().map(|t| std::mem::take(&mut t.data_in)).unwrap_or_default();
        let result = ScsiTaskResult {
            status,
            sense,
            data_in,
            residual: Residual::from_header(inpdu.flags(), inpdu.u32_at(44)),
        };
        Reply::Complete(command_status(status), CommandData::Scsi(result))
    }

    pub(crate) fn process_data_in(&mut self, pdu: &mut Pdu, inpdu: &InPdu) -> Reply {
        let offset = inpdu.u32_at(40) as usize;
        let data = inpdu.data();
        let task = match pdu.task.as_mut() {
            Some(task) => task,
            None => {
                return Reply::Complete(
                    CommandStatus::Error,
                    CommandData::Message("Data-In for a PDU without a SCSI task".to_string()),
                )
            }
        };

        let end = offset + data.len();
        if end > task.expected_transfer_length as usize {
            let msg = format!(
                "Data-In at offset {} with {} bytes overruns expected transfer length {}",
                offset,
                data.len(),
                task.expected_transfer_length
            );
            warn!("{}", msg);
            return Reply::Complete(CommandStatus::Error, CommandData::Message(msg));
        }
        if task.data_in.len() < end {
            if let Err(e) = task.data_in.try_reserve(end - task.data_in.len()) {
                return Reply::Complete(CommandStatus::Error, CommandData::Message(format!("Data-In buffer: {}", e)));
            }
            task.data_in.resize(end, 0);
        }
        task.data_in[offset..end].copy_from_slice(data);

        if inpdu.flags() & flags::STATUS == 0 {
            return Reply::Pending;
        }

        let status = inpdu.byte(3);
        let result = ScsiTaskResult {
            status,
            sense: None,
            data_in: std::mem::take(&mut task.data_in),
            residual: Residual::from_header(inpdu.flags(), inpdu.u32_at(44)),
        };
        Reply::Complete(command_status(status), CommandData::Scsi(result))
    }

    /// Answer an R2T with Data-Out PDUs no larger than the target accepts
    pub(crate) fn process_r2t(&mut self, pdu: &mut Pdu, inpdu: &InPdu) -> Reply {
        let ttt = inpdu.ttt();
        let offset = inpdu.u32_at(40) as usize;
        let length = inpdu.u32_at(44) as usize;
        let itt = pdu.itt();

        let task = match pdu.task.as_ref() {
            Some(task) => task,
            None => {
                return Reply::Complete(
                    CommandStatus::Error,
                    CommandData::Message("R2T for a PDU without a SCSI task".to_string()),
                )
            }
        };
        if offset + length > task.data_out.len() {
            let msg = format!(
                "R2T for {} bytes at offset {} beyond the {} bytes to write",
                length,
                offset,
                task.data_out.len()
            );
            warn!("{}", msg);
            return Reply::Complete(CommandStatus::Error, CommandData::Message(msg));
        }

        let chunk = self.params.target_max_recv_data_segment_length.max(512) as usize;
        let lun = task.lun;
        let mut burst = Vec::new();
        let mut pos = offset;
        let mut datasn = 0u32;
        while pos < offset + length {
            let len = chunk.min(offset + length - pos);
            let mut out = Pdu::new(
                opcode::SCSI_DATA_OUT,
                NO_PDU,
                itt,
                pdu_flags::DELETE_WHEN_SENT | pdu_flags::NO_CALLBACK | pdu_flags::DROP_ON_RECONNECT,
            );
            out.set_pdu_flags(if pos + len == offset + length { flags::FINAL } else { 0 });
            out.set_lun(lun);
            out.set_ttt(ttt);
            out.set_datasn(datasn);
            out.set_bufferoffset(pos as u32);
            if let Err(e) = out.add_data(&task.data_out[pos..pos + len]) {
                return Reply::Complete(CommandStatus::Error, CommandData::Message(e.to_string()));
            }
            burst.push(out);
            pos += len;
            datasn += 1;
        }

        debug!(
            "R2T itt=0x{:08x} ttt=0x{:08x}: sending {} bytes at {} in {} Data-Out PDUs",
            itt,
            ttt,
            length,
            offset,
            burst.len()
        );
        for out in burst {
            self.queue_or_fail(out);
        }
        Reply::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::BHS_SIZE;
    use crate::testing::{fixed_sense, logged_in_context};
    use crate::transport::Readiness;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(CommandStatus, CommandData)>>>;

    fn capture() -> (Seen, CommandCallback) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        (seen, Box::new(move |_ctx, status, data| seen2.lock().unwrap().push((status, data))))
    }

    fn reply_header(ctx: &IscsiContext, op: u8, itt: u32, hdr_flags: u8) -> [u8; BHS_SIZE] {
        let mut hdr = [0u8; BHS_SIZE];
        hdr[0] = op;
        hdr[1] = hdr_flags;
        BigEndian::write_u32(&mut hdr[16..20], itt);
        BigEndian::write_u32(&mut hdr[24..28], ctx.sequence().statsn.wrapping_add(1));
        BigEndian::write_u32(&mut hdr[28..32], ctx.sequence().expcmdsn);
        BigEndian::write_u32(&mut hdr[32..36], ctx.sequence().maxcmdsn);
        hdr
    }

    #[test]
    fn test_fixed_sense_parse() {
        let data = fixed_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0);
        assert_eq!(
            SenseData::parse(&data),
            Some(SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0))
        );
    }

    #[test]
    fn test_descriptor_sense() {
        let mut data = vec![0x72, sense_key::UNIT_ATTENTION, asc::POWER_ON_RESET, 0x00, 0, 0, 0, 12];
        data.extend_from_slice(&[0x00, 0x0a, 0x80, 0x00, 0, 0, 0, 0, 0, 0, 0x12, 0x34]);
        let sense = SenseData::parse(&data).unwrap();
        assert!(sense.is_unit_attention());
        assert_eq!(sense.asc, asc::POWER_ON_RESET);
        assert_eq!(sense.information, 0x1234);
    }

    #[test]
    fn test_unknown_sense_format() {
        assert_eq!(SenseData::parse(&[0x00, 0x00]), None);
        assert_eq!(SenseData::parse(&[]), None);
    }

    #[test]
    fn test_read10_cdb() {
        let cmd = ScsiCommand::read10(100, 10, 512);
        assert_eq!(cmd.cdb[0], 0x28);
        assert_eq!(BigEndian::read_u32(&cmd.cdb[2..6]), 100);
        assert_eq!(BigEndian::read_u16(&cmd.cdb[7..9]), 10);
        assert_eq!(cmd.expected_transfer_length, 5120);
        assert_eq!(cmd.direction, DataDirection::Read);
    }

    #[test]
    fn test_command_requires_login() {
        let (mut ctx, _peer) = crate::testing::connected_context(SessionType::Normal);
        let (seen, cb) = capture();
        assert!(ctx.scsi_command_async(0, ScsiCommand::test_unit_ready(), cb).is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_long_cdb_rejected() {
        let (mut ctx, _peer) = logged_in_context();
        let (_seen, cb) = capture();
        assert!(ctx.scsi_command_async(0, ScsiCommand::new(vec![0u8; 17]), cb).is_err());
        assert_eq!(ctx.outbound_len(), 0);
    }

    #[test]
    fn test_read_gathers_data_in() {
        let (mut ctx, peer) = logged_in_context();
        let (seen, cb) = capture();
        let task = ctx.scsi_command_async(1, ScsiCommand::read10(0, 2, 4), cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        assert_eq!(frame[1], flags::FINAL | flags::ATTR_SIMPLE | flags::READ);
        assert_eq!(BigEndian::read_u32(&frame[20..24]), 8);
        assert_eq!(BigEndian::read_u32(&frame[24..28]), task.cmdsn);

        let hdr = reply_header(&ctx, opcode::SCSI_DATA_IN, task.itt, 0);
        peer.push_pdu(&hdr, b"abcd");
        let mut hdr = reply_header(&ctx, opcode::SCSI_DATA_IN, task.itt, flags::FINAL | flags::STATUS);
        BigEndian::write_u32(&mut hdr[40..44], 4);
        peer.push_pdu(&hdr, b"efgh");
        ctx.service(Readiness::READABLE).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, CommandStatus::Good);
        match &seen[0].1 {
            CommandData::Scsi(result) => assert_eq!(result.data_in, b"abcdefgh"),
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[test]
    fn test_check_condition_carries_sense() {
        let (mut ctx, peer) = logged_in_context();
        let (seen, cb) = capture();
        let task = ctx.scsi_command_async(0, ScsiCommand::test_unit_ready(), cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();

        let mut hdr = reply_header(&ctx, opcode::SCSI_RESPONSE, task.itt, flags::FINAL);
        hdr[3] = scsi_status::CHECK_CONDITION;
        let sense = fixed_sense(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT, 0);
        let mut data = vec![0u8, sense.len() as u8];
        data.extend_from_slice(&sense);
        peer.push_pdu(&hdr, &data);
        ctx.service(Readiness::READABLE).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, CommandStatus::CheckCondition);
        match &seen[0].1 {
            CommandData::Scsi(result) => {
                let sense = result.sense.as_ref().unwrap();
                assert_eq!(sense.sense_key, sense_key::NOT_READY);
                assert_eq!(sense.asc, asc::MEDIUM_NOT_PRESENT);
            }
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[test]
    fn test_r2t_chunks_data_out() {
        let (mut ctx, peer) = logged_in_context();
        ctx.params.immediate_data = false;
        ctx.params.target_max_recv_data_segment_length = 1024;
        let (seen, cb) = capture();
        let data: Vec<u8> = (0..2560u32).map(|i| i as u8).collect();
        let task = ctx.scsi_command_async(0, ScsiCommand::write10(0, data.clone(), 512), cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        assert_eq!(frame.len(), BHS_SIZE);

        let mut hdr = reply_header(&ctx, opcode::R2T, task.itt, flags::FINAL);
        BigEndian::write_u32(&mut hdr[20..24], 0x55);
        BigEndian::write_u32(&mut hdr[24..28], ctx.sequence().statsn);
        BigEndian::write_u32(&mut hdr[40..44], 0);
        BigEndian::write_u32(&mut hdr[44..48], 2560);
        peer.push_pdu(&hdr, &[]);
        ctx.service(Readiness::READABLE).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();

        let frames = peer.take_written_pdus();
        assert_eq!(frames.len(), 3);
        let mut sent = Vec::new();
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f[0], opcode::SCSI_DATA_OUT);
            assert_eq!(BigEndian::read_u32(&f[16..20]), task.itt);
            assert_eq!(BigEndian::read_u32(&f[20..24]), 0x55);
            assert_eq!(BigEndian::read_u32(&f[36..40]), i as u32);
            assert_eq!(BigEndian::read_u32(&f[40..44]), (i * 1024) as u32);
            let len = BigEndian::read_u24(&f[5..8]) as usize;
            sent.extend_from_slice(&f[BHS_SIZE..BHS_SIZE + len]);
        }
        assert_eq!(frames[2][1], flags::FINAL);
        assert_eq!(frames[0][1], 0);
        assert_eq!(sent, data);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.awaiting_len(), 1);
    }

    #[test]
    fn test_immediate_data_attached() {
        let (mut ctx, peer) = logged_in_context();
        ctx.params.target_max_recv_data_segment_length = 8192;
        let (_seen, cb) = capture();
        ctx.scsi_command_async(0, ScsiCommand::write10(0, vec![7u8; 512], 512), cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        assert_eq!(BigEndian::read_u24(&frame[5..8]), 512);
        assert_eq!(frame[1] & flags::WRITE, flags::WRITE);
    }
}
