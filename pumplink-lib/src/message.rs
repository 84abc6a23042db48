use crate::checksum::{crc16, crc16_le_bytes};
use crate::constants::{ENVELOPE_CRC_SIZE, ENVELOPE_HEADER_SIZE};
use crate::error::PumpError;
use crate::packet::fragment;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// GATT characteristic a message travels on. Opcodes are only unique per
/// characteristic: the JPAKE rounds reuse values the status queries use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Characteristic {
    Authorization = 1,
    CurrentStatus = 2,
    HistoryLog = 3,
}

/// Which side sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// Every request/response pair the driver knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CentralChallenge,
    PumpChallenge,
    Jpake1a,
    Jpake1b,
    Jpake2,
    Jpake3SessionKey,
    Jpake4KeyConfirmation,
    CurrentEgv,
    InsulinStatus,
    CurrentBasalStatus,
    CurrentBatteryV1,
    HomeScreenMirror,
    HistoryLogStatus,
    HistoryLog,
    PumpFeatures,
    PumpVersion,
    PumpGlobals,
    PumpSettings,
    ControlIqIob,
    BolusCalcSnapshot,
    CurrentBatteryV2,
    LastBolusStatus,
    /// Pushed by the pump after a `HistoryLog` request; there is no request side.
    HistoryLogStream,
}

impl MessageKind {
    pub const ALL: [MessageKind; 23] = [
        MessageKind::CentralChallenge,
        MessageKind::PumpChallenge,
        MessageKind::Jpake1a,
        MessageKind::Jpake1b,
        MessageKind::Jpake2,
        MessageKind::Jpake3SessionKey,
        MessageKind::Jpake4KeyConfirmation,
        MessageKind::CurrentEgv,
        MessageKind::InsulinStatus,
        MessageKind::CurrentBasalStatus,
        MessageKind::CurrentBatteryV1,
        MessageKind::HomeScreenMirror,
        MessageKind::HistoryLogStatus,
        MessageKind::HistoryLog,
        MessageKind::PumpFeatures,
        MessageKind::PumpVersion,
        MessageKind::PumpGlobals,
        MessageKind::PumpSettings,
        MessageKind::ControlIqIob,
        MessageKind::BolusCalcSnapshot,
        MessageKind::CurrentBatteryV2,
        MessageKind::LastBolusStatus,
        MessageKind::HistoryLogStream,
    ];

    pub fn characteristic(self) -> Characteristic {
        match self {
            MessageKind::CentralChallenge
            | MessageKind::PumpChallenge
            | MessageKind::Jpake1a
            | MessageKind::Jpake1b
            | MessageKind::Jpake2
            | MessageKind::Jpake3SessionKey
            | MessageKind::Jpake4KeyConfirmation => Characteristic::Authorization,
            MessageKind::HistoryLogStream => Characteristic::HistoryLog,
            _ => Characteristic::CurrentStatus,
        }
    }

    /// Opcode of the response; requests use `response_opcode() - 1`.
    pub fn response_opcode(self) -> u8 {
        match self {
            MessageKind::CentralChallenge => 17,
            MessageKind::PumpChallenge => 19,
            MessageKind::Jpake1a => 33,
            MessageKind::Jpake1b => 35,
            MessageKind::Jpake2 => 37,
            MessageKind::Jpake3SessionKey => 39,
            MessageKind::Jpake4KeyConfirmation => 41,
            MessageKind::CurrentEgv => 35,
            MessageKind::InsulinStatus => 37,
            MessageKind::CurrentBasalStatus => 41,
            MessageKind::CurrentBatteryV1 => 53,
            MessageKind::HomeScreenMirror => 57,
            MessageKind::HistoryLogStatus => 59,
            MessageKind::HistoryLog => 61,
            MessageKind::PumpFeatures => 79,
            MessageKind::PumpVersion => 85,
            MessageKind::PumpGlobals => 87,
            MessageKind::PumpSettings => 105,
            MessageKind::ControlIqIob => 109,
            MessageKind::BolusCalcSnapshot => 115,
            MessageKind::CurrentBatteryV2 => 145,
            MessageKind::LastBolusStatus => 165,
            MessageKind::HistoryLogStream => 129,
        }
    }

    pub fn request_opcode(self) -> Option<u8> {
        match self {
            MessageKind::HistoryLogStream => None,
            other => Some(other.response_opcode() - 1),
        }
    }

    pub fn opcode(self, direction: Direction) -> Option<u8> {
        match direction {
            Direction::HostToDevice => self.request_opcode(),
            Direction::DeviceToHost => Some(self.response_opcode()),
        }
    }

    /// Resolve an opcode seen on a characteristic.
    pub fn lookup(characteristic: Characteristic, opcode: u8) -> Option<(MessageKind, Direction)> {
        Self::ALL
            .iter()
            .filter(|kind| kind.characteristic() == characteristic)
            .find_map(|&kind| {
                if kind.response_opcode() == opcode {
                    Some((kind, Direction::DeviceToHost))
                } else if kind.request_opcode() == Some(opcode) {
                    Some((kind, Direction::HostToDevice))
                } else {
                    None
                }
            })
    }
}

/// `[opcode][tx id][cargo len][cargo..][crc16 LE]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: u8,
    pub tx_id: u8,
    pub cargo: Bytes,
}

impl Envelope {
    pub fn new(opcode: u8, tx_id: u8, cargo: Bytes) -> Result<Self, PumpError> {
        if cargo.len() > u8::MAX as usize {
            return Err(PumpError::InvalidLength);
        }
        Ok(Self { opcode, tx_id, cargo })
    }

    pub fn request(kind: MessageKind, tx_id: u8, cargo: Bytes) -> Result<Self, PumpError> {
        let opcode = kind.request_opcode().ok_or(PumpError::UnknownOpcode(kind.response_opcode()))?;
        Self::new(opcode, tx_id, cargo)
    }

    pub fn response(kind: MessageKind, tx_id: u8, cargo: Bytes) -> Result<Self, PumpError> {
        Self::new(kind.response_opcode(), tx_id, cargo)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.cargo.len() + ENVELOPE_CRC_SIZE);
        out.put_u8(self.opcode);
        out.put_u8(self.tx_id);
        out.put_u8(self.cargo.len() as u8);
        out.extend_from_slice(&self.cargo);
        let crc = crc16(&out);
        out.extend_from_slice(&crc16_le_bytes(crc));
        out.freeze()
    }

    /// Encode and split into transport chunks.
    pub fn to_chunks(&self) -> Result<Vec<Bytes>, PumpError> {
        fragment(self.tx_id, &self.encode())
    }

    /// Parse a reassembled message, verifying the checksum before the cargo
    /// is exposed.
    pub fn parse(bytes: Bytes) -> Result<Self, PumpError> {
        let minimum = ENVELOPE_HEADER_SIZE + ENVELOPE_CRC_SIZE;
        if bytes.len() < minimum {
            return Err(PumpError::InsufficientData {
                expected: minimum,
                actual: bytes.len(),
            });
        }
        let cargo_len = bytes[2] as usize;
        let body_len = ENVELOPE_HEADER_SIZE + cargo_len;
        if bytes.len() != body_len + ENVELOPE_CRC_SIZE {
            return Err(PumpError::InvalidLength);
        }

        let expected = crc16(&bytes[..body_len]);
        let actual = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
        if expected != actual {
            return Err(PumpError::Checksum { expected, actual });
        }

        Ok(Self {
            opcode: bytes[0],
            tx_id: bytes[1],
            cargo: bytes.slice(ENVELOPE_HEADER_SIZE..body_len),
        })
    }
}
