// Protocol constants for the pump link

/// Largest chunk the bearer carries (2-byte header + payload)
pub const MAX_CHUNK_SIZE: usize = 20;

/// Size of the chunk header (remaining nibble byte + transaction id)
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Payload bytes available in one chunk
pub const CHUNK_PAYLOAD_SIZE: usize = MAX_CHUNK_SIZE - CHUNK_HEADER_SIZE;

/// The remaining-packets nibble counts down from 15, so one message spans at most 16 chunks
pub const MAX_CHUNKS_PER_MESSAGE: usize = 16;

/// Envelope header: opcode, transaction id, cargo length
pub const ENVELOPE_HEADER_SIZE: usize = 3;

/// Trailing CRC-16 of the envelope
pub const ENVELOPE_CRC_SIZE: usize = 2;

/// Pump clock epoch, 2008-01-01T00:00:00, expressed as Unix seconds
pub const PUMP_EPOCH_UNIX_SECS: i64 = 1_199_145_600;

/// Milliunits per unit of insulin
pub const MILLIUNITS_PER_UNIT: f32 = 1000.0;

/// History-log record sizes
pub const HISTORY_RECORD_SIZE: usize = 26;
pub const LEGACY_HISTORY_RECORD_SIZE: usize = 18;
pub const HISTORY_PAYLOAD_SIZE: usize = 16;

/// History-log event type ids that carry delivery data
pub const EVENT_BASAL_DELIVERY: u16 = 279;
pub const EVENT_BOLUS_DELIVERY: u16 = 280;

/// CGM sensor-fault guard: readings above this are never plausible
pub const CGM_MAX_PLAUSIBLE_MG_DL: u16 = 500;

/// Bolus ceiling no configuration may exceed (25 U)
pub const ABSOLUTE_MAX_BOLUS_MILLIUNITS: u32 = 25_000;

/// One half of the EC-JPAKE round-1 payload (point + ZKP)
pub const JPAKE_ROUND1_HALF_SIZE: usize = 165;
pub const JPAKE_ROUND1_SIZE: usize = 2 * JPAKE_ROUND1_HALF_SIZE;
pub const JPAKE_CLIENT_ROUND2_SIZE: usize = 165;
pub const JPAKE_SERVER_ROUND2_SIZE: usize = 168;

/// Nonce length used by the key-confirmation rounds
pub const NONCE_SIZE: usize = 8;
