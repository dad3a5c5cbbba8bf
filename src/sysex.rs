//! Korg M3 SysEx command encoding
//!
//! Stateless framing of outbound commands. Every frame has the shape
//! `F0 42 (30|deviceId) 75 <function> <payload...> F7`; the variants differ
//! only in function code and payload layout. Bank/slot ranges are not
//! validated here.

/// SysEx frame start.
pub const SYSEX_START: u8 = 0xF0;
/// SysEx frame end.
pub const SYSEX_END: u8 = 0xF7;
/// Korg manufacturer id.
pub const MANUFACTURER_KORG: u8 = 0x42;
/// M3 family id.
pub const FAMILY_M3: u8 = 0x75;

/// Byte offset of the function code within a framed message.
pub const FUNCTION_INDEX: usize = 4;
/// Shortest valid reply: framing plus function code.
pub const MIN_REPLY_LEN: usize = 6;

/// Mode change request.
pub const FUNC_MODE_CHANGE: u8 = 0x4E;
/// Combination parameter dump request.
pub const FUNC_COMBI_DUMP_REQUEST: u8 = 0x72;
/// Combination parameter dump (reply to the request; sending one back
/// writes it).
pub const FUNC_COMBI_DUMP: u8 = 0x73;
/// Store combination.
pub const FUNC_STORE_COMBINATION: u8 = 0x77;
/// Store combination bank to non-volatile memory.
pub const FUNC_STORE_BANK: u8 = 0x76;
/// Generic acknowledge reply.
pub const FUNC_ACK: u8 = 0x24;

/// Combi Play mode argument for [`SysexBuilder::mode_change`].
pub const MODE_COMBI: u8 = 0;

/// Builds framed commands for one device id.
#[derive(Debug, Clone, Copy)]
pub struct SysexBuilder {
    device_id: u8,
}

impl SysexBuilder {
    pub fn new(device_id: u8) -> Self {
        Self { device_id }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// Frame header only, without payload or terminator, for callers that
    /// append payload bytes themselves.
    pub fn header(&self, function: u8) -> Vec<u8> {
        vec![
            SYSEX_START,
            MANUFACTURER_KORG,
            0x30 | self.device_id,
            FAMILY_M3,
            function,
        ]
    }

    fn frame(&self, function: u8, payload: &[u8]) -> Vec<u8> {
        let mut buffer = self.header(function);
        buffer.extend_from_slice(payload);
        buffer.push(SYSEX_END);
        buffer
    }

    /// Mode change: payload is the single mode byte.
    pub fn mode_change(&self, mode: u8) -> Vec<u8> {
        self.frame(FUNC_MODE_CHANGE, &[mode])
    }

    /// Request a combination parameter dump for (bank, num).
    pub fn combi_dump_request(&self, bank: u8, num: u8) -> Vec<u8> {
        self.frame(FUNC_COMBI_DUMP_REQUEST, &[0x01, bank, 0x00, num])
    }

    /// Store the edit-buffer combination to (bank, num).
    pub fn store_combination(&self, bank: u8, num: u8) -> Vec<u8> {
        self.frame(FUNC_STORE_COMBINATION, &[0x01, bank, 0x00, num])
    }

    /// Commit a whole combination bank to non-volatile memory.
    pub fn store_combination_bank(&self, bank: u8) -> Vec<u8> {
        self.frame(FUNC_STORE_BANK, &[0x11, bank])
    }
}
