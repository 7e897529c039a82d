const ID_LEN: usize = 32;

/// Splits the bit stream read out of Shift-DR after a reset into IDCODEs.
///
/// A device in bypass contributes a single 0 bit, a device with an IDCODE
/// register 32 bits, LSB first (the IDCODE LSB is always 1).
#[derive(Debug, Default)]
pub struct ChainDecoder {
    idcodes: Vec<Option<u32>>,
    current_id: u32,
    bit_count: usize,
    consecutive_zeros: usize,
}

impl ChainDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one TDO bit; `true` once the end of the chain was seen.
    pub fn push(&mut self, tdo: bool) -> bool {
        // bypass
        if self.bit_count == 0 && !tdo {
            self.idcodes.push(None);
            self.consecutive_zeros += 1;
        } else {
            self.current_id = (self.current_id >> 1) | if tdo { 0x8000_0000 } else { 0 };
            self.bit_count += 1;
            self.consecutive_zeros = 0;
        }
        // 32 zeros: the zero fill came back out
        if self.consecutive_zeros == ID_LEN {
            let len = self.idcodes.len() - ID_LEN;
            self.idcodes.truncate(len);
            return true;
        }
        if self.bit_count == ID_LEN {
            self.bit_count = 0;
            // 32 ones: the one fill came back out
            if self.current_id == u32::MAX {
                return true;
            }
            self.idcodes.push(Some(self.current_id));
        }
        false
    }

    pub fn finish(self) -> Vec<Option<u32>> {
        self.idcodes
    }
}
