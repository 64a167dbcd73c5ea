
// word 0: bit 24-31 IP version, bit 16-23 TOS, bit 8-15 TTL, bit 0-7 protocol
const VERSION_FIRST_BIT: u32 = 24;
const TOS_FIRST_BIT: u32 = 16;
const TTL_FIRST_BIT: u32 = 8;
const PROTO_FIRST_BIT: u32 = 0;
const BYTE_MASK: u32 = 0xFF;

const HEADER: usize = 0;
const OPTIONS: usize = 1;
const SECURITY: usize = 2;
const FLAGS: usize = 3;

/// Packet is TCP or UDP.
pub const FI_TCPUDP: u32 = 0x0001;
/// Packet carries IP options.
pub const FI_OPTIONS: u32 = 0x0002;
pub const FI_FRAG: u32 = 0x0004;
/// Packet is too short to hold its transport header.
pub const FI_SHORT: u32 = 0x0008;
pub const FI_MULTICAST: u32 = 0x0010;
pub const FI_BROADCAST: u32 = 0x0020;
pub const FI_MBCAST: u32 = 0x0040;
/// TCP segment fell outside the tracked window.
pub const FI_OOW: u32 = 0x0080;
pub const FI_BAD: u32 = 0x0100;

/// Packed header summary used for the coarse, first-pass compare.
///
/// word 0: version, TOS, TTL, protocol
/// word 1: IP option bitmap
/// word 2: security class bitmap (low byte)
/// word 3: packet flags (`FI_*`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct MatchBlock {
    words: [u32; 4],
}

#[inline]
fn get_byte(word: u32, first_bit: u32) -> u8 {
    ((word >> first_bit) & BYTE_MASK) as u8
}

#[inline]
fn set_byte(word: u32, first_bit: u32, val: u8) -> u32 {
    (word & !(BYTE_MASK << first_bit)) | ((val as u32) << first_bit)
}

impl MatchBlock {
    pub const fn new() -> Self {
        Self { words: [0; 4] }
    }

    pub fn with_header(mut self, version: u8, tos: u8, ttl: u8, proto: u8) -> Self {
        self.words[HEADER] = ((version as u32) << VERSION_FIRST_BIT)
            | ((tos as u32) << TOS_FIRST_BIT)
            | ((ttl as u32) << TTL_FIRST_BIT)
            | ((proto as u32) << PROTO_FIRST_BIT);
        self
    }

    pub fn with_options(mut self, opts: u32) -> Self {
        self.words[OPTIONS] = opts;
        self
    }

    pub fn with_security(mut self, secmsk: u8) -> Self {
        self.words[SECURITY] = secmsk as u32;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.words[FLAGS] = flags;
        self
    }

    #[inline]
    pub fn version(&self) -> u8 {
        get_byte(self.words[HEADER], VERSION_FIRST_BIT)
    }

    #[inline]
    pub fn tos(&self) -> u8 {
        get_byte(self.words[HEADER], TOS_FIRST_BIT)
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        get_byte(self.words[HEADER], TTL_FIRST_BIT)
    }

    #[inline]
    pub fn proto(&self) -> u8 {
        get_byte(self.words[HEADER], PROTO_FIRST_BIT)
    }

    #[inline]
    pub fn options(&self) -> u32 {
        self.words[OPTIONS]
    }

    #[inline]
    pub fn security(&self) -> u8 {
        self.words[SECURITY] as u8
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.words[FLAGS]
    }

    // Single pass over all four words, no early exit.
    #[inline]
    fn masked_eq(&self, mask: &MatchBlock, data: &MatchBlock) -> bool {
        let mut diff = 0;
        for i in 0..4 {
            diff |= (self.words[i] & mask.words[i]) ^ data.words[i];
        }
        diff == 0
    }
}

/// Value/mask pair of [MatchBlock]s held by a rule.
///
/// A zero mask bit is a wildcard. `data` never has bits outside `mask`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CoarseMatch {
    data: MatchBlock,
    mask: MatchBlock,
}

impl CoarseMatch {
    pub const fn new() -> Self {
        Self {
            data: MatchBlock::new(),
            mask: MatchBlock::new(),
        }
    }

    #[inline]
    pub fn matches(&self, packet: &MatchBlock) -> bool {
        packet.masked_eq(&self.mask, &self.data)
    }

    fn require_byte(&mut self, first_bit: u32, val: u8) {
        self.data.words[HEADER] = set_byte(self.data.words[HEADER], first_bit, val);
        self.mask.words[HEADER] = set_byte(self.mask.words[HEADER], first_bit, 0xFF);
    }

    fn header_byte(&self, first_bit: u32) -> Option<u8> {
        if get_byte(self.mask.words[HEADER], first_bit) == 0 {
            None
        } else {
            Some(get_byte(self.data.words[HEADER], first_bit))
        }
    }

    pub fn require_version(&mut self, version: u8) {
        self.require_byte(VERSION_FIRST_BIT, version);
    }

    pub fn require_tos(&mut self, tos: u8) {
        self.require_byte(TOS_FIRST_BIT, tos);
    }

    pub fn require_ttl(&mut self, ttl: u8) {
        self.require_byte(TTL_FIRST_BIT, ttl);
    }

    pub fn require_proto(&mut self, proto: u8) {
        self.require_byte(PROTO_FIRST_BIT, proto);
    }

    /// Option bits in `set` must be present, bits in `clear` must be absent.
    pub fn require_options(&mut self, set: u32, clear: u32) {
        self.data.words[OPTIONS] |= set;
        self.data.words[OPTIONS] &= !clear;
        self.mask.words[OPTIONS] |= set | clear;
    }

    pub fn require_security(&mut self, set: u8, clear: u8) {
        self.data.words[SECURITY] |= set as u32;
        self.data.words[SECURITY] &= !(clear as u32);
        self.mask.words[SECURITY] |= (set | clear) as u32;
    }

    pub fn require_flags(&mut self, set: u32, clear: u32) {
        self.data.words[FLAGS] |= set;
        self.data.words[FLAGS] &= !clear;
        self.mask.words[FLAGS] |= set | clear;
    }

    pub fn version(&self) -> Option<u8> {
        self.header_byte(VERSION_FIRST_BIT)
    }

    pub fn tos(&self) -> Option<u8> {
        self.header_byte(TOS_FIRST_BIT)
    }

    pub fn ttl(&self) -> Option<u8> {
        self.header_byte(TTL_FIRST_BIT)
    }

    pub fn proto(&self) -> Option<u8> {
        self.header_byte(PROTO_FIRST_BIT)
    }

    /// `(present, absent)` option bits.
    pub fn options(&self) -> (u32, u32) {
        let d = self.data.options();
        (d, self.mask.options() & !d)
    }

    pub fn security(&self) -> (u8, u8) {
        let d = self.data.security();
        (d, self.mask.security() & !d)
    }

    pub fn flags(&self) -> (u32, u32) {
        let d = self.data.flags();
        (d, self.mask.flags() & !d)
    }
}
