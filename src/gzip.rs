//! Resumable gzip decoding.
//!
//! A small inflate state machine that, unlike a general purpose decoder, can
//! hand out its exact position at every deflate block boundary (bit offset
//! into the compressed stream plus the trailing 32 KiB of output) and can be
//! restarted from such a snapshot. That is what makes the per-layer
//! checkpoint tables usable for random access into single-member gzip layers.
//!
//! Integrity: CRC-32 and ISIZE of each member are verified when decoding
//! starts at the beginning of a member. A decoder resumed from a checkpoint
//! cannot see the member's earlier bytes and skips that member's check.

use std::cell::{Cell, RefCell};
use std::io::{self, Read};
use std::rc::Rc;

use flate2::Crc;

use crate::checkpoint::GzipCheckpoint;

const WINDOW_SIZE: usize = 32 * 1024;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;
const INPUT_CHUNK: usize = 64 * 1024;

const MAX_BITS: usize = 15;
const MAX_LCODES: usize = 286;
const MAX_DCODES: usize = 30;
const FIXED_LCODES: usize = 288;

/// Codes up to this length decode with a single table lookup.
const FAST_BITS: usize = 10;
const FAST_MASK: usize = (1 << FAST_BITS) - 1;

const LBASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
const LEXT: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DBASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DEXT: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "gzip stream ended unexpectedly")
}

// ---------------------------------------------------------------------------
// Progress shared with the indexer
// ---------------------------------------------------------------------------

/// Live position of a decoder, readable while something else owns it.
#[derive(Debug, Default)]
pub struct DecodeProgress {
    total_out: Cell<u64>,
    compressed_in: Cell<u64>,
    boundary: RefCell<Option<GzipCheckpoint>>,
}

impl DecodeProgress {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Uncompressed bytes produced so far.
    pub fn total_out(&self) -> u64 {
        self.total_out.get()
    }

    /// Compressed bytes consumed so far.
    pub fn compressed_in(&self) -> u64 {
        self.compressed_in.get()
    }

    /// Uncompressed offset of the most recent block boundary, if any.
    pub fn boundary_offset(&self) -> Option<u64> {
        self.boundary.borrow().as_ref().map(|b| b.uncompressed_offset)
    }

    /// Copy of the most recent block-boundary snapshot.
    pub fn boundary(&self) -> Option<GzipCheckpoint> {
        self.boundary.borrow().clone()
    }
}

// ---------------------------------------------------------------------------
// Bit reader
// ---------------------------------------------------------------------------

struct BitReader<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    /// Absolute compressed offset of `buf[pos]`.
    consumed: u64,
    bitbuf: u32,
    bitcnt: u32,
}

impl<R: Read> BitReader<R> {
    fn new(inner: R, start: u64) -> Self {
        Self {
            inner,
            buf: vec![0u8; INPUT_CHUNK].into_boxed_slice(),
            pos: 0,
            len: 0,
            consumed: start,
            bitbuf: 0,
            bitcnt: 0,
        }
    }

    /// Refill the input buffer; `Ok(false)` at end of input.
    fn fill(&mut self) -> io::Result<bool> {
        if self.pos < self.len {
            return Ok(true);
        }
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn try_byte(&mut self) -> io::Result<Option<u8>> {
        if !self.fill()? {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        self.consumed += 1;
        Ok(Some(b))
    }

    fn byte(&mut self) -> io::Result<u8> {
        self.try_byte()?.ok_or_else(truncated)
    }

    fn u16_le(&mut self) -> io::Result<u16> {
        Ok(u16::from(self.byte()?) | (u16::from(self.byte()?) << 8))
    }

    fn u32_le(&mut self) -> io::Result<u32> {
        Ok(u32::from(self.u16_le()?) | (u32::from(self.u16_le()?) << 16))
    }

    /// Take `need` bits, least significant first. Never holds more than
    /// seven unread bits afterwards.
    fn bits(&mut self, need: u32) -> io::Result<u32> {
        let mut val = self.bitbuf;
        while self.bitcnt < need {
            val |= u32::from(self.byte()?) << self.bitcnt;
            self.bitcnt += 8;
        }
        self.bitbuf = if need >= 32 { 0 } else { val >> need };
        self.bitcnt -= need;
        Ok(val & ((1u32 << need) - 1))
    }

    /// Drop the unread bits of the current byte.
    fn align(&mut self) {
        self.bitbuf = 0;
        self.bitcnt = 0;
    }

    /// `(offset of the byte holding the next unread bit, unread bits in it)`.
    fn position(&self) -> (u64, u8) {
        if self.bitcnt > 0 {
            (self.consumed - 1, self.bitcnt as u8)
        } else {
            (self.consumed, 0)
        }
    }

    /// The next 16 bits without consuming them, when the buffer holds them.
    fn peek16(&self) -> Option<u32> {
        if self.pos + 2 > self.len {
            return None;
        }
        Some(
            self.bitbuf
                | u32::from(self.buf[self.pos]) << self.bitcnt
                | u32::from(self.buf[self.pos + 1]) << (self.bitcnt + 8),
        )
    }

    /// Buffered, byte-aligned input; empty only at end of input.
    fn available(&mut self) -> io::Result<&[u8]> {
        self.fill()?;
        Ok(&self.buf[self.pos..self.len])
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        self.consumed += n as u64;
    }
}

// ---------------------------------------------------------------------------
// Huffman tables
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Huffman {
    count: [u16; MAX_BITS + 1],
    symbol: Vec<u16>,
    /// Indexed by the next `FAST_BITS` input bits: `symbol << 4 | length`,
    /// or 0 when the code is longer than `FAST_BITS`.
    fast: Box<[u16]>,
}

impl Huffman {
    fn empty() -> Self {
        Self {
            count: [0; MAX_BITS + 1],
            symbol: Vec::new(),
            fast: vec![0u16; 1 << FAST_BITS].into_boxed_slice(),
        }
    }

    /// Build a canonical code from per-symbol lengths. Returns the number of
    /// unused code points: zero for a complete code, negative when the
    /// lengths are over-subscribed.
    fn construct(&mut self, lengths: &[u8]) -> i32 {
        self.count = [0; MAX_BITS + 1];
        self.fast.fill(0);
        for &len in lengths {
            self.count[len as usize] += 1;
        }
        if self.count[0] as usize == lengths.len() {
            self.symbol.clear();
            return 0;
        }

        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= i32::from(self.count[len]);
            if left < 0 {
                return left;
            }
        }

        let mut offs = [0u16; MAX_BITS + 1];
        for len in 1..MAX_BITS {
            offs[len + 1] = offs[len] + self.count[len];
        }
        self.symbol.clear();
        self.symbol.resize(lengths.len(), 0);
        for (sym, &len) in lengths.iter().enumerate() {
            if len != 0 {
                let slot = &mut offs[len as usize];
                self.symbol[*slot as usize] = sym as u16;
                *slot += 1;
            }
        }
        self.fill_fast(lengths);
        left
    }

    /// Canonical codes are sent most significant bit first while the bit
    /// reader hands out bits least significant first, so each short code is
    /// stored bit-reversed and repeated for every value of the unused bits.
    fn fill_fast(&mut self, lengths: &[u8]) {
        let mut next = [0u32; MAX_BITS + 1];
        let mut code = 0u32;
        for len in 1..=MAX_BITS {
            let shorter = if len == 1 { 0 } else { u32::from(self.count[len - 1]) };
            code = (code + shorter) << 1;
            next[len] = code;
        }
        for (sym, &len) in lengths.iter().enumerate() {
            let len = len as usize;
            if len == 0 {
                continue;
            }
            let code = next[len];
            next[len] += 1;
            if len > FAST_BITS || code >= 1 << len {
                continue;
            }
            let reversed = (code.reverse_bits() >> (32 - len)) as usize;
            let entry = (sym as u16) << 4 | len as u16;
            let mut slot = reversed;
            while slot < 1 << FAST_BITS {
                self.fast[slot] = entry;
                slot += 1 << len;
            }
        }
    }

    fn fixed() -> (Self, Self) {
        let mut lengths = [0u8; FIXED_LCODES];
        for (sym, len) in lengths.iter_mut().enumerate() {
            *len = match sym {
                0..=143 => 8,
                144..=255 => 9,
                256..=279 => 7,
                _ => 8,
            };
        }
        let mut lencode = Self::empty();
        lencode.construct(&lengths);
        let mut distcode = Self::empty();
        distcode.construct(&[5u8; MAX_DCODES]);
        (lencode, distcode)
    }
}

fn decode_symbol<R: Read>(br: &mut BitReader<R>, h: &Huffman) -> io::Result<u16> {
    if let Some(peek) = br.peek16() {
        let entry = h.fast[peek as usize & FAST_MASK];
        if entry != 0 {
            br.bits(u32::from(entry & 0xf))?;
            return Ok(entry >> 4);
        }
    }
    decode_slow(br, h)
}

/// Bit-at-a-time canonical decode for long codes and the end of a buffer.
fn decode_slow<R: Read>(br: &mut BitReader<R>, h: &Huffman) -> io::Result<u16> {
    let (mut code, mut first, mut index) = (0i32, 0i32, 0i32);
    for len in 1..=MAX_BITS {
        code |= br.bits(1)? as i32;
        let count = i32::from(h.count[len]);
        if code - count < first {
            return h
                .symbol
                .get((index + (code - first)) as usize)
                .copied()
                .ok_or_else(|| invalid("invalid Huffman code"));
        }
        index += count;
        first += count;
        first <<= 1;
        code <<= 1;
    }
    Err(invalid("invalid Huffman code"))
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a member header (or end of input after the first member).
    Header,
    BlockHeader,
    Stored { remaining: usize },
    Codes,
    Trailer,
    Done,
}

/// Streaming gzip decoder with block-boundary snapshots and resume.
pub struct GzipDecoder<R> {
    br: BitReader<R>,
    state: State,
    last_block: bool,
    fixed_block: bool,
    lencode: Huffman,
    distcode: Huffman,
    fixed_len: Huffman,
    fixed_dist: Huffman,
    copy_len: usize,
    copy_dist: usize,
    window: Box<[u8]>,
    wpos: usize,
    /// Valid bytes in `window`, capped at its size.
    history: usize,
    total_out: u64,
    members: u64,
    crc: Crc,
    verify_member: bool,
    progress: Option<Rc<DecodeProgress>>,
}

impl<R: Read> GzipDecoder<R> {
    /// Decode a gzip stream from its first byte.
    pub fn new(input: R) -> Self {
        let (fixed_len, fixed_dist) = Huffman::fixed();
        Self {
            br: BitReader::new(input, 0),
            state: State::Header,
            last_block: false,
            fixed_block: false,
            lencode: Huffman::empty(),
            distcode: Huffman::empty(),
            fixed_len,
            fixed_dist,
            copy_len: 0,
            copy_dist: 0,
            window: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
            wpos: 0,
            history: 0,
            total_out: 0,
            members: 0,
            crc: Crc::new(),
            verify_member: true,
            progress: None,
        }
    }

    /// Continue decoding at `cp`. `input` must yield the compressed stream
    /// starting at `cp.compressed_offset`.
    pub fn resume(input: R, cp: &GzipCheckpoint) -> io::Result<Self> {
        let mut dec = Self::new(input);
        if cp.is_stream_start() {
            return Ok(dec);
        }
        if cp.bits > 7 || cp.window.len() > WINDOW_SIZE {
            return Err(invalid("corrupt checkpoint"));
        }
        dec.br.consumed = cp.compressed_offset;
        if cp.bits > 0 {
            let b = dec.br.byte()?;
            dec.br.bitbuf = u32::from(b) >> (8 - u32::from(cp.bits));
            dec.br.bitcnt = u32::from(cp.bits);
        }
        for &b in &cp.window {
            dec.push_window(b);
        }
        dec.total_out = cp.uncompressed_offset;
        dec.state = State::BlockHeader;
        dec.members = 1;
        dec.verify_member = false;
        Ok(dec)
    }

    /// Publish position and block-boundary snapshots into `progress`.
    pub fn track(mut self, progress: Rc<DecodeProgress>) -> Self {
        self.progress = Some(progress);
        self.publish();
        self
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn compressed_in(&self) -> u64 {
        self.br.consumed
    }

    fn publish(&self) {
        if let Some(p) = &self.progress {
            p.total_out.set(self.total_out);
            p.compressed_in.set(self.br.consumed);
        }
    }

    fn push_window(&mut self, b: u8) {
        self.window[self.wpos] = b;
        self.wpos = (self.wpos + 1) & WINDOW_MASK;
        if self.history < WINDOW_SIZE {
            self.history += 1;
        }
    }

    /// Append the valid tail of the window, oldest byte first.
    fn copy_window(&self, out: &mut Vec<u8>) {
        let start = (self.wpos + WINDOW_SIZE - self.history) & WINDOW_MASK;
        if start + self.history <= WINDOW_SIZE {
            out.extend_from_slice(&self.window[start..start + self.history]);
        } else {
            out.extend_from_slice(&self.window[start..]);
            out.extend_from_slice(&self.window[..self.wpos]);
        }
    }

    fn mark_boundary(&self) {
        let Some(progress) = &self.progress else {
            return;
        };
        let (compressed_offset, bits) = self.br.position();
        {
            let mut slot = progress.boundary.borrow_mut();
            let cp = slot.get_or_insert_with(GzipCheckpoint::stream_start);
            cp.compressed_offset = compressed_offset;
            cp.uncompressed_offset = self.total_out;
            cp.bits = bits;
            cp.window.clear();
            self.copy_window(&mut cp.window);
        }
        self.publish();
    }

    /// Parse a member header. `Ok(false)` at clean end of input.
    fn read_member_header(&mut self) -> io::Result<bool> {
        let id1 = match self.br.try_byte()? {
            Some(b) => b,
            None if self.members > 0 => return Ok(false),
            None => return Err(truncated()),
        };
        if id1 == 0 && self.members > 0 {
            // Zero padding after the last member.
            while let Some(b) = self.br.try_byte()? {
                if b != 0 {
                    return Err(invalid("trailing garbage after gzip stream"));
                }
            }
            return Ok(false);
        }
        if id1 != 0x1f || self.br.byte()? != 0x8b {
            return Err(invalid("not a gzip stream"));
        }
        if self.br.byte()? != 8 {
            return Err(invalid("unsupported gzip compression method"));
        }
        let flags = self.br.byte()?;
        if flags & 0xe0 != 0 {
            return Err(invalid("reserved gzip header flags set"));
        }
        for _ in 0..6 {
            self.br.byte()?; // mtime, xfl, os
        }
        if flags & FEXTRA != 0 {
            let xlen = self.br.u16_le()?;
            for _ in 0..xlen {
                self.br.byte()?;
            }
        }
        for flag in [FNAME, FCOMMENT] {
            if flags & flag != 0 {
                while self.br.byte()? != 0 {}
            }
        }
        if flags & FHCRC != 0 {
            self.br.u16_le()?;
        }
        self.members += 1;
        self.crc.reset();
        self.verify_member = true;
        Ok(true)
    }

    fn read_block_header(&mut self) -> io::Result<()> {
        self.last_block = self.br.bits(1)? == 1;
        match self.br.bits(2)? {
            0 => {
                self.br.align();
                let len = self.br.u16_le()?;
                let nlen = self.br.u16_le()?;
                if len != !nlen {
                    return Err(invalid("stored block length mismatch"));
                }
                self.state = State::Stored {
                    remaining: usize::from(len),
                };
            }
            1 => {
                self.fixed_block = true;
                self.state = State::Codes;
            }
            2 => {
                self.read_dynamic_tables()?;
                self.fixed_block = false;
                self.state = State::Codes;
            }
            _ => return Err(invalid("invalid deflate block type")),
        }
        Ok(())
    }

    fn read_dynamic_tables(&mut self) -> io::Result<()> {
        let nlen = self.br.bits(5)? as usize + 257;
        let ndist = self.br.bits(5)? as usize + 1;
        let ncode = self.br.bits(4)? as usize + 4;
        if nlen > MAX_LCODES || ndist > MAX_DCODES {
            return Err(invalid("too many length or distance codes"));
        }

        let mut lengths = [0u8; MAX_LCODES + MAX_DCODES];
        for &slot in CODE_LENGTH_ORDER.iter().take(ncode) {
            lengths[slot] = self.br.bits(3)? as u8;
        }
        let mut lencode = Huffman::empty();
        if lencode.construct(&lengths[..19]) != 0 {
            return Err(invalid("incomplete code length code"));
        }

        let mut index = 0;
        while index < nlen + ndist {
            let sym = decode_symbol(&mut self.br, &lencode)?;
            if sym < 16 {
                lengths[index] = sym as u8;
                index += 1;
                continue;
            }
            let (value, repeat) = match sym {
                16 => {
                    if index == 0 {
                        return Err(invalid("repeat with no previous length"));
                    }
                    (lengths[index - 1], 3 + self.br.bits(2)? as usize)
                }
                17 => (0, 3 + self.br.bits(3)? as usize),
                _ => (0, 11 + self.br.bits(7)? as usize),
            };
            if index + repeat > nlen + ndist {
                return Err(invalid("too many code lengths"));
            }
            lengths[index..index + repeat].fill(value);
            index += repeat;
        }

        if lengths[256] == 0 {
            return Err(invalid("missing end-of-block code"));
        }
        let left = self.lencode.construct(&lengths[..nlen]);
        if left < 0 || (left > 0 && nlen != usize::from(self.lencode.count[0] + self.lencode.count[1])) {
            return Err(invalid("invalid literal/length code lengths"));
        }
        let left = self.distcode.construct(&lengths[nlen..nlen + ndist]);
        if left < 0 || (left > 0 && ndist != usize::from(self.distcode.count[0] + self.distcode.count[1])) {
            return Err(invalid("invalid distance code lengths"));
        }
        Ok(())
    }

    fn end_block(&mut self) {
        self.state = if self.last_block {
            State::Trailer
        } else {
            State::BlockHeader
        };
    }

    fn read_trailer(&mut self) -> io::Result<()> {
        self.br.align();
        let crc = self.br.u32_le()?;
        let isize = self.br.u32_le()?;
        if self.verify_member {
            if crc != self.crc.sum() {
                return Err(invalid("gzip CRC-32 mismatch"));
            }
            if isize != self.crc.amount() {
                return Err(invalid("gzip length mismatch"));
            }
        }
        Ok(())
    }

    /// Decode the next literal or match.
    fn decode_codes(&mut self) -> io::Result<Option<u8>> {
        let (lencode, distcode) = if self.fixed_block {
            (&self.fixed_len, &self.fixed_dist)
        } else {
            (&self.lencode, &self.distcode)
        };
        let sym = decode_symbol(&mut self.br, lencode)?;
        if sym < 256 {
            return Ok(Some(sym as u8));
        }
        if sym == 256 {
            self.end_block();
            return Ok(None);
        }

        let sym = usize::from(sym - 257);
        if sym >= LBASE.len() {
            return Err(invalid("invalid length symbol"));
        }
        let len = usize::from(LBASE[sym]) + self.br.bits(u32::from(LEXT[sym]))? as usize;
        let dsym = usize::from(decode_symbol(&mut self.br, distcode)?);
        if dsym >= DBASE.len() {
            return Err(invalid("invalid distance symbol"));
        }
        let dist = usize::from(DBASE[dsym]) + self.br.bits(u32::from(DEXT[dsym]))? as usize;
        if dist > self.history {
            return Err(invalid("distance too far back"));
        }
        self.copy_len = len;
        self.copy_dist = dist;
        Ok(None)
    }
}

impl<R: Read> Read for GzipDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        let mut crc_from = 0;

        while n < buf.len() {
            match self.state {
                State::Header => {
                    if self.read_member_header()? {
                        self.state = State::BlockHeader;
                    } else {
                        self.state = State::Done;
                    }
                }
                State::BlockHeader => {
                    self.mark_boundary();
                    self.read_block_header()?;
                }
                State::Stored { remaining } => {
                    if remaining == 0 {
                        self.end_block();
                        continue;
                    }
                    let avail = self.br.available()?;
                    if avail.is_empty() {
                        return Err(truncated());
                    }
                    let take = remaining.min(avail.len()).min(buf.len() - n);
                    buf[n..n + take].copy_from_slice(&avail[..take]);
                    self.br.advance(take);
                    for &b in &buf[n..n + take] {
                        self.push_window(b);
                    }
                    n += take;
                    self.total_out += take as u64;
                    self.state = State::Stored {
                        remaining: remaining - take,
                    };
                }
                State::Codes => {
                    if self.copy_len > 0 {
                        while self.copy_len > 0 && n < buf.len() {
                            let b = self.window[(self.wpos + WINDOW_SIZE - self.copy_dist) & WINDOW_MASK];
                            self.push_window(b);
                            buf[n] = b;
                            n += 1;
                            self.copy_len -= 1;
                            self.total_out += 1;
                        }
                        continue;
                    }
                    if let Some(b) = self.decode_codes()? {
                        self.push_window(b);
                        buf[n] = b;
                        n += 1;
                        self.total_out += 1;
                    }
                }
                State::Trailer => {
                    self.crc.update(&buf[crc_from..n]);
                    crc_from = n;
                    self.read_trailer()?;
                    self.state = State::Header;
                }
                State::Done => break,
            }
        }

        self.crc.update(&buf[crc_from..n]);
        self.publish();
        Ok(n)
    }
}

/// Decode `len` bytes at uncompressed offset `target`, starting from `cp`.
///
/// `input` yields the compressed stream from `cp.compressed_offset`. Fewer
/// than `len` bytes come back only when the stream ends first.
pub fn read_at<R: Read>(input: R, cp: &GzipCheckpoint, target: u64, len: usize) -> io::Result<Vec<u8>> {
    if target < cp.uncompressed_offset {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "checkpoint lies past the requested offset",
        ));
    }
    let mut dec = GzipDecoder::resume(input, cp)?;
    let gap = target - cp.uncompressed_offset;
    let skipped = io::copy(&mut (&mut dec).take(gap), &mut io::sink())?;
    if skipped < gap {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(len);
    (&mut dec).take(len as u64).read_to_end(&mut out)?;
    Ok(out)
}
