//! Byte stream framing
//!
//! The pipe is a plain byte stream, so message boundaries are recovered here.
//! A frame is one top-level JSON object: it starts at `{` and ends when the
//! brace depth returns to zero. Braces inside string literals (including
//! escaped quotes) do not count. Because `{`, `}`, `"` and `\` are ASCII they
//! never occur inside a multi-byte UTF-8 sequence, so scanning bytes is safe.

use crate::error::FrameError;

/// What the scanner is doing with incoming bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Between frames; only whitespace or `{` is expected
    Idle,
    /// Inside a frame that is being buffered
    Frame,
    /// Inside an oversized frame; bytes are scanned but not kept
    Discard,
    /// Skipping a malformed region until an object starts at top level
    Garbage,
}

/// JSON nesting state, ignoring delimiters inside string literals
#[derive(Debug, Default, Clone, Copy)]
struct Nesting {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Nesting {
    /// Advance over one byte. `brackets` also counts `[` and `]`.
    fn step(&mut self, byte: u8, brackets: bool) {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return;
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' => self.depth += 1,
            b'[' if brackets => self.depth += 1,
            b'}' => self.depth = self.depth.saturating_sub(1),
            b']' if brackets => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn at_top_level(&self) -> bool {
        self.depth == 0 && !self.in_string
    }
}

/// Reassembles JSON-object frames from arbitrarily sized chunks
#[derive(Debug)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    /// Bytes of `buf` already examined
    scanned: usize,
    mode: Mode,
    nesting: Nesting,
    max_frame_len: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            mode: Mode::Idle,
            nesting: Nesting::default(),
            max_frame_len,
        }
    }

    /// Append a chunk and iterate over the frames it completes.
    ///
    /// Frames are extracted lazily; bytes after the last complete frame stay
    /// buffered for the next call. Each malformed region yields one error.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames { assembler: self }
    }

    /// Drop all buffered state (client went away)
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.mode = Mode::Idle;
        self.nesting = Nesting::default();
    }

    /// Number of bytes held for an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        while self.scanned < self.buf.len() {
            let byte = self.buf[self.scanned];

            match self.mode {
                Mode::Idle => match byte {
                    b'{' => {
                        self.buf.drain(..self.scanned);
                        self.scanned = 0;
                        self.nesting = Nesting::default();
                        self.mode = Mode::Frame;
                    }
                    _ if byte.is_ascii_whitespace() => self.scanned += 1,
                    b'}' => return Some(Err(self.skip_region(FrameError::UnbalancedClose, byte))),
                    _ => {
                        return Some(Err(
                            self.skip_region(FrameError::UnexpectedByte { byte }, byte)
                        ))
                    }
                },
                Mode::Frame => {
                    if self.scanned >= self.max_frame_len {
                        return Some(Err(self.discard_frame()));
                    }
                    self.nesting.step(byte, false);
                    self.scanned += 1;

                    if self.nesting.depth == 0 {
                        let frame: Vec<u8> = self.buf.drain(..self.scanned).collect();
                        self.scanned = 0;
                        self.mode = Mode::Idle;
                        return Some(match std::str::from_utf8(&frame) {
                            Ok(_) => Ok(frame),
                            Err(_) => Err(FrameError::InvalidUtf8),
                        });
                    }
                }
                Mode::Discard => {
                    self.nesting.step(byte, false);
                    self.scanned += 1;
                    if self.nesting.depth == 0 {
                        self.mode = Mode::Idle;
                    }
                }
                Mode::Garbage => {
                    if byte == b'{' && self.nesting.at_top_level() {
                        self.mode = Mode::Idle;
                        continue;
                    }
                    self.nesting.step(byte, true);
                    self.scanned += 1;
                }
            }
        }

        if self.mode != Mode::Frame {
            // Nothing worth keeping: whitespace or skipped bytes
            self.buf.clear();
            self.scanned = 0;
        }
        None
    }

    /// A stray byte outside any object. Everything up to the next object at
    /// top level belongs to the same malformed region, so nested values and
    /// strings inside it are skipped whole.
    fn skip_region(&mut self, error: FrameError, byte: u8) -> FrameError {
        self.buf.drain(..=self.scanned);
        self.scanned = 0;
        self.nesting = Nesting::default();
        self.nesting.step(byte, true);
        self.mode = Mode::Garbage;
        error
    }

    /// The frame grew past the limit. Its bytes are dropped, and the rest of
    /// it is scanned without buffering until it closes.
    fn discard_frame(&mut self) -> FrameError {
        self.buf.drain(..self.scanned);
        self.scanned = 0;
        self.mode = Mode::Discard;
        FrameError::Oversized {
            limit: self.max_frame_len,
        }
    }
}

/// Frames completed by one [`FrameAssembler::feed`] call
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Vec<u8>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.assembler.next_frame()
    }
}
