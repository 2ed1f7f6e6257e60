//! LZO1X decompression for the UltraVNC encodings.
//!
//! A safe decompressor for the LZO1X-1 bit stream: every literal copy, match
//! copy and length run is checked against the input, the produced output and
//! the caller's output limit.

use crate::vnc::error::{Result, RfbError};

enum State {
    /// Expecting an instruction after a match with no trailing literals.
    Instruction,
    /// Right after a literal run; short instructions mean a 3-byte far match.
    AfterLiterals,
    /// Decoding a match instruction `t`.
    Match(usize),
    /// Copy `t` trailing literals, then decode the next match.
    Trailing(usize),
}

struct Lzo<'a> {
    input: &'a [u8],
    pos: usize,
    out: Vec<u8>,
    limit: usize,
}

impl Lzo<'_> {
    fn byte(&mut self) -> Result<usize> {
        let b = *self
            .input
            .get(self.pos)
            .ok_or_else(|| RfbError::violation("lzo input overrun"))?;
        self.pos += 1;
        Ok(usize::from(b))
    }

    /// Reads a zero-extended length: each zero byte adds 255, the final non-zero byte is added to `base`.
    fn run(&mut self, base: usize) -> Result<usize> {
        let mut len = 0usize;
        loop {
            let b = self.byte()?;
            if b != 0 {
                return Ok(len + base + b);
            }
            len += 255;
            if len > self.limit {
                return Err(RfbError::violation("lzo length run exceeds output limit"));
            }
        }
    }

    fn reserve(&self, n: usize) -> Result<()> {
        if self.out.len() + n > self.limit {
            return Err(RfbError::violation(format!("lzo output exceeds {} bytes", self.limit)));
        }
        Ok(())
    }

    fn literals(&mut self, n: usize) -> Result<()> {
        self.reserve(n)?;
        let end = self.pos + n;
        let src = self
            .input
            .get(self.pos..end)
            .ok_or_else(|| RfbError::violation("lzo literal run overruns input"))?;
        self.out.extend_from_slice(src);
        self.pos = end;
        Ok(())
    }

    fn copy_match(&mut self, dist: usize, len: usize) -> Result<()> {
        if dist == 0 || dist > self.out.len() {
            return Err(RfbError::violation(format!("lzo lookbehind {} before start of output", dist)));
        }
        self.reserve(len)?;
        let start = self.out.len() - dist;
        // Byte at a time: the source may overlap what this copy produces.
        for i in 0..len {
            let b = self.out[start + i];
            self.out.push(b);
        }
        Ok(())
    }

    /// Low two bits of the byte two positions back select 0-3 trailing literals.
    fn next_after_match(&self) -> State {
        match self.input[self.pos - 2] & 3 {
            0 => State::Instruction,
            t => State::Trailing(usize::from(t)),
        }
    }
}

/// Largest LZO1X block that can expand to `n` bytes of incompressible data.
pub fn compressed_bound(n: usize) -> usize {
    n + n / 16 + 64 + 3
}

/// Decompresses an LZO1X block, producing at most `limit` bytes.
pub fn decompress(input: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut z = Lzo { input, pos: 0, out: Vec::with_capacity(limit.min(input.len().saturating_mul(4))), limit };

    let mut state = State::Instruction;
    if input.first().is_some_and(|&b| b > 17) {
        let t = z.byte()? - 17;
        if t < 4 {
            state = State::Trailing(t);
        } else {
            z.literals(t)?;
            state = State::AfterLiterals;
        }
    }

    loop {
        state = match state {
            State::Instruction => {
                let t = z.byte()?;
                if t >= 16 {
                    State::Match(t)
                } else {
                    let n = if t == 0 { z.run(15)? } else { t };
                    z.literals(n + 3)?;
                    State::AfterLiterals
                }
            }
            State::AfterLiterals => {
                let t = z.byte()?;
                if t >= 16 {
                    State::Match(t)
                } else {
                    let dist = 1 + 0x0800 + (t >> 2) + (z.byte()? << 2);
                    z.copy_match(dist, 3)?;
                    z.next_after_match()
                }
            }
            State::Trailing(n) => {
                z.literals(n)?;
                State::Match(z.byte()?)
            }
            State::Match(t) => {
                if t >= 64 {
                    let dist = 1 + ((t >> 2) & 7) + (z.byte()? << 3);
                    z.copy_match(dist, (t >> 5) + 1)?;
                } else if t >= 32 {
                    let len = match t & 31 {
                        0 => z.run(31)?,
                        n => n,
                    };
                    let b0 = z.byte()?;
                    let b1 = z.byte()?;
                    z.copy_match(1 + (b0 >> 2) + (b1 << 6), len + 2)?;
                } else if t >= 16 {
                    let high = (t & 8) << 11;
                    let len = match t & 7 {
                        0 => z.run(7)?,
                        n => n,
                    };
                    let b0 = z.byte()?;
                    let b1 = z.byte()?;
                    let dist = high + (b0 >> 2) + (b1 << 6);
                    if dist == 0 {
                        if z.pos != input.len() {
                            return Err(RfbError::violation(format!(
                                "lzo end marker with {} bytes of input left",
                                input.len() - z.pos
                            )));
                        }
                        return Ok(z.out);
                    }
                    z.copy_match(dist + 0x4000, len + 2)?;
                } else {
                    let dist = 1 + (t >> 2) + (z.byte()? << 2);
                    z.copy_match(dist, 2)?;
                }
                z.next_after_match()
            }
        };
    }
}
