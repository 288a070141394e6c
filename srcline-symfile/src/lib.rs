//! Support for the textual symbol file format consumed by the resolver.
//!
//! A symbol file is a line-oriented ASCII document describing one binary
//! module: its source files, its functions with their source line mappings,
//! and Windows stack frame information. Every line is one record:
//!
//! ```text
//! FILE 1 /src/foo.c
//! FUNC 1000 100 foo(int)
//! 1000 20 42 1
//! STACK WIN 4 1000 20 5 0 0 0 0 100 $eip 4 + ^ =
//! ```
//!
//!  - [`FileRecord`]: `FILE <id> <path>` assigns an id to a source file
//!    path. Ids are decimal and unique within a module.
//!  - [`FuncRecord`]: `FUNC <address> <size> <name>` opens a function. All
//!    addresses and sizes are hexadecimal without a `0x` prefix and
//!    relative to the module's load address.
//!  - [`LineRecord`]: `<address> <size> <line> <file>` maps a code range of
//!    the most recently opened function to a source line. Line records
//!    carry no keyword prefix.
//!  - [`StackWinRecord`]: `STACK WIN <type> <address> <size> <prolog>
//!    <epilog> <params> <saved_regs> <locals> <max_stack> <program>`
//!    describes how to recover the caller's frame from within a code
//!    range.
//!
//! All record types borrow their string fields from the input data. This
//! crate only splits raw data into lines and parses individual records;
//! building the per-module index and deciding which malformed records are
//! fatal is the resolver's job.

#![warn(missing_docs)]

use std::fmt;
use std::iter::FusedIterator;

use thiserror::Error;

#[cfg(test)]
mod strategies;

/// Characters that separate the fields of a record.
const SEPARATORS: &[char] = &[' ', '\r', '\n'];

/// An iterator over the lines of a symbol file.
///
/// Lines are terminated by `\n`; a trailing `\r` is stripped from each
/// line. A newline at the very end of the input does not produce a final
/// empty line, but blank lines between records are yielded, since the
/// resolver must treat them as malformed.
#[derive(Clone, Debug, Default)]
pub struct Lines<'d> {
    data: &'d [u8],
}

impl<'d> Lines<'d> {
    /// Creates an iterator over the lines in `data`.
    pub fn new(data: &'d [u8]) -> Self {
        Lines { data }
    }
}

impl<'d> Iterator for Lines<'d> {
    type Item = &'d [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let mut line = match self.data.iter().position(|b| *b == b'\n') {
            Some(index) => {
                let line = &self.data[..index];
                self.data = &self.data[index + 1..];
                line
            }
            None => std::mem::take(&mut self.data),
        };

        if let [rest @ .., b'\r'] = line {
            line = rest;
        }

        Some(line)
    }
}

impl FusedIterator for Lines<'_> {}

/// Splits `line` into at most `max_tokens` fields.
///
/// Fields are separated by runs of ASCII space, CR and LF. Once
/// `max_tokens - 1` fields have been taken, the final field extends to the
/// end of the line with trailing CR/LF stripped, preserving any interior
/// spaces. This is how multi-word function names and program strings
/// survive tokenization.
///
/// Returns `Some` only if exactly `max_tokens` fields were produced.
pub fn tokenize(line: &str, max_tokens: usize) -> Option<Vec<&str>> {
    let mut tokens = Vec::with_capacity(max_tokens);
    let mut rest = line;

    while tokens.len() + 1 < max_tokens {
        rest = rest.trim_start_matches(SEPARATORS);
        if rest.is_empty() {
            break;
        }

        match rest.find(SEPARATORS) {
            Some(index) => {
                tokens.push(&rest[..index]);
                rest = &rest[index..];
            }
            None => {
                tokens.push(rest);
                rest = "";
            }
        }
    }

    let last = rest
        .trim_start_matches(SEPARATORS)
        .trim_end_matches(&['\r', '\n'][..]);
    if !last.is_empty() {
        tokens.push(last);
    }

    (tokens.len() == max_tokens).then_some(tokens)
}

/// The reason a record failed to parse.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseSymbolErrorKind {
    /// The record does not carry the expected keyword prefix.
    Prefix,
    /// A mandatory field is missing from the record.
    MissingInput,
    /// A field could not be parsed as a hexadecimal number.
    NumHex,
    /// A field could not be parsed as a decimal number.
    NumDec,
    /// A line record specified a non-positive line number.
    Line,
    /// A stack record used a platform tag other than `WIN`.
    Platform,
    /// A stack record used a frame info type outside the known range.
    StackWinType,
}

/// An error parsing a single record of a symbol file.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub struct ParseSymbolError {
    kind: ParseSymbolErrorKind,
    input: String,
}

impl ParseSymbolError {
    fn new(kind: ParseSymbolErrorKind, input: &str) -> Self {
        ParseSymbolError {
            kind,
            input: input.to_string(),
        }
    }

    /// Returns the kind of this parse error.
    pub fn kind(&self) -> ParseSymbolErrorKind {
        self.kind
    }
}

impl fmt::Display for ParseSymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParseSymbolErrorKind::Prefix => write!(f, "missing record prefix: ")?,
            ParseSymbolErrorKind::MissingInput => write!(f, "missing field in record: ")?,
            ParseSymbolErrorKind::NumHex => write!(f, "expected hex number: ")?,
            ParseSymbolErrorKind::NumDec => write!(f, "expected decimal number: ")?,
            ParseSymbolErrorKind::Line => write!(f, "invalid line number: ")?,
            ParseSymbolErrorKind::Platform => write!(f, "unknown stack record platform: ")?,
            ParseSymbolErrorKind::StackWinType => write!(f, "invalid stack frame info type: ")?,
        }

        write!(f, "{}", self.input)
    }
}

fn expect_prefix<'d>(line: &'d str, prefix: &str) -> Result<&'d str, ParseSymbolError> {
    line.strip_prefix(prefix)
        .ok_or_else(|| ParseSymbolError::new(ParseSymbolErrorKind::Prefix, line))
}

fn expect_tokens<'d>(
    line: &str,
    rest: &'d str,
    max_tokens: usize,
) -> Result<Vec<&'d str>, ParseSymbolError> {
    tokenize(rest, max_tokens)
        .ok_or_else(|| ParseSymbolError::new(ParseSymbolErrorKind::MissingInput, line))
}

fn num_hex_64(input: &str) -> Result<u64, ParseSymbolError> {
    u64::from_str_radix(input, 16)
        .map_err(|_| ParseSymbolError::new(ParseSymbolErrorKind::NumHex, input))
}

fn num_hex_32(input: &str) -> Result<u32, ParseSymbolError> {
    u32::from_str_radix(input, 16)
        .map_err(|_| ParseSymbolError::new(ParseSymbolErrorKind::NumHex, input))
}

fn num_dec_64(input: &str) -> Result<u64, ParseSymbolError> {
    input
        .parse::<u64>()
        .map_err(|_| ParseSymbolError::new(ParseSymbolErrorKind::NumDec, input))
}

/// A `FILE` record, assigning a path to a source file id.
///
/// The id is referenced by the file field of [`LineRecord`]s. File records
/// are not necessarily sorted or consecutive, and a later record for the
/// same id replaces the earlier path.
///
/// Example: `FILE 2 /home/build/src/nsBrowserApp.cpp`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileRecord<'d> {
    /// Identifier of the file within its module.
    pub id: u64,
    /// Path to the source file.
    pub name: &'d str,
}

impl<'d> FileRecord<'d> {
    /// Parses a file record from a single line.
    pub fn parse(line: &'d str) -> Result<Self, ParseSymbolError> {
        let rest = expect_prefix(line, "FILE")?;
        let tokens = expect_tokens(line, rest, 2)?;

        Ok(FileRecord {
            id: num_dec_64(tokens[0])?,
            name: tokens[1],
        })
    }
}

/// A `FUNC` record, opening a function that subsequent line records
/// belong to.
///
/// Example: `FUNC 1730 1a nsQueryInterface::operator()(nsID const&)`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FuncRecord<'d> {
    /// Start of the function relative to the module's load address.
    pub address: u64,
    /// Size in bytes of the function's code.
    pub size: u64,
    /// Name of the function, possibly containing spaces.
    pub name: &'d str,
}

impl<'d> FuncRecord<'d> {
    /// Parses a function record from a single line.
    pub fn parse(line: &'d str) -> Result<Self, ParseSymbolError> {
        let rest = expect_prefix(line, "FUNC")?;
        let tokens = expect_tokens(line, rest, 3)?;

        Ok(FuncRecord {
            address: num_hex_64(tokens[0])?,
            size: num_hex_64(tokens[1])?,
            name: tokens[2],
        })
    }
}

/// A line record, mapping a code range of the enclosing function to a
/// source line.
///
/// Line records carry no keyword prefix: every record that does not start
/// with a known keyword is parsed as a line record.
///
/// Example: `1730 6 93 20`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineRecord {
    /// Start of the range relative to the module's load address.
    pub address: u64,
    /// Size in bytes of the range.
    pub size: u64,
    /// Source line number at this range, always positive.
    pub line: u64,
    /// Id of the source file in the module's file table.
    pub file_id: u64,
}

impl LineRecord {
    /// Parses a line record from a single line.
    ///
    /// Non-positive line numbers fail with [`ParseSymbolErrorKind::Line`].
    pub fn parse(line: &str) -> Result<Self, ParseSymbolError> {
        let tokens = expect_tokens(line, line, 4)?;

        let number = tokens[2]
            .parse::<i64>()
            .map_err(|_| ParseSymbolError::new(ParseSymbolErrorKind::NumDec, tokens[2]))?;
        if number <= 0 {
            return Err(ParseSymbolError::new(ParseSymbolErrorKind::Line, tokens[2]));
        }

        Ok(LineRecord {
            address: num_hex_64(tokens[0])?,
            size: num_hex_64(tokens[1])?,
            line: number as u64,
            file_id: num_dec_64(tokens[3])?,
        })
    }
}

/// Frame info type codes used by `STACK WIN` records.
///
/// The codes mirror MSVC's `StackFrameTypeEnum`. Each type is kept in its
/// own index, since records of different types may legitimately cover
/// overlapping ranges. `Trap` and `Tss` are accepted on input but never
/// consulted when resolving a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackWinKind {
    /// Frame pointer omission data.
    Fpo = 0,
    /// Trap frames (reserved).
    Trap = 1,
    /// Task switches (reserved).
    Tss = 2,
    /// Standard frame data.
    Standard = 3,
    /// Full frame data with a register recovery program.
    FrameData = 4,
}

impl StackWinKind {
    /// The number of distinct frame info type codes.
    pub const COUNT: usize = 5;

    /// Converts a raw type code into a kind.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(StackWinKind::Fpo),
            1 => Some(StackWinKind::Trap),
            2 => Some(StackWinKind::Tss),
            3 => Some(StackWinKind::Standard),
            4 => Some(StackWinKind::FrameData),
            _ => None,
        }
    }
}

/// A `STACK WIN` record, describing how to recover the caller's frame
/// from within a code range.
///
/// Example: `STACK WIN 4 1000 20 5 0 0 0 0 100 $eip 4 + ^ =`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackWinRecord<'d> {
    /// The type of frame data this record holds.
    pub kind: StackWinKind,
    /// Start of the covered range relative to the module's load address.
    pub address: u64,
    /// Size in bytes of the covered range.
    pub size: u64,
    /// Size in bytes of the function prolog.
    pub prolog_size: u32,
    /// Size in bytes of the function epilog.
    pub epilog_size: u32,
    /// Size in bytes of arguments passed to the function.
    pub parameter_size: u32,
    /// Size in bytes of callee-saved registers.
    pub saved_register_size: u32,
    /// Size in bytes of local variables.
    pub local_size: u32,
    /// Maximum number of bytes pushed onto the stack by the frame.
    pub max_stack_size: u32,
    /// Program string for recovering the caller's registers.
    pub program_string: &'d str,
}

impl<'d> StackWinRecord<'d> {
    /// Parses a stack record from a single line.
    ///
    /// Records of platforms other than `WIN` fail with
    /// [`ParseSymbolErrorKind::Platform`] and type codes outside the known
    /// range with [`ParseSymbolErrorKind::StackWinType`]; callers are
    /// expected to skip both.
    pub fn parse(line: &'d str) -> Result<Self, ParseSymbolError> {
        let rest = expect_prefix(line, "STACK")?;

        // The platform tag decides whether the rest of the record can be
        // understood at all, so it is split off before the full record.
        let tokens = expect_tokens(line, rest, 2)?;
        if tokens[0] != "WIN" {
            return Err(ParseSymbolError::new(
                ParseSymbolErrorKind::Platform,
                tokens[0],
            ));
        }

        let tokens = expect_tokens(line, tokens[1], 10)?;
        let code = num_hex_64(tokens[0])?;
        let kind = StackWinKind::from_code(code)
            .ok_or_else(|| ParseSymbolError::new(ParseSymbolErrorKind::StackWinType, tokens[0]))?;

        Ok(StackWinRecord {
            kind,
            address: num_hex_64(tokens[1])?,
            size: num_hex_64(tokens[2])?,
            prolog_size: num_hex_32(tokens[3])?,
            epilog_size: num_hex_32(tokens[4])?,
            parameter_size: num_hex_32(tokens[5])?,
            saved_register_size: num_hex_32(tokens[6])?,
            local_size: num_hex_32(tokens[7])?,
            max_stack_size: num_hex_32(tokens[8])?,
            program_string: tokens[9],
        })
    }
}
