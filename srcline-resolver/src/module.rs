//! Symbol data for a single binary module.

use std::collections::BTreeMap;
use std::ops::Range;
use std::str;

use thiserror::Error;

use srcline_symfile::{
    FileRecord, FuncRecord, LineRecord, Lines, ParseSymbolError, ParseSymbolErrorKind,
    StackWinKind, StackWinRecord,
};

use crate::maps::{NestedRangeMap, RangeMap};

/// An error loading a module from symbol file data.
#[non_exhaustive]
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LoadError {
    /// The symbol file contains bytes that are not valid UTF-8.
    #[error("bad utf-8 sequence in symbol file")]
    BadEncoding(#[from] str::Utf8Error),

    /// A line record appeared before the first `FUNC` record.
    #[error("line record without a preceding FUNC record: {0:?}")]
    OrphanLine(String),

    /// A mandatory record failed to parse.
    #[error("failed to parse symbol file record")]
    Parse(#[from] ParseSymbolError),

    /// A module with the same name has already been loaded.
    #[error("module {0:?} is already loaded")]
    DuplicateModule(String),
}

/// Stack frame information covering a code range of a module.
///
/// Describes how to locate the caller's frame from within the covered
/// range, as recorded by a `STACK WIN` record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackFrameInfo<'d> {
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

impl<'d> From<StackWinRecord<'d>> for StackFrameInfo<'d> {
    fn from(record: StackWinRecord<'d>) -> Self {
        StackFrameInfo {
            prolog_size: record.prolog_size,
            epilog_size: record.epilog_size,
            parameter_size: record.parameter_size,
            saved_register_size: record.saved_register_size,
            local_size: record.local_size,
            max_stack_size: record.max_stack_size,
            program_string: record.program_string,
        }
    }
}

/// Source information resolved for a single instruction address.
///
/// Fields remain `None` when the respective lookup misses; a missing
/// source file still reports the line number if the line itself was found.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameSymbol<'d> {
    /// Name of the function containing the address.
    pub function_name: Option<&'d str>,
    /// Path of the source file declaring the line.
    pub source_file: Option<&'d str>,
    /// Source line number at the address.
    pub source_line: Option<u64>,
}

/// The full result of looking up an instruction address in a module.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolvedFrame<'d> {
    /// Function, source file and line information.
    pub symbol: FrameSymbol<'d>,
    /// Stack frame information, if a record covers the address.
    pub frame_info: Option<StackFrameInfo<'d>>,
}

/// A function and the line ranges nested within it.
#[derive(Debug)]
struct Function<'d> {
    name: &'d str,
    address: u64,
    size: u64,
    lines: RangeMap<u64, LineRecord>,
}

/// Symbol information for a single module, parsed from a symbol file.
///
/// A module is immutable once [`parse`](Self::parse) returns. Lookups
/// never mutate, so any number of threads may share a loaded module
/// without synchronization.
#[derive(Debug)]
pub struct Module<'d> {
    name: String,
    files: BTreeMap<u64, &'d str>,
    functions: RangeMap<u64, Function<'d>>,
    stack_info: [NestedRangeMap<u64, StackFrameInfo<'d>>; StackWinKind::COUNT],
}

impl<'d> Module<'d> {
    /// Parses an entire symbol file into a module called `name`.
    ///
    /// Structurally broken input fails the whole parse: a line record
    /// outside of any function, an unparsable mandatory field, or a
    /// non-positive line number. Tolerable anomalies are dropped with a
    /// warning instead: records of unknown stack platforms or frame info
    /// types, and records whose range conflicts with data stored earlier.
    pub fn parse(name: &str, data: &'d [u8]) -> Result<Self, LoadError> {
        let mut module = Module {
            name: name.to_string(),
            files: BTreeMap::new(),
            functions: RangeMap::default(),
            stack_info: Default::default(),
        };

        let mut current: Option<Function<'d>> = None;

        for raw_line in Lines::new(data) {
            let line = str::from_utf8(raw_line)?;

            if line.starts_with("FILE ") {
                match FileRecord::parse(line) {
                    // A repeated id replaces the earlier path.
                    Ok(record) => {
                        module.files.insert(record.id, record.name);
                    }
                    Err(error) => {
                        tracing::warn!(
                            module = module.name.as_str(),
                            %error,
                            "skipping malformed FILE record"
                        );
                    }
                }
            } else if line.starts_with("STACK ") {
                match StackWinRecord::parse(line) {
                    Ok(record) => module.store_stack_record(&record),
                    Err(error) if is_skippable_stack_error(&error) => {
                        tracing::warn!(
                            module = module.name.as_str(),
                            %error,
                            "skipping unsupported STACK record"
                        );
                    }
                    Err(error) => return Err(error.into()),
                }
            } else if line.starts_with("FUNC ") {
                module.store_function(current.take());

                let record = FuncRecord::parse(line)?;
                current = Some(Function {
                    name: record.name,
                    address: record.address,
                    size: record.size,
                    lines: RangeMap::default(),
                });
            } else {
                let function = match current.as_mut() {
                    Some(function) => function,
                    None => return Err(LoadError::OrphanLine(line.to_string())),
                };

                let record = LineRecord::parse(line)?;
                let stored = match checked_range(record.address, record.size) {
                    Some(range) => function.lines.insert(range, record),
                    None => false,
                };

                if !stored {
                    tracing::warn!(
                        module = module.name.as_str(),
                        function = function.name,
                        address = record.address,
                        "dropping conflicting line record"
                    );
                }
            }
        }

        module.store_function(current);
        Ok(module)
    }

    /// Returns the name this module was loaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the function, source line and stack frame information
    /// covering the given module-relative address.
    pub fn lookup(&self, rva: u64) -> ResolvedFrame<'d> {
        // Frame info is filled in even when the function or line lookups
        // miss; callers detect its presence independently.
        let frame_info = self.frame_info(rva).copied();

        let mut symbol = FrameSymbol::default();
        if let Some(function) = self.functions.get_contents(rva) {
            symbol.function_name = Some(function.name);

            if let Some(line) = function.lines.get_contents(rva) {
                symbol.source_file = self.files.get(&line.file_id).copied();
                symbol.source_line = Some(line.line);
            }
        }

        ResolvedFrame { symbol, frame_info }
    }

    /// Returns the innermost stack frame info covering the address.
    ///
    /// `FrameData` records are preferred over `Fpo`, which in turn is
    /// preferred over `Standard`. `Trap` and `Tss` are never consulted.
    fn frame_info(&self, rva: u64) -> Option<&StackFrameInfo<'d>> {
        const PREFERENCE: [StackWinKind; 3] = [
            StackWinKind::FrameData,
            StackWinKind::Fpo,
            StackWinKind::Standard,
        ];

        PREFERENCE
            .iter()
            .find_map(|kind| self.stack_info[*kind as usize].get(rva))
    }

    /// Moves a completed function into the function index.
    ///
    /// A function whose range conflicts with one stored earlier is dropped
    /// together with all the line records attached to it.
    fn store_function(&mut self, function: Option<Function<'d>>) {
        let function = match function {
            Some(function) => function,
            None => return,
        };

        let name = function.name;
        let address = function.address;
        let stored = match checked_range(function.address, function.size) {
            Some(range) => self.functions.insert(range, function),
            None => false,
        };

        if !stored {
            tracing::warn!(
                module = self.name.as_str(),
                function = name,
                address,
                "dropping function with conflicting range"
            );
        }
    }

    fn store_stack_record(&mut self, record: &StackWinRecord<'d>) {
        let map = &mut self.stack_info[record.kind as usize];
        let stored = match checked_range(record.address, record.size) {
            Some(range) => map.insert(range, StackFrameInfo::from(*record)),
            None => false,
        };

        if !stored {
            // MSVC emits frame data whose ranges violate containment when
            // prologs overlap; such records are dropped.
            tracing::warn!(
                module = self.name.as_str(),
                address = record.address,
                "dropping conflicting STACK WIN record"
            );
        }
    }
}

/// Builds the half-open range of a record, rejecting empty and
/// overflowing ranges.
fn checked_range(address: u64, size: u64) -> Option<Range<u64>> {
    let end = address.checked_add(size)?;
    (size > 0).then(|| address..end)
}

fn is_skippable_stack_error(error: &ParseSymbolError) -> bool {
    matches!(
        error.kind(),
        ParseSymbolErrorKind::Platform | ParseSymbolErrorKind::StackWinType
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn parse_resolves_function_file_and_line() {
        let data = b"FILE 1 /src/foo.c\nFUNC 1000 100 foo\n1000 20 42 1\n";
        let module = Module::parse("app", data).unwrap();

        let frame = module.lookup(0x1005);
        assert_eq!(frame.symbol.function_name, Some("foo"));
        assert_eq!(frame.symbol.source_file, Some("/src/foo.c"));
        assert_eq!(frame.symbol.source_line, Some(42));
    }

    #[test]
    fn missing_file_still_reports_line() {
        let data = b"FUNC 2000 50 bar\n2000 10 7 9\n";
        let module = Module::parse("app", data).unwrap();

        let frame = module.lookup(0x2001);
        assert_eq!(frame.symbol.function_name, Some("bar"));
        assert_eq!(frame.symbol.source_file, None);
        assert_eq!(frame.symbol.source_line, Some(7));
    }

    #[test]
    fn function_boundaries() {
        let data = b"FUNC 1000 100 foo\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(module.lookup(0x1000).symbol.function_name, Some("foo"));
        assert_eq!(module.lookup(0x10ff).symbol.function_name, Some("foo"));
        assert_eq!(module.lookup(0xfff).symbol.function_name, None);
        assert_eq!(module.lookup(0x1100).symbol.function_name, None);
    }

    #[test]
    fn overlapping_function_is_discarded_with_its_lines() {
        let data = b"FILE 1 /src/a.c\n\
                     FUNC 1000 100 a\n\
                     1000 20 11 1\n\
                     FUNC 1050 10 b\n\
                     1050 8 99 1\n";
        let module = Module::parse("app", data).unwrap();

        // The second function's range is covered by the first, so both the
        // function and its line records are gone.
        let frame = module.lookup(0x1050);
        assert_eq!(frame.symbol.function_name, Some("a"));
        assert_eq!(frame.symbol.source_line, None);
    }

    #[test]
    fn orphan_line_aborts() {
        let data = b"1000 10 5 1\n";
        let error = Module::parse("app", data).unwrap_err();
        assert_eq!(error, LoadError::OrphanLine("1000 10 5 1".to_string()));
    }

    #[test]
    fn blank_line_aborts() {
        let data = b"FUNC 1000 100 foo\n\n1000 10 1 1\n";
        assert!(Module::parse("app", data).is_err());
    }

    #[test]
    fn unknown_prefix_aborts() {
        // Unknown keywords take the line record path and fail there.
        let data = b"MODULE Linux x86 deadbeef app\n";
        assert!(Module::parse("app", data).is_err());
    }

    #[test]
    fn non_positive_line_number_aborts() {
        let data = b"FUNC 1000 100 foo\n1000 10 0 1\n";
        let error = Module::parse("app", data).unwrap_err();
        assert!(matches!(error, LoadError::Parse(_)));
    }

    #[test]
    fn overlapping_line_is_dropped() {
        let data = b"FILE 1 /src/a.c\n\
                     FUNC 1000 100 foo\n\
                     1000 20 11 1\n\
                     1010 20 12 1\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(module.lookup(0x1005).symbol.source_line, Some(11));
        assert_eq!(module.lookup(0x1015).symbol.source_line, Some(11));
        assert_eq!(module.lookup(0x1025).symbol.source_line, None);
    }

    #[test]
    fn duplicate_file_id_overwrites() {
        let data = b"FILE 1 /src/old.c\n\
                     FILE 1 /src/new.c\n\
                     FUNC 1000 100 foo\n\
                     1000 20 42 1\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(module.lookup(0x1005).symbol.source_file, Some("/src/new.c"));
    }

    #[test]
    fn malformed_file_record_is_skipped() {
        let data = b"FILE x nope.c\nFUNC 1000 100 foo\n";
        let module = Module::parse("app", data).unwrap();
        assert_eq!(module.lookup(0x1000).symbol.function_name, Some("foo"));
    }

    #[test]
    fn stack_win_frame_data() {
        let data = b"STACK WIN 4 1000 20 5 0 0 0 0 100 $eip\n";
        let module = Module::parse("app", data).unwrap();

        let info = module.lookup(0x1003).frame_info.unwrap();
        assert_eq!(info.prolog_size, 5);
        assert_eq!(info.max_stack_size, 0x100);
        assert_eq!(info.program_string, "$eip");

        assert_eq!(module.lookup(0x1020).frame_info, None);
    }

    #[test]
    fn stack_win_nested_ranges() {
        let data = b"STACK WIN 4 1000 100 5 0 0 0 0 10 outer\n\
                     STACK WIN 4 1020 10 1 0 0 0 0 20 inner\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(
            module.lookup(0x1025).frame_info.unwrap().program_string,
            "inner"
        );
        assert_eq!(
            module.lookup(0x1050).frame_info.unwrap().program_string,
            "outer"
        );
    }

    #[test]
    fn stack_win_partial_overlap_is_tolerated() {
        let data = b"STACK WIN 4 4242 1a a 0 0 0 0 0 p1\n\
                     STACK WIN 4 4243 2e 9 0 0 0 0 0 p2\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(
            module.lookup(0x4250).frame_info.unwrap().program_string,
            "p1"
        );
        assert_eq!(module.lookup(0x4260).frame_info, None);
    }

    #[test]
    fn stack_win_type_preference() {
        let data = b"STACK WIN 3 1000 20 0 0 0 0 0 0 standard\n\
                     STACK WIN 0 1000 20 0 0 0 0 0 0 fpo\n\
                     STACK WIN 4 1000 20 0 0 0 0 0 0 framedata\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(
            module.lookup(0x1010).frame_info.unwrap().program_string,
            "framedata"
        );
    }

    #[test]
    fn stack_win_reserved_types_are_stored_but_not_consulted() {
        let data = b"STACK WIN 1 1000 20 0 0 0 0 0 0 trap\n\
                     STACK WIN 2 1000 20 0 0 0 0 0 0 tss\n";
        let module = Module::parse("app", data).unwrap();
        assert_eq!(module.lookup(0x1010).frame_info, None);
    }

    #[test]
    fn stack_cfi_record_is_skipped() {
        let data = b"STACK CFI INIT 1880 2d .cfa: $rsp 8 + .ra: .cfa -8 + ^\n\
                     FUNC 1000 100 foo\n";
        let module = Module::parse("app", data).unwrap();
        assert_eq!(module.lookup(0x1000).symbol.function_name, Some("foo"));
    }

    #[test]
    fn stack_win_unknown_type_is_skipped() {
        let data = b"STACK WIN 7 1000 20 0 0 0 0 0 0 x\nFUNC 1000 100 foo\n";
        let module = Module::parse("app", data).unwrap();
        assert_eq!(module.lookup(0x1010).frame_info, None);
    }

    #[test]
    fn stack_win_bad_hex_aborts() {
        let data = b"STACK WIN 4 zz 20 0 0 0 0 0 0 x\n";
        assert!(Module::parse("app", data).is_err());
    }

    #[test]
    fn overflowing_function_range_is_dropped() {
        let data = b"FUNC ffffffffffffffff 2 wrap\nFUNC 1000 10 ok\n";
        let module = Module::parse("app", data).unwrap();

        assert_eq!(module.lookup(u64::MAX).symbol.function_name, None);
        assert_eq!(module.lookup(0x1000).symbol.function_name, Some("ok"));
    }

    #[test]
    fn bad_encoding_aborts() {
        let data = b"FUNC 1000 100 \xff\xfe\n";
        assert!(matches!(
            Module::parse("app", data).unwrap_err(),
            LoadError::BadEncoding(_)
        ));
    }

    #[test]
    fn lookup_is_idempotent() {
        let data = b"FILE 1 /src/foo.c\nFUNC 1000 100 foo\n1000 20 42 1\n";
        let module = Module::parse("app", data).unwrap();

        let first = module.lookup(0x1005);
        for _ in 0..4 {
            assert_eq!(module.lookup(0x1005), first);
        }
    }

    #[test]
    fn module_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Module<'static>>();
    }
}
