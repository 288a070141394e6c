//! Symbolic source line resolution for post-mortem crash analysis.
//!
//! This crate answers the central question of crash processing: given the
//! instruction address of a stack frame, which function, source file,
//! source line, and stack frame information apply? The answers come from
//! textual symbol files (parsed by `srcline-symfile`), one per binary
//! module of the crashed process.
//!
//! # Usage
//!
//! Load each module's symbol data into a [`Resolver`], then resolve the
//! frames reported by a stackwalker:
//!
//! ```
//! use srcline_resolver::{RawFrame, Resolver};
//!
//! let data = b"FILE 1 /src/foo.c\nFUNC 1000 100 foo\n1000 20 42 1\n";
//!
//! let mut resolver = Resolver::new();
//! resolver.load_module("app", data)?;
//!
//! let frame = resolver.resolve_frame(&RawFrame {
//!     module_name: "app",
//!     module_base: 0x40000000,
//!     instruction: 0x40001005,
//! });
//!
//! assert_eq!(frame.symbol.function_name, Some("foo"));
//! assert_eq!(frame.symbol.source_file, Some("/src/foo.c"));
//! assert_eq!(frame.symbol.source_line, Some(42));
//! # Ok::<(), srcline_resolver::LoadError>(())
//! ```
//!
//! Misses are not errors: fields of the result simply stay `None`. Stack
//! frame information is resolved independently of the source lookup, so a
//! frame may carry unwind data even when no function is known for it.
//!
//! # Address structure
//!
//! All symbol data is indexed by module-relative addresses. Function and
//! line ranges must tile without overlap and live in a [`RangeMap`];
//! stack frame info ranges may nest (a function's record enclosing the
//! records of its prolog, for instance) and live in a [`NestedRangeMap`]
//! per frame info type. Real-world symbol files violate these rules in
//! places; conflicting records are dropped during loading rather than
//! failing the module.

#![warn(missing_docs)]

mod maps;
mod module;
mod resolver;

pub use crate::maps::{NestedRangeMap, RangeMap};
pub use crate::module::{FrameSymbol, LoadError, Module, ResolvedFrame, StackFrameInfo};
pub use crate::resolver::{RawFrame, Resolver};
