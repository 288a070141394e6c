//! Dispatching frames to the symbol data of their modules.

use std::collections::BTreeMap;

use crate::module::{LoadError, Module, ResolvedFrame};

/// A raw stack frame as produced by a stackwalker.
///
/// Carries the absolute instruction address together with the name and
/// load address of the module containing it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawFrame<'a> {
    /// Name of the module containing the instruction.
    pub module_name: &'a str,
    /// Absolute address the module was loaded at.
    pub module_base: u64,
    /// Absolute address of the instruction.
    pub instruction: u64,
}

/// Resolves frames against the symbol data of any number of modules.
///
/// Modules are keyed by their unique name. Loading borrows the caller's
/// symbol data for the lifetime `'d`; resolved frames borrow with the
/// same lifetime and remain valid as long as the resolver does. Dropping
/// the resolver releases all modules and their indices.
///
/// Loading requires exclusive access, while any number of threads may
/// resolve frames against a shared resolver concurrently.
#[derive(Debug, Default)]
pub struct Resolver<'d> {
    modules: BTreeMap<String, Module<'d>>,
}

impl<'d> Resolver<'d> {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Resolver {
            modules: BTreeMap::new(),
        }
    }

    /// Parses symbol file data and installs it as module `name`.
    ///
    /// Fails without touching existing state if a module of the same name
    /// is already loaded or if the data is structurally malformed.
    pub fn load_module(&mut self, name: &str, data: &'d [u8]) -> Result<(), LoadError> {
        if self.modules.contains_key(name) {
            return Err(LoadError::DuplicateModule(name.to_string()));
        }

        let module = Module::parse(name, data)?;
        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    /// Returns true if a module with the given name has been loaded.
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Returns the module with the given name, if loaded.
    pub fn module(&self, name: &str) -> Option<&Module<'d>> {
        self.modules.get(name)
    }

    /// Resolves a frame's instruction against its module's symbol data.
    ///
    /// The instruction is translated to a module-relative address before
    /// the lookup. Frames of unknown modules, and frames whose instruction
    /// lies below their module's base, resolve to an empty result.
    pub fn resolve_frame(&self, frame: &RawFrame<'_>) -> ResolvedFrame<'d> {
        let module = match self.modules.get(frame.module_name) {
            Some(module) => module,
            None => return ResolvedFrame::default(),
        };

        match frame.instruction.checked_sub(frame.module_base) {
            Some(rva) => module.lookup(rva),
            None => ResolvedFrame::default(),
        }
    }
}
