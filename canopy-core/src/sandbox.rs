//! Code sandbox: one resident WebAssembly module per node, invoked on a dedicated thread.
//!
//! Every load builds a fresh engine and drops the previous one, so nothing from an earlier
//! module survives. Loading only parses, validates and links; no module code runs until an
//! invocation, which gets its own store and instance on its own thread. The entry point is
//! the exported function `_start`, which must take no parameters and return nothing.
//! Modules with a start section are rejected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use sha2::{Digest, Sha256};
use wasmi::{Engine, ExternType, Instance, Linker, Module, Store};

use crate::log::Logger;
use crate::protocol::Op;

/// Exported symbol bound as the runnable unit.
pub const ENTRY_SYMBOL: &str = "_start";

/// Observable sandbox state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Nothing loaded yet.
    Empty,
    /// A module with a valid entry point is resident.
    Loaded,
    /// The last load failed; nothing is runnable.
    Rejected,
}

struct Resident {
    id: String,
    engine: Engine,
    module: Arc<Module>,
}

enum Slot {
    Empty,
    Loaded(Resident),
    Rejected,
}

pub struct Sandbox {
    slot: Slot,
    invocations: u64,
    running: Arc<AtomicUsize>,
}

/// Counts an invocation as running for as long as it lives.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        RunningGuard(count)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            slot: Slot::Empty,
            invocations: 0,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> ModuleState {
        match self.slot {
            Slot::Empty => ModuleState::Empty,
            Slot::Loaded(_) => ModuleState::Loaded,
            Slot::Rejected => ModuleState::Rejected,
        }
    }

    /// Number of invocations started since this sandbox was created.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Invocations currently executing module code, across every module loaded so far.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Identifier of the resident module, if any.
    pub fn module_id(&self) -> Option<&str> {
        match &self.slot {
            Slot::Loaded(resident) => Some(&resident.id),
            _ => None,
        }
    }

    /// Unload whatever is resident, then parse, validate and link `image`.
    /// Returns the identifiers of the loaded modules.
    pub fn load(&mut self, image: &[u8]) -> Result<Vec<String>, SandboxError> {
        self.slot = Slot::Empty;
        match bind(image) {
            Ok(resident) => {
                let ids = vec![resident.id.clone()];
                self.slot = Slot::Loaded(resident);
                Ok(ids)
            }
            Err(e) => {
                self.slot = Slot::Rejected;
                Err(e)
            }
        }
    }

    /// Start the entry point on its own thread, in a fresh store, and return immediately.
    /// The invocation is not tracked or cancelled afterwards.
    pub fn invoke(&mut self, log: &Logger) -> Result<u64, SandboxError> {
        let resident = match &self.slot {
            Slot::Loaded(resident) => resident,
            _ => return Err(SandboxError::NoImage),
        };
        let seq = self.invocations + 1;
        let engine = resident.engine.clone();
        let module = resident.module.clone();
        let id = resident.id.clone();
        let running = self.running.clone();
        let log = log.clone();
        thread::Builder::new()
            .name(format!("canopy-invoke-{seq}"))
            .spawn(move || {
                let _running = RunningGuard::enter(running);
                match instantiate(&engine, &module) {
                    Ok((instance, mut store)) => {
                        match instance
                            .get_typed_func::<(), ()>(&store, ENTRY_SYMBOL)
                            .and_then(|entry| entry.call(&mut store, ()))
                        {
                            Ok(()) => log.info(format!("Module {id} invocation #{seq} returned")),
                            Err(e) => {
                                log.fail(format!("Module {id} invocation #{seq} trapped: {e}"))
                            }
                        }
                    }
                    Err(e) => log.fail(format!("Module {id} invocation #{seq} failed: {e}")),
                }
            })
            .map_err(SandboxError::Spawn)?;
        self.invocations = seq;
        Ok(seq)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}
fn bind(image: &[u8]) -> Result<Resident, SandboxError> {
    let engine = Engine::default();
    let module =
        Module::new(&engine, image).map_err(|e| SandboxError::BadImage(e.to_string()))?;

    let export = module
        .exports()
        .find(|export| export.name() == ENTRY_SYMBOL)
        .ok_or(SandboxError::NoEntryPoint)?;
    let ExternType::Func(ty) = export.ty() else {
        return Err(SandboxError::NoEntryPoint);
    };
    if !ty.params().is_empty() || !ty.results().is_empty() {
        return Err(SandboxError::InvalidSignature {
            params: ty.params().len(),
            results: ty.results().len(),
        });
    }

    // Imports must resolve and no start section may exist; the scratch store is dropped here.
    instantiate(&engine, &module).map_err(SandboxError::BadImage)?;

    Ok(Resident {
        id: module_id(image),
        engine,
        module: Arc::new(module),
    })
}

/// Link `module` into a fresh store without running any module code.
fn instantiate(engine: &Engine, module: &Module) -> Result<(Instance, Store<()>), String> {
    let mut store = Store::new(engine, ());
    let instance = Linker::<()>::new(engine)
        .instantiate(&mut store, module)
        .map_err(|e| e.to_string())?
        .ensure_no_start(&mut store)
        .map_err(|e| e.to_string())?;
    Ok((instance, store))
}

/// `sha256:` plus the first 8 digest bytes in hex.
pub fn module_id(image: &[u8]) -> String {
    let digest = Sha256::digest(image);
    let mut id = String::from("sha256:");
    for byte in &digest[..8] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("bad image: {0}")]
    BadImage(String),
    #[error("no `_start` entry point")]
    NoEntryPoint,
    #[error("entry point `_start` has invalid signature ({params} params, {results} results)")]
    InvalidSignature { params: usize, results: usize },
    #[error("no image loaded")]
    NoImage,
    #[error("could not start invocation thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SandboxError {
    /// Error opcode reported back to the uploader.
    pub fn op(&self) -> Op {
        match self {
            SandboxError::BadImage(_) => Op::BadImage,
            SandboxError::NoEntryPoint => Op::NoEntryPoint,
            SandboxError::InvalidSignature { .. } => Op::EntryPointInvalidSignature,
            SandboxError::NoImage | SandboxError::Spawn(_) => Op::NoImage,
        }
    }
}
