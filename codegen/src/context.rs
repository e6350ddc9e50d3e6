//! The per-translation-unit compilation context.
//!
//! One `CompileCtx` owns all mutable state of a compilation: the type pool,
//! the assembly buffer, the diagnostics sink, the function registry, and the
//! per-function generator state (location arena, scope stack, register
//! bookkeeping, temp-slot pool). The original design kept several of these
//! as process globals; here everything is threaded through the context so
//! multiple translation units can be compiled concurrently, each with its
//! own context.

use crate::asm::Assembler;
use crate::ast::{FuncSig, GlobalDef, Pos};
use crate::diag::Diagnostics;
use crate::isa::{Flags, TargetIsa};
use crate::loc::{Loc, LocArena, LocData, LocKind};
use crate::preproc::{PreScope, PreprocData};
use crate::scope::Scope;
use crate::types::{Type, TypePool};
use crate::{CodeOffset, Word};
use lilycc_entity::PrimaryMap;
use rustc_hash::FxHashMap;

/// Maximum number of register units any target may declare.
pub const MAX_REG_UNITS: usize = 8;

/// State describing the function currently being generated.
#[derive(Clone, Debug)]
pub struct CurFunc {
    pub sig: FuncSig,
    /// Logical stack size right after the function entry sequence; the
    /// epilogue winds back to this before popping saved registers.
    pub base_stack_size: CodeOffset,
    /// Next temp-slot number, for `<func>.LT<n>` label naming.
    pub temp_no: u32,
    /// Next declared-variable number, for `<func>.LV<n>` label naming.
    pub var_no: u32,
}

/// The compilation context for one translation unit.
pub struct CompileCtx {
    pub types: TypePool,
    pub asm: Assembler,
    pub diag: Diagnostics,
    pub flags: Flags,
    /// Signatures of every function seen so far, keyed by name.
    pub functions: FxHashMap<String, FuncSig>,
    /// Global variables: name to (type, label).
    pub globals: FxHashMap<String, (Type, String)>,

    /* ==== Per-function generator state ==== */
    /// Location arena; freed wholesale when the function is done.
    pub locs: LocArena,
    /// The scope stack. Empty between functions.
    pub scopes: Vec<Scope>,
    /// LRU order of the registers; `reg_order[0]` is most recently used.
    pub reg_order: [u8; MAX_REG_UNITS],
    /// Per-instruction temporary locks. A locked register may not be
    /// evicted while the current instruction is still placing operands.
    pub reg_lock: [bool; MAX_REG_UNITS],
    /// The temp-slot pool: one entry per slot, true while in use.
    pub temp_usage: Vec<bool>,
    /// Labels of the temp slots, for memory-temp targets.
    pub temp_labels: Vec<String>,
    /// Logical stack offset of temp slot 0, for stack-temp targets.
    pub temp_base: CodeOffset,
    /// Per-scope preprocessing records of the current function.
    pub preproc: PrimaryMap<PreScope, PreprocData>,
    /// The function currently being generated.
    pub cur: Option<CurFunc>,
}

impl CompileCtx {
    /// Create a fresh context for compiling one translation unit with the
    /// given target.
    pub fn new(isa: &dyn TargetIsa, filename: &str) -> Self {
        let cfg = *isa.config();
        Self {
            types: TypePool::new(&cfg),
            asm: Assembler::new(cfg),
            diag: Diagnostics::new(filename),
            flags: *isa.flags(),
            functions: FxHashMap::default(),
            globals: FxHashMap::default(),
            locs: LocArena::new(),
            scopes: Vec::new(),
            reg_order: core::array::from_fn(|i| i as u8),
            reg_lock: [false; MAX_REG_UNITS],
            temp_usage: Vec::new(),
            temp_labels: Vec::new(),
            temp_base: 0,
            preproc: PrimaryMap::new(),
            cur: None,
        }
    }

    /// Reset the per-function state and make `sig` the current function.
    pub fn begin_function(&mut self, sig: FuncSig) {
        self.locs.clear();
        self.scopes.clear();
        self.reg_order = core::array::from_fn(|i| i as u8);
        self.reg_lock = [false; MAX_REG_UNITS];
        self.temp_usage.clear();
        self.temp_labels.clear();
        self.temp_base = 0;
        self.preproc.clear();
        self.cur = Some(CurFunc {
            sig,
            base_stack_size: 0,
            temp_no: 0,
            var_no: 0,
        });
    }

    /// Done with the current function.
    pub fn end_function(&mut self) {
        self.cur = None;
        self.scopes.clear();
        self.locs.clear();
    }

    /// The current function, which must exist.
    pub fn cur_func(&self) -> &CurFunc {
        self.cur.as_ref().expect("inside a function")
    }

    /// Name of the current function.
    pub fn func_name(&self) -> &str {
        &self.cur_func().sig.name
    }

    /* ================ Locations ================ */

    /// Allocate a location in the function arena.
    pub fn alloc(&mut self, data: LocData) -> Loc {
        self.locs.push(data)
    }

    /// Allocate an anonymous location.
    pub fn alloc_anon(&mut self, kind: LocKind, ty: Type) -> Loc {
        self.locs.push(LocData::anon(kind, ty))
    }

    /// Allocate a constant location.
    pub fn alloc_const(&mut self, value: Word, ty: Type) -> Loc {
        self.alloc_anon(LocKind::Const(value), ty)
    }

    /// Allocate a void location.
    pub fn alloc_void(&mut self) -> Loc {
        let void = self.types.simple(crate::types::SimpleType::Void);
        self.alloc_anon(LocKind::Void, void)
    }

    /// The kind of a location.
    pub fn kind(&self, loc: Loc) -> &LocKind {
        &self.locs[loc].kind
    }

    /// The type of the value at a location.
    pub fn ty_of(&self, loc: Loc) -> Type {
        self.locs[loc].ty
    }

    /// Size in words of the value at a location.
    pub fn size_of(&self, loc: Loc) -> CodeOffset {
        self.types.size_words(self.locs[loc].ty)
    }

    /* ================= Scopes ================== */

    /// The innermost scope.
    pub fn scope(&self) -> &Scope {
        self.scopes.last().expect("scope stack not empty")
    }

    /// The innermost scope, mutable.
    pub fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack not empty")
    }

    /// Open a new scope: clones the parent's register occupancy snapshot
    /// and inherits its stack accounting.
    pub fn push_scope(&mut self) {
        let scope = match self.scopes.last() {
            Some(parent) => Scope {
                vars: FxHashMap::default(),
                regs: parent.regs,
                stack_size: parent.stack_size,
                real_stack_size: parent.real_stack_size,
            },
            None => Scope::default(),
        };
        log::trace!("push scope (depth {})", self.scopes.len() + 1);
        self.scopes.push(scope);
    }

    /// Close the innermost scope, restoring the parent's register occupancy
    /// to what it was at the matching push. Evictions are eager, so no
    /// restoration code is generated.
    pub fn pop_scope(&mut self) {
        let old = self.scopes.pop().expect("scope to pop");
        log::trace!(
            "pop scope (depth {}), stack size was {}",
            self.scopes.len(),
            old.stack_size
        );
    }

    /// Find the location bound to an identifier, searching outward through
    /// the scope stack, then the globals.
    pub fn get_variable(&mut self, name: &str) -> Option<Loc> {
        for scope in self.scopes.iter().rev() {
            if let Some(loc) = scope.vars.get(name) {
                return Some(*loc);
            }
        }
        // Globals materialise as a label location in the current arena.
        if let Some((ty, label)) = self.globals.get(name) {
            let (ty, label) = (*ty, label.clone());
            return Some(self.alloc(LocData {
                kind: LocKind::Label(label),
                ty,
                owner: Some(name.to_string()),
                default_loc: None,
            }));
        }
        None
    }

    /// Bind an identifier in the innermost scope. Returns false if the name
    /// was already bound in this scope.
    pub fn define_var(&mut self, name: &str, loc: Loc) -> bool {
        self.scope_mut().vars.insert(name.to_string(), loc).is_none()
    }

    /// Register a global variable and emit its backing label.
    pub fn define_global(&mut self, def: &GlobalDef) {
        let size = self.types.size_words(def.ty);
        match def.init {
            Some(value) => {
                let words: Vec<Word> = (0..size)
                    .map(|i| value >> (i * self.asm.config().mem_bits))
                    .collect();
                self.asm.data_label(&def.name, &words);
            }
            None => self.asm.bss_label(&def.name, size.max(1)),
        }
        self.globals
            .insert(def.name.clone(), (def.ty, def.name.clone()));
    }

    /// Record that the words emitted next belong to this source span.
    pub fn mark_pos(&mut self, pos: Pos) {
        if pos.y0 != 0 {
            self.asm.write_srcpos(pos);
        }
    }
}
