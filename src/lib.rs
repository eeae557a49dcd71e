//! `acpi-core` is a pure-Rust AML (ACPI Machine Language) parser and interpreter, used for parsing
//! the DSDT and SSDT tables from ACPI and evaluating the control methods they define. This crate
//! can be used by kernels to gather information about the hardware, and invoke control methods to
//! query and change the state of devices in a hardware-independent way.
//!
//! ### Using the library
//! Create an [`AmlContext`] with [`AmlContext::new`], giving it a [`Handler`] implementation that
//! wires the interpreter up to the host's memory, IO, PCI config space, and semaphore primitives.
//! Then hand it each ACPI table (DSDT, then every SSDT) via [`AmlContext::parse_table`] - once
//! parsed, the table's memory can be unmapped, since everything the interpreter needs has been
//! copied onto the heap. Control methods can be invoked directly:
//! ```ignore
//! let result = aml_context.invoke_method(&AmlName::from_str("\\_SB.HPET._CRS").unwrap(), value::Args::EMPTY);
//! ```
//! or indirectly, by simply looking a name up and letting the caller decide whether it was really
//! a method (`\_STA` is often just a plain `Integer`, not a method that returns one):
//! ```ignore
//! let status = aml_context.namespace.get(&AmlName::from_str("\\_SB.PCI0._STA").unwrap());
//! ```
//!
//! ### About the parser
//! The parser is written using a set of custom parser combinators - the code can be confusing on
//! first reading, but provides an extensible and type-safe way to write parsers. The combinators
//! live in `parser.rs`. The actual grammar productions are grouped into modules loosely matching
//! the AML grammar sections of the ACPI specification; most are written in terms of combinators,
//! but a few (field lists, package lengths) are clearer written imperatively.
//!
//! ### About the interpreter
//! Beyond parsing, this crate reproduces the parts of the ACPICA-style runtime a correct
//! interpreter needs: a namespace of owner-tagged entries that can be bulk-unloaded
//! ([`namespace`]), per-method concurrency gating and a walk-state pool ([`walk`]), the ACPI
//! global lock and a lock-ordering discipline ([`sync`]), and an address-space dispatcher that
//! fans field accesses out to whichever handler the host registered for that space
//! ([`opregion`]).

#![no_std]
#![feature(decl_macro)]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod test_utils;

pub(crate) mod expression;
pub mod handler;
pub(crate) mod misc;
pub(crate) mod name_object;
pub(crate) mod namespace;
pub(crate) mod object;
pub(crate) mod opcode;
pub mod opregion;
pub mod owner;
pub(crate) mod parser;
pub mod pci_routing;
pub(crate) mod pkg_length;
pub mod resource;
pub(crate) mod statement;
pub(crate) mod sync;
pub mod table;
pub(crate) mod term_object;
pub mod value;
pub(crate) mod walk;

pub use crate::{handler::Handler, namespace::*, value::AmlValue};

use alloc::{
    collections::BTreeMap,
    format,
    string::{String, ToString},
    sync::Arc,
};
use bit_field::BitField;
use core::{mem, str::FromStr};
use log::{error, warn};
use misc::{ArgNum, LocalNum};
use name_object::Target;
use opregion::{AddressSpaceDispatcher, RegionSpace};
use owner::{OwnerId, OwnerIdAllocator};
use parser::{Parser, Propagate};
use pkg_length::PkgLength;
use spin::Mutex as SpinMutex;
use sync::GlobalLock;
use term_object::term_list;
use value::{
    AmlType, Args, FieldAccessType, FieldContainer, FieldFlags, FieldLockRule, FieldUpdateRule, MethodCode,
};
use walk::{ConcurrencyTable, MethodInvocationGuard, NotifyTable, WalkList, WalkStatePool};

/// AML has a `RevisionOp` operator that returns the "AML interpreter revision". It's not clear
/// what this is actually used for, but this is ours.
pub const AML_INTERPRETER_REVISION: u64 = 0;

/// Describes how much debug information the parser should emit. Set the "maximum" expected verbosity in
/// the context's `debug_verbosity` - everything will be printed that is less or equal in 'verbosity'.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum DebugVerbosity {
    /// Print no debug information
    None,
    /// Print heads and tails when entering and leaving scopes of major objects, but not more minor ones.
    Scopes,
    /// Print heads and tails when entering and leaving scopes of all objects.
    AllScopes,
    /// Print heads and tails of all objects, and extra debug information as it's parsed.
    All,
}

#[derive(Debug)]
struct MethodContext {
    /// AML local variables. These are used when we invoke a control method. A `None` value represents a null AML
    /// object.
    locals: [Option<AmlValue>; 8],
    /// If we're currently invoking a control method, this stores the arguments that were passed to
    /// it. It's `None` if we aren't invoking a method.
    args: Args,
}

impl MethodContext {
    fn new(args: Args) -> MethodContext {
        // XXX: this is required because `Option<AmlValue>` is not `Copy`, so it can't be used to initialize an
        // array, but consts can :(
        const NONE_BUT_CONST: Option<AmlValue> = None;

        MethodContext { locals: [NONE_BUT_CONST; 8], args }
    }
}

pub struct AmlContext {
    /// The `Handler` passed from the library user. Stored behind an `Arc` (rather than the `Box` a
    /// single-owner design would use) so that [`MethodInvocationGuard`] can hold its own clone
    /// across a method invocation without borrowing `self` - a method body executes with `&mut
    /// AmlContext`, which a borrowed handler reference would conflict with.
    handler: Arc<dyn Handler>,

    pub namespace: Namespace,
    method_context: Option<MethodContext>,

    /*
     * These track the state of the context while it's parsing an AML table or executing a
     * control method. `current_scope` is read directly as a field by `term_object::named_obj`
     * (which needs to swap it in place while recursing into a scope's body) and through the
     * `current_scope()` accessor by `name_object` (which only ever needs to read it).
     */
    pub(crate) current_scope: AmlName,
    current_owner: OwnerId,
    scope_indent: usize,
    debug_verbosity: DebugVerbosity,

    /// Hands out owner ids for table loads and method invocations (spec.md §4.4 step 1).
    owner_allocator: OwnerIdAllocator,
    /// Per-method semaphore + live-thread-count, keyed by method identity (spec.md §4.4 steps 1-2).
    concurrency: ConcurrencyTable,
    /// The stack of owner ids currently executing, outermost table load first.
    walk_list: WalkList,
    /// Reusable walk-state records, acquired on method entry and released on exit.
    walk_state_pool: WalkStatePool,
    /// The ACPI global lock, acquired around field accesses whose `FieldLockRule` is `Lock`.
    global_lock: GlobalLock,
    /// Fans `OpRegion` reads/writes out to whichever handler the host registered for that space.
    pub address_space: AddressSpaceDispatcher,
    /// Per-device system/driver notify handler slots (spec.md §4.6), keyed by the device's
    /// absolute name. Populated by [`AmlContext::install_system_notify_handler`] /
    /// [`AmlContext::install_driver_notify_handler`] and consulted by `Notify`.
    notify_handlers: SpinMutex<BTreeMap<AmlName, NotifyTable>>,
}

impl AmlContext {
    /// Creates a new `AmlContext` - the central type in managing the AML tables. Only one of these should be
    /// created, and it should be passed the DSDT and all SSDTs defined by the hardware.
    pub fn new(handler: alloc::boxed::Box<dyn Handler>, debug_verbosity: DebugVerbosity) -> AmlContext {
        let mut context = AmlContext {
            handler: Arc::from(handler),
            namespace: Namespace::new(),
            method_context: None,

            current_scope: AmlName::root(),
            current_owner: OwnerId::PREDEFINED,
            scope_indent: 0,
            debug_verbosity,

            owner_allocator: OwnerIdAllocator::new(),
            concurrency: ConcurrencyTable::new(),
            walk_list: WalkList::new(),
            walk_state_pool: WalkStatePool::new(),
            global_lock: GlobalLock::new(),
            address_space: AddressSpaceDispatcher::new(),
            notify_handlers: SpinMutex::new(BTreeMap::new()),
        };

        context.add_predefined_objects();
        context
    }

    /// The scope currently in effect - the scope a relative name is resolved against.
    pub(crate) fn current_scope(&self) -> &AmlName {
        &self.current_scope
    }

    /// The owner id that should be stamped onto any namespace entry created right now: either the
    /// table currently being loaded, or the method currently executing (spec.md §4.4 step 5).
    pub(crate) fn current_owner(&self) -> OwnerId {
        self.current_owner
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    /// Installs `device`'s system (OSPM) notify handler, replacing any previous one.
    pub fn install_system_notify_handler(&self, device: AmlName, handler: Arc<dyn Fn(u64) + Send + Sync>) {
        self.notify_handlers.lock().entry(device).or_default().system = Some(handler);
    }

    /// Installs `device`'s driver notify handler, replacing any previous one.
    pub fn install_driver_notify_handler(&self, device: AmlName, handler: Arc<dyn Fn(u64) + Send + Sync>) {
        self.notify_handlers.lock().entry(device).or_default().driver = Some(handler);
    }

    /// Dispatches a `Notify(device, value)` to both of `device`'s registered handlers, if any are
    /// installed (spec.md §4.6: "`notify` dispatches to both if present").
    pub(crate) fn dispatch_notify(&self, device: &AmlName, value: u64) {
        if let Some(table) = self.notify_handlers.lock().get(device) {
            table.notify(value);
        }
    }

    /// Parses a table's AML stream, binding every object it defines into the namespace. On
    /// failure, any entries the partial parse managed to create are rolled back by owner id
    /// (spec.md §7: "partial work rolled back by owner-id sweep when possible"). Returns the
    /// table's owner id, which a caller that wants to unload it later should hold onto.
    pub fn parse_table(&mut self, stream: &[u8]) -> Result<OwnerId, AmlError> {
        fn stream_context(stream: &[u8], err_buf: &[u8]) -> String {
            const BEFORE_LEN: usize = 4;
            const ABBREV_LEN: usize = 4;
            let abbreviated = if err_buf.len() >= ABBREV_LEN { &err_buf[..ABBREV_LEN] } else { err_buf };

            if let Some(position) = (err_buf.as_ptr() as usize).checked_sub(stream.as_ptr() as usize) {
                if position <= stream.len() {
                    let before = if position > BEFORE_LEN {
                        &stream[position - BEFORE_LEN..position]
                    } else {
                        &stream[..position]
                    };
                    return format!(
                        "position {:#X}: preceding {:X?}, buf {:X?}",
                        position + 36,
                        before,
                        abbreviated
                    );
                }
            }
            format!("buf {:X?}", abbreviated)
        }

        if stream.is_empty() {
            return Err(AmlError::UnexpectedEndOfStream);
        }

        let owner = self.owner_allocator.allocate();
        let old_owner = mem::replace(&mut self.current_owner, owner);
        self.walk_list.push(owner);

        let table_length = PkgLength::from_raw_length(stream, stream.len() as u32).unwrap();
        let result = match term_object::term_list(table_length).parse(stream, self) {
            Ok(_) => Ok(owner),
            Err((err_buf, _, Propagate::Err(err))) => {
                error!("Failed to parse AML stream. Err = {:?}, {}", err, stream_context(stream, err_buf));
                self.namespace.delete_by_owner(owner);
                Err(err)
            }
            Err((_, _, other)) => {
                error!("AML table evaluated to unexpected result: {:?}", other);
                self.namespace.delete_by_owner(owner);
                Err(AmlError::MalformedStream)
            }
        };

        self.walk_list.pop();
        self.current_owner = old_owner;
        result
    }

    /// Unloads a previously-parsed table, removing every namespace entry it (or any method called
    /// while it was the current owner) created.
    pub fn unload_table(&mut self, owner: OwnerId) {
        self.namespace.delete_by_owner(owner);
    }

    pub fn invoke_method(&mut self, path: &AmlName, args: Args) -> Result<AmlValue, AmlError> {
        let (flags, code, concurrency) = match self.namespace.get(path)?.clone() {
            AmlValue::Method { flags, code, concurrency } => (flags, code, concurrency),

            /*
             * AML can encode methods that don't require any computation simply as the value that would
             * otherwise be returned (e.g. a `_STA` object simply being an `AmlValue::Integer`, instead
             * of a method that just returns an integer).
             */
            value => return Ok(value),
        };

        if args.0.len() > flags.arg_count() as usize {
            return Err(AmlError::TooManyArgs);
        }

        let method_identity = match &code {
            MethodCode::Aml(body) => body.as_ptr() as usize,
            MethodCode::Native(f) => Arc::as_ptr(f) as *const () as usize,
        };
        let gate = self.concurrency.gate_for(method_identity, concurrency, self.handler())?;
        let _guard = MethodInvocationGuard::enter(gate, self.handler.clone())?;

        /*
         * Allocate an owner id for everything this invocation creates, and record it on the walk
         * list (spec.md §4.4 steps 1 and 5) so a nested call's bookkeeping nests correctly.
         */
        let owner = self.owner_allocator.allocate();
        self.walk_list.push(owner);
        let walk_record = self.walk_state_pool.acquire();

        /*
         * Set up the state we expect to enter the method with, clearing local variables to "null"
         * and setting the arguments. Save the current method state, scope, and owner, so if we're
         * already executing another control method, we resume into it correctly.
         */
        let old_context = mem::replace(&mut self.method_context, Some(MethodContext::new(args)));
        let old_scope = mem::replace(&mut self.current_scope, path.clone());
        let old_owner = mem::replace(&mut self.current_owner, owner);

        /*
         * Create a namespace level to store local objects created by the invocation.
         */
        if let Err(err) = self.namespace.add_level(path.clone(), LevelType::MethodLocals, owner) {
            self.method_context = old_context;
            self.current_scope = old_scope;
            self.current_owner = old_owner;
            self.walk_state_pool.release(walk_record);
            self.walk_list.pop();
            return Err(err);
        }

        let return_value = match code {
            MethodCode::Aml(ref body) => {
                match term_list(PkgLength::from_raw_length(body, body.len() as u32).unwrap()).parse(body, self) {
                    // If the method doesn't return a value, we implicitly return `0`
                    Ok(_) => Ok(AmlValue::Integer(0)),
                    Err((_, _, Propagate::Return(result))) => Ok(result),
                    Err((_, _, Propagate::Break)) => Err(AmlError::BreakInInvalidPosition),
                    Err((_, _, Propagate::Continue)) => Err(AmlError::ContinueInInvalidPosition),
                    Err((_, _, Propagate::Err(err))) => {
                        error!("Failed to execute control method: {:?}", err);
                        Err(err)
                    }
                }
            }

            MethodCode::Native(ref method) => match (method)(self) {
                Ok(result) => Ok(result),
                Err(err) => {
                    error!("Failed to execute control method: {:?}", err);
                    Err(err)
                }
            },
        };

        /*
         * Locally-created objects are destroyed on method exit (§5.5.2.3 of the ACPI spec): sweep
         * away everything this invocation's owner id tagged, including the `MethodLocals` level
         * itself and any globally-scoped names the body created via a bare `Name`/`Device`/etc.
         */
        self.namespace.delete_by_owner(owner);
        self.walk_state_pool.release(walk_record);
        self.walk_list.pop();

        /*
         * Restore the old state.
         */
        self.method_context = old_context;
        self.current_scope = old_scope;
        self.current_owner = old_owner;

        return_value
    }

    pub fn initialize_objects(&mut self) -> Result<(), AmlError> {
        use name_object::NameSeg;
        use value::StatusObject;

        /*
         * If `\_SB._INI` exists, we unconditionally execute it at the beginning of device initialization.
         */
        match self.invoke_method(&AmlName::from_str("\\_SB._INI").unwrap(), Args::default()) {
            Ok(_) => (),
            Err(AmlError::ValueDoesNotExist(_)) => (),
            Err(err) => return Err(err),
        }

        /*
         * Next, we traverse the namespace, looking for devices.
         *
         * XXX: we clone the namespace here, which obviously drives up heap burden quite a bit (not as much as you
         * might first expect though - we're only duplicating the level data structure, not all the objects). The
         * issue here is that we need to access the namespace during traversal (e.g. to invoke a method), which the
         * borrow checker really doesn't like. A better solution could be a iterator-like traversal system that
         * keeps track of the namespace without keeping it borrowed. This works for now.
         */
        self.namespace.clone().traverse(|path, level: &NamespaceLevel| match level.typ {
            LevelType::Device => {
                let status = if level.values.contains_key(&NameSeg::from_str("_STA").unwrap()) {
                    self.invoke_method(&AmlName::from_str("_STA").unwrap().resolve(path)?, Args::default())?
                        .as_status()?
                } else {
                    StatusObject::default()
                };

                /*
                 * If the device is present and has an `_INI` method, invoke it.
                 */
                if status.present && level.values.contains_key(&NameSeg::from_str("_INI").unwrap()) {
                    log::info!("Invoking _INI at level: {}", path);
                    self.invoke_method(&AmlName::from_str("_INI").unwrap().resolve(path)?, Args::default())?;
                }

                /*
                 * We traverse the children of this device if it's present, or isn't present but is functional.
                 */
                Ok(status.present || status.functional)
            }

            LevelType::Scope => Ok(true),

            LevelType::Processor => Ok(false),
            LevelType::PowerResource => Ok(false),
            LevelType::ThermalZone => Ok(false),
            LevelType::MethodLocals => Ok(false),
        })?;

        Ok(())
    }

    pub(crate) fn read_target(&self, target: &Target) -> Result<&AmlValue, AmlError> {
        match target {
            Target::Null => Err(AmlError::Unimplemented),
            Target::Name(name) => {
                let (_, value) = self.namespace.search(name, &self.current_scope)?;
                Ok(value)
            }
            Target::Debug => Err(AmlError::Unimplemented),
            Target::Arg(arg) => self.current_arg(*arg),
            Target::Local(local) => self.local(*local),
        }
    }

    /// Dispatches a field read through its [`FieldContainer`]: straight to a region, through an
    /// index/data register pair, or bank-selected first (spec.md §4.5).
    pub(crate) fn read_field(
        &mut self,
        container: &FieldContainer,
        flags: FieldFlags,
        bit_index: u64,
        bit_length: u64,
    ) -> Result<AmlValue, AmlError> {
        match container {
            FieldContainer::Region(region_name) => {
                let (space, base) = self.region_geometry(region_name)?;
                let value = self.with_field_lock(flags, || self.read_region_bits(space, base, bit_index, bit_length))?;
                Ok(AmlValue::Integer(value))
            }

            FieldContainer::Index { index, data } => {
                let mut index_register = self.namespace.get(index)?.clone();
                let data_register = self.namespace.get(data)?.clone();
                self.read_indexed_field(&mut index_register, &data_register, flags, bit_index / 8, bit_length)
            }

            FieldContainer::Bank { region, bank_select, bank_value } => {
                let mut bank_select_register = self.namespace.get(bank_select)?.clone();
                bank_select_register.write_field(AmlValue::Integer(*bank_value), self)?;
                let (space, base) = self.region_geometry(region)?;
                let value = self.with_field_lock(flags, || self.read_region_bits(space, base, bit_index, bit_length))?;
                Ok(AmlValue::Integer(value))
            }
        }
    }

    pub(crate) fn write_field(
        &mut self,
        container: &FieldContainer,
        flags: FieldFlags,
        bit_index: u64,
        bit_length: u64,
        value: AmlValue,
    ) -> Result<(), AmlError> {
        let update_rule = flags.field_update_rule()?;

        match container {
            FieldContainer::Region(region_name) => {
                let (space, base) = self.region_geometry(region_name)?;
                let raw = value.as_integer(self)?;
                self.with_field_lock(flags, || {
                    self.write_region_bits(space, base, bit_index, bit_length, raw, update_rule)
                })
            }

            FieldContainer::Index { index, data } => {
                let mut index_register = self.namespace.get(index)?.clone();
                let mut data_register = self.namespace.get(data)?.clone();
                self.write_indexed_field(&mut index_register, &mut data_register, flags, bit_index / 8, bit_length, value)
            }

            FieldContainer::Bank { region, bank_select, bank_value } => {
                let mut bank_select_register = self.namespace.get(bank_select)?.clone();
                bank_select_register.write_field(AmlValue::Integer(*bank_value), self)?;
                let (space, base) = self.region_geometry(region)?;
                let raw = value.as_integer(self)?;
                self.with_field_lock(flags, || {
                    self.write_region_bits(space, base, bit_index, bit_length, raw, update_rule)
                })
            }
        }
    }

    /// Resolves a `Field`'s named `OpRegion` to the address space and byte offset the field's own
    /// `bit_index` is relative to. Region bodies are evaluated eagerly when the `OpRegion` op is
    /// parsed (see `term_object::named_obj::op_region_op`), so no re-evaluation happens here.
    fn region_geometry(&self, region_name: &AmlName) -> Result<(RegionSpace, u64), AmlError> {
        match self.namespace.get(region_name)?.clone() {
            AmlValue::OpRegion { space, offset, .. } => Ok((space, offset.as_integer(self)?)),
            _ => Err(AmlError::FieldRegionIsNotOpRegion),
        }
    }

    /// Wraps `f` in the ACPI global lock iff the field's `FieldLockRule` demands it (spec.md §4.5,
    /// §4.6). A fixed thread id of `0` is used throughout this crate: `invoke_method` doesn't
    /// thread a caller-supplied [`walk::ThreadId`] through (its signature is fixed by every
    /// existing call site), so recursive-acquire tracking only distinguishes "the interpreter" from
    /// nobody, not one host thread from another.
    fn with_field_lock<R>(&self, flags: FieldFlags, f: impl FnOnce() -> Result<R, AmlError>) -> Result<R, AmlError> {
        if flags.lock_rule() == FieldLockRule::Lock {
            let _guard = self.global_lock.acquire(0);
            f()
        } else {
            f()
        }
    }

    /// Reads `bit_length` bits starting at `bit_index` (relative to `region_base`) out of
    /// `space`, via the address-space dispatcher. When the field is byte-aligned and exactly one
    /// access-unit wide, issues a single dispatcher call at that width (this is the common case,
    /// and what scenario S4 exercises); otherwise assembles the value byte by byte.
    fn read_region_bits(&self, space: RegionSpace, region_base: u64, bit_index: u64, bit_length: u64) -> Result<u64, AmlError> {
        if bit_index % 8 == 0 && matches!(bit_length, 8 | 16 | 32 | 64) {
            let byte_offset = region_base + bit_index / 8;
            return self.address_space.read(space, byte_offset, bit_length as u8);
        }

        let byte_offset = region_base + bit_index / 8;
        let bit_shift = bit_index % 8;
        let num_bytes = ((bit_shift + bit_length + 7) / 8) as u64;

        let mut raw = 0u64;
        for i in 0..num_bytes {
            let byte = self.address_space.read(space, byte_offset + i, 8)?;
            raw |= byte << (i * 8);
        }
        Ok((raw >> bit_shift) & low_bits_mask(bit_length))
    }

    /// Writes `value`'s low `bit_length` bits to `bit_index` (relative to `region_base`) in
    /// `space`. Bits in a partially-covered boundary byte that fall outside the field are filled
    /// according to `update_rule` (spec.md §4.5's `Preserve`/`WriteAsOnes`/`WriteAsZeros`).
    fn write_region_bits(
        &self,
        space: RegionSpace,
        region_base: u64,
        bit_index: u64,
        bit_length: u64,
        value: u64,
        update_rule: FieldUpdateRule,
    ) -> Result<(), AmlError> {
        if bit_index % 8 == 0 && matches!(bit_length, 8 | 16 | 32 | 64) {
            let byte_offset = region_base + bit_index / 8;
            return self.address_space.write(space, byte_offset, bit_length as u8, value & low_bits_mask(bit_length));
        }

        let byte_offset = region_base + bit_index / 8;
        let bit_shift = bit_index % 8;
        let num_bytes = ((bit_shift + bit_length + 7) / 8) as u64;

        let field_mask = low_bits_mask(bit_length) << bit_shift;
        let span_mask = low_bits_mask(num_bytes * 8);
        let outside_mask = span_mask & !field_mask;

        let mut raw = (value & low_bits_mask(bit_length)) << bit_shift;
        if outside_mask != 0 {
            let fill = match update_rule {
                FieldUpdateRule::WriteAsOnes => outside_mask,
                FieldUpdateRule::WriteAsZeros => 0,
                FieldUpdateRule::Preserve => {
                    let mut existing = 0u64;
                    for i in 0..num_bytes {
                        let byte = self.address_space.read(space, byte_offset + i, 8)?;
                        existing |= byte << (i * 8);
                    }
                    existing & outside_mask
                }
            };
            raw |= fill;
        }

        for i in 0..num_bytes {
            let byte = (raw >> (i * 8)) & 0xff;
            self.address_space.write(space, byte_offset + i, 8, byte)?;
        }
        Ok(())
    }

    pub(crate) fn read_buffer_field(&self, buffer_name: &AmlName, bit_index: u64, bit_length: u64) -> Result<AmlValue, AmlError> {
        let buffer = match self.namespace.get(buffer_name)? {
            AmlValue::Buffer(buffer) => buffer.clone(),
            other => return Err(AmlError::IncompatibleValueConversion { current: other.type_of(), target: AmlType::BufferField }),
        };
        let bytes = buffer.lock();

        let byte_offset = (bit_index / 8) as usize;
        let bit_shift = bit_index % 8;
        let num_bytes = ((bit_shift + bit_length + 7) / 8) as usize;
        if byte_offset + num_bytes > bytes.len() {
            return Err(AmlError::BufferFieldIndexesOutOfBounds);
        }

        let mut raw = 0u64;
        for (i, &byte) in bytes[byte_offset..byte_offset + num_bytes].iter().enumerate() {
            raw |= (byte as u64) << (i * 8);
        }
        Ok(AmlValue::Integer((raw >> bit_shift) & low_bits_mask(bit_length)))
    }

    pub(crate) fn write_buffer_field(&self, buffer_name: &AmlName, bit_index: u64, bit_length: u64, value: AmlValue) -> Result<(), AmlError> {
        let raw_value = value.as_integer(self)?;

        let buffer = match self.namespace.get(buffer_name)? {
            AmlValue::Buffer(buffer) => buffer.clone(),
            other => return Err(AmlError::IncompatibleValueConversion { current: other.type_of(), target: AmlType::BufferField }),
        };
        let mut bytes = buffer.lock();

        let byte_offset = (bit_index / 8) as usize;
        let bit_shift = bit_index % 8;
        let num_bytes = ((bit_shift + bit_length + 7) / 8) as usize;
        if byte_offset + num_bytes > bytes.len() {
            return Err(AmlError::BufferFieldIndexesOutOfBounds);
        }

        let field_mask = low_bits_mask(bit_length) << bit_shift;
        for i in 0..num_bytes {
            let byte_mask = ((field_mask >> (i * 8)) & 0xff) as u8;
            let new_bits = (((raw_value << bit_shift) >> (i * 8)) & 0xff) as u8 & byte_mask;
            bytes[byte_offset + i] = (bytes[byte_offset + i] & !byte_mask) | new_bits;
        }
        Ok(())
    }

    pub(crate) fn read_indexed_field(
        &mut self,
        index_register: &mut AmlValue,
        data_register: &AmlValue,
        flags: FieldFlags,
        offset: u64,
        length: u64,
    ) -> Result<AmlValue, AmlError> {
        let min_access_size = match flags.access_type()? {
            FieldAccessType::Any => 8,
            FieldAccessType::Byte => 8,
            FieldAccessType::Word => 16,
            FieldAccessType::DWord => 32,
            FieldAccessType::QWord => 64,
            FieldAccessType::Buffer => 8,
        };

        let access_size = u64::max(min_access_size, length.next_power_of_two());

        let mut result = 0u64;
        for i in 0..access_size {
            // write the index offset to the index field
            let byte_offset = offset + i;
            index_register.write_field(AmlValue::Integer(byte_offset), self)?;

            // read the corresponding bytes from the data field
            let byte = data_register.read_field(self)?.as_integer(self)?;
            result |= byte << (i * 8);
        }
        Ok(AmlValue::Integer(result))
    }

    pub(crate) fn write_indexed_field(
        &mut self,
        index_register: &mut AmlValue,
        data_register: &mut AmlValue,
        flags: FieldFlags,
        offset: u64,
        length: u64,
        value: AmlValue,
    ) -> Result<(), AmlError> {
        /*
         * If the field's update rule is `Preserve`, we need to read the initial value of the field, so we can
         * overwrite the correct bits. We destructure the field to do the actual write, so we read from it if
         * needed here, otherwise the borrow-checker doesn't understand.
         */
        let mut field_value = match flags.field_update_rule()? {
            FieldUpdateRule::Preserve => {
                self.read_indexed_field(index_register, data_register, flags, offset, length)?.as_integer(self)?
            }
            FieldUpdateRule::WriteAsOnes => 0xffffffff_ffffffff,
            FieldUpdateRule::WriteAsZeros => 0x0,
        };

        let minimum_access_size = match flags.access_type()? {
            FieldAccessType::Any => 8,
            FieldAccessType::Byte => 8,
            FieldAccessType::Word => 16,
            FieldAccessType::DWord => 32,
            FieldAccessType::QWord => 64,
            FieldAccessType::Buffer => 8,
        };

        /*
         * Find the access size, as either the minimum access size allowed by the region, or the field length
         * rounded up to the next power-of-2, whichever is larger.
         */
        let access_size = u64::max(minimum_access_size, length.next_power_of_two());

        field_value.set_bits(0..(length as usize), value.as_integer(self)?);

        for i in 0..access_size {
            let byte_offset = offset + i;
            let byte = (field_value >> (i * 8)) & 0xFF;

            index_register.write_field(AmlValue::Integer(byte_offset), self)?;
            data_register.write_field(AmlValue::Integer(byte), self)?;
        }

        Ok(())
    }

    /// Get the value of an argument by its argument number. Can only be executed from inside a control method.
    pub(crate) fn current_arg(&self, arg: ArgNum) -> Result<&AmlValue, AmlError> {
        self.method_context.as_ref().ok_or(AmlError::NotExecutingControlMethod)?.args.arg(arg)
    }

    /// Get the current value of a local by its local number. Can only be executed from inside a control method.
    pub(crate) fn local(&self, local: LocalNum) -> Result<&AmlValue, AmlError> {
        if self.method_context.is_none() {
            return Err(AmlError::NotExecutingControlMethod);
        }
        if local > 7 {
            return Err(AmlError::InvalidLocalAccess(local));
        }

        self.method_context.as_ref().unwrap().locals[local as usize]
            .as_ref()
            .ok_or(AmlError::InvalidLocalAccess(local))
    }

    /// Perform a store into a `Target`, according to the rules specified by §19.3.5.8. This returns a value read
    /// out of the target, if neccessary, as values can be altered during a store in some circumstances.  When
    /// required, this also performs required implicit conversions, otherwise stores are semantically equivalent to
    /// a `CopyObject`.
    pub(crate) fn store(&mut self, target: Target, value: AmlValue) -> Result<AmlValue, AmlError> {
        match target {
            Target::Name(ref path) => {
                let (resolved, _) = self.namespace.search(path, &self.current_scope)?;

                match self.namespace.get(&resolved).unwrap().type_of() {
                    AmlType::FieldUnit => {
                        let mut field = self.namespace.get(&resolved).unwrap().clone();
                        field.write_field(value, self)?;
                        field.read_field(self)
                    }
                    AmlType::BufferField => {
                        let mut buffer_field = self.namespace.get(&resolved).unwrap().clone();
                        buffer_field.write_buffer_field(value.clone(), self)?;
                        Ok(value)
                    }
                    typ => {
                        *self.namespace.get_mut(&resolved)? = value.as_type(typ, self)?;
                        Ok(self.namespace.get(&resolved)?.clone())
                    }
                }
            }

            Target::Debug => {
                log::debug!("{:?}", value);
                Ok(value)
            }

            Target::Arg(arg_num) => {
                if self.method_context.is_none() {
                    return Err(AmlError::NotExecutingControlMethod);
                }

                /*
                 * Stores into `Arg` objects are simply copied with no conversion applied, unless the `Arg`
                 * contains an Object Reference, in which case an automatic de-reference occurs and the object is
                 * copied to the target of the Object Reference, instead of overwriting the `Arg.`
                 */
                self.method_context.as_mut().unwrap().args.store_arg(arg_num, value.clone())?;
                Ok(value)
            }

            Target::Local(local_num) => {
                if self.method_context.is_none() {
                    return Err(AmlError::NotExecutingControlMethod);
                }

                /*
                 * Stores into `Local` objects are always simply copied into the destination with no conversion
                 * applied, even if it contains an Object Reference.
                 */
                self.method_context.as_mut().unwrap().locals[local_num as usize] = Some(value.clone());
                Ok(value)
            }

            Target::Null => Ok(value),
        }
    }

    fn add_predefined_objects(&mut self) {
        let owner = OwnerId::PREDEFINED;

        /*
         * These are the scopes predefined by the spec. Some tables will try to access them without defining them
         * themselves, and so we have to pre-create them.
         */
        self.namespace.add_level(AmlName::from_str("\\_GPE").unwrap(), LevelType::Scope, owner).unwrap();
        self.namespace.add_level(AmlName::from_str("\\_SB").unwrap(), LevelType::Scope, owner).unwrap();
        self.namespace.add_level(AmlName::from_str("\\_SI").unwrap(), LevelType::Scope, owner).unwrap();
        self.namespace.add_level(AmlName::from_str("\\_PR").unwrap(), LevelType::Scope, owner).unwrap();
        self.namespace.add_level(AmlName::from_str("\\_TZ").unwrap(), LevelType::Scope, owner).unwrap();

        /*
         * In the dark ages of ACPI 1.0, before `\_OSI`, `\_OS` was used to communicate to the firmware which OS
         * was running. This was predictably not very good, and so was replaced in ACPI 3.0 with `_OSI`, which
         * allows support for individual capabilities to be queried. `_OS` should not be used by modern firmwares,
         * but to avoid problems we follow Linux in returning `"Microsoft Windows NT"`.
         *
         * See https://www.kernel.org/doc/html/latest/firmware-guide/acpi/osi.html for more information.
         */
        self.namespace
            .add_value(AmlName::from_str("\\_OS").unwrap(), owner, AmlValue::String("Microsoft Windows NT".to_string()))
            .unwrap();

        /*
         * `\_OSI` was introduced by ACPI 3.0 to improve the situation created by `\_OS`. Unfortunately, exactly
         * the same problem was immediately repeated by introducing capabilities reflecting that an ACPI
         * implementation is exactly the same as a particular version of Windows' (e.g. firmwares will call
         * `\_OSI("Windows 2001")`).
         *
         * We basically follow suit with whatever Linux does, as this will hopefully minimise breakage:
         *    - We always claim `Windows *` compatability
         *    - We answer 'yes' to `_OSI("Darwin")
         *    - We answer 'no' to `_OSI("Linux")`, and report that the tables are doing the wrong thing
         */
        self.namespace
            .add_value(
                AmlName::from_str("\\_OSI").unwrap(),
                owner,
                AmlValue::native_method(1, false, 0, |context| {
                    let value = context.current_arg(0)?.clone();
                    Ok(
                        if match value.as_string(context)?.as_str() {
                            "Windows 2000" => true,       // 2000
                            "Windows 2001" => true,       // XP
                            "Windows 2001 SP1" => true,   // XP SP1
                            "Windows 2001 SP2" => true,   // XP SP2
                            "Windows 2001.1" => true,     // Server 2003
                            "Windows 2001.1 SP1" => true, // Server 2003 SP1
                            "Windows 2006" => true,       // Vista
                            "Windows 2006 SP1" => true,   // Vista SP1
                            "Windows 2006 SP2" => true,   // Vista SP2
                            "Windows 2006.1" => true,     // Server 2008
                            "Windows 2009" => true,       // 7 and Server 2008 R2
                            "Windows 2012" => true,       // 8 and Server 2012
                            "Windows 2013" => true,       // 8.1 and Server 2012 R2
                            "Windows 2015" => true,       // 10
                            "Windows 2016" => true,       // 10 version 1607
                            "Windows 2017" => true,       // 10 version 1703
                            "Windows 2017.2" => true,     // 10 version 1709
                            "Windows 2018" => true,       // 10 version 1803
                            "Windows 2018.2" => true,     // 10 version 1809
                            "Windows 2019" => true,       // 10 version 1903

                            "Darwin" => true,

                            "Linux" => {
                                warn!("ACPI evaluated `_OSI(\"Linux\")`. This is a bug. Reporting no support.");
                                false
                            }

                            "Extended Address Space Descriptor" => true,
                            "Module Device" => false,
                            "3.0 Thermal Model" => true,
                            "3.0 _SCP Extensions" => true,
                            "Processor Aggregator Device" => false,

                            _ => false,
                        } {
                            AmlValue::ones()
                        } else {
                            AmlValue::zero()
                        },
                    )
                }),
            )
            .unwrap();

        /*
         * `\_REV` evaluates to the version of the ACPI specification supported by this interpreter. Linux did this
         * correctly until 2015, but firmwares misused this to detect Linux (as even modern versions of Windows
         * return `2`), and so they switched to just returning `2` (as we'll also do). `_REV` should be considered
         * useless and deprecated (this is mirrored in newer specs, which claim `2` means "ACPI 2 or greater").
         */
        self.namespace.add_value(AmlName::from_str("\\_REV").unwrap(), owner, AmlValue::Integer(2)).unwrap();
    }
}

fn low_bits_mask(bits: u64) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Used when an [`AmlContext`] encounters an error.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AmlError {
    /*
     * Errors produced parsing the AML stream.
     */
    UnexpectedEndOfStream,
    UnexpectedByte(u8),
    /// Produced when the stream evaluates to something other than nothing or an error.
    MalformedStream,
    InvalidNameSeg,
    InvalidPkgLength,
    /// Invalid PkgLength relative to an OperationRegion
    InvalidRegionPkgLength {
        region_bit_length: u64,
        raw_length: u32,
    },
    InvalidFieldFlags,
    UnterminatedStringConstant,
    InvalidStringConstant,
    InvalidRegionSpace(u8),
    /// Produced when a `DefPackage` contains a different number of elements to the package's length.
    MalformedPackage,
    /// Produced when a `DefBuffer` contains more bytes that its size.
    MalformedBuffer,
    /// Emitted by a parser when it's clear that the stream doesn't encode the object parsed by
    /// that parser (e.g. the wrong opcode starts the stream). This is handled specially by some
    /// parsers such as `or` and `choice!`.
    WrongParser,
    /// Returned when a `DefFatal` op is encountered. This is separately reported using [`Handler::handle_fatal_error`].
    FatalError,

    /*
     * Errors produced manipulating AML names.
     */
    EmptyNamesAreInvalid,
    /// Produced when trying to normalize a path that does not point to a valid level of the
    /// namespace. E.g. `\_SB.^^PCI0` goes above the root of the namespace. The contained value is the name that
    /// normalization was attempted upon.
    InvalidNormalizedName(AmlName),
    RootHasNoParent,

    /*
     * Errors produced working with the namespace.
     */
    /// Produced when a sub-level or value is added to a level that has not yet been added to the namespace. The
    /// `AmlName` is the name of the entire sub-level/value.
    LevelDoesNotExist(AmlName),
    ValueDoesNotExist(AmlName),
    /// Produced when two values with the same name are added to the namespace.
    NameCollision(AmlName),
    TriedToRemoveRootNamespace,

    /*
     * Errors produced executing control methods.
     */
    /// Produced when AML tries to do something only possible in a control method (e.g. read from an argument)
    /// when there's no control method executing.
    NotExecutingControlMethod,
    /// Produced when a method accesses an argument it does not have (e.g. a method that takes 2
    /// arguments accesses `Arg4`). The inner value is the number of the argument accessed.
    InvalidArgAccess(ArgNum),
    /// Produced when a method accesses a local that it has not stored into.
    InvalidLocalAccess(LocalNum),
    /// Tried to invoke a method with too many arguments.
    TooManyArgs,
    /// A `DefBreak` operation was performed outside of a `DefWhile` or `DefSwitch`.
    BreakInInvalidPosition,
    /// A `DefContinue` operation was performed outside of a `DefWhile`.
    ContinueInInvalidPosition,

    /*
     * Errors produced parsing the PCI routing tables (_PRT objects).
     */
    PrtInvalidAddress,
    PrtInvalidPin,
    PrtInvalidSource,
    PrtInvalidGsi,
    /// Produced when the PRT doesn't contain an entry for the requested address + pin
    PrtNoEntry,

    /*
     * Errors produced parsing Resource Descriptors.
     */
    ReservedResourceType,
    ResourceDescriptorTooShort,
    ResourceDescriptorTooLong,
    UnexpectedResourceType,

    /*
     * Errors produced validating and loading firmware tables (table manager).
     */
    TableTooShort,
    InvalidTableChecksum,
    UnexpectedTableSignature([u8; 4]),

    /*
     * Errors produced working with AML values.
     */
    IncompatibleValueConversion {
        current: AmlType,
        target: AmlType,
    },
    InvalidStatusObject,
    InvalidShiftLeft,
    InvalidShiftRight,
    FieldRegionIsNotOpRegion,
    FieldInvalidAddress,
    FieldInvalidAccessSize,
    TypeCannotBeCompared(AmlType),
    /// Produced when the `Mid` operator is applied to a value of a type other than `Buffer` or `String`.
    TypeCannotBeSliced(AmlType),
    TypeCannotBeWrittenToBufferField(AmlType),
    BufferFieldIndexesOutOfBounds,
    InvalidSizeOfApplication(AmlType),

    /// Produced when the WaitOp event timeout is too long
    Timeout,

    /// Unimplemented functionality - return error rather than abort
    Unimplemented,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::test_handler, value::MethodFlags};
    use alloc::{boxed::Box, sync::Arc, vec::Vec};
    use opregion::AddressSpaceHandler;

    #[test]
    fn test_send_sync() {
        // verify that AmlContext implements Send and Sync
        fn test_send_sync<T: Send + Sync>() {}
        test_send_sync::<AmlContext>();
    }

    struct FakeMemory(spin::Mutex<Vec<u8>>);

    impl AddressSpaceHandler for FakeMemory {
        fn read(&self, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
            let bytes = self.0.lock();
            let len = (bit_width / 8) as usize;
            let mut value = 0u64;
            for i in 0..len {
                value |= (bytes[offset as usize + i] as u64) << (i * 8);
            }
            Ok(value)
        }

        fn write(&self, offset: u64, bit_width: u8, value: u64) -> Result<(), AmlError> {
            let mut bytes = self.0.lock();
            let len = (bit_width / 8) as usize;
            for i in 0..len {
                bytes[offset as usize + i] = ((value >> (i * 8)) & 0xff) as u8;
            }
            Ok(())
        }
    }

    #[test]
    fn s4_field_read_through_context_dispatches_to_region() {
        // spec.md S4: a SystemMemory region, field at offset 4 / bit-width 32, evaluates to
        // 0xDEADBEEF.
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        let mut backing = alloc::vec![0u8; 0x10];
        backing[4..8].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        context.address_space.register(RegionSpace::SystemMemory, Arc::new(FakeMemory(spin::Mutex::new(backing))));

        context.namespace.add_level(AmlName::from_str("\\DEV").unwrap(), LevelType::Device, OwnerId::PREDEFINED).unwrap();
        context
            .namespace
            .add_value(
                AmlName::from_str("\\DEV.REG").unwrap(),
                OwnerId::PREDEFINED,
                AmlValue::OpRegion {
                    space: RegionSpace::SystemMemory,
                    offset: alloc::boxed::Box::new(AmlValue::Integer(0)),
                    length: alloc::boxed::Box::new(AmlValue::Integer(0x10)),
                    parent_device: None,
                },
            )
            .unwrap();
        context
            .namespace
            .add_value(
                AmlName::from_str("\\DEV.FLD").unwrap(),
                OwnerId::PREDEFINED,
                AmlValue::Field {
                    container: FieldContainer::Region(AmlName::from_str("\\DEV.REG").unwrap()),
                    flags: FieldFlags::empty(),
                    bit_index: 32,
                    bit_length: 32,
                },
            )
            .unwrap();

        let field = context.namespace.get(&AmlName::from_str("\\DEV.FLD").unwrap()).unwrap().clone();
        let value = field.read_field(&mut context).unwrap();
        assert_eq!(value, AmlValue::Integer(0xDEADBEEF));
    }

    #[test]
    fn s5_method_preemption_unwinds_owner_and_walk_state() {
        // spec.md S5: method A calls B calls C, each returning its argument + 1; evaluate(A, {10})
        // returns 13, and the walk list/walk-state pool are fully unwound afterwards.
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        context.namespace.add_level(AmlName::from_str("\\DEV").unwrap(), LevelType::Device, OwnerId::PREDEFINED).unwrap();

        // Method(_C, 1) { Return (Add(Arg0, One)) }
        let c_body: &[u8] = &[0xa4, 0x72, 0x68, 0x01, 0x00];
        // Method(_B, 1) { Return (Add(\DEV._C(Arg0), One)) }
        let mut b_body = alloc::vec![0xa4, 0x72];
        b_body.extend_from_slice(b"\\DEV._C\0");
        b_body.push(0x68); // Arg0
        b_body.push(0x01); // One
        b_body.push(0x00); // Target::Null
        // Method(_A, 1) { Return (Add(\DEV._B(Arg0), One)) }
        let mut a_body = alloc::vec![0xa4, 0x72];
        a_body.extend_from_slice(b"\\DEV._B\0");
        a_body.push(0x68);
        a_body.push(0x01);
        a_body.push(0x00);

        for (name, body, flags) in [
            ("\\DEV._C", c_body.to_vec(), 1u8),
            ("\\DEV._B", b_body, 1u8),
            ("\\DEV._A", a_body, 1u8),
        ] {
            context
                .namespace
                .add_value(
                    AmlName::from_str(name).unwrap(),
                    OwnerId::PREDEFINED,
                    AmlValue::Method {
                        flags: MethodFlags::from_bits_truncate(flags),
                        code: MethodCode::Aml(Arc::from(body.into_boxed_slice())),
                        concurrency: None,
                    },
                )
                .unwrap();
        }

        let result =
            context.invoke_method(&AmlName::from_str("\\DEV._A").unwrap(), Args(alloc::vec![AmlValue::Integer(10)])).unwrap();
        assert_eq!(result, AmlValue::Integer(13));
        assert_eq!(context.walk_list.depth(), 0);
        assert_eq!(context.walk_state_pool.free_count(), 3);
    }

    #[test]
    fn parse_table_rolls_back_namespace_on_parse_error() {
        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        // Name(FOO, <truncated integer constant - DWordConst needs 4 more bytes>)
        let malformed: &[u8] = &[0x08, b'F', b'O', b'O', b'_', 0x0c, 0x01, 0x02];
        assert!(context.parse_table(malformed).is_err());
        assert!(!context.namespace.contains(&AmlName::from_str("\\FOO").unwrap()));
    }

    #[test]
    fn notify_dispatches_to_both_installed_handlers() {
        use core::sync::atomic::{AtomicU64, Ordering};

        let mut context = AmlContext::new(Box::new(test_handler()), DebugVerbosity::None);
        context
            .namespace
            .add_level(AmlName::from_str("\\DEV").unwrap(), LevelType::Device, OwnerId::PREDEFINED)
            .unwrap();

        let system_seen = Arc::new(AtomicU64::new(0));
        let driver_seen = Arc::new(AtomicU64::new(0));
        let (system_seen_clone, driver_seen_clone) = (system_seen.clone(), driver_seen.clone());

        context.install_system_notify_handler(
            AmlName::from_str("\\DEV").unwrap(),
            Arc::new(move |value| system_seen_clone.store(value, Ordering::SeqCst)),
        );
        context.install_driver_notify_handler(
            AmlName::from_str("\\DEV").unwrap(),
            Arc::new(move |value| driver_seen_clone.store(value, Ordering::SeqCst)),
        );

        context.dispatch_notify(&AmlName::from_str("\\DEV").unwrap(), 0x80);

        assert_eq!(system_seen.load(Ordering::SeqCst), 0x80);
        assert_eq!(driver_seen.load(Ordering::SeqCst), 0x80);

        // A device with no handlers installed is simply a no-op, not an error.
        context.dispatch_notify(&AmlName::from_str("\\OTHER").unwrap(), 0x1);
    }
}
