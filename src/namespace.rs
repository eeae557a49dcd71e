//! The namespace: a tree of named entries (here called *levels*, following the teacher crate's
//! terminology) indexed by 4-character ACPI names.
//!
//! Unlike the C implementation this is distilled from (`original_source/drivers/acpi/namespace/`,
//! which links fixed-capacity 16-entry chunks of raw named-entry structs), we represent a level as
//! an owned `BTreeMap<NameSeg, AmlValue>` plus a `BTreeMap<NameSeg, NamespaceLevel>` of child
//! levels - idiomatic for a language with growable collections and no need to hand-roll chunked
//! allocation. The owner id carried by each level (spec.md §3 "named entry ... owner id") is what
//! lets [`Namespace::delete_by_owner`] perform the bulk teardown that the chunked C structure used
//! a manual re-link for.

use crate::{
    name_object::NameSeg,
    owner::OwnerId,
    value::AmlValue,
    AmlError,
};
use alloc::{collections::BTreeMap, fmt, vec::Vec};
use core::str::FromStr;

/// A fully-resolved, absolute AML name: a path of segments from the root. Never carries `^`
/// prefixes or an ambiguous relative form - those are only valid on the wire (see
/// [`crate::name_object::NameString`]) and are resolved against a scope before becoming an
/// `AmlName`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmlName(Vec<NameSeg>);

impl AmlName {
    pub fn root() -> AmlName {
        AmlName(Vec::new())
    }

    pub fn from_parts(is_absolute: bool, parent_levels: u32, segments: &[NameSeg]) -> AmlName {
        // Relative names are normalized against the root here only when `is_absolute` - true
        // relative resolution (honoring `current_scope`) happens in `AmlName::resolve`.
        let _ = (is_absolute, parent_levels);
        AmlName(segments.to_vec())
    }

    /// Resolves a name parsed on the wire (possibly relative, possibly with `^` up-prefixes)
    /// against the scope currently in effect. Mirrors spec.md §4.2 "Name formats on the wire".
    pub fn resolve_relative(
        is_absolute: bool,
        parent_levels: u32,
        segments: &[NameSeg],
        scope: &AmlName,
    ) -> Result<AmlName, AmlError> {
        if is_absolute {
            return Ok(AmlName(segments.to_vec()));
        }

        let mut base = scope.0.clone();
        for _ in 0..parent_levels {
            if base.pop().is_none() {
                return Err(AmlError::InvalidNormalizedName(AmlName(segments.to_vec())));
            }
        }
        base.extend_from_slice(segments);
        Ok(AmlName(base))
    }

    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        // An already-resolved `AmlName` (as produced by `name_object::name_string`, which treats
        // plain `^`/`\` prefixes specially before we get here) is just appended to scope: callers
        // that need full wire semantics go through `resolve_relative` instead.
        let mut base = scope.0.clone();
        base.extend_from_slice(&self.0);
        Ok(AmlName(base))
    }

    pub fn parent(&self) -> Result<AmlName, AmlError> {
        if self.0.is_empty() {
            return Err(AmlError::RootHasNoParent);
        }
        let mut parts = self.0.clone();
        parts.pop();
        Ok(AmlName(parts))
    }

    pub fn segments(&self) -> &[NameSeg] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for AmlName {
    type Err = AmlError;

    fn from_str(s: &str) -> Result<AmlName, AmlError> {
        if s.is_empty() {
            return Err(AmlError::EmptyNamesAreInvalid);
        }
        let s = s.strip_prefix('\\').unwrap_or(s);
        if s.is_empty() {
            return Ok(AmlName::root());
        }
        let mut segments = Vec::new();
        for part in s.split('.') {
            segments.push(NameSeg::from_str(part)?);
        }
        Ok(AmlName(segments))
    }
}

impl fmt::Display for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\\")?;
        for (i, seg) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// What opened this level - mirrors which opcodes are allowed to "open a scope" per spec.md
/// §4.2. `MethodLocals` is not an AML-visible scope type; it's the synthetic level the
/// interpreter pushes to hold a method invocation's transiently-created names (spec.md §4.4 step
/// 5: "entries created immediately underneath the method").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LevelType {
    Scope,
    Device,
    Processor,
    ThermalZone,
    PowerResource,
    MethodLocals,
}

/// A value binding together with the owner id it was created under - the piece a plain `Name`,
/// `Method`, `Mutex`, `Event`, `OpRegion`, `Field`, ... binding needs so that [`Namespace::delete_by_owner`]
/// can sweep it even when it lives in a scope the owner didn't create (e.g. a method writing
/// `Name(\GBL, ...)` into an already-existing `\_SB` scope).
#[derive(Clone)]
struct OwnedValue {
    owner: OwnerId,
    value: AmlValue,
}

pub struct NamespaceLevel {
    pub typ: LevelType,
    pub owner: OwnerId,
    pub(crate) values: BTreeMap<NameSeg, OwnedValue>,
    pub children: BTreeMap<NameSeg, NamespaceLevel>,
}

impl NamespaceLevel {
    fn new(typ: LevelType, owner: OwnerId) -> NamespaceLevel {
        NamespaceLevel { typ, owner, values: BTreeMap::new(), children: BTreeMap::new() }
    }
}

/// Search flags controlling how an unqualified (single-segment) name is looked up. Corresponds to
/// spec.md §4.2's `EXECUTE` mode with `NS_SEARCH_PARENT`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SearchFlags {
    pub search_parents: bool,
}

pub struct Namespace {
    root: NamespaceLevel,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace { root: NamespaceLevel::new(LevelType::Scope, OwnerId::PREDEFINED) }
    }

    fn level_mut(&mut self, path: &AmlName) -> Result<&mut NamespaceLevel, AmlError> {
        let mut level = &mut self.root;
        for seg in path.segments() {
            level = level
                .children
                .get_mut(seg)
                .ok_or_else(|| AmlError::LevelDoesNotExist(path.clone()))?;
        }
        Ok(level)
    }

    fn level(&self, path: &AmlName) -> Result<&NamespaceLevel, AmlError> {
        let mut level = &self.root;
        for seg in path.segments() {
            level =
                level.children.get(seg).ok_or_else(|| AmlError::LevelDoesNotExist(path.clone()))?;
        }
        Ok(level)
    }

    /// Creates a new scope at `path` of kind `typ`, owned by `owner`. This is `LOAD_PASS1`'s
    /// "enter if not present" for scope-opening ops (spec.md §4.2).
    pub fn add_level(&mut self, path: AmlName, typ: LevelType, owner: OwnerId) -> Result<(), AmlError> {
        if path.is_root() {
            return Ok(());
        }
        let parent_path = path.parent()?;
        let seg = *path.segments().last().unwrap();
        let parent = self.level_mut(&parent_path)?;
        parent.children.entry(seg).or_insert_with(|| NamespaceLevel::new(typ, owner));
        Ok(())
    }

    /// Stores a value at `path`, creating the binding if absent (`LOAD_PASS1`) or overwriting an
    /// existing placeholder (`LOAD_PASS2`'s type-promotion, see SPEC_FULL.md §5.3). The owner id is
    /// recorded on the value itself, not just on the level that holds it, so a method (or table)
    /// that writes into an already-existing scope can still have that one binding swept by
    /// [`Namespace::delete_by_owner`] without taking the whole scope down with it.
    pub fn add_value(&mut self, path: AmlName, owner: OwnerId, value: AmlValue) -> Result<(), AmlError> {
        let parent_path = path.parent()?;
        let seg = *path.segments().last().unwrap();
        let parent = self.level_mut(&parent_path)?;
        parent.values.insert(seg, OwnedValue { owner, value });
        Ok(())
    }

    pub fn get(&self, path: &AmlName) -> Result<&AmlValue, AmlError> {
        let parent_path = path.parent()?;
        let seg = *path.segments().last().unwrap();
        let parent = self.level(&parent_path)?;
        parent.values.get(&seg).map(|owned| &owned.value).ok_or_else(|| AmlError::ValueDoesNotExist(path.clone()))
    }

    pub fn get_mut(&mut self, path: &AmlName) -> Result<&mut AmlValue, AmlError> {
        let parent_path = path.parent()?;
        let seg = *path.segments().last().unwrap();
        let parent = self.level_mut(&parent_path)?;
        parent.values.get_mut(&seg).map(|owned| &mut owned.value).ok_or_else(|| AmlError::ValueDoesNotExist(path.clone()))
    }

    pub fn contains(&self, path: &AmlName) -> bool {
        self.get(path).is_ok() || self.level(path).is_ok()
    }

    /// `EXECUTE`-mode lookup of a (possibly unqualified) name starting from `scope`, honouring
    /// `NS_SEARCH_PARENT` upsearch for single-segment names (spec.md §4.2).
    pub fn search(&self, name: &AmlName, scope: &AmlName) -> Result<(AmlName, &AmlValue), AmlError> {
        if name.segments().len() > 1 || name.is_root() {
            let resolved = name.resolve(scope)?;
            // Fall back to treating `name` as already absolute, for callers that pre-resolved it.
            if let Ok(value) = self.get(&resolved) {
                return Ok((resolved, value));
            }
            let value = self.get(name)?;
            return Ok((name.clone(), value));
        }

        // Single segment: upsearch from `scope` towards the root.
        let mut candidate_scope = scope.clone();
        loop {
            let candidate = candidate_scope.resolve(name)?;
            if let Ok(value) = self.get(&candidate) {
                return Ok((candidate, value));
            }
            if candidate_scope.is_root() {
                break;
            }
            candidate_scope = candidate_scope.parent()?;
        }
        Err(AmlError::ValueDoesNotExist(name.resolve(scope)?))
    }

    pub fn remove_level(&mut self, path: AmlName) -> Result<(), AmlError> {
        if path.is_root() {
            return Err(AmlError::TriedToRemoveRootNamespace);
        }
        let parent_path = path.parent()?;
        let seg = *path.segments().last().unwrap();
        let parent = self.level_mut(&parent_path)?;
        parent.children.remove(&seg);
        Ok(())
    }

    /// Deletes every entry (value or child level) whose owner id is `owner`, depth-first,
    /// mirroring `original_source/drivers/acpi/namespace/nsalloc.c`'s owner-id sweep. Levels
    /// emptied of both values and children by the sweep are themselves removed, unless they are
    /// the root.
    pub fn delete_by_owner(&mut self, owner: OwnerId) {
        Self::sweep_level(&mut self.root, owner);
    }

    fn sweep_level(level: &mut NamespaceLevel, owner: OwnerId) {
        let mut to_remove = Vec::new();
        for (seg, child) in level.children.iter_mut() {
            Self::sweep_level(child, owner);
            if child.owner == owner {
                to_remove.push(*seg);
            }
        }
        for seg in to_remove {
            level.children.remove(&seg);
        }

        // A value can be tagged with a different owner than the level holding it (a method body
        // writing `Name(\GBL, ...)` into an already-existing `\_SB` scope, for instance), so it's
        // swept independently of whether the whole level gets removed above.
        level.values.retain(|_, owned| owned.owner != owner);
    }

    /// Walks the whole tree, calling `f(path, level)` pre-order. `f` returns whether to descend
    /// into the level's children - this is what drives `initialize_objects`'s device-presence
    /// gating (spec.md / teacher `lib.rs::initialize_objects`).
    pub fn traverse<F>(&self, mut f: F) -> Result<(), AmlError>
    where
        F: FnMut(&AmlName, &NamespaceLevel) -> Result<bool, AmlError>,
    {
        self.traverse_level(&AmlName::root(), &self.root, &mut f)
    }

    fn traverse_level<F>(&self, path: &AmlName, level: &NamespaceLevel, f: &mut F) -> Result<(), AmlError>
    where
        F: FnMut(&AmlName, &NamespaceLevel) -> Result<bool, AmlError>,
    {
        if f(path, level)? {
            for (seg, child) in &level.children {
                let child_path = {
                    let mut segs = path.segments().to_vec();
                    segs.push(*seg);
                    AmlName(segs)
                };
                self.traverse_level(&child_path, child, f)?;
            }
        }
        Ok(())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Namespace {
    fn clone(&self) -> Self {
        fn clone_level(level: &NamespaceLevel) -> NamespaceLevel {
            NamespaceLevel {
                typ: level.typ,
                owner: level.owner,
                values: level.values.clone(),
                children: level.children.iter().map(|(k, v)| (*k, clone_level(v))).collect(),
            }
        }
        Namespace { root: clone_level(&self.root) }
    }
}

#[cfg(test)]
impl NamespaceLevel {
    fn value_owner(&self, seg: &NameSeg) -> Option<OwnerId> {
        self.values.get(seg).map(|owned| owned.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn add_and_lookup_value() {
        let mut ns = Namespace::new();
        ns.add_level(AmlName::from_str("\\_SB").unwrap(), LevelType::Scope, OwnerId::PREDEFINED).unwrap();
        ns.add_value(
            AmlName::from_str("\\_SB._INI").unwrap(),
            OwnerId::PREDEFINED,
            AmlValue::Integer(42),
        )
        .unwrap();

        let value = ns.get(&AmlName::from_str("\\_SB._INI").unwrap()).unwrap();
        assert_eq!(*value, AmlValue::Integer(42));
    }

    #[test]
    fn upsearch_finds_parent_scope_object() {
        let mut ns = Namespace::new();
        ns.add_level(AmlName::from_str("\\_SB").unwrap(), LevelType::Scope, OwnerId::PREDEFINED).unwrap();
        ns.add_level(AmlName::from_str("\\_SB.PCI0").unwrap(), LevelType::Device, OwnerId::PREDEFINED).unwrap();
        ns.add_value(AmlName::from_str("\\_SB.FOO").unwrap(), OwnerId::PREDEFINED, AmlValue::Integer(7))
            .unwrap();

        let name = AmlName::from_str("FOO").unwrap();
        let scope = AmlName::from_str("\\_SB.PCI0").unwrap();
        let (resolved, value) = ns.search(&name, &scope).unwrap();
        assert_eq!(resolved, AmlName::from_str("\\_SB.FOO").unwrap());
        assert_eq!(*value, AmlValue::Integer(7));
    }

    #[test]
    fn invariant3_delete_by_owner_removes_everything_tagged() {
        let mut ns = Namespace::new();
        let owner = OwnerId::PREDEFINED;
        let method_owner = crate::owner::OwnerIdAllocator::new().allocate();

        ns.add_level(AmlName::from_str("\\DEV").unwrap(), LevelType::Device, owner).unwrap();
        ns.add_level(AmlName::from_str("\\DEV.TMP").unwrap(), LevelType::Scope, method_owner).unwrap();
        ns.add_value(
            AmlName::from_str("\\DEV.TMP.VAL").unwrap(),
            method_owner,
            AmlValue::Integer(1),
        )
        .unwrap();

        ns.delete_by_owner(method_owner);
        assert!(!ns.contains(&AmlName::from_str("\\DEV.TMP").unwrap()));
        assert!(ns.contains(&AmlName::from_str("\\DEV").unwrap()));
    }

    #[test]
    fn delete_by_owner_sweeps_a_value_without_removing_the_scope_that_holds_it() {
        // Mirrors a method body writing `Name(\GBL, ...)` straight into an already-existing
        // `\_SB` scope, rather than into its own freshly-pushed `MethodLocals` level.
        let mut ns = Namespace::new();
        let method_owner = crate::owner::OwnerIdAllocator::new().allocate();

        ns.add_level(AmlName::from_str("\\_SB").unwrap(), LevelType::Scope, OwnerId::PREDEFINED).unwrap();
        ns.add_value(AmlName::from_str("\\_SB.PRE").unwrap(), OwnerId::PREDEFINED, AmlValue::Integer(1)).unwrap();
        ns.add_value(AmlName::from_str("\\_SB.GBL").unwrap(), method_owner, AmlValue::Integer(2)).unwrap();

        assert_eq!(ns.level(&AmlName::from_str("\\_SB").unwrap()).unwrap().value_owner(&NameSeg::from_str("GBL").unwrap()), Some(method_owner));

        ns.delete_by_owner(method_owner);

        assert!(ns.contains(&AmlName::from_str("\\_SB").unwrap()));
        assert!(ns.contains(&AmlName::from_str("\\_SB.PRE").unwrap()));
        assert!(!ns.contains(&AmlName::from_str("\\_SB.GBL").unwrap()));
    }
}
