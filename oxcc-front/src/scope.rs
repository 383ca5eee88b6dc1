//! Lexical scopes, variable storage and tag namespaces.
//!
//! Scopes form a tree rooted at the global scope. Each scope owns its
//! variables (in declaration order, which drives frame layout) plus a name
//! table and a struct/union/enum tag table. Child→parent edges are plain
//! handles; nothing owns anything across the tree, so the whole structure
//! drops with the per-unit arenas.

use crate::ast::Initializer;
use crate::types::TypeRef;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use oxcc_codegen::ir::VReg;
use std::collections::HashMap;

/// An opaque reference to a scope.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScopeRef(u32);
entity_impl!(ScopeRef, "scope");

/// An opaque reference to a declared variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct VarRef(u32);
entity_impl!(VarRef, "var");

/// Storage-class flags attached to a declaration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VarFlags {
    /// `static`.
    pub is_static: bool,
    /// `extern`.
    pub is_extern: bool,
    /// `const`.
    pub is_const: bool,
}

/// Where a variable's value lives.
#[derive(Clone, Debug)]
pub enum Storage {
    /// A local; bound to a virtual register when its function is lowered.
    Local {
        /// Backing register, assigned during lowering.
        vreg: Option<VReg>,
    },
    /// A global or file-scope static; the symbol name is the label.
    Global,
    /// A block-scope static promoted to module data under a unique label.
    StaticLocal {
        /// Generated label name.
        label: String,
    },
    /// An enumerator; a plain constant.
    EnumConst {
        /// The enumerator's value.
        value: i64,
    },
    /// A `typedef` name; aliases its type.
    Typedef,
}

/// Everything known about one declared name.
#[derive(Clone, Debug)]
pub struct VarInfo {
    /// Declared name.
    pub name: String,
    /// Declared type.
    pub ty: TypeRef,
    /// Storage-class flags.
    pub flags: VarFlags,
    /// Storage binding.
    pub storage: Storage,
    /// Initializer for globals and statics, already flattened.
    pub init: Option<Initializer>,
}

/// One scope's contents.
pub struct ScopeData {
    /// Enclosing scope, absent for the global scope.
    pub parent: PackedOption<ScopeRef>,
    /// Variables declared here, in order.
    pub vars: Vec<VarRef>,
    names: HashMap<String, VarRef>,
    tags: HashMap<String, TypeRef>,
}

/// The scope tree and variable arena for one translation unit.
pub struct Scopes {
    scopes: PrimaryMap<ScopeRef, ScopeData>,
    /// Variable storage, indexed by [`VarRef`].
    pub vars: PrimaryMap<VarRef, VarInfo>,
    global: ScopeRef,
}

impl Scopes {
    /// Create the tree with an empty global scope.
    pub fn new() -> Self {
        let mut scopes = PrimaryMap::new();
        let global = scopes.push(ScopeData {
            parent: None.into(),
            vars: Vec::new(),
            names: HashMap::new(),
            tags: HashMap::new(),
        });
        Self { scopes, vars: PrimaryMap::new(), global }
    }

    /// The global scope.
    pub fn global(&self) -> ScopeRef {
        self.global
    }

    /// Is `scope` the global scope?
    pub fn is_global(&self, scope: ScopeRef) -> bool {
        scope == self.global
    }

    /// Create a child of `parent`.
    pub fn create(&mut self, parent: ScopeRef) -> ScopeRef {
        self.scopes.push(ScopeData {
            parent: Some(parent).into(),
            vars: Vec::new(),
            names: HashMap::new(),
            tags: HashMap::new(),
        })
    }

    /// The parent of `scope`.
    pub fn parent(&self, scope: ScopeRef) -> Option<ScopeRef> {
        self.scopes[scope].parent.expand()
    }

    /// Variables declared directly in `scope`.
    pub fn scope_vars(&self, scope: ScopeRef) -> &[VarRef] {
        &self.scopes[scope].vars
    }

    /// Declare `info` in `scope`. Redeclaration in the same scope is an
    /// error, except that an `extern` and a definition may coexist.
    pub fn add(&mut self, scope: ScopeRef, info: VarInfo) -> Result<VarRef, String> {
        if let Some(&prev) = self.scopes[scope].names.get(&info.name) {
            let existing = &self.vars[prev];
            let compatible = existing.flags.is_extern || info.flags.is_extern;
            if !compatible {
                return Err(format!("`{}` redeclared", info.name));
            }
            if existing.flags.is_extern && !info.flags.is_extern {
                // The definition wins over the earlier extern declaration.
                self.vars[prev] = info;
            }
            return Ok(prev);
        }
        let name = info.name.clone();
        let var = self.vars.push(info);
        self.scopes[scope].vars.push(var);
        self.scopes[scope].names.insert(name, var);
        Ok(var)
    }

    /// Resolve `name` from `scope` outward. Returns the variable and the
    /// scope that declared it.
    pub fn find(&self, scope: ScopeRef, name: &str) -> Option<(VarRef, ScopeRef)> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if let Some(&var) = self.scopes[s].names.get(name) {
                return Some((var, s));
            }
            cur = self.scopes[s].parent.expand();
        }
        None
    }

    /// Resolve `name` in `scope` only, without walking outward.
    pub fn find_here(&self, scope: ScopeRef, name: &str) -> Option<VarRef> {
        self.scopes[scope].names.get(name).cloned()
    }

    /// Bind a struct/union/enum tag in `scope`.
    pub fn add_tag(&mut self, scope: ScopeRef, name: &str, ty: TypeRef) {
        self.scopes[scope].tags.insert(name.to_string(), ty);
    }

    /// Resolve a tag from `scope` outward.
    pub fn find_tag(&self, scope: ScopeRef, name: &str) -> Option<TypeRef> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if let Some(&ty) = self.scopes[s].tags.get(name) {
                return Some(ty);
            }
            cur = self.scopes[s].parent.expand();
        }
        None
    }

    /// Resolve a tag in `scope` only.
    pub fn find_tag_here(&self, scope: ScopeRef, name: &str) -> Option<TypeRef> {
        self.scopes[scope].tags.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Types;

    fn local(name: &str, ty: TypeRef) -> VarInfo {
        VarInfo {
            name: name.to_string(),
            ty,
            flags: VarFlags::default(),
            storage: Storage::Local { vreg: None },
            init: None,
        }
    }

    #[test]
    fn inner_scopes_shadow_outer_ones() {
        let types = Types::new();
        let mut scopes = Scopes::new();
        let g = scopes.global();
        let inner = scopes.create(g);
        let outer_x = scopes.add(g, local("x", types.int_)).unwrap();
        let inner_x = scopes.add(inner, local("x", types.long_)).unwrap();
        assert_eq!(scopes.find(inner, "x"), Some((inner_x, inner)));
        assert_eq!(scopes.find(g, "x"), Some((outer_x, g)));
        assert_eq!(scopes.find(inner, "y"), None);
    }

    #[test]
    fn redeclaration_is_rejected_but_extern_merges() {
        let types = Types::new();
        let mut scopes = Scopes::new();
        let g = scopes.global();
        scopes.add(g, local("x", types.int_)).unwrap();
        assert!(scopes.add(g, local("x", types.int_)).is_err());

        let mut ext = local("e", types.int_);
        ext.flags.is_extern = true;
        ext.storage = Storage::Global;
        let first = scopes.add(g, ext).unwrap();
        let mut def = local("e", types.int_);
        def.storage = Storage::Global;
        let second = scopes.add(g, def).unwrap();
        assert_eq!(first, second);
        assert!(!scopes.vars[second].flags.is_extern);
    }

    #[test]
    fn tags_have_their_own_namespace() {
        let mut types = Types::new();
        let mut scopes = Scopes::new();
        let g = scopes.global();
        let (st, _) = types.new_struct(false);
        scopes.add_tag(g, "point", st);
        scopes.add(g, local("point", types.int_)).unwrap();
        assert_eq!(scopes.find_tag(g, "point"), Some(st));
        assert!(scopes.find(g, "point").is_some());
    }
}
