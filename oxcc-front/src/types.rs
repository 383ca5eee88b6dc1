//! The C type representation.
//!
//! Types live in a per-unit arena and are referenced by [`TypeRef`]
//! handles; struct/union bodies live in a parallel arena under
//! [`StructRef`]. Pointer, array and function types have structural
//! identity (two `int*` handles compare equal through [`Types::same`]);
//! struct, union and enum types are nominal — identity is the shared
//! `StructRef` (or the tag-table entry for enums).
//!
//! Aggregate layout is computed lazily and memoized: a fresh `StructInfo`
//! carries `size == -1`, and the first size or alignment query rounds every
//! member up to its alignment, accumulates (struct) or maxes (union), and
//! rounds the total to the aggregate alignment. Mutating a body after its
//! layout is computed is a bug.

use cranelift_entity::{entity_impl, PrimaryMap};
use oxcc_codegen::ir::VRegType;

/// An opaque reference to a type in the arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(u32);
entity_impl!(TypeRef, "ty");

/// An opaque reference to a struct/union body.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StructRef(u32);
entity_impl!(StructRef, "sd");

/// Integer widths.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixnumKind {
    /// 1 byte.
    Char,
    /// 2 bytes.
    Short,
    /// 4 bytes.
    Int,
    /// 8 bytes.
    Long,
}

impl FixnumKind {
    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            FixnumKind::Char => 1,
            FixnumKind::Short => 2,
            FixnumKind::Int => 4,
            FixnumKind::Long => 8,
        }
    }
}

/// A C type.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// `void`.
    Void,
    /// Integer types.
    Fixnum {
        /// Width.
        kind: FixnumKind,
        /// `unsigned` variant.
        unsigned: bool,
    },
    /// Floating types.
    Flonum {
        /// `double` when set, `float` otherwise.
        dbl: bool,
    },
    /// Pointer to `inner`.
    Ptr {
        /// Pointee.
        inner: TypeRef,
    },
    /// Array of `inner`; `len` is `None` until inferred.
    Array {
        /// Element type.
        inner: TypeRef,
        /// Element count, or unsized.
        len: Option<u32>,
    },
    /// Function type.
    Func {
        /// Return type.
        ret: TypeRef,
        /// Parameter types in order.
        params: Vec<TypeRef>,
        /// Variadic tail.
        vaargs: bool,
    },
    /// Struct or union; the body carries the union flag.
    Struct {
        /// Body reference shared by every occurrence of the tag.
        info: StructRef,
    },
    /// Enumerated type; represented as `int`.
    Enum,
}

/// One struct/union member.
#[derive(Clone, Debug)]
pub struct Member {
    /// Member name.
    pub name: String,
    /// Member type.
    pub ty: TypeRef,
    /// Byte offset, valid once the layout is computed.
    pub offset: u32,
}

/// A struct or union body.
#[derive(Clone, Debug)]
pub struct StructInfo {
    /// Members in declaration order.
    pub members: Vec<Member>,
    /// Union (overlapping members) rather than struct.
    pub is_union: bool,
    /// Total size; `-1` until the layout is computed.
    pub size: i32,
    /// Alignment; valid once the layout is computed.
    pub align: u32,
}

fn align_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// The per-unit type arena, with the primitives pre-interned.
pub struct Types {
    data: PrimaryMap<TypeRef, Type>,
    structs: PrimaryMap<StructRef, StructInfo>,
    /// `void`.
    pub void_: TypeRef,
    /// `char`.
    pub char_: TypeRef,
    /// `short`.
    pub short_: TypeRef,
    /// `int`.
    pub int_: TypeRef,
    /// `long`.
    pub long_: TypeRef,
    /// `unsigned char`.
    pub uchar: TypeRef,
    /// `unsigned short`.
    pub ushort: TypeRef,
    /// `unsigned int`.
    pub uint: TypeRef,
    /// `unsigned long`.
    pub ulong: TypeRef,
    /// `float`.
    pub float_: TypeRef,
    /// `double`.
    pub double_: TypeRef,
    /// `void *`.
    pub void_ptr: TypeRef,
    /// `char *`.
    pub char_ptr: TypeRef,
}

impl Types {
    /// Create an arena with the primitives interned.
    pub fn new() -> Self {
        let mut data = PrimaryMap::new();
        let void_ = data.push(Type::Void);
        let char_ = data.push(Type::Fixnum { kind: FixnumKind::Char, unsigned: false });
        let short_ = data.push(Type::Fixnum { kind: FixnumKind::Short, unsigned: false });
        let int_ = data.push(Type::Fixnum { kind: FixnumKind::Int, unsigned: false });
        let long_ = data.push(Type::Fixnum { kind: FixnumKind::Long, unsigned: false });
        let uchar = data.push(Type::Fixnum { kind: FixnumKind::Char, unsigned: true });
        let ushort = data.push(Type::Fixnum { kind: FixnumKind::Short, unsigned: true });
        let uint = data.push(Type::Fixnum { kind: FixnumKind::Int, unsigned: true });
        let ulong = data.push(Type::Fixnum { kind: FixnumKind::Long, unsigned: true });
        let float_ = data.push(Type::Flonum { dbl: false });
        let double_ = data.push(Type::Flonum { dbl: true });
        let void_ptr = data.push(Type::Ptr { inner: void_ });
        let char_ptr = data.push(Type::Ptr { inner: char_ });
        Self {
            data,
            structs: PrimaryMap::new(),
            void_,
            char_,
            short_,
            int_,
            long_,
            uchar,
            ushort,
            uint,
            ulong,
            float_,
            double_,
            void_ptr,
            char_ptr,
        }
    }

    /// The shape behind a handle.
    pub fn get(&self, t: TypeRef) -> &Type {
        &self.data[t]
    }

    /// Intern an integer type.
    pub fn fixnum(&self, kind: FixnumKind, unsigned: bool) -> TypeRef {
        match (kind, unsigned) {
            (FixnumKind::Char, false) => self.char_,
            (FixnumKind::Short, false) => self.short_,
            (FixnumKind::Int, false) => self.int_,
            (FixnumKind::Long, false) => self.long_,
            (FixnumKind::Char, true) => self.uchar,
            (FixnumKind::Short, true) => self.ushort,
            (FixnumKind::Int, true) => self.uint,
            (FixnumKind::Long, true) => self.ulong,
        }
    }

    /// Pointer to `inner`.
    pub fn ptr_to(&mut self, inner: TypeRef) -> TypeRef {
        if inner == self.void_ {
            return self.void_ptr;
        }
        if inner == self.char_ {
            return self.char_ptr;
        }
        self.data.push(Type::Ptr { inner })
    }

    /// Array of `inner` with `len` elements (or unsized).
    pub fn array_of(&mut self, inner: TypeRef, len: Option<u32>) -> TypeRef {
        self.data.push(Type::Array { inner, len })
    }

    /// A function type.
    pub fn func_of(&mut self, ret: TypeRef, params: Vec<TypeRef>, vaargs: bool) -> TypeRef {
        self.data.push(Type::Func { ret, params, vaargs })
    }

    /// A fresh, empty struct/union body and a type for it.
    pub fn new_struct(&mut self, is_union: bool) -> (TypeRef, StructRef) {
        let info =
            self.structs.push(StructInfo { members: Vec::new(), is_union, size: -1, align: 1 });
        (self.data.push(Type::Struct { info }), info)
    }

    /// A fresh enum type.
    pub fn new_enum(&mut self) -> TypeRef {
        self.data.push(Type::Enum)
    }

    /// The body of a struct type.
    pub fn struct_info(&self, info: StructRef) -> &StructInfo {
        &self.structs[info]
    }

    /// Mutable body access, used while the tag is still being defined.
    pub fn struct_info_mut(&mut self, info: StructRef) -> &mut StructInfo {
        debug_assert!(self.structs[info].size < 0, "struct mutated after layout");
        &mut self.structs[info]
    }

    /// Replace an array's length once it has been inferred.
    pub fn set_array_len(&mut self, t: TypeRef, len: u32) {
        match &mut self.data[t] {
            Type::Array { len: l, .. } => *l = Some(len),
            _ => panic!("not an array"),
        }
    }

    /// Compute (and memoize) the layout of `info`.
    pub fn compute_layout(&mut self, info: StructRef) {
        if self.structs[info].size >= 0 {
            return;
        }
        let is_union = self.structs[info].is_union;
        let members: Vec<(TypeRef, usize)> = self.structs[info]
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.ty, i))
            .collect();

        let mut size = 0u32;
        let mut maxsize = 0u32;
        let mut max_align = 1u32;
        for (ty, idx) in members {
            let sz = self.size_of(ty);
            let align = self.align_of(ty);
            size = align_up(size, align);
            self.structs[info].members[idx].offset = if is_union { 0 } else { size };
            if is_union {
                maxsize = maxsize.max(sz);
            } else {
                size += sz;
            }
            max_align = max_align.max(align);
        }
        if is_union {
            size = maxsize;
        }
        size = align_up(size, max_align);
        let si = &mut self.structs[info];
        si.size = size as i32;
        si.align = max_align;
    }

    /// Size of a value of type `t` in bytes.
    pub fn size_of(&mut self, t: TypeRef) -> u32 {
        match self.data[t].clone() {
            Type::Void => 1,
            Type::Fixnum { kind, .. } => kind.size(),
            Type::Flonum { dbl } => {
                if dbl {
                    8
                } else {
                    4
                }
            }
            Type::Ptr { .. } | Type::Func { .. } => 8,
            Type::Array { inner, len } => self.size_of(inner) * len.unwrap_or(0),
            Type::Struct { info } => {
                self.compute_layout(info);
                self.structs[info].size as u32
            }
            Type::Enum => 4,
        }
    }

    /// Alignment of a value of type `t` in bytes.
    pub fn align_of(&mut self, t: TypeRef) -> u32 {
        match self.data[t].clone() {
            Type::Void => 1,
            Type::Fixnum { kind, .. } => kind.size(),
            Type::Flonum { dbl } => {
                if dbl {
                    8
                } else {
                    4
                }
            }
            Type::Ptr { .. } | Type::Func { .. } => 8,
            Type::Array { inner, .. } => self.align_of(inner),
            Type::Struct { info } => {
                self.compute_layout(info);
                self.structs[info].align
            }
            Type::Enum => 4,
        }
    }

    /// Structural equivalence; struct identity is the shared body.
    pub fn same(&self, a: TypeRef, b: TypeRef) -> bool {
        if a == b {
            return true;
        }
        match (&self.data[a], &self.data[b]) {
            (Type::Void, Type::Void) | (Type::Enum, Type::Enum) => true,
            (
                Type::Fixnum { kind: ka, unsigned: ua },
                Type::Fixnum { kind: kb, unsigned: ub },
            ) => ka == kb && ua == ub,
            (Type::Flonum { dbl: da }, Type::Flonum { dbl: db }) => da == db,
            (Type::Ptr { inner: ia }, Type::Ptr { inner: ib }) => self.same(*ia, *ib),
            (Type::Array { inner: ia, len: la }, Type::Array { inner: ib, len: lb }) => {
                la == lb && self.same(*ia, *ib)
            }
            (
                Type::Func { ret: ra, params: pa, vaargs: va },
                Type::Func { ret: rb, params: pb, vaargs: vb },
            ) => {
                va == vb
                    && pa.len() == pb.len()
                    && self.same(*ra, *rb)
                    && pa.iter().zip(pb).all(|(&x, &y)| self.same(x, y))
            }
            (Type::Struct { info: ia }, Type::Struct { info: ib }) => ia == ib,
            _ => false,
        }
    }

    /// Is `t` an integer type (including enums)?
    pub fn is_fixnum(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Fixnum { .. } | Type::Enum)
    }

    /// Is `t` a floating type?
    pub fn is_flonum(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Flonum { .. })
    }

    /// Is `t` arithmetic (integer or floating)?
    pub fn is_number(&self, t: TypeRef) -> bool {
        self.is_fixnum(t) || self.is_flonum(t)
    }

    /// Is `t` a pointer?
    pub fn is_ptr(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Ptr { .. })
    }

    /// Is `t` an array?
    pub fn is_array(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Array { .. })
    }

    /// Pointer or array.
    pub fn ptr_or_array(&self, t: TypeRef) -> bool {
        self.is_ptr(t) || self.is_array(t)
    }

    /// Is `t` a struct or union?
    pub fn is_struct(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Struct { .. })
    }

    /// Is `t` a function type?
    pub fn is_func(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Func { .. })
    }

    /// Is `t` void?
    pub fn is_void(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Void)
    }

    /// Usable in a boolean context.
    pub fn is_scalar(&self, t: TypeRef) -> bool {
        self.is_number(t) || self.ptr_or_array(t) || self.is_func(t)
    }

    /// The pointee/element type of a pointer or array.
    pub fn elem_of(&self, t: TypeRef) -> TypeRef {
        match self.data[t] {
            Type::Ptr { inner } | Type::Array { inner, .. } => inner,
            _ => panic!("elem_of on non-pointer"),
        }
    }

    /// Integer kind and signedness, treating enums as `int`.
    pub fn fixnum_of(&self, t: TypeRef) -> Option<(FixnumKind, bool)> {
        match self.data[t] {
            Type::Fixnum { kind, unsigned } => Some((kind, unsigned)),
            Type::Enum => Some((FixnumKind::Int, false)),
            _ => None,
        }
    }

    /// Is `t` an unsigned integer?
    pub fn is_unsigned(&self, t: TypeRef) -> bool {
        matches!(self.data[t], Type::Fixnum { unsigned: true, .. })
    }

    /// The machine shape the back end sees for `t`.
    pub fn to_vtype(&mut self, t: TypeRef) -> VRegType {
        let size = self.size_of(t);
        let align = self.align_of(t);
        let (unsigned, flonum) = match self.data[t] {
            Type::Fixnum { unsigned, .. } => (unsigned, false),
            Type::Flonum { .. } => (false, true),
            Type::Enum => (false, false),
            _ => (true, false),
        };
        VRegType { size, align, unsigned, flonum }
    }

    /// Render `t` for diagnostics.
    pub fn display(&self, t: TypeRef) -> String {
        match &self.data[t] {
            Type::Void => "void".to_string(),
            Type::Fixnum { kind, unsigned } => {
                let base = match kind {
                    FixnumKind::Char => "char",
                    FixnumKind::Short => "short",
                    FixnumKind::Int => "int",
                    FixnumKind::Long => "long",
                };
                if *unsigned {
                    format!("unsigned {}", base)
                } else {
                    base.to_string()
                }
            }
            Type::Flonum { dbl: true } => "double".to_string(),
            Type::Flonum { dbl: false } => "float".to_string(),
            Type::Ptr { inner } => format!("{}*", self.display(*inner)),
            Type::Array { inner, len: Some(n) } => format!("{}[{}]", self.display(*inner), n),
            Type::Array { inner, len: None } => format!("{}[]", self.display(*inner)),
            Type::Func { .. } => "function".to_string(),
            Type::Struct { info } => {
                if self.structs[*info].is_union {
                    "union".to_string()
                } else {
                    "struct".to_string()
                }
            }
            Type::Enum => "enum".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_member(types: &mut Types, info: StructRef, name: &str, ty: TypeRef) {
        types.struct_info_mut(info).members.push(Member {
            name: name.to_string(),
            ty,
            offset: 0,
        });
    }

    #[test]
    fn struct_layout_rounds_members_up() {
        let mut types = Types::new();
        let (st, info) = types.new_struct(false);
        let (c, i, l) = (types.char_, types.int_, types.long_);
        add_member(&mut types, info, "c", c);
        add_member(&mut types, info, "i", i);
        add_member(&mut types, info, "l", l);
        assert_eq!(types.size_of(st), 16);
        let si = types.struct_info(types.struct_ref(st));
        assert_eq!(si.members[0].offset, 0);
        assert_eq!(si.members[1].offset, 4);
        assert_eq!(si.members[2].offset, 8);
        assert_eq!(si.align, 8);
        // Size is a multiple of the alignment and offsets are aligned.
        assert_eq!(si.size as u32 % si.align, 0);
    }

    #[test]
    fn union_layout_takes_the_max() {
        let mut types = Types::new();
        let (un, info) = types.new_struct(true);
        let (i, l) = (types.int_, types.long_);
        add_member(&mut types, info, "i", i);
        add_member(&mut types, info, "l", l);
        assert_eq!(types.size_of(un), 8);
        let si = types.struct_info(types.struct_ref(un));
        assert_eq!(si.members[0].offset, 0);
        assert_eq!(si.members[1].offset, 0);
    }

    #[test]
    fn empty_struct_is_size_zero_align_one() {
        let mut types = Types::new();
        let (st, _) = types.new_struct(false);
        assert_eq!(types.size_of(st), 0);
        assert_eq!(types.align_of(st), 1);
    }

    #[test]
    fn layout_is_memoized_and_query_order_independent() {
        let mut types = Types::new();
        let (a, ia) = types.new_struct(false);
        let (b, ib) = types.new_struct(false);
        let int_ = types.int_;
        add_member(&mut types, ia, "x", int_);
        add_member(&mut types, ib, "y", a);
        add_member(&mut types, ib, "z", int_);
        // Query the outer struct first: the inner layout is pulled in.
        assert_eq!(types.size_of(b), 8);
        assert_eq!(types.size_of(a), 4);
        // And again, memoized.
        assert_eq!(types.size_of(b), 8);
        let _ = ia;
    }

    #[test]
    fn structural_identity_for_derived_types() {
        let mut types = Types::new();
        let p1 = types.ptr_to(types.int_);
        let p2 = types.ptr_to(types.int_);
        assert!(types.same(p1, p2));
        let a1 = types.array_of(types.int_, Some(3));
        let a2 = types.array_of(types.int_, Some(3));
        let a3 = types.array_of(types.int_, Some(4));
        assert!(types.same(a1, a2));
        assert!(!types.same(a1, a3));
    }

    impl Types {
        fn struct_ref(&self, t: TypeRef) -> StructRef {
            match self.data[t] {
                Type::Struct { info } => info,
                _ => panic!(),
            }
        }
    }
}
