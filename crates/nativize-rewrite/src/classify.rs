//! Type classification for marshalling.
//!
//! Blittable types have the same in-memory representation on both sides of
//! a native call. Value types are classified by walking their instance
//! fields; results are memoized per type name and a type reached again while
//! its own classification is in progress counts as blittable, so
//! self-referencing field graphs terminate.

use std::collections::{HashMap, HashSet};

use nativize_model::{Module, PrimitiveType, TypeDef, TypeKind, TypeName, TypeRef};

use crate::error::{Result, RewriteError};

/// Classifies types of one module.
pub struct TypeClassifier<'m> {
    module: &'m Module,
    memo: HashMap<TypeName, bool>,
    in_progress: HashSet<TypeName>,
}

impl<'m> TypeClassifier<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Resolve a named type or fail with `UnresolvedType`.
    pub fn resolve(&self, name: &TypeName) -> Result<&'m TypeDef> {
        self.module
            .find_type(name)
            .ok_or_else(|| RewriteError::UnresolvedType {
                type_name: name.to_string(),
            })
    }

    pub fn is_blittable(&mut self, ty: &TypeRef) -> Result<bool> {
        match ty {
            TypeRef::Primitive(p) => Ok(p.is_numeric_or_pointer()),
            TypeRef::Pointer(_) => Ok(true),
            TypeRef::ByRef(_) => Ok(false),
            TypeRef::Array { element, rank } => {
                Ok(*rank == 1 && self.is_blittable_element(element)?)
            }
            TypeRef::Named(name) => self.is_blittable_named(name),
        }
    }

    /// Blittability of a type stored inline (array element or struct field):
    /// arrays held by reference never qualify.
    fn is_blittable_element(&mut self, ty: &TypeRef) -> Result<bool> {
        match ty {
            TypeRef::Array { .. } => Ok(false),
            other => self.is_blittable(other),
        }
    }

    fn is_blittable_named(&mut self, name: &TypeName) -> Result<bool> {
        if let Some(&known) = self.memo.get(name) {
            return Ok(known);
        }
        if self.in_progress.contains(name) {
            return Ok(true);
        }

        let def = self.resolve(name)?;
        let result = match def.kind {
            TypeKind::Enum { underlying } => underlying.is_numeric_or_pointer(),
            TypeKind::Struct => {
                self.in_progress.insert(name.clone());
                let fields = self.struct_fields_blittable(def);
                self.in_progress.remove(name);
                fields?
            }
            TypeKind::Class | TypeKind::Delegate | TypeKind::Interface => false,
        };

        // Provisional answers given to cycle members are not cached; only the
        // outermost result for each type is final.
        if self.in_progress.is_empty() || !result {
            self.memo.insert(name.clone(), result);
        }
        Ok(result)
    }

    fn struct_fields_blittable(&mut self, def: &TypeDef) -> Result<bool> {
        for field in def.fields.iter().filter(|f| !f.is_static) {
            if field.marshal.is_some() || !self.is_blittable_element(&field.ty)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_string(&self, ty: &TypeRef) -> bool {
        ty.is_primitive(PrimitiveType::String)
    }

    pub fn is_boolean(&self, ty: &TypeRef) -> bool {
        ty.is_primitive(PrimitiveType::Boolean)
    }

    pub fn is_delegate(&self, ty: &TypeRef) -> Result<bool> {
        match ty {
            TypeRef::Named(name) => Ok(matches!(self.resolve(name)?.kind, TypeKind::Delegate)),
            _ => Ok(false),
        }
    }

    /// Single-rank array whose element satisfies `predicate`.
    pub fn is_array_of(
        &mut self,
        ty: &TypeRef,
        predicate: impl FnOnce(&mut Self, &TypeRef) -> Result<bool>,
    ) -> Result<bool> {
        match ty.as_array() {
            Some((element, 1)) => predicate(self, element),
            _ => Ok(false),
        }
    }

    pub fn is_string_array(&mut self, ty: &TypeRef) -> Result<bool> {
        self.is_array_of(ty, |c, e| Ok(c.is_string(e)))
    }

    /// Number of types classified so far.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativize_model::builder::ModuleBuilder;
    use nativize_model::{MarshalInfo, NativeType};

    fn module() -> Module {
        ModuleBuilder::new("c")
            .value_type("Geo.Point", |t| {
                t.field("X", TypeRef::i32())
                    .field("Y", TypeRef::i32())
                    .static_field("Origin", TypeRef::named("Geo.Point"))
            })
            .value_type("Geo.Rect", |t| {
                t.field("TopLeft", TypeRef::named("Geo.Point"))
                    .field("BottomRight", TypeRef::named("Geo.Point"))
            })
            .value_type("Geo.Flagged", |t| {
                t.field("X", TypeRef::i32()).field("On", TypeRef::boolean())
            })
            .value_type("Geo.Annotated", |t| {
                t.marshalled_field("X", TypeRef::i32(), MarshalInfo::new(NativeType::I4))
            })
            .value_type("Geo.WithArray", |t| {
                t.field("Data", TypeRef::vector(TypeRef::i32()))
            })
            .value_type("Geo.SelfRef", |t| {
                t.field("Value", TypeRef::i64())
                    .field("Next", TypeRef::named("Geo.SelfRef"))
            })
            .value_type("Geo.CycleA", |t| t.field("B", TypeRef::named("Geo.CycleB")))
            .value_type("Geo.CycleB", |t| {
                t.field("A", TypeRef::named("Geo.CycleA"))
                    .field("Text", TypeRef::string())
            })
            .value_type("Geo.Broken", |t| t.field("M", TypeRef::named("Missing.Type")))
            .enum_type("Geo.Mode", PrimitiveType::I32)
            .class("Geo.Shape", |t| t.field("Area", TypeRef::f64()))
            .delegate("Geo.Callback", TypeRef::void(), vec![TypeRef::i32()])
            .build()
    }

    #[test]
    fn primitives() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        assert!(c.is_blittable(&TypeRef::i32()).unwrap());
        assert!(c.is_blittable(&TypeRef::int_ptr()).unwrap());
        assert!(c.is_blittable(&TypeRef::f64()).unwrap());
        assert!(c.is_blittable(&TypeRef::pointer(TypeRef::u8())).unwrap());
        assert!(!c.is_blittable(&TypeRef::boolean()).unwrap());
        assert!(!c.is_blittable(&TypeRef::char()).unwrap());
        assert!(!c.is_blittable(&TypeRef::string()).unwrap());
        assert!(!c.is_blittable(&TypeRef::object()).unwrap());
        assert!(!c.is_blittable(&TypeRef::by_ref(TypeRef::i32())).unwrap());
    }

    #[test]
    fn value_types() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        assert!(c.is_blittable(&TypeRef::named("Geo.Point")).unwrap());
        assert!(c.is_blittable(&TypeRef::named("Geo.Rect")).unwrap());
        assert!(c.is_blittable(&TypeRef::named("Geo.Mode")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.Flagged")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.Annotated")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.WithArray")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.Shape")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.Callback")).unwrap());
    }

    #[test]
    fn arrays() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        assert!(c.is_blittable(&TypeRef::vector(TypeRef::u8())).unwrap());
        assert!(c
            .is_blittable(&TypeRef::vector(TypeRef::named("Geo.Point")))
            .unwrap());
        assert!(!c.is_blittable(&TypeRef::array(TypeRef::i32(), 2)).unwrap());
        assert!(!c.is_blittable(&TypeRef::vector(TypeRef::boolean())).unwrap());
        assert!(!c
            .is_blittable(&TypeRef::vector(TypeRef::vector(TypeRef::i32())))
            .unwrap());
        assert!(c.is_string_array(&TypeRef::vector(TypeRef::string())).unwrap());
        assert!(!c
            .is_string_array(&TypeRef::array(TypeRef::string(), 2))
            .unwrap());
    }

    #[test]
    fn self_reference_terminates() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        assert!(c.is_blittable(&TypeRef::named("Geo.SelfRef")).unwrap());
        // Cycle through a non-blittable member settles on false for both.
        assert!(!c.is_blittable(&TypeRef::named("Geo.CycleA")).unwrap());
        assert!(!c.is_blittable(&TypeRef::named("Geo.CycleB")).unwrap());
    }

    #[test]
    fn repeated_calls_are_stable() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        let first = c.is_blittable(&TypeRef::named("Geo.Rect")).unwrap();
        let memoized = c.memoized();
        let second = c.is_blittable(&TypeRef::named("Geo.Rect")).unwrap();
        assert_eq!(first, second);
        assert_eq!(memoized, c.memoized());

        let mut fresh = TypeClassifier::new(&m);
        assert_eq!(
            fresh.is_blittable(&TypeRef::named("Geo.Rect")).unwrap(),
            first
        );
    }

    #[test]
    fn unresolved_type_is_error() {
        let m = module();
        let mut c = TypeClassifier::new(&m);
        let err = c.is_blittable(&TypeRef::named("Geo.Broken")).unwrap_err();
        assert!(matches!(
            err,
            RewriteError::UnresolvedType { ref type_name } if type_name == "Missing.Type"
        ));
        assert!(c.is_delegate(&TypeRef::named("Nope.Gone")).is_err());
    }

    #[test]
    fn delegates_and_strings() {
        let m = module();
        let c = TypeClassifier::new(&m);
        assert!(c.is_delegate(&TypeRef::named("Geo.Callback")).unwrap());
        assert!(!c.is_delegate(&TypeRef::named("Geo.Shape")).unwrap());
        assert!(!c.is_delegate(&TypeRef::i32()).unwrap());
        assert!(c.is_string(&TypeRef::string()));
        assert!(c.is_boolean(&TypeRef::boolean()));
    }
}
