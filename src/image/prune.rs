//! Removal of classes that must not be written into an image.
//!
//! A class is left out when it is not on the image class allow-list, when it failed to load or
//! verify, or when anything it depends on is left out: its superclass, its interfaces, the
//! component type of an array class, and the classes of the objects held by its reference
//! statics. App images additionally drop boot class loader classes that are missing from the
//! boot image, since the boot class loader would define them again at load time.
//!
//! The dependency walk is a depth-first search over a graph that may contain cycles (a class
//! whose statics reference an instance of itself). Nodes on the current path are "in
//! progress"; meeting one yields a provisional `false`. Results are memoized only once they
//! are final: a `true` is always final, a `false` only if no cycle was met below it, or if the
//! node is the root of the search.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    dex::DexFileId,
    runtime::{
        class::{Class, ClassId, ClassStatus},
        ClassLinker, Heap, ObjectId, ObjectKind,
    },
};

/// Decides, per class, whether it is kept in the image.
pub struct ClassPruner<'a> {
    linker: &'a ClassLinker,
    heap: &'a Heap,
    image_classes: Option<&'a BTreeSet<String>>,
    compile_app_image: bool,
    memo: FxHashMap<ClassId, bool>,
    in_progress: FxHashSet<ClassId>,
}

impl<'a> ClassPruner<'a> {
    /// Creates a pruner. `image_classes` of `None` allows every class.
    #[must_use]
    pub fn new(
        linker: &'a ClassLinker,
        heap: &'a Heap,
        image_classes: Option<&'a BTreeSet<String>>,
        compile_app_image: bool,
    ) -> Self {
        ClassPruner {
            linker,
            heap,
            image_classes,
            compile_app_image,
            memo: FxHashMap::default(),
            in_progress: FxHashSet::default(),
        }
    }

    /// Returns `true` if `class` stays in the image.
    pub fn keep_class(&mut self, class: ClassId) -> bool {
        let Some(klass) = self.linker.get_class(class) else {
            return false;
        };
        if self.compile_app_image && self.heap.is_in_boot_image_space(klass.mirror()) {
            return true;
        }
        if klass.is_erroneous() || !self.is_image_class(klass.descriptor()) {
            return false;
        }
        !self.prune_class(class)
    }

    /// Returns `true` if `class` or one of its dependencies must be left out.
    pub fn prune_class(&mut self, class: ClassId) -> bool {
        let mut early_exit = false;
        self.prune_class_internal(Some(class), &mut early_exit)
    }

    /// Memoized results so far.
    #[must_use]
    pub fn memo(&self) -> &FxHashMap<ClassId, bool> {
        &self.memo
    }

    fn is_image_class(&self, descriptor: &str) -> bool {
        self.image_classes
            .is_none_or(|classes| classes.contains(descriptor))
    }

    fn prune_class_internal(&mut self, class: Option<ClassId>, early_exit: &mut bool) -> bool {
        let Some(id) = class else {
            return false;
        };
        let linker = self.linker;
        let Some(klass) = linker.get_class(id) else {
            return true;
        };
        if self.heap.is_in_boot_image_space(klass.mirror()) {
            return false;
        }
        if let Some(&result) = self.memo.get(&id) {
            return result;
        }
        if !self.in_progress.insert(id) {
            *early_exit = true;
            return false;
        }

        let mut my_early_exit = false;
        let mut result = (self.compile_app_image && klass.class_loader().is_none())
            || !self.is_image_class(klass.descriptor())
            || klass.is_erroneous();

        if !result {
            for &interface in klass.iftable() {
                if self.prune_class_internal(Some(interface), &mut my_early_exit) {
                    result = true;
                    break;
                }
            }
        }
        if !result && klass.is_object_array() {
            result = self.prune_class_internal(klass.component_type(), &mut my_early_exit);
        }
        if !result {
            for referenced in self.static_reference_classes(klass) {
                if self.prune_class_internal(Some(referenced), &mut my_early_exit) {
                    result = true;
                    break;
                }
            }
        }
        if !result {
            result = self.prune_class_internal(klass.super_class(), &mut my_early_exit);
        }

        self.in_progress.remove(&id);
        if result || !my_early_exit || self.in_progress.is_empty() {
            self.memo.insert(id, result);
        }
        *early_exit |= my_early_exit;
        result
    }

    /// Classes of the objects held by the reference statics of `klass`. A static holding a
    /// class mirror contributes that class.
    fn static_reference_classes(&self, klass: &Class) -> Vec<ClassId> {
        if klass.status() < ClassStatus::Resolved || klass.num_reference_static_fields() == 0 {
            return Vec::new();
        }
        let mirror = self.heap.object(klass.mirror());
        klass
            .static_fields()
            .iter()
            .filter(|field| field.is_reference() && mirror.is_reference_slot(field.offset()))
            .filter_map(|field| mirror.reference(field.offset()))
            .filter_map(|object| class_of_object(self.heap, object))
            .collect()
    }
}

/// The class an object is an instance of, or the class a mirror stands for.
#[must_use]
pub fn class_of_object(heap: &Heap, object: ObjectId) -> Option<ClassId> {
    let object = heap.get(object)?;
    if let ObjectKind::Class(id) = object.kind() {
        return Some(*id);
    }
    match heap.get(object.class())?.kind() {
        ObjectKind::Class(id) => Some(*id),
        _ => None,
    }
}

/// Removes every class the image must not contain from the linker, and scrubs the dex cache
/// slots that referenced them.
///
/// Method slots fall back to the resolution trampoline, type and field slots are cleared.
/// Returns the descriptors of the removed classes.
pub fn prune_non_image_classes(
    linker: &mut ClassLinker,
    heap: &Heap,
    image_classes: Option<&BTreeSet<String>>,
    compile_app_image: bool,
) -> Vec<String> {
    let removed: Vec<ClassId> = {
        let mut pruner = ClassPruner::new(linker, heap, image_classes, compile_app_image);
        let ids: Vec<ClassId> = linker.classes().map(|(id, _)| id).collect();
        ids.into_iter().filter(|&id| !pruner.keep_class(id)).collect()
    };

    let removed_set: FxHashSet<ClassId> = removed.iter().copied().collect();
    let mut descriptors = Vec::with_capacity(removed.len());
    for id in removed {
        if let Some(class) = linker.remove_class(id) {
            log::debug!("Pruned {} from the image", class.descriptor());
            descriptors.push(class.descriptor().to_string());
        }
    }

    for index in 0..linker.dex_caches().len() {
        #[allow(clippy::cast_possible_truncation)]
        let cache = linker.dex_cache_mut(DexFileId(index as u32));
        for slot in &mut cache.resolved_types {
            if slot.is_some_and(|class| removed_set.contains(&class)) {
                *slot = None;
            }
        }
        for slot in &mut cache.resolved_methods {
            if slot.is_some_and(|method| removed_set.contains(&method.class)) {
                *slot = None;
            }
        }
        for slot in &mut cache.resolved_fields {
            if slot.is_some_and(|field| removed_set.contains(&field.class)) {
                *slot = None;
            }
        }
    }
    descriptors
}

/// Asserts that no class left in the heap is one the image must not contain.
///
/// # Panics
/// Panics if a pruned class is still reachable, or a class outside the allow-list survived.
pub fn check_non_image_classes_removed(
    linker: &ClassLinker,
    heap: &Heap,
    image_classes: Option<&BTreeSet<String>>,
) {
    heap.visit_objects(|id, object| {
        let ObjectKind::Class(class) = object.kind() else {
            return;
        };
        if heap.is_in_boot_image_space(id) {
            return;
        }
        let Some(klass) = linker.get_class(*class) else {
            log::error!("Mirror {id:?} of pruned class {class:?} is still reachable");
            panic!("Pruned class {class:?} is still reachable");
        };
        if image_classes.is_some_and(|classes| !classes.contains(klass.descriptor())) {
            panic!("Non image class {} not removed", klass.descriptor());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{AccessFlags, DexFileBuilder},
        runtime::{core, Runtime},
    };

    const NODE_A: &str = "Lcycle/A;";
    const NODE_B: &str = "Lcycle/B;";
    const LEAF: &str = "Lcycle/Leaf;";

    /// A and B hold each other's mirrors in a static; Leaf extends A.
    fn cyclic_runtime() -> (Runtime, ClassId, ClassId, ClassId) {
        let mut builder = DexFileBuilder::new("cycle.dex");
        builder
            .class(NODE_A)
            .superclass(core::OBJECT)
            .static_field("peer", "Ljava/lang/Object;", AccessFlags::STATIC)
            .finish();
        builder
            .class(NODE_B)
            .superclass(core::OBJECT)
            .static_field("peer", "Ljava/lang/Object;", AccessFlags::STATIC)
            .finish();
        builder.class(LEAF).superclass(NODE_A).finish();

        let mut runtime = Runtime::new(Vec::new()).unwrap();
        runtime.mark_boot_image_space();
        let (loader, _) = runtime.create_class_loader(vec![builder.build()]).unwrap();
        let a = runtime.find_class(NODE_A, Some(loader)).unwrap();
        let b = runtime.find_class(NODE_B, Some(loader)).unwrap();
        let leaf = runtime.find_class(LEAF, Some(loader)).unwrap();

        let (linker, heap) = runtime.parts_mut();
        let a_mirror = linker.class(a).mirror();
        let b_mirror = linker.class(b).mirror();
        let a_peer = linker.class(a).static_fields()[0].offset();
        let b_peer = linker.class(b).static_fields()[0].offset();
        heap.object_mut(a_mirror).set_reference(a_peer, Some(b_mirror));
        heap.object_mut(b_mirror).set_reference(b_peer, Some(a_mirror));
        (runtime, a, b, leaf)
    }

    #[test]
    fn test_cycle_terminates_and_is_stable() {
        let (runtime, a, b, _) = cyclic_runtime();
        let mut pruner = ClassPruner::new(runtime.class_linker(), runtime.heap(), None, true);

        assert!(!pruner.prune_class(a));
        assert_eq!(pruner.memo().get(&a), Some(&false));
        // B was reached through the cycle and is only settled by its own root search.
        assert_eq!(pruner.memo().get(&b), None);

        assert!(!pruner.prune_class(a));
        assert!(!pruner.prune_class(b));
        assert_eq!(pruner.memo().get(&b), Some(&false));
    }

    #[test]
    fn test_cycle_with_excluded_member() {
        let (runtime, a, b, leaf) = cyclic_runtime();
        let allowed: BTreeSet<String> = [NODE_A, LEAF].iter().map(ToString::to_string).collect();
        let mut pruner =
            ClassPruner::new(runtime.class_linker(), runtime.heap(), Some(&allowed), true);

        assert!(pruner.prune_class(a));
        assert!(pruner.prune_class(b));
        assert!(pruner.prune_class(leaf));
        assert!(!pruner.keep_class(leaf));
        assert_eq!(pruner.memo().get(&a), Some(&true));
    }

    #[test]
    fn test_boot_image_classes_are_kept() {
        let (runtime, ..) = cyclic_runtime();
        let object = runtime.class_linker().lookup_class(core::OBJECT, None).unwrap();
        let mut pruner = ClassPruner::new(runtime.class_linker(), runtime.heap(), None, true);
        assert!(pruner.keep_class(object));
        assert!(!pruner.prune_class(object));
    }

    #[test]
    fn test_prune_scrubs_dex_caches() {
        let (mut runtime, a, b, leaf) = cyclic_runtime();
        let dex_file = runtime.class_linker().class(a).dex_file().unwrap();
        {
            let cache = runtime.class_linker_mut().dex_cache_mut(dex_file);
            for slot in &mut cache.resolved_types {
                *slot = Some(a);
            }
        }
        let allowed: BTreeSet<String> = [NODE_B].iter().map(ToString::to_string).collect();
        let (linker, heap) = runtime.parts_mut();
        let removed = prune_non_image_classes(linker, heap, Some(&allowed), true);

        assert!(removed.contains(&NODE_A.to_string()));
        assert!(removed.contains(&LEAF.to_string()));
        assert!(linker.get_class(a).is_none());
        assert!(linker.get_class(leaf).is_none());
        assert!(linker.get_class(b).is_none());
        assert!(linker
            .dex_cache(dex_file)
            .resolved_types()
            .iter()
            .all(Option::is_none));
    }
}
