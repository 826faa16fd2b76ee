//! Class Registry - process-wide identities and inheritance for native types.
//!
//! Uses `petgraph::DiGraph` with:
//! - Nodes: `ClassNode` (identity, payload extractor, mark list, cast table)
//! - Edges: upcast functions, pointing from a derived class to its base
//!
//! Every node keeps a cast table covering its whole derived hierarchy.
//! Adding an edge re-walks the affected part of the graph, so the tables are
//! complete whatever order the edges were registered in.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use petgraph::algo::{astar, has_path_connecting};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::bound::BoundPtr;
use crate::class_id::ClassId;
use crate::error::{CastError, RegistryError};
use crate::tracer::Tracer;

/// Reports the runtime values embedded in a native instance.
pub type MarkFn<T> = Arc<dyn Fn(&T, &mut Tracer<'_>) + Send + Sync>;

/// Converts a boxed `Rc<Derived>` into a boxed `Rc<Base>`.
type Upcast = Arc<dyn Fn(Box<dyn Any>) -> Option<Box<dyn Any>> + Send + Sync>;

/// Upcasts applied in order to reach a base from one of its descendants.
type CastChain = Arc<[Upcast]>;

/// Reads a `BoundPtr<T>` payload as a boxed `Rc<T>`.
type Extract = fn(&dyn Any) -> Option<Box<dyn Any>>;

/// Runs a type-erased `Vec<MarkFn<T>>` against a boxed `Rc<T>`.
type RunMarks = fn(&(dyn Any + Send + Sync), &dyn Any, &mut Tracer<'_>);

fn extract<T: ?Sized + 'static>(payload: &dyn Any) -> Option<Box<dyn Any>> {
    let rc = payload.downcast_ref::<BoundPtr<T>>()?.get()?;
    Some(Box::new(rc) as Box<dyn Any>)
}

fn run_marks<T: ?Sized + 'static>(marks: &(dyn Any + Send + Sync), value: &dyn Any, tracer: &mut Tracer<'_>) {
    let (Some(marks), Some(value)) = (marks.downcast_ref::<Vec<MarkFn<T>>>(), value.downcast_ref::<Rc<T>>()) else {
        return;
    };
    for mark in marks {
        mark(&**value, tracer);
    }
}

#[derive(Clone)]
struct Marks {
    list: Arc<dyn Any + Send + Sync>,
    run: RunMarks,
}

struct ClassNode {
    id: ClassId,
    name: &'static str,
    extract: Extract,
    marks: Option<Marks>,
    /// Derived class identity -> path of upcasts to this class.
    casts: FxHashMap<ClassId, CastChain>,
}

#[derive(Default)]
struct RegistryState {
    graph: DiGraph<ClassNode, Upcast>,
    by_type: FxHashMap<TypeId, NodeIndex>,
    by_id: FxHashMap<ClassId, NodeIndex>,
}

impl RegistryState {
    fn node<T: ?Sized + 'static>(&self) -> Option<NodeIndex> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    fn ensure<T: ?Sized + 'static>(&mut self) -> NodeIndex {
        if let Some(node) = self.node::<T>() {
            return node;
        }
        let id = ClassId::allocate();
        let name = type_name::<T>();
        let node = self.graph.add_node(ClassNode {
            id,
            name,
            extract: extract::<T>,
            marks: None,
            casts: FxHashMap::default(),
        });
        self.by_type.insert(TypeId::of::<T>(), node);
        self.by_id.insert(id, node);
        debug!(class_id = %id, name, "class identity allocated");
        node
    }

    /// `start` and every class that derives from it.
    fn descendants(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut nodes = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            nodes.push(node);
        }
        nodes
    }

    /// `start` and every class it derives from.
    fn ancestors(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut dfs = Dfs::new(&self.graph, start);
        let mut nodes = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            nodes.push(node);
        }
        nodes
    }

    fn cast_chain(&self, from: NodeIndex, to: NodeIndex) -> Option<CastChain> {
        let (_, path) = astar(&self.graph, from, |n| n == to, |_| 1u32, |_| 0)?;
        path.windows(2)
            .map(|pair| {
                let edge = self.graph.find_edge(pair[0], pair[1])?;
                Some(self.graph[edge].clone())
            })
            .collect::<Option<Vec<_>>>()
            .map(CastChain::from)
    }

    /// Refresh the cast tables touched by a new `derived -> base` edge.
    fn propagate(&mut self, derived: NodeIndex, base: NodeIndex) {
        let lower = self.descendants(derived);
        let upper = self.ancestors(base);
        let mut updates = Vec::new();
        for &low in &lower {
            for &high in &upper {
                if let Some(chain) = self.cast_chain(low, high) {
                    updates.push((high, self.graph[low].id, chain));
                }
            }
        }
        trace!(entries = updates.len(), "propagating derived casts");
        for (high, low_id, chain) in updates {
            self.graph[high].casts.insert(low_id, chain);
        }
    }
}

/// Process-wide table of native classes.
///
/// Identities are allocated lazily, once per native type, and shared by every
/// runtime that uses the registry. Registration takes a write lock; lookups
/// during calls take read locks and release them before running user code.
pub struct ClassRegistry {
    state: RwLock<RegistryState>,
}

lazy_static! {
    static ref GLOBAL: Arc<ClassRegistry> = Arc::new(ClassRegistry::new());
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// The registry shared by the whole process.
    pub fn global() -> Arc<ClassRegistry> {
        GLOBAL.clone()
    }

    // =========================================
    // Identities
    // =========================================

    /// Identity of `T`, allocated on first use.
    pub fn class_id<T: ?Sized + 'static>(&self) -> ClassId {
        if let Some(id) = self.lookup::<T>() {
            return id;
        }
        let mut state = self.state.write();
        let node = state.ensure::<T>();
        state.graph[node].id
    }

    /// Identity of `T` if one has been allocated.
    pub fn lookup<T: ?Sized + 'static>(&self) -> Option<ClassId> {
        let state = self.state.read();
        state.node::<T>().map(|node| state.graph[node].id)
    }

    /// Every identity allocated so far, in allocation order.
    pub fn class_ids(&self) -> Vec<ClassId> {
        let state = self.state.read();
        let mut ids: Vec<ClassId> = state.by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn class_name(&self, id: ClassId) -> Option<&'static str> {
        let state = self.state.read();
        state.by_id.get(&id).map(|&node| state.graph[node].name)
    }

    pub fn len(&self) -> usize {
        self.state.read().graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================
    // Inheritance
    // =========================================

    /// Record that `D` derives from `B`.
    ///
    /// Every ancestor of `B` learns how to recover itself from `D` and from
    /// every class already derived from `D`. Registering an existing edge
    /// again is a no-op.
    pub fn register_derived<D, B>(&self, upcast: impl Fn(Rc<D>) -> Rc<B> + Send + Sync + 'static) -> Result<(), RegistryError>
    where
        D: ?Sized + 'static,
        B: ?Sized + 'static,
    {
        let mut state = self.state.write();
        let derived = state.ensure::<D>();
        let base = state.ensure::<B>();
        if derived == base {
            return Err(RegistryError::SelfDerivation(type_name::<D>()));
        }
        if state.graph.find_edge(derived, base).is_some() {
            return Ok(());
        }
        if has_path_connecting(&state.graph, base, derived, None) {
            return Err(RegistryError::Cycle {
                derived: type_name::<D>(),
                base: type_name::<B>(),
            });
        }
        let erased: Upcast = Arc::new(move |value: Box<dyn Any>| {
            let rc = value.downcast::<Rc<D>>().ok()?;
            Some(Box::new(upcast(*rc)) as Box<dyn Any>)
        });
        state.graph.add_edge(derived, base, erased);
        debug!(derived = type_name::<D>(), base = type_name::<B>(), "inheritance edge added");
        state.propagate(derived, base);
        Ok(())
    }

    /// Whether objects of class `derived` can be recovered as `base`.
    pub fn is_derived(&self, derived: ClassId, base: ClassId) -> bool {
        let state = self.state.read();
        state
            .by_id
            .get(&base)
            .is_some_and(|&node| state.graph[node].casts.contains_key(&derived))
    }

    /// Identities of every class derived from `base`, directly or not.
    pub fn derived_classes(&self, base: ClassId) -> Vec<ClassId> {
        let state = self.state.read();
        let mut ids: Vec<ClassId> = state
            .by_id
            .get(&base)
            .map(|&node| state.graph[node].casts.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Recover a `Rc<B>` from the payload of an object of class `class_id`.
    ///
    /// The payload must be the `BoundPtr` stored when the object was created.
    pub fn recover<B: ?Sized + 'static>(&self, class_id: ClassId, payload: &dyn Any) -> Result<Rc<B>, CastError> {
        let (extract, chain) = {
            let state = self.state.read();
            let unrelated = |expected| CastError::Unrelated {
                expected,
                actual: class_id,
            };
            let Some(base) = state.node::<B>() else {
                return Err(unrelated(type_name::<B>()));
            };
            let node = &state.graph[base];
            if node.id == class_id {
                (node.extract, None)
            } else {
                let chain = node.casts.get(&class_id).cloned().ok_or(unrelated(node.name))?;
                let source = state.by_id.get(&class_id).ok_or(unrelated(node.name))?;
                (state.graph[*source].extract, Some(chain))
            }
        };
        let mut value = extract(payload).ok_or(CastError::Null)?;
        for step in chain.iter().flat_map(|chain| chain.iter()) {
            value = step(value).ok_or(CastError::Null)?;
        }
        value.downcast::<Rc<B>>().map(|rc| *rc).map_err(|_| CastError::Null)
    }

    // =========================================
    // GC marks
    // =========================================

    /// Add a mark function reporting runtime values held by `T`.
    ///
    /// Marks also run for instances of classes derived from `T`.
    pub fn add_mark<T: ?Sized + 'static>(&self, mark: impl Fn(&T, &mut Tracer<'_>) + Send + Sync + 'static) {
        let mut state = self.state.write();
        let node = state.ensure::<T>();
        let entry = &mut state.graph[node];
        let mut list: Vec<MarkFn<T>> = entry
            .marks
            .as_ref()
            .and_then(|marks| marks.list.downcast_ref::<Vec<MarkFn<T>>>())
            .cloned()
            .unwrap_or_default();
        list.push(Arc::new(mark));
        debug!(class = entry.name, marks = list.len(), "mark registered");
        entry.marks = Some(Marks {
            list: Arc::new(list),
            run: run_marks::<T>,
        });
    }

    /// Whether objects of class `class_id` have anything to trace.
    pub fn has_marks(&self, class_id: ClassId) -> bool {
        let state = self.state.read();
        let Some(&node) = state.by_id.get(&class_id) else {
            return false;
        };
        state.ancestors(node).into_iter().any(|n| {
            let class = &state.graph[n];
            class.marks.is_some() && (n == node || class.casts.contains_key(&class_id))
        })
    }

    /// Run every mark that applies to an object of class `class_id`.
    pub fn trace(&self, class_id: ClassId, payload: &dyn Any, tracer: &mut Tracer<'_>) {
        let (extract, plan) = {
            let state = self.state.read();
            let Some(&node) = state.by_id.get(&class_id) else {
                return;
            };
            let plan: Vec<(Option<CastChain>, Marks)> = state
                .ancestors(node)
                .into_iter()
                .filter_map(|n| {
                    let class = &state.graph[n];
                    let marks = class.marks.clone()?;
                    if n == node {
                        return Some((None, marks));
                    }
                    Some((Some(class.casts.get(&class_id)?.clone()), marks))
                })
                .collect();
            (state.graph[node].extract, plan)
        };
        'plan: for (chain, marks) in plan {
            let Some(mut value) = extract(payload) else {
                return;
            };
            for step in chain.iter().flat_map(|chain| chain.iter()) {
                match step(value) {
                    Some(next) => value = next,
                    None => continue 'plan,
                }
            }
            (marks.run)(&*marks.list, &*value, tracer);
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ClassRegistry")
            .field("classes", &state.graph.node_count())
            .field("edges", &state.graph.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Shape {
        fn kind(&self) -> &'static str;
    }

    trait Polygon: Shape {
        fn into_shape(self: Rc<Self>) -> Rc<dyn Shape>;
    }

    struct Square;

    impl Shape for Square {
        fn kind(&self) -> &'static str {
            "square"
        }
    }

    impl Polygon for Square {
        fn into_shape(self: Rc<Self>) -> Rc<dyn Shape> {
            self
        }
    }

    fn square_payload() -> Box<dyn Any> {
        Box::new(BoundPtr::Shared(Rc::new(Square)))
    }

    fn link_polygon(registry: &ClassRegistry) {
        registry
            .register_derived::<dyn Polygon, dyn Shape>(|p| p.into_shape())
            .unwrap();
    }

    fn link_square(registry: &ClassRegistry) {
        registry
            .register_derived::<Square, dyn Polygon>(|s| s as Rc<dyn Polygon>)
            .unwrap();
    }

    #[test]
    fn identities_are_stable_per_type() {
        let registry = ClassRegistry::new();
        let a = registry.class_id::<Square>();
        assert_eq!(registry.class_id::<Square>(), a);
        assert_ne!(registry.class_id::<dyn Shape>(), a);
        assert!(registry.lookup::<dyn Polygon>().is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.class_ids().len(), 2);
    }

    #[test]
    fn recovers_base_from_leaf_in_registration_order() {
        let registry = ClassRegistry::new();
        link_polygon(&registry);
        link_square(&registry);
        let leaf = registry.class_id::<Square>();
        let shape = registry.recover::<dyn Shape>(leaf, &*square_payload()).unwrap();
        assert_eq!(shape.kind(), "square");
    }

    #[test]
    fn recovers_base_from_leaf_in_reverse_order() {
        let registry = ClassRegistry::new();
        link_square(&registry);
        link_polygon(&registry);
        let leaf = registry.class_id::<Square>();
        let shape = registry.recover::<dyn Shape>(leaf, &*square_payload()).unwrap();
        assert_eq!(shape.kind(), "square");
        assert!(registry.is_derived(leaf, registry.class_id::<dyn Shape>()));
        assert_eq!(registry.derived_classes(registry.class_id::<dyn Shape>()).len(), 2);
    }

    #[test]
    fn unrelated_class_is_a_type_mismatch() {
        let registry = ClassRegistry::new();
        let other = registry.class_id::<String>();
        registry.class_id::<dyn Shape>();
        let err = registry.recover::<dyn Shape>(other, &*square_payload()).err().unwrap();
        assert!(matches!(err, CastError::Unrelated { actual, .. } if actual == other));
        assert!(err.to_string().starts_with("Expected type dyn "));
    }

    #[test]
    fn dead_borrowed_payload_is_null() {
        let registry = ClassRegistry::new();
        let id = registry.class_id::<Square>();
        let owner = Rc::new(Square);
        let payload = BoundPtr::Borrowed(Rc::downgrade(&owner));
        assert!(registry.recover::<Square>(id, &payload).is_ok());
        drop(owner);
        assert_eq!(registry.recover::<Square>(id, &payload).err().unwrap(), CastError::Null);
    }

    #[test]
    fn rejects_self_and_cyclic_edges() {
        let registry = ClassRegistry::new();
        assert!(matches!(
            registry.register_derived::<Square, Square>(|s| s),
            Err(RegistryError::SelfDerivation(_))
        ));
        link_square(&registry);
        assert!(matches!(
            registry.register_derived::<dyn Polygon, Square>(|_| Rc::new(Square)),
            Err(RegistryError::Cycle { .. })
        ));
        link_square(&registry);
    }

    #[test]
    fn marks_are_inherited_by_derived_classes() {
        let registry = ClassRegistry::new();
        link_square(&registry);
        let leaf = registry.class_id::<Square>();
        assert!(!registry.has_marks(leaf));
        registry.add_mark::<dyn Polygon>(|_, _| {});
        assert!(registry.has_marks(leaf));
        assert!(!registry.has_marks(registry.class_id::<String>()));
    }
}
