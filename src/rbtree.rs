//! An intrusive red-black tree.
//!
//! Items embed an [`RbNode`] and expose it through [`RbItem`]. The tree keeps
//! only the parent/child links and the color inside that node, so inserting or
//! removing never allocates. Keys stay in the items: the tree is given a
//! compare function `fn(&K, &T) -> Ordering` and asks it at every step.
//!
//! Inserting a key that is already present replaces the old item in place.
//! The optional collide function then sees both the old and the new item,
//! together with an auxiliary value owned by the tree, and the old handle is
//! given back to the caller.
//!
//! # Example
//! ```rust
//! use embed_rbtree::rbtree::{RbItem, RbNode, RbTree};
//! use std::cell::UnsafeCell;
//! use std::cmp::Ordering;
//!
//! struct Session {
//!     id: u64,
//!     user: String,
//!     node: UnsafeCell<RbNode<Session, ()>>,
//! }
//!
//! unsafe impl RbItem<()> for Session {
//!     fn get_node(&self) -> &mut RbNode<Self, ()> {
//!         unsafe { &mut *self.node.get() }
//!     }
//! }
//!
//! fn cmp_id(id: &u64, s: &Session) -> Ordering {
//!     id.cmp(&s.id)
//! }
//!
//! // Count replaced sessions in the auxiliary value.
//! fn on_collide(_old: &Session, _new: &Session, replaced: &mut usize) {
//!     *replaced += 1;
//! }
//!
//! fn session(id: u64, user: &str) -> Box<Session> {
//!     Box::new(Session { id, user: user.to_string(), node: UnsafeCell::new(RbNode::default()) })
//! }
//!
//! let mut tree = RbTree::<Box<Session>, (), u64, usize>::with_collide(cmp_id, on_collide, 0);
//! tree.insert(&3, session(3, "carol"));
//! tree.insert(&1, session(1, "alice"));
//! tree.insert(&2, session(2, "bob"));
//!
//! let old = tree.insert(&2, session(2, "bobby")).unwrap();
//! assert_eq!(old.user, "bob");
//! assert_eq!(*tree.aux(), 1);
//!
//! let users: Vec<&str> = tree.iter().map(|s| s.user.as_str()).collect();
//! assert_eq!(users, ["alice", "bobby", "carol"]);
//! assert_eq!(tree.at(1).id, 2);
//!
//! assert_eq!(tree.remove_first().unwrap().id, 1);
//! assert_eq!(tree.len(), 2);
//! ```

use crate::Pointer;
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::marker::PhantomData;
use core::{cmp::Ordering, fmt, mem, ptr::null};
use log::{debug, trace, warn};

/// A trait to return internal mutable RbNode for specified tree.
///
/// The tag is used to distinguish different RbNodes within the same item,
/// allowing an item to belong to multiple trees simultaneously.
/// For only one ownership, you can use `()`.
///
/// # Safety
///
/// Implementors must ensure `get_node` returns a valid reference to the `RbNode`
/// embedded within `Self`. Users must use `UnsafeCell` to hold `RbNode` to support
/// interior mutability required by tree operations.
pub unsafe trait RbItem<Tag>: Sized {
    fn get_node(&self) -> &mut RbNode<Self, Tag>;
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum RbColor {
    Red = 0,
    Black = 1,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum RbDirection {
    Left = 0,
    Right = 1,
}

impl RbDirection {
    #[inline(always)]
    fn reverse(self) -> RbDirection {
        match self {
            RbDirection::Left => RbDirection::Right,
            RbDirection::Right => RbDirection::Left,
        }
    }
}

/// Links of one item inside one tree.
///
/// A default node is detached. Removal (or being replaced by a colliding
/// item) clears the links and detaches the node again, so a stale item can be
/// told apart from a linked one with [`RbNode::is_linked`].
pub struct RbNode<T: Sized, Tag> {
    pub(crate) parent: *const T,
    pub(crate) left: *const T,
    pub(crate) right: *const T,
    pub(crate) color: RbColor,
    linked: bool,
    _phan: PhantomData<fn(&Tag)>,
}

unsafe impl<T, Tag> Send for RbNode<T, Tag> {}

impl<T, Tag> RbNode<T, Tag> {
    #[inline]
    pub fn parent(&self) -> *const T {
        self.parent
    }

    #[inline]
    pub fn left(&self) -> *const T {
        self.left
    }

    #[inline]
    pub fn right(&self) -> *const T {
        self.right
    }

    #[inline]
    pub fn color(&self) -> RbColor {
        self.color
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    // The color is kept, only the links are dropped.
    #[inline(always)]
    fn detach(&mut self) {
        self.left = null();
        self.right = null();
        self.parent = null();
        self.linked = false;
    }

    #[inline(always)]
    fn get_child(&self, dir: RbDirection) -> *const T {
        match dir {
            RbDirection::Left => self.left,
            RbDirection::Right => self.right,
        }
    }

    #[inline(always)]
    fn set_child(&mut self, dir: RbDirection, child: *const T) {
        match dir {
            RbDirection::Left => self.left = child,
            RbDirection::Right => self.right = child,
        }
    }

    // Swap the position of two nodes, not their items
    #[inline(always)]
    fn swap(&mut self, other: &mut RbNode<T, Tag>) {
        mem::swap(&mut self.parent, &mut other.parent);
        mem::swap(&mut self.left, &mut other.left);
        mem::swap(&mut self.right, &mut other.right);
        mem::swap(&mut self.color, &mut other.color);
    }
}

impl<T, Tag> Default for RbNode<T, Tag> {
    fn default() -> Self {
        Self {
            parent: null(),
            left: null(),
            right: null(),
            color: RbColor::Red,
            linked: false,
            _phan: Default::default(),
        }
    }
}

impl<T, Tag> fmt::Debug for RbNode<T, Tag> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.linked {
            return write!(f, "(detached {:?})", self.color);
        }
        write!(f, "({:?} ", self.color)?;
        if !self.parent.is_null() {
            write!(f, "parent: {:p} ", self.parent)?;
        } else {
            write!(f, "parent: none ")?;
        }
        if !self.left.is_null() {
            write!(f, "left: {:p} ", self.left)?;
        } else {
            write!(f, "left: none ")?;
        }
        if !self.right.is_null() {
            write!(f, "right: {:p}", self.right)?;
        } else {
            write!(f, "right: none")?;
        }
        write!(f, ")")
    }
}

/// Compares a key with the key held by an item.
pub type RbCmpFunc<K, T> = fn(&K, &T) -> Ordering;

/// Called with `(old, new, aux)` after `new` took the place of `old`.
pub type RbCollideFunc<T, A> = fn(&T, &T, &mut A);

/// An intrusive red-black tree holding items through handles of type `P`.
///
/// `K` is the key type understood by the compare function, `A` the auxiliary
/// value handed to the collide function.
pub struct RbTree<P, Tag, K: ?Sized, A = ()>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    root: *const P::Target,
    count: usize,
    compare: RbCmpFunc<K, P::Target>,
    collide: Option<RbCollideFunc<P::Target, A>>,
    aux: A,
    _phan: PhantomData<fn(P, &Tag)>,
}

unsafe impl<P, Tag, K: ?Sized, A> Send for RbTree<P, Tag, K, A>
where
    P: Pointer + Send,
    P::Target: RbItem<Tag>,
    A: Send,
{
}

impl<P, Tag, K: ?Sized, A> RbTree<P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    pub fn new(compare: RbCmpFunc<K, P::Target>) -> Self
    where
        A: Default,
    {
        RbTree {
            root: null(),
            count: 0,
            compare,
            collide: None,
            aux: A::default(),
            _phan: Default::default(),
        }
    }

    pub fn with_collide(
        compare: RbCmpFunc<K, P::Target>, collide: RbCollideFunc<P::Target, A>, aux: A,
    ) -> Self {
        RbTree {
            root: null(),
            count: 0,
            compare,
            collide: Some(collide),
            aux,
            _phan: Default::default(),
        }
    }

    /// Reset the tree with new callbacks.
    ///
    /// Items still linked are released the same way [`RbTree::remove_all`]
    /// releases them.
    pub fn init(
        &mut self, compare: RbCmpFunc<K, P::Target>, collide: Option<RbCollideFunc<P::Target, A>>,
        aux: A,
    ) {
        self.remove_all();
        self.compare = compare;
        self.collide = collide;
        self.aux = aux;
    }

    #[inline]
    pub fn aux(&self) -> &A {
        &self.aux
    }

    #[inline]
    pub fn aux_mut(&mut self) -> &mut A {
        &mut self.aux
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn first(&self) -> Option<&P::Target> {
        unsafe { self.first_ptr().as_ref() }
    }

    #[inline]
    pub fn last(&self) -> Option<&P::Target> {
        unsafe { self.last_ptr().as_ref() }
    }

    #[inline]
    pub fn next(&self, data: &P::Target) -> Option<&P::Target> {
        self.walk_dir(data, RbDirection::Right)
    }

    #[inline]
    pub fn prev(&self, data: &P::Target) -> Option<&P::Target> {
        self.walk_dir(data, RbDirection::Left)
    }

    /// In-order neighbour of `data` toward `dir`.
    #[inline]
    pub fn walk_dir(&self, data: &P::Target, dir: RbDirection) -> Option<&P::Target> {
        unsafe { self.walk_dir_ptr(data, dir).as_ref() }
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        !self.lookup_ptr(key).is_null()
    }

    #[inline]
    pub fn lookup_key(&self, key: &K) -> Option<&P::Target> {
        unsafe { self.lookup_ptr(key).as_ref() }
    }

    /// In-order position of `data`.
    ///
    /// The last item is answered in O(1); any other item costs a linear scan
    /// since nodes carry no subtree sizes.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not an item of this tree.
    pub fn index_of(&self, data: &P::Target) -> usize {
        let target = data as *const P::Target;
        if !self.root.is_null() && self.last_ptr() == target {
            return self.count - 1;
        }
        for (index, item) in self.iter().enumerate() {
            if item as *const P::Target == target {
                return index;
            }
        }
        panic!("node {:p} is not in this tree", target);
    }

    /// Item at in-order position `index`, scanning from the nearer end.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn at(&self, index: usize) -> &P::Target {
        assert!(index < self.count, "index {} out of range for tree of size {}", index, self.count);
        let found = if index < self.count / 2 {
            self.iter().nth(index)
        } else {
            self.iter().rev().nth(self.count - 1 - index)
        };
        match found {
            Some(item) => item,
            None => panic!("tree of size {} ended before index {}", self.count, index),
        }
    }

    /// Insert `node` under `key`.
    ///
    /// When an item with an equal key is present, `node` takes over its
    /// position and color, the collide function runs, and the displaced
    /// handle is returned. The count does not change in that case.
    ///
    /// Passing the very item that already holds `key` leaves the tree as it
    /// is and hands the surplus handle back.
    pub fn insert(&mut self, key: &K, node: P) -> Option<P> {
        let new_ptr = node.into_raw();
        let mut here = self.root;
        let mut which_child = RbDirection::Left;
        while !here.is_null() {
            match (self.compare)(key, unsafe { &*here }) {
                Ordering::Less => which_child = RbDirection::Left,
                Ordering::Greater => which_child = RbDirection::Right,
                Ordering::Equal => {
                    if here == new_ptr {
                        return Some(unsafe { P::from_raw(new_ptr) });
                    }
                    self.replace(here, new_ptr);
                    trace!("rbtree: node {:p} replaced by colliding node {:p}", here, new_ptr);
                    if let Some(collide) = self.collide {
                        collide(unsafe { &*here }, unsafe { &*new_ptr }, &mut self.aux);
                    }
                    return Some(unsafe { P::from_raw(here) });
                }
            }
            let child = Self::node_of(here).get_child(which_child);
            if child.is_null() {
                break;
            }
            here = child;
        }

        let node = Self::node_of(new_ptr);
        node.parent = here;
        node.left = null();
        node.right = null();
        node.color = RbColor::Red;
        node.linked = true;
        if here.is_null() {
            self.root = new_ptr;
        } else {
            Self::node_of(here).set_child(which_child, new_ptr);
        }
        self.repair_after_insert(new_ptr);
        self.count += 1;
        None
    }

    /// Unlink `del` from the tree and give its handle back.
    ///
    /// A null `del` is ignored.
    ///
    /// # Safety
    ///
    /// `del` must be null or point to an item currently linked into this tree.
    /// Debug builds assert the membership.
    pub unsafe fn remove(&mut self, del: *const P::Target) -> Option<P> {
        if del.is_null() {
            return None;
        }
        debug_assert!(self.is_member(del), "node {:p} is not linked into this tree", del);

        // A node with two children trades places with its in-order predecessor,
        // which has at most one child.
        let (left, right) = {
            let del_node = Self::node_of(del);
            (del_node.left, del_node.right)
        };
        if !left.is_null() && !right.is_null() {
            let pred = Self::bottom_child_ref(left, RbDirection::Right);
            self.swap_places(del, pred);
        }

        let child = {
            let del_node = Self::node_of(del);
            if !del_node.right.is_null() { del_node.right } else { del_node.left }
        };
        if Self::color_of(del) == RbColor::Black {
            Self::node_of(del).color = Self::color_of(child);
            self.repair_after_remove(del);
        }
        self.transplant(del, child);
        if Self::node_of(del).parent.is_null() && !child.is_null() {
            Self::node_of(child).color = RbColor::Black;
        }

        Self::node_of(del).detach();
        self.count -= 1;
        Some(unsafe { P::from_raw(del) })
    }

    #[inline]
    pub fn remove_key(&mut self, key: &K) -> Option<P> {
        let data = self.lookup_ptr(key);
        unsafe { self.remove(data) }
    }

    #[inline]
    pub fn remove_first(&mut self) -> Option<P> {
        let data = self.first_ptr();
        unsafe { self.remove(data) }
    }

    #[inline]
    pub fn remove_last(&mut self) -> Option<P> {
        let data = self.last_ptr();
        unsafe { self.remove(data) }
    }

    /// Empty the tree.
    ///
    /// With raw handles this is O(1): only the old root is detached, the
    /// other items keep their stale links. Owning handles are drained one by
    /// one and dropped.
    pub fn remove_all(&mut self) {
        if self.root.is_null() {
            return;
        }
        debug!("rbtree: remove_all releasing {} nodes", self.count);
        if mem::needs_drop::<P>() {
            self.drain().for_each(drop);
            return;
        }
        Self::node_of(self.root).detach();
        self.root = null();
        self.count = 0;
    }

    /// Keep only the items for which `f` returns true.
    pub fn retain<F: FnMut(&P::Target) -> bool>(&mut self, mut f: F) {
        let mut cursor = self.front_mut();
        while let Some(item) = cursor.get() {
            if f(item) {
                cursor.move_next();
            } else {
                drop(cursor.remove());
            }
        }
    }

    #[inline]
    pub fn iter(&self) -> RbTreeIterator<'_, P, Tag, K, A> {
        RbTreeIterator::new(self, self.first_ptr(), self.last_ptr())
    }

    /// Iterate from `data` (included) to the last item.
    #[inline]
    pub fn iter_from<'a>(&'a self, data: &'a P::Target) -> RbTreeIterator<'a, P, Tag, K, A> {
        RbTreeIterator::new(self, data, self.last_ptr())
    }

    /// Iterate over the items following `data`.
    #[inline]
    pub fn iter_after(&self, data: &P::Target) -> RbTreeIterator<'_, P, Tag, K, A> {
        RbTreeIterator::new(self, self.walk_dir_ptr(data, RbDirection::Right), self.last_ptr())
    }

    /// Iterate from the first item to `data` (included).
    ///
    /// `iter_to(data).rev()` walks backward starting at `data`.
    #[inline]
    pub fn iter_to<'a>(&'a self, data: &'a P::Target) -> RbTreeIterator<'a, P, Tag, K, A> {
        RbTreeIterator::new(self, self.first_ptr(), data)
    }

    /// Iterate over the items preceding `data`.
    #[inline]
    pub fn iter_before(&self, data: &P::Target) -> RbTreeIterator<'_, P, Tag, K, A> {
        RbTreeIterator::new(self, self.first_ptr(), self.walk_dir_ptr(data, RbDirection::Left))
    }

    /// Returns a draining iterator that removes items in ascending order.
    #[inline]
    pub fn drain(&mut self) -> RbTreeDrainer<'_, P, Tag, K, A> {
        RbTreeDrainer { tree: self }
    }

    #[inline]
    pub fn front_mut(&mut self) -> RbTreeCursorMut<'_, P, Tag, K, A> {
        let current = self.first_ptr();
        RbTreeCursorMut { tree: self, current }
    }

    #[inline]
    pub fn back_mut(&mut self) -> RbTreeCursorMut<'_, P, Tag, K, A> {
        let current = self.last_ptr();
        RbTreeCursorMut { tree: self, current }
    }

    /// Cursor on the item matching `key`, or a null cursor.
    #[inline]
    pub fn find_mut(&mut self, key: &K) -> RbTreeCursorMut<'_, P, Tag, K, A> {
        let current = self.lookup_ptr(key);
        RbTreeCursorMut { tree: self, current }
    }

    /// # Safety
    ///
    /// `data` must be null or point to an item linked into this tree.
    #[inline]
    pub unsafe fn cursor_mut_from_ptr(
        &mut self, data: *const P::Target,
    ) -> RbTreeCursorMut<'_, P, Tag, K, A> {
        RbTreeCursorMut { tree: self, current: data }
    }

    /// Check every red-black and ordering invariant of the tree.
    ///
    /// `cmp_func` compares two items by key. The walk is linear and also
    /// checks the parent links and the element count.
    pub fn validate(
        &self, cmp_func: RbCmpFunc<P::Target, P::Target>,
    ) -> Result<(), RbTreeError> {
        let result = self.check(cmp_func);
        if let Err(e) = &result {
            warn!("rbtree: validation failed: {}", e);
        }
        result
    }

    fn check(&self, cmp_func: RbCmpFunc<P::Target, P::Target>) -> Result<(), RbTreeError> {
        if self.root.is_null() {
            if self.count != 0 {
                return Err(RbTreeError::Count { expected: self.count, found: 0 });
            }
            return Ok(());
        }
        if Self::color_of(self.root) != RbColor::Black {
            return Err(RbTreeError::RootNotBlack);
        }

        let mut black_height: Option<usize> = None;
        let mut prev: *const P::Target = null();
        let mut index = 0;
        let mut data = self.first_ptr();
        while !data.is_null() {
            if index >= self.count {
                return Err(RbTreeError::Count { expected: self.count, found: index + 1 });
            }
            let node = Self::node_of(data);
            if !node.linked {
                return Err(RbTreeError::Detached { index });
            }
            if node.parent.is_null() {
                if data != self.root {
                    return Err(RbTreeError::ParentLink { index });
                }
            } else {
                let parent_node = Self::node_of(node.parent);
                if parent_node.left != data && parent_node.right != data {
                    return Err(RbTreeError::ParentLink { index });
                }
                if node.color == RbColor::Red && parent_node.color == RbColor::Red {
                    return Err(RbTreeError::RedRed { index });
                }
            }
            for child in [node.left, node.right] {
                if !child.is_null() && Self::node_of(child).parent != data {
                    return Err(RbTreeError::ParentLink { index });
                }
            }
            if !prev.is_null() && cmp_func(unsafe { &*prev }, unsafe { &*data }) != Ordering::Less {
                return Err(RbTreeError::Order { index });
            }
            if node.left.is_null() || node.right.is_null() {
                let found = Self::black_count_to_root(data);
                match black_height {
                    None => black_height = Some(found),
                    Some(expected) if expected != found => {
                        return Err(RbTreeError::BlackHeight { index, expected, found });
                    }
                    Some(_) => {}
                }
            }
            prev = data;
            index += 1;
            data = self.walk_dir_ptr(data, RbDirection::Right);
        }
        if index != self.count {
            return Err(RbTreeError::Count { expected: self.count, found: index });
        }
        Ok(())
    }

    fn black_count_to_root(mut data: *const P::Target) -> usize {
        let mut blacks = 0;
        while !data.is_null() {
            let node = Self::node_of(data);
            if node.color == RbColor::Black {
                blacks += 1;
            }
            data = node.parent;
        }
        blacks
    }

    // `data` must point to a live item; every link followed from it is one
    // the tree wrote itself.
    #[inline(always)]
    fn node_of<'b>(data: *const P::Target) -> &'b mut RbNode<P::Target, Tag> {
        debug_assert!(!data.is_null());
        unsafe { (*data).get_node() }
    }

    // absent children count as black
    #[inline(always)]
    fn color_of(data: *const P::Target) -> RbColor {
        if data.is_null() { RbColor::Black } else { Self::node_of(data).color }
    }

    #[inline(always)]
    fn set_color(data: *const P::Target, color: RbColor) {
        Self::node_of(data).color = color;
    }

    #[inline(always)]
    fn parent_of(data: *const P::Target) -> *const P::Target {
        Self::node_of(data).parent
    }

    #[inline(always)]
    fn parent_direction(data: *const P::Target, parent: *const P::Target) -> RbDirection {
        let parent_node = Self::node_of(parent);
        if parent_node.left == data {
            return RbDirection::Left;
        }
        if parent_node.right == data {
            return RbDirection::Right;
        }
        panic!("invalid rb tree, node {:p}, parent {:p}", data, parent);
    }

    #[inline(always)]
    fn sibling(data: *const P::Target) -> *const P::Target {
        let parent = Self::parent_of(data);
        let dir = Self::parent_direction(data, parent);
        Self::node_of(parent).get_child(dir.reverse())
    }

    #[inline(always)]
    fn grandparent(data: *const P::Target) -> *const P::Target {
        Self::parent_of(Self::parent_of(data))
    }

    #[inline(always)]
    fn uncle(data: *const P::Target) -> *const P::Target {
        Self::sibling(Self::parent_of(data))
    }

    #[inline(always)]
    fn bottom_child_ref(mut data: *const P::Target, dir: RbDirection) -> *const P::Target {
        loop {
            let child = Self::node_of(data).get_child(dir);
            if child.is_null() {
                return data;
            }
            data = child;
        }
    }

    #[inline]
    fn first_ptr(&self) -> *const P::Target {
        if self.root.is_null() {
            return null();
        }
        Self::bottom_child_ref(self.root, RbDirection::Left)
    }

    #[inline]
    fn last_ptr(&self) -> *const P::Target {
        if self.root.is_null() {
            return null();
        }
        Self::bottom_child_ref(self.root, RbDirection::Right)
    }

    fn walk_dir_ptr(&self, data: *const P::Target, dir: RbDirection) -> *const P::Target {
        let child = Self::node_of(data).get_child(dir);
        if !child.is_null() {
            return Self::bottom_child_ref(child, dir.reverse());
        }
        let mut data = data;
        let mut parent = Self::parent_of(data);
        while !parent.is_null() && Self::node_of(parent).get_child(dir) == data {
            data = parent;
            parent = Self::parent_of(data);
        }
        parent
    }

    fn lookup_ptr(&self, key: &K) -> *const P::Target {
        let mut data = self.root;
        while !data.is_null() {
            match (self.compare)(key, unsafe { &*data }) {
                Ordering::Less => data = Self::node_of(data).left,
                Ordering::Greater => data = Self::node_of(data).right,
                Ordering::Equal => break,
            }
        }
        data
    }

    // Walk up the parent links and check we end at our own root.
    fn is_member(&self, data: *const P::Target) -> bool {
        if !Self::node_of(data).linked {
            return false;
        }
        let mut data = data;
        loop {
            let parent = Self::parent_of(data);
            if parent.is_null() {
                return data == self.root;
            }
            data = parent;
        }
    }

    /// Put `new` in the slot of `old`: same parent, children and color.
    /// `old` ends up detached.
    fn replace(&mut self, old: *const P::Target, new: *const P::Target) {
        let parent = Self::parent_of(old);
        if parent.is_null() {
            self.root = new;
        } else {
            let dir = Self::parent_direction(old, parent);
            Self::node_of(parent).set_child(dir, new);
        }

        let old_node = Self::node_of(old);
        if !old_node.left.is_null() {
            Self::node_of(old_node.left).parent = new;
        }
        if !old_node.right.is_null() {
            Self::node_of(old_node.right).parent = new;
        }

        let new_node = Self::node_of(new);
        new_node.parent = old_node.parent;
        new_node.left = old_node.left;
        new_node.right = old_node.right;
        new_node.color = old_node.color;
        new_node.linked = true;
        old_node.detach();
    }

    /// Hang `new` where `old` was in its parent. `old` keeps its own links.
    fn transplant(&mut self, old: *const P::Target, new: *const P::Target) {
        let parent = Self::parent_of(old);
        if parent.is_null() {
            self.root = new;
        } else {
            let dir = Self::parent_direction(old, parent);
            Self::node_of(parent).set_child(dir, new);
        }
        if !new.is_null() {
            Self::node_of(new).parent = parent;
        }
    }

    /// Exchange the tree positions (links and colors) of `high` and `low`.
    ///
    /// `low` must be a descendant of `high`; it may be its direct child.
    fn swap_places(&mut self, high: *const P::Target, low: *const P::Target) {
        let high_parent = Self::parent_of(high);
        if high_parent.is_null() {
            self.root = low;
        } else {
            let dir = Self::parent_direction(high, high_parent);
            Self::node_of(high_parent).set_child(dir, low);
        }

        let (low_left, low_right) = {
            let low_node = Self::node_of(low);
            (low_node.left, low_node.right)
        };
        if !low_left.is_null() {
            Self::node_of(low_left).parent = high;
        }
        if !low_right.is_null() {
            Self::node_of(low_right).parent = high;
        }

        let (high_left, high_right) = {
            let high_node = Self::node_of(high);
            (high_node.left, high_node.right)
        };
        if high_left == low {
            if !high_right.is_null() {
                Self::node_of(high_right).parent = low;
            }
            // after the swap below these self links turn into low <-> high links
            Self::node_of(high).left = high;
            Self::node_of(low).parent = low;
        } else if high_right == low {
            if !high_left.is_null() {
                Self::node_of(high_left).parent = low;
            }
            Self::node_of(high).right = high;
            Self::node_of(low).parent = low;
        } else {
            if !high_left.is_null() {
                Self::node_of(high_left).parent = low;
            }
            if !high_right.is_null() {
                Self::node_of(high_right).parent = low;
            }
            let low_parent = Self::parent_of(low);
            let dir = Self::parent_direction(low, low_parent);
            Self::node_of(low_parent).set_child(dir, high);
        }

        Self::node_of(high).swap(Self::node_of(low));
    }

    /// `data` moves down toward `dir`, its child on the other side moves up.
    fn rotate(&mut self, data: *const P::Target, dir: RbDirection) {
        let up = dir.reverse();
        let child = Self::node_of(data).get_child(up);
        debug_assert!(!child.is_null(), "rotate {:?} without a child to promote", dir);

        self.transplant(data, child);
        let middle = Self::node_of(child).get_child(dir);
        Self::node_of(data).set_child(up, middle);
        if !middle.is_null() {
            Self::node_of(middle).parent = data;
        }
        Self::node_of(child).set_child(dir, data);
        Self::node_of(data).parent = child;
    }

    #[inline]
    fn rotate_left(&mut self, data: *const P::Target) {
        self.rotate(data, RbDirection::Left);
    }

    #[inline]
    fn rotate_right(&mut self, data: *const P::Target) {
        self.rotate(data, RbDirection::Right);
    }

    fn repair_after_insert(&mut self, mut data: *const P::Target) {
        loop {
            let parent = Self::parent_of(data);
            if parent.is_null() {
                Self::set_color(data, RbColor::Black);
                return;
            }
            if Self::color_of(parent) == RbColor::Black {
                return;
            }

            // A red parent is never the root, so the grandparent exists.
            let uncle = Self::uncle(data);
            if Self::color_of(uncle) == RbColor::Red {
                let grandparent = Self::grandparent(data);
                Self::set_color(parent, RbColor::Black);
                Self::set_color(uncle, RbColor::Black);
                Self::set_color(grandparent, RbColor::Red);
                data = grandparent;
                continue;
            }

            let parent_dir = Self::parent_direction(parent, Self::parent_of(parent));
            if Self::parent_direction(data, parent) != parent_dir {
                // zig-zag, turn it into zig-zig
                match parent_dir {
                    RbDirection::Left => self.rotate_left(parent),
                    RbDirection::Right => self.rotate_right(parent),
                }
                data = parent;
            }

            let parent = Self::parent_of(data);
            let grandparent = Self::parent_of(parent);
            Self::set_color(parent, RbColor::Black);
            Self::set_color(grandparent, RbColor::Red);
            match parent_dir {
                RbDirection::Left => self.rotate_right(grandparent),
                RbDirection::Right => self.rotate_left(grandparent),
            }
            return;
        }
    }

    /// Restore the black height around `data`, whose side of the tree is one
    /// black short once `data` is unlinked.
    fn repair_after_remove(&mut self, mut data: *const P::Target) {
        loop {
            let parent = Self::parent_of(data);
            if parent.is_null() {
                return;
            }
            let dir = Self::parent_direction(data, parent);

            let mut sibling = Self::sibling(data);
            if Self::color_of(sibling) == RbColor::Red {
                Self::set_color(parent, RbColor::Red);
                Self::set_color(sibling, RbColor::Black);
                self.rotate(parent, dir);
                sibling = Self::sibling(data);
            }
            debug_assert!(!sibling.is_null(), "black node {:p} without a sibling", data);

            let (near, far) = {
                let sibling_node = Self::node_of(sibling);
                (sibling_node.get_child(dir), sibling_node.get_child(dir.reverse()))
            };
            if Self::color_of(near) == RbColor::Black && Self::color_of(far) == RbColor::Black {
                Self::set_color(sibling, RbColor::Red);
                if Self::color_of(parent) == RbColor::Black {
                    data = parent;
                    continue;
                }
                Self::set_color(parent, RbColor::Black);
                return;
            }

            if Self::color_of(far) == RbColor::Black {
                // near nephew is red, bring it up so the far side turns red
                Self::set_color(sibling, RbColor::Red);
                Self::set_color(near, RbColor::Black);
                self.rotate(sibling, dir.reverse());
                sibling = Self::sibling(data);
            }

            Self::set_color(sibling, Self::color_of(parent));
            Self::set_color(parent, RbColor::Black);
            Self::set_color(Self::node_of(sibling).get_child(dir.reverse()), RbColor::Black);
            self.rotate(parent, dir);
            return;
        }
    }
}

impl<P, Tag, K: ?Sized, A> Drop for RbTree<P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    fn drop(&mut self) {
        if mem::needs_drop::<P>() && !self.root.is_null() {
            debug!("rbtree: dropping {} owned nodes", self.count);
            self.drain().for_each(drop);
        }
    }
}

impl<P, Tag, K: ?Sized, A> fmt::Debug for RbTree<P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag> + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, Tag, K: ?Sized, A> RbTree<Arc<T>, Tag, K, A>
where
    T: RbItem<Tag>,
{
    /// Remove the item behind `node`, if it is linked into this tree.
    pub fn remove_ref(&mut self, node: &Arc<T>) -> Option<Arc<T>> {
        let data = Arc::as_ptr(node);
        if !self.is_member(data) {
            return None;
        }
        unsafe { self.remove(data) }
    }
}

impl<T, Tag, K: ?Sized, A> RbTree<Rc<T>, Tag, K, A>
where
    T: RbItem<Tag>,
{
    /// Remove the item behind `node`, if it is linked into this tree.
    pub fn remove_ref(&mut self, node: &Rc<T>) -> Option<Rc<T>> {
        let data = Rc::as_ptr(node);
        if !self.is_member(data) {
            return None;
        }
        unsafe { self.remove(data) }
    }
}

impl<'a, P, Tag, K: ?Sized, A> IntoIterator for &'a RbTree<P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    type Item = &'a P::Target;
    type IntoIter = RbTreeIterator<'a, P, Tag, K, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// In-order iterator over a closed range of items, usable from both ends.
pub struct RbTreeIterator<'a, P, Tag, K: ?Sized, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    tree: &'a RbTree<P, Tag, K, A>,
    front: *const P::Target,
    back: *const P::Target,
}

impl<'a, P, Tag, K: ?Sized, A> RbTreeIterator<'a, P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    fn new(
        tree: &'a RbTree<P, Tag, K, A>, front: *const P::Target, back: *const P::Target,
    ) -> Self {
        if front.is_null() || back.is_null() {
            return Self { tree, front: null(), back: null() };
        }
        Self { tree, front, back }
    }
}

impl<'a, P, Tag, K: ?Sized, A> Iterator for RbTreeIterator<'a, P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    type Item = &'a P::Target;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front.is_null() {
            return None;
        }
        let cur = self.front;
        if cur == self.back {
            self.front = null();
            self.back = null();
        } else {
            self.front = self.tree.walk_dir_ptr(cur, RbDirection::Right);
        }
        unsafe { cur.as_ref() }
    }
}

impl<'a, P, Tag, K: ?Sized, A> DoubleEndedIterator for RbTreeIterator<'a, P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.back.is_null() {
            return None;
        }
        let cur = self.back;
        if cur == self.front {
            self.front = null();
            self.back = null();
        } else {
            self.back = self.tree.walk_dir_ptr(cur, RbDirection::Left);
        }
        unsafe { cur.as_ref() }
    }
}

pub struct RbTreeDrainer<'a, P, Tag, K: ?Sized, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    tree: &'a mut RbTree<P, Tag, K, A>,
}

impl<'a, P, Tag, K: ?Sized, A> Iterator for RbTreeDrainer<'a, P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    type Item = P;

    #[inline]
    fn next(&mut self) -> Option<P> {
        self.tree.remove_first()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.tree.count, Some(self.tree.count))
    }
}

/// A cursor that may remove the item it points at and keep walking.
///
/// The null position sits between the last and the first item: moving past
/// either end lands on it, and moving from it wraps to the opposite end.
pub struct RbTreeCursorMut<'a, P, Tag, K: ?Sized, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    tree: &'a mut RbTree<P, Tag, K, A>,
    current: *const P::Target,
}

impl<'a, P, Tag, K: ?Sized, A> RbTreeCursorMut<'a, P, Tag, K, A>
where
    P: Pointer,
    P::Target: RbItem<Tag>,
{
    #[inline]
    pub fn is_null(&self) -> bool {
        self.current.is_null()
    }

    #[inline]
    pub fn get(&self) -> Option<&P::Target> {
        unsafe { self.current.as_ref() }
    }

    #[inline]
    pub fn move_next(&mut self) {
        self.current = self.neighbour(RbDirection::Right);
    }

    #[inline]
    pub fn move_prev(&mut self) {
        self.current = self.neighbour(RbDirection::Left);
    }

    #[inline]
    pub fn peek_next(&self) -> Option<&P::Target> {
        unsafe { self.neighbour(RbDirection::Right).as_ref() }
    }

    #[inline]
    pub fn peek_prev(&self) -> Option<&P::Target> {
        unsafe { self.neighbour(RbDirection::Left).as_ref() }
    }

    /// Remove the current item and move to its successor.
    pub fn remove(&mut self) -> Option<P> {
        self.remove_toward(RbDirection::Right)
    }

    /// Remove the current item and move to its predecessor.
    pub fn remove_and_move_prev(&mut self) -> Option<P> {
        self.remove_toward(RbDirection::Left)
    }

    fn remove_toward(&mut self, dir: RbDirection) -> Option<P> {
        if self.current.is_null() {
            return None;
        }
        let cur = self.current;
        // the neighbour is still linked after cur leaves the tree
        self.current = self.tree.walk_dir_ptr(cur, dir);
        unsafe { self.tree.remove(cur) }
    }

    fn neighbour(&self, dir: RbDirection) -> *const P::Target {
        if !self.current.is_null() {
            return self.tree.walk_dir_ptr(self.current, dir);
        }
        match dir {
            RbDirection::Right => self.tree.first_ptr(),
            RbDirection::Left => self.tree.last_ptr(),
        }
    }
}

/// A broken invariant found by [`RbTree::validate`].
///
/// `index` is the in-order position of the offending item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RbTreeError {
    RootNotBlack,
    RedRed { index: usize },
    BlackHeight { index: usize, expected: usize, found: usize },
    Order { index: usize },
    ParentLink { index: usize },
    Detached { index: usize },
    Count { expected: usize, found: usize },
}

impl fmt::Display for RbTreeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RbTreeError::RootNotBlack => write!(f, "root is not black"),
            RbTreeError::RedRed { index } => write!(f, "red node {} has a red parent", index),
            RbTreeError::BlackHeight { index, expected, found } => {
                write!(f, "node {} has black height {}, expected {}", index, found, expected)
            }
            RbTreeError::Order { index } => {
                write!(f, "node {} does not compare greater than its predecessor", index)
            }
            RbTreeError::ParentLink { index } => {
                write!(f, "node {} has a broken parent link", index)
            }
            RbTreeError::Detached { index } => {
                write!(f, "node {} is reachable but detached", index)
            }
            RbTreeError::Count { expected, found } => {
                write!(f, "tree counts {} nodes but {} are reachable", expected, found)
            }
        }
    }
}

impl std::error::Error for RbTreeError {}
