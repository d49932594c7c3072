#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! Intrusive red-black tree.
//!
//! The tree never allocates. Each record embeds an [`rbtree::RbNode`] and the
//! tree only rewires the parent/child links and colors stored there. Records
//! are handed to the tree through a [`Pointer`]: an owning handle such as
//! `Box`, `Rc` or `Arc`, or a raw pointer when the caller keeps the memory.
//!
//! ```rust
//! use embed_rbtree::rbtree::{RbItem, RbNode, RbTree};
//! use std::cell::UnsafeCell;
//! use std::cmp::Ordering;
//!
//! struct Object {
//!     key: i32,
//!     val: i32,
//!     node: UnsafeCell<RbNode<Object, ()>>,
//! }
//!
//! unsafe impl RbItem<()> for Object {
//!     fn get_node(&self) -> &mut RbNode<Self, ()> {
//!         unsafe { &mut *self.node.get() }
//!     }
//! }
//!
//! fn cmp_key(key: &i32, obj: &Object) -> Ordering {
//!     key.cmp(&obj.key)
//! }
//!
//! let mut tree = RbTree::<Box<Object>, (), i32>::new(cmp_key);
//! let obj = Box::new(Object { key: 1, val: 1000, node: UnsafeCell::new(RbNode::default()) });
//! assert!(tree.insert(&1, obj).is_none());
//! assert_eq!(tree.first().unwrap().val, 1000);
//! assert!(tree.contains_key(&1));
//! ```

extern crate alloc;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::ptr::NonNull;

/// A handle through which a container holds its items.
///
/// Owning handles (`Box`, `Rc`, `Arc`) are turned into raw pointers while the
/// item is linked and rebuilt with `from_raw` when it leaves the container.
/// Raw handles (`*const T`, `NonNull<T>`) leave ownership with the caller.
pub trait Pointer: Sized {
    type Target;

    fn as_ref(&self) -> &Self::Target;

    /// # Safety
    ///
    /// `p` must come from `into_raw` of the same handle type and must not be
    /// rebuilt twice.
    unsafe fn from_raw(p: *const Self::Target) -> Self;

    fn into_raw(self) -> *const Self::Target;
}

impl<T> Pointer for *const T {
    type Target = T;

    #[inline]
    fn as_ref(&self) -> &Self::Target {
        unsafe { &**self }
    }

    unsafe fn from_raw(p: *const Self::Target) -> Self {
        p
    }

    fn into_raw(self) -> *const Self::Target {
        self
    }
}

impl<T> Pointer for NonNull<T> {
    type Target = T;

    #[inline]
    fn as_ref(&self) -> &Self::Target {
        unsafe { NonNull::as_ref(self) }
    }

    unsafe fn from_raw(p: *const Self::Target) -> Self {
        unsafe { NonNull::new_unchecked(p as *mut T) }
    }

    fn into_raw(self) -> *const Self::Target {
        self.as_ptr()
    }
}

impl<T> Pointer for Box<T> {
    type Target = T;

    #[inline]
    fn as_ref(&self) -> &Self::Target {
        self
    }

    unsafe fn from_raw(p: *const Self::Target) -> Self {
        unsafe { Box::from_raw(p as *mut T) }
    }

    fn into_raw(self) -> *const Self::Target {
        Box::into_raw(self)
    }
}

impl<T> Pointer for Rc<T> {
    type Target = T;

    #[inline]
    fn as_ref(&self) -> &Self::Target {
        self
    }

    unsafe fn from_raw(p: *const Self::Target) -> Self {
        unsafe { Rc::from_raw(p) }
    }

    fn into_raw(self) -> *const Self::Target {
        Rc::into_raw(self)
    }
}

impl<T> Pointer for Arc<T> {
    type Target = T;

    #[inline]
    fn as_ref(&self) -> &Self::Target {
        self
    }

    unsafe fn from_raw(p: *const Self::Target) -> Self {
        unsafe { Arc::from_raw(p) }
    }

    fn into_raw(self) -> *const Self::Target {
        Arc::into_raw(self)
    }
}

pub mod rbtree;
