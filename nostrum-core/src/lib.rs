//! Shared-memory object runtime.
//!
//! A [`Region`] of raw memory is shared by threads.
//! The [`Arena`] carves it into blocks, the [`sync`] primitives
//! coordinate access to words inside it, and the [`World`]
//! maintains a reference-counted, garbage-collected graph of
//! objects living in the arena.
//! Each thread talks to the world through its own [`ThreadContext`].
//!
//! ```
//! use nostrum_core::{Config, ThreadContext, World};
//!
//! let world = World::create(Config::default()).unwrap();
//! let ctx = ThreadContext::new(&world).unwrap();
//!
//! let a = ctx.create_node(1).unwrap();
//! let b = ctx.create_node(1).unwrap();
//! a.node().unwrap().set(0, Some(&b)).unwrap();
//! b.node().unwrap().set(0, Some(&a)).unwrap();
//! drop((a, b));
//!
//! // The cycle keeps both objects alive until the collector runs.
//! assert_eq!(world.object_count(), 3);
//! ctx.gc().unwrap();
//! assert_eq!(world.object_count(), 1);
//! ```

#![warn(missing_docs)]

pub use self::{
    arena::{Arena, Ptr},
    config::Config,
    error::{Error, Result},
    region::Region,
    world::{GcReport, Handle, Init, Node, ObjectKind, ThreadContext, World},
};

pub mod arena;
pub mod config;
pub mod region;
pub mod sync;
pub mod world;

mod error;
