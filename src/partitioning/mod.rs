//! Consistent hashing of bean keys onto cluster members.
//!
//! Every cache key exposes partition bytes. Keys of one bean share the same
//! partition bytes, so all of them land on the same primary owner.
//!
//! ```text
//!   BeanKey::Creation(id) ┐
//!   BeanKey::Access(id)   ├─ id bytes ─ xxHash64 ─ ring ─ primary owner
//!   BeanKey::Group(gid)   ┘  (gid bytes)                 + backups
//! ```

mod hashring;
mod ownership;

pub use hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
pub use ownership::{KeyOwnership, OwnershipRole};
