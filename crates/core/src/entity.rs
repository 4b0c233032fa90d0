//! Identity and parent links of the ownership tree.

/// A node of the Client → Project → Queue → Job → Output tree.
pub trait Entity {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}

/// A node with exactly one parent, referenced by id.
pub trait BelongsTo<P: Entity> {
    fn parent_id(&self) -> P::Id;

    fn belongs_to(&self, parent: &P) -> bool {
        self.parent_id() == *parent.id()
    }
}
